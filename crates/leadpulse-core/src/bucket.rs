//! Day and hour buckets.
//!
//! Every map produced here is dense over its expected key set: missing keys
//! are backfilled with zero, and keys outside the set are dropped.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::metric::conversion_rate;
use crate::period::DatePeriod;

/// Bucket key (`YYYY-MM-DD` or `HH`) to count.
pub type BucketMap = BTreeMap<String, i64>;

/// Bucket key to a derived percentage.
pub type RateMap = BTreeMap<String, f64>;

/// Inclusive list of `YYYY-MM-DD` keys. Empty when `from` is after `to`.
pub fn generate_date_range(from: NaiveDate, to: NaiveDate) -> Vec<String> {
    from.iter_days()
        .take_while(|day| *day <= to)
        .map(|day| day.format("%Y-%m-%d").to_string())
        .collect()
}

pub fn is_single_day(period: &DatePeriod) -> bool {
    period.is_single_day()
}

pub fn day_keys(period: &DatePeriod) -> Vec<String> {
    generate_date_range(period.start_date(), period.end_date())
}

pub fn hour_key(hour: u32) -> String {
    format!("{hour:02}")
}

/// Hour keys for `day`: all 24 for past days, `00..=current hour` for today,
/// none for future days.
pub fn hour_keys(day: NaiveDate, now: DateTime<Utc>, tz: Tz) -> Vec<String> {
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();
    let last_hour = if day < today {
        23
    } else if day == today {
        local_now.hour()
    } else {
        return Vec::new();
    };
    (0..=last_hour).map(hour_key).collect()
}

pub fn local_day_key(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

pub fn local_hour_key(ts: DateTime<Utc>, tz: Tz) -> String {
    hour_key(ts.with_timezone(&tz).hour())
}

/// Dense map over `keys`, taking counts from `raw` where present.
pub fn zero_filled(keys: &[String], raw: &BucketMap) -> BucketMap {
    keys.iter()
        .map(|key| (key.clone(), raw.get(key).copied().unwrap_or(0)))
        .collect()
}

pub fn bucket_total(buckets: &BucketMap) -> i64 {
    buckets.values().sum()
}

/// Per-bucket conversion rate, keyed like `sessions`.
pub fn conversion_rate_buckets(leads: &BucketMap, sessions: &BucketMap) -> RateMap {
    sessions
        .iter()
        .map(|(key, &session_count)| {
            let lead_count = leads.get(key).copied().unwrap_or(0);
            (key.clone(), conversion_rate(lead_count, session_count))
        })
        .collect()
}

/// Clamp a period that ends in the future so it ends at `now`.
///
/// Periods entirely in the past or entirely in the future are returned as is.
pub fn truncate_to_now(period: &DatePeriod, now: DateTime<Utc>, tz: Tz) -> DatePeriod {
    let local_now = now.with_timezone(&tz).naive_local();
    let local_now = local_now.with_nanosecond(0).unwrap_or(local_now);
    if period.from <= local_now && local_now < period.to {
        DatePeriod {
            to: local_now,
            ..period.clone()
        }
    } else {
        period.clone()
    }
}

/// Sessions, leads and conversion rate keyed by the same hours.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyMetrics {
    pub sessions: BucketMap,
    pub leads: BucketMap,
    pub conversion_rate: RateMap,
}

impl HourlyMetrics {
    pub fn from_buckets(sessions: BucketMap, leads: BucketMap) -> Self {
        let leads = zero_filled(&sessions.keys().cloned().collect::<Vec<_>>(), &leads);
        let conversion_rate = conversion_rate_buckets(&leads, &sessions);
        Self {
            sessions,
            leads,
            conversion_rate,
        }
    }
}
