//! Period-over-period calculators shared by every aggregate.

use serde::Serialize;

/// Count metric compared against a previous period.
///
/// `percentage` is the absolute delta; direction lives in `is_increasing`.
/// When `previous` is zero and `current` is not, `percentage` is pinned to
/// 100 and is not a ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricResult {
    pub current: i64,
    pub previous: i64,
    pub percentage: f64,
    pub is_increasing: bool,
}

/// Float variant of [`MetricResult`] for currency amounts and rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecimalMetric {
    pub current: f64,
    pub previous: f64,
    pub percentage: f64,
    pub is_increasing: bool,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percentage_delta(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        if current == 0.0 {
            0.0
        } else {
            100.0
        }
    } else {
        round2((current - previous).abs() / previous.abs() * 100.0)
    }
}

pub fn calculate_metric(current: i64, previous: i64) -> MetricResult {
    MetricResult {
        current,
        previous,
        percentage: percentage_delta(current as f64, previous as f64),
        is_increasing: current > previous,
    }
}

pub fn calculate_decimal_metric(current: f64, previous: f64) -> DecimalMetric {
    let current = round2(current);
    let previous = round2(previous);
    DecimalMetric {
        current,
        previous,
        percentage: percentage_delta(current, previous),
        is_increasing: current > previous,
    }
}

/// `leads / sessions * 100` rounded to 2 decimals, or 0 without sessions.
pub fn conversion_rate(leads: i64, sessions: i64) -> f64 {
    if sessions > 0 {
        round2(leads as f64 / sessions as f64 * 100.0)
    } else {
        0.0
    }
}
