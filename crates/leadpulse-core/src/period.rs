//! Date/time ranges and previous-period derivation.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Resolution of a period boundary. `to` is inclusive at this granularity.
pub fn tick() -> Duration {
    Duration::seconds(1)
}

/// A civil-time range in the reference timezone with an optional daily
/// clock window.
///
/// When `time_from`/`time_to` are set they restrict *every* day of the range,
/// not only the first and last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatePeriod {
    pub(crate) from: NaiveDateTime,
    pub(crate) to: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) time_from: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) time_to: Option<NaiveTime>,
}

impl DatePeriod {
    pub fn new(from: NaiveDateTime, to: NaiveDateTime) -> EngineResult<Self> {
        if from > to {
            return Err(EngineError::InvalidPeriod(format!(
                "from ({from}) must not be after to ({to})"
            )));
        }
        Ok(Self {
            from,
            to,
            time_from: None,
            time_to: None,
        })
    }

    /// Whole days: `start 00:00:00` through `end 23:59:59`.
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> EngineResult<Self> {
        let after_end = end
            .succ_opt()
            .ok_or_else(|| EngineError::InvalidPeriod(format!("end date out of range: {end}")))?;
        Self::new(
            start.and_time(NaiveTime::MIN),
            after_end.and_time(NaiveTime::MIN) - tick(),
        )
    }

    pub fn single_day(day: NaiveDate) -> EngineResult<Self> {
        Self::from_dates(day, day)
    }

    /// Restrict every day of the period to `[time_from, time_to]`.
    pub fn with_time_window(
        mut self,
        time_from: Option<NaiveTime>,
        time_to: Option<NaiveTime>,
    ) -> EngineResult<Self> {
        if let (Some(start), Some(end)) = (time_from, time_to) {
            if start > end {
                return Err(EngineError::InvalidPeriod(format!(
                    "time_from ({}) must not be after time_to ({})",
                    start.format("%H:%M"),
                    end.format("%H:%M")
                )));
            }
        }
        self.time_from = time_from;
        self.time_to = time_to;
        Ok(self)
    }

    pub fn from(&self) -> NaiveDateTime {
        self.from
    }

    pub fn to(&self) -> NaiveDateTime {
        self.to
    }

    pub fn time_from(&self) -> Option<NaiveTime> {
        self.time_from
    }

    pub fn time_to(&self) -> Option<NaiveTime> {
        self.time_to
    }

    pub fn start_date(&self) -> NaiveDate {
        self.from.date()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.to.date()
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }

    /// Number of calendar days touched, inclusive.
    pub fn span_days(&self) -> i64 {
        (self.end_date() - self.start_date()).num_days() + 1
    }

    pub fn is_single_day(&self) -> bool {
        self.start_date() == self.end_date()
    }

    pub fn is_today(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.is_single_day() && self.start_date() == now.with_timezone(&tz).date_naive()
    }

    /// Every calendar day in the period, in order.
    pub fn days(&self) -> Vec<NaiveDate> {
        self.start_date()
            .iter_days()
            .take_while(|day| *day <= self.end_date())
            .collect()
    }

    /// The immediately preceding interval of identical length.
    pub fn previous(&self) -> EngineResult<Self> {
        let out_of_range = || EngineError::InvalidPeriod("previous period out of range".to_string());
        let to = self.from.checked_sub_signed(tick()).ok_or_else(out_of_range)?;
        let from = to.checked_sub_signed(self.duration()).ok_or_else(out_of_range)?;
        Ok(Self {
            from,
            to,
            time_from: self.time_from,
            time_to: self.time_to,
        })
    }

    pub fn shift_days(&self, days: i64) -> EngineResult<Self> {
        let offset = Duration::days(days);
        Ok(Self {
            from: checked_add(self.from, offset)?,
            to: checked_add(self.to, offset)?,
            time_from: self.time_from,
            time_to: self.time_to,
        })
    }

    pub fn yesterday(&self) -> EngineResult<Self> {
        self.shift_days(-1)
    }

    pub fn same_day_last_week(&self) -> EngineResult<Self> {
        self.shift_days(-7)
    }

    /// Half-open UTC intervals covering the period, one per day when a clock
    /// window is set.
    pub fn utc_windows(&self, tz: Tz) -> EngineResult<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let end_exclusive = checked_add(self.to, tick())?;
        if self.time_from.is_none() && self.time_to.is_none() {
            return Ok(vec![(
                local_to_utc(tz, self.from)?,
                local_to_utc(tz, end_exclusive)?,
            )]);
        }

        let mut windows = Vec::new();
        for day in self.days() {
            let day_start = day.and_time(self.time_from.unwrap_or(NaiveTime::MIN));
            let day_end = match self.time_to {
                Some(t) => checked_add(day.and_time(t), Duration::minutes(1))?,
                None => checked_add(day.and_time(NaiveTime::MIN), Duration::days(1))?,
            };
            let start = day_start.max(self.from);
            let end = day_end.min(end_exclusive);
            if start < end {
                windows.push((local_to_utc(tz, start)?, local_to_utc(tz, end)?));
            }
        }
        Ok(windows)
    }
}

fn checked_add(at: NaiveDateTime, offset: Duration) -> EngineResult<NaiveDateTime> {
    at.checked_add_signed(offset)
        .ok_or_else(|| EngineError::InvalidPeriod(format!("{at} shifted by {offset} is out of range")))
}

/// Parse a clock-time string `HH:MM`.
pub fn parse_clock(raw: &str) -> EngineResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| EngineError::InvalidPeriod(format!("invalid clock time {raw:?} (expected HH:MM)")))
}

/// Resolve a civil time to UTC. Ambiguous times take the earlier instant;
/// times inside a DST gap move to the first instant after it.
pub fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> EngineResult<DateTime<Utc>> {
    let resolved = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(a, b) => a.min(b),
        LocalResult::None => match tz.from_local_datetime(&checked_add(naive, Duration::hours(1))?) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(a, b) => a.min(b),
            LocalResult::None => {
                return Err(EngineError::InvalidPeriod(format!(
                    "{naive} does not exist in {tz}"
                )))
            }
        },
    };
    Ok(resolved.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        date(y, m, d).and_hms_opt(h, min, s).expect("time")
    }

    #[test]
    fn rejects_inverted_range() {
        let result = DatePeriod::new(at(2024, 1, 3, 0, 0, 0), at(2024, 1, 1, 0, 0, 0));
        assert!(matches!(result, Err(EngineError::InvalidPeriod(_))));
    }

    #[test]
    fn previous_period_has_identical_length() {
        let current = DatePeriod::from_dates(date(2024, 1, 10), date(2024, 1, 16)).expect("period");
        let previous = current.previous().expect("previous");
        assert_eq!(previous.to(), at(2024, 1, 9, 23, 59, 59));
        assert_eq!(previous.from(), at(2024, 1, 3, 0, 0, 0));
        assert_eq!(previous.span_days(), current.span_days());
    }

    #[test]
    fn previous_of_single_day_is_yesterday() {
        let current = DatePeriod::single_day(date(2024, 3, 1)).expect("period");
        let previous = current.previous().expect("previous");
        assert_eq!(previous, current.yesterday().expect("yesterday"));
        assert_eq!(previous.start_date(), date(2024, 2, 29));
    }

    #[test]
    fn single_day_detection() {
        let one = DatePeriod::single_day(date(2024, 5, 5)).expect("period");
        let two = DatePeriod::from_dates(date(2024, 5, 5), date(2024, 5, 6)).expect("period");
        assert!(one.is_single_day());
        assert!(!two.is_single_day());
        assert_eq!(
            one.same_day_last_week().expect("last week").start_date(),
            date(2024, 4, 28)
        );
    }

    #[test]
    fn is_today_uses_reference_timezone() {
        let tz: Tz = "America/Sao_Paulo".parse().expect("tz");
        // 01:30 UTC on the 2nd is still the 1st in Sao Paulo (UTC-3).
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 1, 30, 0).single().expect("now");
        let first = DatePeriod::single_day(date(2024, 6, 1)).expect("period");
        let second = DatePeriod::single_day(date(2024, 6, 2)).expect("period");
        assert!(first.is_today(now, tz));
        assert!(!second.is_today(now, tz));
    }

    #[test]
    fn time_window_rejects_inverted_clock() {
        let period = DatePeriod::single_day(date(2024, 1, 1)).expect("period");
        let result = period.with_time_window(
            Some(parse_clock("18:00").expect("clock")),
            Some(parse_clock("09:00").expect("clock")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_clock_requires_hh_mm() {
        assert!(parse_clock("09:30").is_ok());
        assert!(parse_clock("9h30").is_err());
        assert!(parse_clock("25:00").is_err());
    }

    #[test]
    fn utc_windows_without_clock_window_is_one_interval() {
        let tz: Tz = "America/Sao_Paulo".parse().expect("tz");
        let period = DatePeriod::from_dates(date(2024, 6, 1), date(2024, 6, 3)).expect("period");
        let windows = period.utc_windows(tz).expect("windows");
        assert_eq!(windows.len(), 1);
        assert_eq!(
            windows[0].0,
            Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).single().expect("start")
        );
        assert_eq!(
            windows[0].1,
            Utc.with_ymd_and_hms(2024, 6, 4, 3, 0, 0).single().expect("end")
        );
    }

    #[test]
    fn utc_windows_apply_clock_window_to_every_day() {
        let period = DatePeriod::from_dates(date(2024, 6, 1), date(2024, 6, 3))
            .expect("period")
            .with_time_window(
                Some(parse_clock("09:00").expect("clock")),
                Some(parse_clock("17:59").expect("clock")),
            )
            .expect("window");
        let windows = period.utc_windows(Tz::UTC).expect("windows");
        assert_eq!(windows.len(), 3);
        for (i, (start, end)) in windows.iter().enumerate() {
            let day = 1 + i as u32;
            assert_eq!(
                *start,
                Utc.with_ymd_and_hms(2024, 6, day, 9, 0, 0).single().expect("start")
            );
            assert_eq!(
                *end,
                Utc.with_ymd_and_hms(2024, 6, day, 18, 0, 0).single().expect("end")
            );
        }
    }

    #[test]
    fn previous_period_keeps_clock_window() {
        let period = DatePeriod::from_dates(date(2024, 6, 8), date(2024, 6, 14))
            .expect("period")
            .with_time_window(Some(parse_clock("08:00").expect("clock")), None)
            .expect("window");
        let previous = period.previous().expect("previous");
        assert_eq!(previous.time_from(), period.time_from());
        assert_eq!(previous.start_date(), date(2024, 6, 1));
    }

    #[test]
    fn dst_gap_moves_forward() {
        // 2023-03-26 02:30 does not exist in Europe/Berlin.
        let tz: Tz = "Europe/Berlin".parse().expect("tz");
        let utc = local_to_utc(tz, at(2023, 3, 26, 2, 30, 0)).expect("resolved");
        assert_eq!(
            utc,
            Utc.with_ymd_and_hms(2023, 3, 26, 1, 30, 0).single().expect("utc")
        );
    }

    #[test]
    fn ambiguous_local_time_takes_earlier_instant() {
        // 2023-10-29 02:30 happens twice in Europe/Berlin (CEST, then CET).
        let tz: Tz = "Europe/Berlin".parse().expect("tz");
        let utc = local_to_utc(tz, at(2023, 10, 29, 2, 30, 0)).expect("resolved");
        assert_eq!(
            utc,
            Utc.with_ymd_and_hms(2023, 10, 29, 0, 30, 0).single().expect("utc")
        );
    }

    #[test]
    fn shifting_past_the_calendar_floor_is_invalid() {
        let first = DatePeriod::single_day(NaiveDate::MIN).expect("period");
        assert!(matches!(first.yesterday(), Err(EngineError::InvalidPeriod(_))));
        assert!(matches!(
            first.same_day_last_week(),
            Err(EngineError::InvalidPeriod(_))
        ));
        assert!(matches!(first.previous(), Err(EngineError::InvalidPeriod(_))));
    }
}
