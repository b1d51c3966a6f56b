//! Dashboard aggregation: period resolution, concurrent fan-out to the
//! [`QueryExecutor`], and reduction into comparison results.
//!
//! Each request moves through `init -> dispatch -> await -> reduce` and ends
//! `done` or `failed`. Every aggregate runs as its own tokio task and hands
//! its value back through the `JoinSet`; the reducer is the only code that
//! touches the accumulated results. The first failure aborts the remaining
//! tasks, and dropping the request future aborts them too.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::bucket::{
    bucket_total, conversion_rate_buckets, day_keys, hour_keys, truncate_to_now, zero_filled,
    BucketMap, HourlyMetrics, RateMap,
};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::filter::{validate_filters, AdvancedFilter, FilterCondition, ScopeFilter, SkippedFilter};
use crate::metric::{
    calculate_decimal_metric, calculate_metric, conversion_rate, DecimalMetric, MetricResult,
};
use crate::period::DatePeriod;
use crate::query::{Measure, PeriodSummary, Predicate, QueryExecutor};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timezone: Tz,
    pub max_span_days: i64,
    /// Deadline for each individual aggregate query.
    pub query_timeout: Duration,
    /// Fetch totals and daily buckets through [`QueryExecutor::period_summary`]
    /// instead of separate count and group-by queries.
    pub single_pass: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            max_span_days: 90,
            query_timeout: Duration::from_secs(30),
            single_pass: false,
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            timezone: config.timezone,
            max_span_days: config.max_span_days,
            query_timeout: config.query_timeout(),
            single_pass: false,
        }
    }
}

/// One dashboard query, already decoded by the transport layer.
#[derive(Debug, Clone)]
pub struct DashboardRequest {
    pub current: DatePeriod,
    /// Used verbatim when present; otherwise derived from `current`.
    pub previous: Option<DatePeriod>,
    pub filters: Vec<AdvancedFilter>,
    pub filter_condition: FilterCondition,
    pub scope: ScopeFilter,
}

impl DashboardRequest {
    pub fn new(current: DatePeriod) -> Self {
        Self {
            current,
            previous: None,
            filters: Vec::new(),
            filter_condition: FilterCondition::And,
            scope: ScopeFilter::default(),
        }
    }

    pub fn with_previous(mut self, previous: DatePeriod) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_filters(mut self, filters: Vec<AdvancedFilter>, condition: FilterCondition) -> Self {
        self.filters = filters;
        self.filter_condition = condition;
        self
    }

    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub measure: String,
    pub metric: MetricResult,
    pub current_period: DatePeriod,
    pub previous_period: DatePeriod,
    pub current_daily: BucketMap,
    pub previous_daily: BucketMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_hourly: Option<BucketMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hourly: Option<BucketMap>,
    /// Hourly buckets outnumbered the direct total and replaced it.
    pub reconciled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_filters: Vec<SkippedFilter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOverview {
    pub sessions: MetricResult,
    pub leads: MetricResult,
    pub conversion_rate: DecimalMetric,
    pub current_period: DatePeriod,
    pub previous_period: DatePeriod,
    pub daily_conversion_rate: RateMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hourly: Option<HourlyMetrics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_filters: Vec<SkippedFilter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSummary {
    pub revenue: DecimalMetric,
    pub purchases: MetricResult,
    pub current_period: DatePeriod,
    pub previous_period: DatePeriod,
}

/// Revenue for the whole scope plus one independent summary per profession.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfessionBreakdown {
    pub general: RevenueSummary,
    pub by_profession: BTreeMap<i64, RevenueSummary>,
    /// Professions whose breakdown failed, with the error message.
    pub failed: BTreeMap<i64, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    CurrentCount,
    PreviousCount,
    CurrentDaily,
    PreviousDaily,
    CurrentHourly,
    PreviousHourly,
    CurrentSummary,
    PreviousSummary,
    CurrentRevenue,
    PreviousRevenue,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::CurrentCount => "current_count",
            Slot::PreviousCount => "previous_count",
            Slot::CurrentDaily => "current_daily",
            Slot::PreviousDaily => "previous_daily",
            Slot::CurrentHourly => "current_hourly",
            Slot::PreviousHourly => "previous_hourly",
            Slot::CurrentSummary => "current_summary",
            Slot::PreviousSummary => "previous_summary",
            Slot::CurrentRevenue => "current_revenue",
            Slot::PreviousRevenue => "previous_revenue",
        };
        f.write_str(name)
    }
}

enum SlotValue {
    Count(i64),
    Buckets(BucketMap),
    Summary(PeriodSummary),
    Amount(f64),
}

/// Private result slots filled by the reducer.
struct Slots(HashMap<Slot, SlotValue>);

impl Slots {
    fn missing(slot: Slot) -> EngineError {
        EngineError::TaskFailed(format!("no result for {slot}"))
    }

    fn count(&mut self, slot: Slot) -> EngineResult<i64> {
        match self.0.remove(&slot) {
            Some(SlotValue::Count(n)) => Ok(n),
            _ => Err(Self::missing(slot)),
        }
    }

    fn buckets(&mut self, slot: Slot) -> EngineResult<BucketMap> {
        match self.0.remove(&slot) {
            Some(SlotValue::Buckets(b)) => Ok(b),
            _ => Err(Self::missing(slot)),
        }
    }

    fn summary(&mut self, slot: Slot) -> EngineResult<PeriodSummary> {
        match self.0.remove(&slot) {
            Some(SlotValue::Summary(s)) => Ok(s),
            _ => Err(Self::missing(slot)),
        }
    }

    fn amount(&mut self, slot: Slot) -> EngineResult<f64> {
        match self.0.remove(&slot) {
            Some(SlotValue::Amount(a)) => Ok(a),
            _ => Err(Self::missing(slot)),
        }
    }

    fn has(&self, slot: Slot) -> bool {
        self.0.contains_key(&slot)
    }
}

/// Concurrent aggregate queries for one request.
struct FanOut {
    executor: Arc<dyn QueryExecutor>,
    tz: Tz,
    timeout: Duration,
    tasks: JoinSet<(Slot, EngineResult<SlotValue>)>,
}

impl FanOut {
    fn new(executor: Arc<dyn QueryExecutor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            tz: config.timezone,
            timeout: config.query_timeout,
            tasks: JoinSet::new(),
        }
    }

    fn spawn<F>(&mut self, slot: Slot, query: F)
    where
        F: std::future::Future<Output = anyhow::Result<SlotValue>> + Send + 'static,
    {
        let timeout = self.timeout;
        self.tasks.spawn(async move {
            let outcome = match tokio::time::timeout(timeout, query).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(EngineError::Query {
                    slot: slot.to_string(),
                    source,
                }),
                Err(_) => Err(EngineError::Timeout {
                    slot: slot.to_string(),
                    seconds: timeout.as_secs(),
                }),
            };
            (slot, outcome)
        });
    }

    fn count(&mut self, slot: Slot, measure: Measure, predicate: &Predicate, period: &DatePeriod) {
        let (executor, predicate, period, tz) = self.capture(predicate, period);
        self.spawn(slot, async move {
            executor
                .count_by_range(measure, &predicate, &period, tz)
                .await
                .map(SlotValue::Count)
        });
    }

    fn daily(&mut self, slot: Slot, measure: Measure, predicate: &Predicate, period: &DatePeriod) {
        let (executor, predicate, period, tz) = self.capture(predicate, period);
        self.spawn(slot, async move {
            executor
                .group_count_by_day(measure, &predicate, &period, tz)
                .await
                .map(SlotValue::Buckets)
        });
    }

    fn hourly(&mut self, slot: Slot, measure: Measure, predicate: &Predicate, day: &DatePeriod) {
        let (executor, predicate, day, tz) = self.capture(predicate, day);
        self.spawn(slot, async move {
            executor
                .group_count_by_hour(measure, &predicate, &day, tz)
                .await
                .map(SlotValue::Buckets)
        });
    }

    fn summary(&mut self, slot: Slot, measure: Measure, predicate: &Predicate, period: &DatePeriod) {
        let (executor, predicate, period, tz) = self.capture(predicate, period);
        self.spawn(slot, async move {
            executor
                .period_summary(measure, &predicate, &period, tz)
                .await
                .map(SlotValue::Summary)
        });
    }

    fn revenue(&mut self, slot: Slot, measure: Measure, predicate: &Predicate, period: &DatePeriod) {
        let (executor, predicate, period, tz) = self.capture(predicate, period);
        self.spawn(slot, async move {
            executor
                .sum_by_range(measure, &predicate, &period, tz)
                .await
                .map(SlotValue::Amount)
        });
    }

    fn capture(
        &self,
        predicate: &Predicate,
        period: &DatePeriod,
    ) -> (Arc<dyn QueryExecutor>, Predicate, DatePeriod, Tz) {
        (
            Arc::clone(&self.executor),
            predicate.clone(),
            period.clone(),
            self.tz,
        )
    }

    /// Wait for every task. The first failure aborts the rest and is returned.
    async fn join(mut self) -> EngineResult<Slots> {
        let mut slots = HashMap::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((slot, Ok(value))) => {
                    slots.insert(slot, value);
                }
                Ok((slot, Err(err))) => {
                    debug!(%slot, error = %err, state = "failed", "aggregate failed");
                    self.tasks.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    self.tasks.abort_all();
                    return Err(EngineError::TaskFailed(join_err.to_string()));
                }
            }
        }
        Ok(Slots(slots))
    }
}

/// Current and previous period after truncation and fallback.
#[derive(Debug, Clone)]
struct ResolvedPeriods {
    current: DatePeriod,
    previous: DatePeriod,
}

#[derive(Clone)]
pub struct DashboardEngine {
    executor: Arc<dyn QueryExecutor>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl DashboardEngine {
    pub fn new(executor: Arc<dyn QueryExecutor>, config: EngineConfig) -> Self {
        Self {
            executor,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn validate(&self, request: &DashboardRequest) -> EngineResult<()> {
        for period in std::iter::once(&request.current).chain(request.previous.as_ref()) {
            let days = period.span_days();
            if days > self.config.max_span_days {
                return Err(EngineError::SpanTooLong {
                    days,
                    max: self.config.max_span_days,
                });
            }
        }
        validate_filters(&request.filters)
    }

    /// Truncate "today" to now and derive the previous period.
    ///
    /// Single-day requests without an explicit previous period try yesterday
    /// first and fall back to the same weekday a week earlier when yesterday
    /// had no activity for `measure`.
    async fn resolve_periods(
        &self,
        measure: Measure,
        predicate: &Predicate,
        request: &DashboardRequest,
    ) -> EngineResult<ResolvedPeriods> {
        let now = self.clock.now();
        let tz = self.config.timezone;
        let current = if request.current.is_today(now, tz) {
            truncate_to_now(&request.current, now, tz)
        } else {
            request.current.clone()
        };

        let previous = match request.previous {
            Some(ref previous) => previous.clone(),
            None if current.is_single_day() => {
                let yesterday = current.yesterday()?;
                let mut lookback = FanOut::new(Arc::clone(&self.executor), &self.config);
                lookback.count(Slot::PreviousCount, measure, predicate, &yesterday);
                let activity = lookback.join().await?.count(Slot::PreviousCount)?;
                if activity > 0 {
                    yesterday
                } else {
                    debug!(%measure, "no activity yesterday, comparing against last week");
                    current.same_day_last_week()?
                }
            }
            None => current.previous()?,
        };
        Ok(ResolvedPeriods { current, previous })
    }

    /// Current-vs-previous comparison for one measure, with daily buckets and,
    /// for single-day requests, hourly buckets.
    pub async fn compare(
        &self,
        measure: Measure,
        request: &DashboardRequest,
    ) -> EngineResult<ComparisonResult> {
        debug!(%measure, state = "init");
        self.validate(request)?;
        let (predicate, skipped) = Predicate::compile(
            measure,
            &request.scope,
            &request.filters,
            request.filter_condition,
        );
        let periods = self.resolve_periods(measure, &predicate, request).await?;
        let mut result = self.compare_resolved(measure, &predicate, &periods).await?;
        result.skipped_filters = skipped;
        Ok(result)
    }

    async fn compare_resolved(
        &self,
        measure: Measure,
        predicate: &Predicate,
        periods: &ResolvedPeriods,
    ) -> EngineResult<ComparisonResult> {
        let ResolvedPeriods { current, previous } = periods;
        let mut fan = FanOut::new(Arc::clone(&self.executor), &self.config);

        if self.config.single_pass {
            fan.summary(Slot::CurrentSummary, measure, predicate, current);
            fan.summary(Slot::PreviousSummary, measure, predicate, previous);
        } else {
            fan.count(Slot::CurrentCount, measure, predicate, current);
            fan.count(Slot::PreviousCount, measure, predicate, previous);
            fan.daily(Slot::CurrentDaily, measure, predicate, current);
            fan.daily(Slot::PreviousDaily, measure, predicate, previous);
        }
        if current.is_single_day() {
            fan.hourly(Slot::CurrentHourly, measure, predicate, current);
            if previous.is_single_day() {
                fan.hourly(Slot::PreviousHourly, measure, predicate, previous);
            }
        }

        debug!(%measure, state = "dispatch", tasks = fan.tasks.len());
        let mut slots = fan.join().await?;
        debug!(%measure, state = "reduce");

        let (mut current_total, mut current_raw, mut previous_total, mut previous_raw) =
            if self.config.single_pass {
                let cur = slots.summary(Slot::CurrentSummary)?;
                let prev = slots.summary(Slot::PreviousSummary)?;
                (cur.total, cur.daily, prev.total, prev.daily)
            } else {
                (
                    slots.count(Slot::CurrentCount)?,
                    slots.buckets(Slot::CurrentDaily)?,
                    slots.count(Slot::PreviousCount)?,
                    slots.buckets(Slot::PreviousDaily)?,
                )
            };

        let now = self.clock.now();
        let tz = self.config.timezone;
        let mut reconciled = false;

        let current_hourly = if slots.has(Slot::CurrentHourly) {
            let keys = hour_keys(current.start_date(), now, tz);
            let hourly = zero_filled(&keys, &slots.buckets(Slot::CurrentHourly)?);
            if reconcile(&mut current_total, &hourly) {
                reconciled = true;
                current_raw.insert(day_key(current), current_total);
            }
            Some(hourly)
        } else {
            None
        };
        let previous_hourly = if slots.has(Slot::PreviousHourly) {
            let keys = hour_keys(previous.start_date(), now, tz);
            let hourly = zero_filled(&keys, &slots.buckets(Slot::PreviousHourly)?);
            if reconcile(&mut previous_total, &hourly) {
                reconciled = true;
                previous_raw.insert(day_key(previous), previous_total);
            }
            Some(hourly)
        } else {
            None
        };
        if reconciled {
            debug!(%measure, "hourly buckets exceeded direct totals; using the larger value");
        }

        debug!(%measure, current_total, previous_total, state = "done");
        Ok(ComparisonResult {
            measure: measure.to_string(),
            metric: calculate_metric(current_total, previous_total),
            current_period: current.clone(),
            previous_period: previous.clone(),
            current_daily: zero_filled(&day_keys(current), &current_raw),
            previous_daily: zero_filled(&day_keys(previous), &previous_raw),
            current_hourly,
            previous_hourly,
            reconciled,
            skipped_filters: Vec::new(),
        })
    }

    /// Sessions, leads and the conversion rate between them. Both measures
    /// share the periods resolved for sessions.
    pub async fn conversion_overview(
        &self,
        request: &DashboardRequest,
    ) -> EngineResult<ConversionOverview> {
        self.validate(request)?;
        let (session_predicate, mut skipped) = Predicate::compile(
            Measure::Sessions,
            &request.scope,
            &request.filters,
            request.filter_condition,
        );
        let (lead_predicate, lead_skipped) = Predicate::compile(
            Measure::LEADS,
            &request.scope,
            &request.filters,
            request.filter_condition,
        );
        // A filter only counts as skipped when neither root could use it.
        skipped.retain(|s| lead_skipped.contains(s));

        let periods = self
            .resolve_periods(Measure::Sessions, &session_predicate, request)
            .await?;
        let (sessions, leads) = tokio::try_join!(
            self.compare_resolved(Measure::Sessions, &session_predicate, &periods),
            self.compare_resolved(Measure::LEADS, &lead_predicate, &periods),
        )?;

        let hourly = match (sessions.current_hourly, leads.current_hourly) {
            (Some(s), Some(l)) => Some(HourlyMetrics::from_buckets(s, l)),
            _ => None,
        };
        Ok(ConversionOverview {
            conversion_rate: calculate_decimal_metric(
                conversion_rate(leads.metric.current, sessions.metric.current),
                conversion_rate(leads.metric.previous, sessions.metric.previous),
            ),
            daily_conversion_rate: conversion_rate_buckets(
                &leads.current_daily,
                &sessions.current_daily,
            ),
            sessions: sessions.metric,
            leads: leads.metric,
            current_period: periods.current,
            previous_period: periods.previous,
            hourly,
            skipped_filters: skipped,
        })
    }

    /// Purchase revenue and purchase count, current vs previous.
    pub async fn revenue_summary(&self, request: &DashboardRequest) -> EngineResult<RevenueSummary> {
        self.validate(request)?;
        let measure = Measure::PURCHASES;
        let (predicate, _) = Predicate::compile(
            measure,
            &request.scope,
            &request.filters,
            request.filter_condition,
        );
        let periods = self.resolve_periods(measure, &predicate, request).await?;
        self.revenue_resolved(&predicate, periods).await
    }

    async fn revenue_resolved(
        &self,
        predicate: &Predicate,
        periods: ResolvedPeriods,
    ) -> EngineResult<RevenueSummary> {
        let measure = Measure::PURCHASES;
        let mut fan = FanOut::new(Arc::clone(&self.executor), &self.config);
        fan.revenue(Slot::CurrentRevenue, measure, predicate, &periods.current);
        fan.revenue(Slot::PreviousRevenue, measure, predicate, &periods.previous);
        fan.count(Slot::CurrentCount, measure, predicate, &periods.current);
        fan.count(Slot::PreviousCount, measure, predicate, &periods.previous);
        let mut slots = fan.join().await?;

        Ok(RevenueSummary {
            revenue: calculate_decimal_metric(
                slots.amount(Slot::CurrentRevenue)?,
                slots.amount(Slot::PreviousRevenue)?,
            ),
            purchases: calculate_metric(
                slots.count(Slot::CurrentCount)?,
                slots.count(Slot::PreviousCount)?,
            ),
            current_period: periods.current,
            previous_period: periods.previous,
        })
    }

    /// General revenue plus an independent summary per profession.
    ///
    /// A failing profession is reported in `failed` and does not affect the
    /// others or the general summary. The general summary failing fails the
    /// call.
    pub async fn revenue_by_profession(
        &self,
        request: &DashboardRequest,
        profession_ids: &[i64],
    ) -> EngineResult<ProfessionBreakdown> {
        self.validate(request)?;
        let measure = Measure::PURCHASES;
        let (predicate, _) = Predicate::compile(
            measure,
            &request.scope,
            &request.filters,
            request.filter_condition,
        );
        // Every profession is compared over the same periods as the total.
        let periods = self.resolve_periods(measure, &predicate, request).await?;

        let mut ids = profession_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut per_profession = JoinSet::new();
        let mut task_professions = HashMap::with_capacity(ids.len());
        for id in ids {
            let engine = self.clone();
            let scope = ScopeFilter {
                profession_ids: vec![id],
                ..request.scope.clone()
            };
            let (predicate, _) =
                Predicate::compile(measure, &scope, &request.filters, request.filter_condition);
            let periods = periods.clone();
            let handle = per_profession.spawn(async move {
                (id, engine.revenue_resolved(&predicate, periods).await)
            });
            task_professions.insert(handle.id(), id);
        }

        let collect = async {
            let mut by_profession = BTreeMap::new();
            let mut failed = BTreeMap::new();
            while let Some(joined) = per_profession.join_next().await {
                match joined {
                    Ok((id, Ok(summary))) => {
                        by_profession.insert(id, summary);
                    }
                    Ok((id, Err(err))) => {
                        warn!(profession_id = id, error = %err, "profession breakdown failed");
                        failed.insert(id, err.to_string());
                    }
                    Err(join_err) => match task_professions.get(&join_err.id()) {
                        Some(&id) => {
                            warn!(profession_id = id, error = %join_err, "profession breakdown task failed");
                            failed.insert(id, format!("aggregate task failed: {join_err}"));
                        }
                        None => warn!(error = %join_err, "unknown profession task failed"),
                    },
                }
            }
            (by_profession, failed)
        };

        let (general, (by_profession, failed)) =
            tokio::join!(self.revenue_resolved(&predicate, periods.clone()), collect);
        Ok(ProfessionBreakdown {
            general: general?,
            by_profession,
            failed,
        })
    }
}

/// Lift `total` to the hourly sum when the hourly buckets saw more.
/// Daily bucket key of a single-day period.
fn day_key(period: &DatePeriod) -> String {
    period.start_date().format("%Y-%m-%d").to_string()
}

fn reconcile(total: &mut i64, hourly: &BucketMap) -> bool {
    let hourly_total = bucket_total(hourly);
    if hourly_total > *total {
        *total = hourly_total;
        true
    } else {
        false
    }
}
