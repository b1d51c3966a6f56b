//! The query executor seam.

use std::fmt;

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketMap;
use crate::filter::{
    AdvancedFilter, Entity, FilterCompiler, FilterCondition, ScopeFilter, SkippedFilter, SqlArg,
};
use crate::period::DatePeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Lead,
    Purchase,
    SurveyResponse,
}

impl EventKind {
    /// Value stored in `events.type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead => "LEAD",
            Self::Purchase => "PURCHASE",
            Self::SurveyResponse => "SURVEY_RESPONSE",
        }
    }
}

/// What an aggregate counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    Sessions,
    Events(EventKind),
}

impl Measure {
    pub const LEADS: Measure = Measure::Events(EventKind::Lead);
    pub const PURCHASES: Measure = Measure::Events(EventKind::Purchase);
    pub const SURVEY_RESPONSES: Measure = Measure::Events(EventKind::SurveyResponse);

    /// Entity whose rows are counted; filters resolve relative to it.
    pub fn root(self) -> Entity {
        match self {
            Measure::Sessions => Entity::Session,
            Measure::Events(_) => Entity::Event,
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measure::Sessions => f.write_str("sessions"),
            Measure::Events(EventKind::Lead) => f.write_str("leads"),
            Measure::Events(EventKind::Purchase) => f.write_str("purchases"),
            Measure::Events(EventKind::SurveyResponse) => f.write_str("survey_responses"),
        }
    }
}

/// Predicate fragment (` AND ...`) plus its arguments in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl Predicate {
    /// Scope constraints first, then the advanced-filter group.
    pub fn compile(
        measure: Measure,
        scope: &ScopeFilter,
        filters: &[AdvancedFilter],
        condition: FilterCondition,
    ) -> (Self, Vec<SkippedFilter>) {
        let root = measure.root();
        let scope = scope.compile(root);
        let advanced = FilterCompiler::new(root).compile(filters, condition);

        let mut predicate = Predicate {
            sql: scope.sql,
            args: scope.args,
        };
        predicate.sql.push_str(&advanced.sql);
        predicate.args.extend(advanced.args);
        (predicate, advanced.skipped)
    }
}

/// Total and per-day breakdown computed in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeriodSummary {
    pub total: i64,
    pub daily: BucketMap,
}

/// Read-only aggregate queries the engine fans out to.
///
/// Day and hour keys must be computed in `tz`. Maps may be sparse; the engine
/// backfills them.
#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    async fn count_by_range(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> anyhow::Result<i64>;

    async fn group_count_by_day(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> anyhow::Result<BucketMap>;

    /// `day` is a single-day period (clock window and truncation included).
    async fn group_count_by_hour(
        &self,
        measure: Measure,
        predicate: &Predicate,
        day: &DatePeriod,
        tz: Tz,
    ) -> anyhow::Result<BucketMap>;

    /// Sum of `events.amount` for an event measure.
    async fn sum_by_range(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> anyhow::Result<f64>;

    /// Single-pass total plus daily breakdown. Backends that can compute both
    /// from one scan should override this.
    async fn period_summary(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> anyhow::Result<PeriodSummary> {
        let total = self.count_by_range(measure, predicate, period, tz).await?;
        let daily = self.group_count_by_day(measure, predicate, period, tz).await?;
        Ok(PeriodSummary { total, daily })
    }
}
