//! [`QueryExecutor`] over the DuckDB schema in [`crate::schema`].
//!
//! Bucketing happens in two steps. DuckDB groups rows into 15-minute UTC
//! slots, and the slots are folded into local day/hour keys here. Modern
//! IANA offsets are all multiples of 15 minutes, so a slot never straddles a
//! local boundary. Historical local-mean-time offsets (before a zone adopted
//! standard time) are not aligned, and rows from those years may land in the
//! neighbouring day or hour.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use duckdb::types::ToSql;
use duckdb::Connection;
use tracing::debug;

use leadpulse_core::bucket::{local_day_key, local_hour_key, BucketMap};
use leadpulse_core::filter::{Entity, SqlArg};
use leadpulse_core::period::DatePeriod;
use leadpulse_core::query::{Measure, PeriodSummary, Predicate, QueryExecutor};

use crate::DuckDbBackend;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Base `FROM` clause for a measure. Every entity a filter can reach from the
/// measure's root is joined under its fixed alias.
fn from_clause(measure: Measure) -> &'static str {
    match measure.root() {
        Entity::Session => {
            r#"FROM sessions s
            LEFT JOIN users u ON u.id = s.user_id
            LEFT JOIN professions p ON p.id = s.profession_id
            LEFT JOIN products pr ON pr.id = s.product_id
            LEFT JOIN funnels f ON f.id = s.funnel_id"#
        }
        _ => {
            r#"FROM events e
            LEFT JOIN users u ON u.id = e.user_id
            LEFT JOIN sessions s ON s.id = e.session_id
            LEFT JOIN professions p ON p.id = e.profession_id
            LEFT JOIN products pr ON pr.id = e.product_id
            LEFT JOIN funnels f ON f.id = e.funnel_id"#
        }
    }
}

/// A fully rendered statement with owned parameters, ready for the blocking pool.
struct Statement {
    sql: String,
    params: Vec<Box<dyn ToSql + Send>>,
}

impl Statement {
    /// `SELECT {select} FROM ... WHERE <type> AND <time windows> <predicate> {tail}`.
    fn build(
        select: &str,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
        tail: &str,
    ) -> Result<Self> {
        let root = measure.root().alias();
        let mut params: Vec<Box<dyn ToSql + Send>> = Vec::new();
        let mut where_sql = String::from("TRUE");

        if let Measure::Events(kind) = measure {
            where_sql = format!(r#"{root}."type" = ?"#);
            params.push(Box::new(kind.as_str().to_string()));
        }

        let windows = period.utc_windows(tz)?;
        if windows.is_empty() {
            where_sql.push_str(" AND FALSE");
        } else {
            let ranges: Vec<String> = windows
                .iter()
                .map(|_| {
                    format!(
                        "({root}.created_at >= CAST(? AS TIMESTAMP) AND {root}.created_at < CAST(? AS TIMESTAMP))"
                    )
                })
                .collect();
            where_sql.push_str(&format!(" AND ({})", ranges.join(" OR ")));
            for (start, end) in &windows {
                params.push(Box::new(start.format(TS_FORMAT).to_string()));
                params.push(Box::new(end.format(TS_FORMAT).to_string()));
            }
        }

        where_sql.push_str(&predicate.sql);
        for arg in &predicate.args {
            params.push(match arg {
                SqlArg::Text(v) => Box::new(v.clone()),
                SqlArg::Int(v) => Box::new(*v),
                SqlArg::Float(v) => Box::new(*v),
            });
        }

        Ok(Self {
            sql: format!(
                "SELECT {select} {from} WHERE {where_sql} {tail}",
                from = from_clause(measure)
            ),
            params,
        })
    }

    fn param_refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref() as &dyn ToSql).collect()
    }
}

fn slot_select(measure: Measure) -> String {
    format!(
        "CAST(time_bucket(INTERVAL '15 minutes', {}.created_at) AS VARCHAR) AS slot, COUNT(*) AS n",
        measure.root().alias()
    )
}

fn parse_slot(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("unexpected time bucket {raw:?}"))?;
    Ok(naive.and_utc())
}

fn query_scalar<T: duckdb::types::FromSql>(conn: &Connection, stmt: &Statement) -> Result<T> {
    let params = stmt.param_refs();
    Ok(conn.query_row(&stmt.sql, params.as_slice(), |row| row.get(0))?)
}

/// Run a slot histogram and fold each slot into a local key.
fn query_slots(
    conn: &Connection,
    stmt: &Statement,
    key: impl Fn(DateTime<Utc>) -> String,
) -> Result<BucketMap> {
    let params = stmt.param_refs();
    let mut prepared = conn.prepare(&stmt.sql)?;
    let rows = prepared.query_map(params.as_slice(), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut buckets = BTreeMap::new();
    for row in rows {
        let (slot, n) = row?;
        *buckets.entry(key(parse_slot(&slot)?)).or_insert(0) += n;
    }
    Ok(buckets)
}

impl DuckDbBackend {
    /// Run `f` against a cloned connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.reader().await?;
        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .map_err(|e| anyhow!("query task panicked: {e}"))?
    }
}

#[async_trait]
impl QueryExecutor for DuckDbBackend {
    async fn count_by_range(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> Result<i64> {
        let stmt = Statement::build("COUNT(*)", measure, predicate, period, tz, "")?;
        debug!(%measure, sql = %stmt.sql, "count_by_range");
        self.run(move |conn| query_scalar(conn, &stmt)).await
    }

    async fn group_count_by_day(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> Result<BucketMap> {
        let stmt = Statement::build(
            &slot_select(measure),
            measure,
            predicate,
            period,
            tz,
            "GROUP BY slot",
        )?;
        debug!(%measure, sql = %stmt.sql, "group_count_by_day");
        self.run(move |conn| query_slots(conn, &stmt, |ts| local_day_key(ts, tz)))
            .await
    }

    async fn group_count_by_hour(
        &self,
        measure: Measure,
        predicate: &Predicate,
        day: &DatePeriod,
        tz: Tz,
    ) -> Result<BucketMap> {
        let stmt = Statement::build(
            &slot_select(measure),
            measure,
            predicate,
            day,
            tz,
            "GROUP BY slot",
        )?;
        debug!(%measure, sql = %stmt.sql, "group_count_by_hour");
        self.run(move |conn| query_slots(conn, &stmt, |ts| local_hour_key(ts, tz)))
            .await
    }

    async fn sum_by_range(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> Result<f64> {
        if measure == Measure::Sessions {
            return Err(anyhow!("sessions carry no amount"));
        }
        let stmt = Statement::build(
            "CAST(COALESCE(SUM(e.amount), 0) AS DOUBLE)",
            measure,
            predicate,
            period,
            tz,
            "",
        )?;
        debug!(%measure, sql = %stmt.sql, "sum_by_range");
        self.run(move |conn| query_scalar(conn, &stmt)).await
    }

    /// One scan: the daily histogram, with the total as its sum.
    async fn period_summary(
        &self,
        measure: Measure,
        predicate: &Predicate,
        period: &DatePeriod,
        tz: Tz,
    ) -> Result<PeriodSummary> {
        let daily = self.group_count_by_day(measure, predicate, period, tz).await?;
        Ok(PeriodSummary {
            total: daily.values().sum(),
            daily,
        })
    }
}
