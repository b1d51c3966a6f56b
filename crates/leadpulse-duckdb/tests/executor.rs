use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use leadpulse_core::{
    engine::{DashboardEngine, DashboardRequest, EngineConfig},
    filter::{AdvancedFilter, FilterCondition, FilterOperator, ScopeFilter},
    period::{parse_clock, DatePeriod},
    query::{Measure, Predicate, QueryExecutor},
};
use leadpulse_duckdb::{duckdb::params, DuckDbBackend};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("date")
}

/// Three users (one NULL and one empty `utmSource`), one session each, and
/// lead/purchase events spread over 2024-06-01 and 2024-06-02 (UTC).
async fn seeded() -> Arc<DuckDbBackend> {
    let db = DuckDbBackend::open_in_memory().expect("db");
    {
        let conn = db.conn_for_test().await;
        conn.execute_batch(
            r#"
            INSERT INTO professions (id, name, slug) VALUES
                (1, 'Nursing', 'nursing'),
                (2, 'Law', 'law');

            INSERT INTO users (id, name, email, "utmSource", "utmMedium", created_at) VALUES
                (1, 'Ana',   'ana@acme.com',  'google', 'cpc',   '2024-05-01 10:00:00'),
                (2, 'Bruno', 'bruno@mail.com', NULL,    NULL,    '2024-05-01 10:00:00'),
                (3, 'Caio',  'caio@acme.com', '',       'email', '2024-05-01 10:00:00');

            INSERT INTO sessions (id, user_id, "landingPage", utm_medium, profession_id, created_at) VALUES
                (10, 1, '/nursing', 'cpc',     1, '2024-06-01 08:00:00'),
                (11, 2, '/law',     'email',   2, '2024-06-01 12:00:00'),
                (12, 3, '/nursing', 'organic', 1, '2024-06-02 12:30:00'),
                (13, 1, '/nursing', 'cpc',     1, '2024-06-02 01:30:00');

            INSERT INTO events (id, "type", user_id, session_id, profession_id, amount, created_at) VALUES
                (100, 'LEAD',     1, 10, 1, NULL,  '2024-06-01 08:05:00'),
                (101, 'LEAD',     2, 11, 2, NULL,  '2024-06-01 12:10:00'),
                (102, 'LEAD',     3, 12, 1, NULL,  '2024-06-02 12:40:00'),
                (103, 'LEAD',     1, 13, 1, NULL,  '2024-06-02 01:35:00'),
                (104, 'PURCHASE', 1, 10, 1, 199.9, '2024-06-01 20:00:00'),
                (105, 'PURCHASE', 2, 11, 2, 50.0,  '2024-06-02 09:00:00');
            "#,
        )
        .expect("fixtures");
    }
    Arc::new(db)
}

fn june(from: u32, to: u32) -> DatePeriod {
    DatePeriod::from_dates(date(2024, 6, from), date(2024, 6, to)).expect("period")
}

fn predicate(
    measure: Measure,
    scope: &ScopeFilter,
    filters: &[AdvancedFilter],
    condition: FilterCondition,
) -> Predicate {
    Predicate::compile(measure, scope, filters, condition).0
}

#[tokio::test]
async fn counts_events_of_one_type_in_range() {
    let db = seeded().await;
    let leads = db
        .count_by_range(Measure::LEADS, &Predicate::default(), &june(1, 2), Tz::UTC)
        .await
        .expect("count");
    assert_eq!(leads, 4);

    let purchases = db
        .count_by_range(Measure::PURCHASES, &Predicate::default(), &june(1, 1), Tz::UTC)
        .await
        .expect("count");
    assert_eq!(purchases, 1);
}

#[tokio::test]
async fn empty_attribution_filter_treats_null_as_empty() {
    let db = seeded().await;
    let set = predicate(
        Measure::LEADS,
        &ScopeFilter::default(),
        &[AdvancedFilter::new("user.utm_source", FilterOperator::NotEquals, "")],
        FilterCondition::And,
    );
    let with_source = db
        .count_by_range(Measure::LEADS, &set, &june(1, 2), Tz::UTC)
        .await
        .expect("count");
    // Leads 100 and 103 belong to the only user with a source.
    assert_eq!(with_source, 2);

    let unset = predicate(
        Measure::LEADS,
        &ScopeFilter::default(),
        &[AdvancedFilter::new("user.utm_source", FilterOperator::Equals, "")],
        FilterCondition::And,
    );
    let without_source = db
        .count_by_range(Measure::LEADS, &unset, &june(1, 2), Tz::UTC)
        .await
        .expect("count");
    assert_eq!(without_source, 2);
}

#[tokio::test]
async fn or_group_stays_inside_scope() {
    let db = seeded().await;
    let scope = ScopeFilter {
        profession_ids: vec![1],
        ..Default::default()
    };
    let p = predicate(
        Measure::LEADS,
        &scope,
        &[
            AdvancedFilter::new("session.utm_medium", FilterOperator::Equals, "cpc"),
            AdvancedFilter::new("session.utm_medium", FilterOperator::Equals, "email"),
        ],
        FilterCondition::Or,
    );
    // Lead 101 is email but profession 2, so the scope excludes it.
    let n = db
        .count_by_range(Measure::LEADS, &p, &june(1, 2), Tz::UTC)
        .await
        .expect("count");
    assert_eq!(n, 2);
}

#[tokio::test]
async fn contains_filter_and_landing_page_scope() {
    let db = seeded().await;
    let p = predicate(
        Measure::Sessions,
        &ScopeFilter {
            landing_page: Some("/nursing".to_string()),
            ..Default::default()
        },
        &[AdvancedFilter::new("user.email", FilterOperator::Contains, "@acme")],
        FilterCondition::And,
    );
    let n = db
        .count_by_range(Measure::Sessions, &p, &june(1, 2), Tz::UTC)
        .await
        .expect("count");
    assert_eq!(n, 3);
}

#[tokio::test]
async fn clock_window_applies_to_every_day() {
    let db = seeded().await;
    let period = june(1, 2)
        .with_time_window(
            Some(parse_clock("09:00").expect("clock")),
            Some(parse_clock("18:00").expect("clock")),
        )
        .expect("window");
    let n = db
        .count_by_range(Measure::LEADS, &Predicate::default(), &period, Tz::UTC)
        .await
        .expect("count");
    // 12:10 on the 1st and 12:40 on the 2nd.
    assert_eq!(n, 2);
}

#[tokio::test]
async fn buckets_follow_reference_timezone() {
    let db = seeded().await;
    let tz: Tz = "America/Sao_Paulo".parse().expect("tz");

    let daily = db
        .group_count_by_day(Measure::LEADS, &Predicate::default(), &june(1, 2), tz)
        .await
        .expect("daily");
    // 01:35 UTC on the 2nd is 22:35 local on the 1st.
    assert_eq!(daily.get("2024-06-01"), Some(&3));
    assert_eq!(daily.get("2024-06-02"), Some(&1));

    let hourly = db
        .group_count_by_hour(
            Measure::LEADS,
            &Predicate::default(),
            &DatePeriod::single_day(date(2024, 6, 1)).expect("day"),
            tz,
        )
        .await
        .expect("hourly");
    assert_eq!(hourly.get("05"), Some(&1));
    assert_eq!(hourly.get("09"), Some(&1));
    assert_eq!(hourly.get("22"), Some(&1));
}

#[tokio::test]
async fn revenue_sums_purchase_amounts() {
    let db = seeded().await;
    let total = db
        .sum_by_range(Measure::PURCHASES, &Predicate::default(), &june(1, 2), Tz::UTC)
        .await
        .expect("sum");
    assert!((total - 249.9).abs() < 1e-9);

    let empty = db
        .sum_by_range(Measure::PURCHASES, &Predicate::default(), &june(3, 3), Tz::UTC)
        .await
        .expect("sum");
    assert_eq!(empty, 0.0);

    assert!(db
        .sum_by_range(Measure::Sessions, &Predicate::default(), &june(1, 2), Tz::UTC)
        .await
        .is_err());
}

#[tokio::test]
async fn late_purchase_lands_in_its_local_day() {
    let db = seeded().await;
    {
        let conn = db.conn_for_test().await;
        conn.execute(
            r#"INSERT INTO events (id, "type", user_id, session_id, profession_id, amount, created_at)
               VALUES (?, 'PURCHASE', ?, ?, ?, ?, CAST(? AS TIMESTAMP))"#,
            params![106, 3, 12, 1, 25.5, "2024-06-03 02:00:00"],
        )
        .expect("insert");
    }
    let tz: Tz = "America/Sao_Paulo".parse().expect("tz");
    // 02:00 UTC on the 3rd is 23:00 local on the 2nd.
    let local = db
        .sum_by_range(Measure::PURCHASES, &Predicate::default(), &june(2, 2), tz)
        .await
        .expect("sum");
    assert!((local - 75.5).abs() < 1e-9);
    let utc = db
        .sum_by_range(Measure::PURCHASES, &Predicate::default(), &june(2, 2), Tz::UTC)
        .await
        .expect("sum");
    assert!((utc - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn period_summary_matches_separate_queries() {
    let db = seeded().await;
    let summary = db
        .period_summary(Measure::Sessions, &Predicate::default(), &june(1, 2), Tz::UTC)
        .await
        .expect("summary");
    assert_eq!(summary.total, 4);
    assert_eq!(summary.daily.get("2024-06-01"), Some(&2));
    assert_eq!(summary.daily.get("2024-06-02"), Some(&2));
}

#[tokio::test]
async fn engine_runs_against_duckdb() {
    let db = seeded().await;
    let engine = DashboardEngine::new(db, EngineConfig::default());

    let result = engine
        .compare(
            Measure::LEADS,
            &DashboardRequest::new(june(2, 2)).with_previous(june(1, 1)),
        )
        .await
        .expect("compare");
    assert_eq!(result.metric.current, 2);
    assert_eq!(result.metric.previous, 2);
    assert!(!result.metric.is_increasing);
    assert_eq!(result.current_hourly.as_ref().map(|h| h.len()), Some(24));
    assert_eq!(result.current_hourly.as_ref().and_then(|h| h.get("12")), Some(&1));

    let breakdown = engine
        .revenue_by_profession(
            &DashboardRequest::new(june(1, 2)).with_previous(DatePeriod::from_dates(
                date(2024, 5, 30),
                date(2024, 5, 31),
            )
            .expect("period")),
            &[1, 2],
        )
        .await
        .expect("breakdown");
    assert_eq!(breakdown.general.revenue.current, 249.9);
    assert_eq!(breakdown.by_profession[&1].revenue.current, 199.9);
    assert_eq!(breakdown.by_profession[&2].purchases.current, 1);
    assert!(breakdown.failed.is_empty());
}
