/// DuckDB initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. Every
/// statement is `IF NOT EXISTS`, so re-running it on startup is a no-op.
///
/// Always set an explicit memory limit: the DuckDB default (80% of system
/// RAM) is not acceptable for a server process. `threads = 2` keeps the
/// background pool small for embedded use.
///
/// Attribution columns on `users` and the landing page on `sessions` are
/// stored camelCased and must be quoted in queries. All `created_at` values
/// are UTC.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

CREATE TABLE IF NOT EXISTS professions (
    id              BIGINT PRIMARY KEY,
    name            VARCHAR NOT NULL,
    slug            VARCHAR,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS products (
    id              BIGINT PRIMARY KEY,
    name            VARCHAR NOT NULL,
    profession_id   BIGINT,
    price           DOUBLE,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS funnels (
    id              BIGINT PRIMARY KEY,
    name            VARCHAR NOT NULL,
    slug            VARCHAR,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS users (
    id              BIGINT PRIMARY KEY,
    name            VARCHAR,
    email           VARCHAR,
    phone           VARCHAR,
    "utmSource"     VARCHAR,
    "utmMedium"     VARCHAR,
    "utmCampaign"   VARCHAR,
    "utmContent"    VARCHAR,
    "utmTerm"       VARCHAR,
    created_at      TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id              BIGINT PRIMARY KEY,
    user_id         BIGINT,
    "landingPage"   VARCHAR,
    referrer        VARCHAR,
    device          VARCHAR,
    country         VARCHAR,
    utm_source      VARCHAR,
    utm_medium      VARCHAR,
    utm_campaign    VARCHAR,
    utm_content     VARCHAR,
    utm_term        VARCHAR,
    profession_id   BIGINT,
    product_id      BIGINT,
    funnel_id       BIGINT,
    created_at      TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);

CREATE TABLE IF NOT EXISTS events (
    id              BIGINT PRIMARY KEY,
    "type"          VARCHAR NOT NULL,
    user_id         BIGINT,
    session_id      BIGINT,
    profession_id   BIGINT,
    product_id      BIGINT,
    funnel_id       BIGINT,
    amount          DOUBLE,
    created_at      TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_type_created ON events("type", created_at);
"#
    )
}
