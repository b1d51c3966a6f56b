use std::time::Duration;

use chrono_tz::Tz;

/// Process configuration, read once at startup from `LEADPULSE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    /// IANA name of the civil timezone every day/hour bucket is computed in.
    pub timezone: Tz,
    pub max_span_days: i64,
    pub query_timeout_secs: u64,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            port: std::env::var("LEADPULSE_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("LEADPULSE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("LEADPULSE_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            timezone: {
                let raw =
                    std::env::var("LEADPULSE_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());
                raw.trim()
                    .parse::<Tz>()
                    .map_err(|_| format!("invalid timezone: {raw}"))?
            },
            max_span_days: std::env::var("LEADPULSE_MAX_SPAN_DAYS")
                .unwrap_or_else(|_| "90".to_string())
                .parse()
                .unwrap_or(90),
            // Anything below 30s is clamped up: it is the floor for a single aggregate.
            query_timeout_secs: std::env::var("LEADPULSE_QUERY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30)
                .max(30),
            cors_origins: std::env::var("LEADPULSE_CORS_ORIGINS")
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "1GB".to_string(),
            timezone: Tz::UTC,
            max_span_days: 90,
            query_timeout_secs: 30,
            cors_origins: Vec::new(),
        }
    }
}
