use std::sync::Arc;

use leadpulse_core::{
    config::Config,
    engine::{DashboardEngine, EngineConfig},
};
use leadpulse_duckdb::DuckDbBackend;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// The DuckDB backend, also used directly by the health probe.
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// Aggregation engine over `db`. Cheap to clone per request.
    pub engine: DashboardEngine,
}

impl AppState {
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        let db = Arc::new(db);
        let engine = DashboardEngine::new(db.clone(), EngineConfig::from(&config));
        Self {
            db,
            config: Arc::new(config),
            engine,
        }
    }
}
