use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use leadpulse_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logging. Level controlled via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leadpulse=info".parse()?),
        )
        .json()
        .init();

    let cfg = leadpulse_core::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/leadpulse.db", cfg.data_dir);
    let db = leadpulse_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    info!(
        timezone = cfg.timezone.name(),
        max_span_days = cfg.max_span_days,
        query_timeout_secs = cfg.query_timeout_secs,
        "Dashboard engine configured"
    );

    let state = Arc::new(AppState::new(db, cfg.clone()));
    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = leadpulse_server::app::build_app(state);

    info!(port = cfg.port, "LeadPulse listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
