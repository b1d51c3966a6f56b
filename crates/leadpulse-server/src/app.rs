use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// Middleware is applied in outer-to-inner order (outermost runs first on
/// request, last on response):
///
/// 1. `TraceLayer` for request/response logging via `tracing`.
/// 2. `CorsLayer` restricted to `LEADPULSE_CORS_ORIGINS`, or open when unset.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/dashboard/sessions", post(routes::dashboard::sessions))
        .route("/api/dashboard/leads", post(routes::dashboard::leads))
        .route("/api/dashboard/purchases", post(routes::dashboard::purchases))
        .route(
            "/api/dashboard/survey-responses",
            post(routes::dashboard::survey_responses),
        )
        .route("/api/dashboard/conversion", post(routes::dashboard::conversion))
        .route("/api/dashboard/revenue", post(routes::dashboard::revenue))
        .route(
            "/api/dashboard/revenue/professions",
            post(routes::dashboard::revenue_by_profession),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}
