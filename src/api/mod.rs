use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::vault::SecretService;

pub mod handlers;

/// Shared state passed to handlers.
pub struct AppState {
    pub service: SecretService,
    /// Request body limit, reported back in 413 responses.
    pub max_data_size_mb: u64,
}

impl AppState {
    pub fn max_body_bytes(&self) -> usize {
        (self.max_data_size_mb as usize).saturating_mul(1_000_000)
    }
}

/// Build the full HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_bytes();

    let api = Router::new()
        .route("/secrets", post(handlers::create_secret))
        .route(
            "/secrets/:id",
            post(handlers::retrieve_secret).delete(handlers::revoke_secret),
        )
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api)
        .fallback(fallback_404)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(crate::middleware::request_id))
        .layer(middleware::from_fn(crate::middleware::security_headers))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
