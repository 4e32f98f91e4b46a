//! HTTP surface.
//!
//! ```text
//! GET    /health
//! GET    /metrics
//! GET    /api/search
//! POST   /api/auctions
//! GET    /api/auctions/:id
//! PUT    /api/auctions/:id
//! DELETE /api/auctions/:id
//! GET    /api/auctions/:id/snapshot
//! GET    /api/auctions/:id/bids
//! POST   /api/auctions/:id/bids
//! GET    /ws/notifications
//! ```

pub mod auctions;
pub mod error;
pub mod notifications;
pub mod search;
pub mod state;

pub use error::ApiError;
pub use state::AppState;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// Service version
    pub version: &'static str,
}

/// Liveness check. Does not verify dependencies.
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus exposition, or `404` when metrics are disabled.
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.as_ref().and_then(|m| m.render()) {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => ApiError::new(StatusCode::NOT_FOUND, "METRICS_DISABLED", "metrics are not enabled").into_response(),
    }
}

/// Build the router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/search", get(search::search))
        .route("/auctions", post(auctions::create_auction))
        .route(
            "/auctions/:id",
            get(auctions::get_auction)
                .put(auctions::update_auction)
                .delete(auctions::delete_auction),
        )
        .route("/auctions/:id/snapshot", get(auctions::get_snapshot))
        .route("/auctions/:id/bids", get(auctions::list_bids).post(auctions::place_bid));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/ws/notifications", get(notifications::notifications))
        .nest("/api", api_routes)
        .with_state(state)
}
