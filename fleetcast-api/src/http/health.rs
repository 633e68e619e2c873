//! Health check endpoints
//!
//! Provides simple health check for monitoring probes.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
struct Readiness {
    status: &'static str,
    /// Instances currently known to the registry; absent for a static target.
    instances: Option<usize>,
}

/// Readiness check reporting the size of the discovered fleet
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let instances = state
        .gateway
        .broadcast()
        .targets()
        .registry_handle()
        .map(|registry| registry.len());

    Json(Readiness {
        status: "ready",
        instances,
    })
}
