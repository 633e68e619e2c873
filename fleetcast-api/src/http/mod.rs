// Module: http
// HTTP/JSON front of the module gateway

pub mod error;
pub mod health;
pub mod module;

use axum::{routing::get, Router};
use fleetcast_cluster::ModuleGateway;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ModuleGateway>,
}

/// Create the HTTP router with all routes
pub fn create_router(gateway: Arc<ModuleGateway>) -> Router {
    let state = AppState { gateway };

    let router = Router::new()
        .merge(health::create_health_router())
        .route("/api/v1/module", get(module::list))
        .route(
            "/api/v1/module/{name}",
            get(module::get).post(module::apply).delete(module::delete),
        )
        .route("/api/v1/module/{name}/log", get(module::watch_log))
        .route("/api/v1/module/{name}/data", get(module::watch_data));

    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
