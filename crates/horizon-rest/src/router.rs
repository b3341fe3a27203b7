//! Main application router.

use crate::{
    controllers::{dead_letter_controller, health_controller, jobs_controller},
    middleware::logging_middleware,
    state::AppState,
};
use axum::{middleware, Router};
use horizon_config::ServerConfig;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

/// Builds the admin router: health at the root, everything else under
/// `/api/v1/admin`.
pub fn create_router(state: AppState, server_config: &ServerConfig) -> Router {
    let admin = Router::new()
        .nest("/dead-letters", dead_letter_controller::router())
        .nest("/jobs", jobs_controller::router());

    let router = Router::new()
        .merge(health_controller::router())
        .nest("/api/v1/admin", admin)
        .with_state(state)
        .layer(TimeoutLayer::new(server_config.request_timeout()))
        .layer(create_cors_layer(server_config))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware));

    info!("Admin router created");
    router
}

fn create_cors_layer(server_config: &ServerConfig) -> CorsLayer {
    if server_config.cors_enabled {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}
