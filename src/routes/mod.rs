// HTTP + WebSocket routes

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tower_http::cors::{Any, CorsLayer};

use crate::service::StackPilot;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) pilot: Arc<StackPilot>,
    pub(crate) ws_event_connections: Arc<AtomicUsize>,
}

pub fn app(pilot: Arc<StackPilot>, ws_event_connections: Arc<AtomicUsize>) -> Router {
    let state = AppState {
        pilot,
        ws_event_connections,
    };
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/endpoints", get(http::endpoints_handler))
        .route(
            "/api/endpoints/{endpoint_id}/snapshot",
            get(http::snapshot_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/refresh",
            post(http::refresh_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/containers/{container_id}/update",
            get(http::update_check_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/containers/{container_id}/start",
            post(http::start_container_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/containers/{container_id}/stop",
            post(http::stop_container_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/containers/{container_id}/restart",
            post(http::restart_container_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/containers/{container_id}/pull",
            post(http::pull_image_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/stacks/{stack_id}/update",
            post(http::stack_update_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/stacks/{stack_id}/start",
            post(http::start_stack_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/stacks/{stack_id}/stop",
            post(http::stop_stack_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/stacks/{stack_id}/operation",
            get(http::active_operation_handler),
        )
        .route(
            "/api/endpoints/{endpoint_id}/stacks/{stack_id}/last-update",
            get(http::last_update_handler),
        )
        .route("/ws/events", get(ws::ws_events)) // WS /ws/events
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
