// ABOUTME: HTTP router for the Boxyard API
// ABOUTME: Wires box lifecycle, status and progress endpoints onto shared manager state

use axum::{
    routing::{get, post},
    Router,
};
use boxyard_deploy::BoxManager;
use std::sync::Arc;

pub mod boxes;
pub mod health;
pub mod response;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BoxManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/boxes", post(boxes::create_box).get(boxes::list_boxes))
        .route(
            "/api/boxes/{id}",
            get(boxes::get_box).delete(boxes::delete_box),
        )
        .route("/api/boxes/{id}/status", get(boxes::get_status))
        .route("/api/boxes/{id}/progress", get(boxes::get_progress))
        .route(
            "/api/boxes/{id}/attempts/{attempt}",
            get(boxes::get_attempt),
        )
        .route("/api/boxes/{id}/redeploy", post(boxes::redeploy))
        .with_state(state)
}
