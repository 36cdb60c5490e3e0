/**
 * Router Configuration
 *
 * Two routers are served on separate listeners:
 *
 * - HTTP (`PORT`): `/health`, `/readiness`
 * - WebSocket (`HOCUSPOCUS_PORT`): `/ws/document/{documentId}`
 *
 * CORS, per-IP rate limiting and REST CRUD live in the front gateway;
 * this service only exposes the session and control-plane surface.
 */

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::collab::session::document_ws;
use crate::routes::health::{health, readiness};
use crate::server::state::AppState;

/// Control-plane router: health and readiness probes.
pub fn http_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Session router: the document WebSocket endpoint.
pub fn ws_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/document/{document_id}", get(document_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
