/**
 * Health and Readiness
 *
 * `/health` reports liveness plus worker status and is always 200 while
 * the process runs. `/readiness` additionally probes the database, the
 * blob store and (in remote-auth mode) the identity service, each with
 * a 2 second budget, and returns 503 until all are reachable.
 */

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;

use crate::server::state::AppState;
use crate::storage::SNAPSHOT_BUCKET;

const PROBE_BUDGET: Duration = Duration::from_secs(2);

pub async fn health(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "ok": true,
        "worker_running": state.worker.is_running(),
        "pending_snapshots": state.worker.pending_snapshots(),
        "uptime_secs": state.uptime_secs(),
    }))
    .into_response()
}

pub async fn readiness(State(state): State<AppState>) -> Response {
    let database = tokio::time::timeout(
        PROBE_BUDGET,
        sqlx::query("SELECT 1").execute(&state.db_pool),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let blob_store = tokio::time::timeout(
        PROBE_BUDGET,
        state.blob_store.ensure_bucket(SNAPSHOT_BUCKET),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    // Local HMAC mode has no identity dependency.
    let identity = if state.verifier.is_local() {
        true
    } else {
        state.verifier.probe_identity().await.is_ok()
    };

    let ready = database && blob_store && identity;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "ready": ready,
            "services": {
                "database": database,
                "blob_store": blob_store,
                "identity": identity,
            },
        })),
    )
        .into_response()
}
