/**
 * Application State
 *
 * The central state container handed to every axum handler. Everything
 * in here is cheaply cloneable (`Arc`s, pool handles, a watch
 * receiver); handlers extract the parts they need via `FromRef`.
 */

use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::auth::{AuthVerifier, PermissionOracle};
use crate::collab::{CompactionWorker, ReplicaRegistry};
use crate::server::config::Config;
use crate::storage::{BlobStore, LogStore, SnapshotStore};

/// Shared state for both the HTTP and the WebSocket router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_pool: PgPool,
    pub blob_store: Arc<dyn BlobStore>,
    pub log_store: Arc<dyn LogStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub verifier: Arc<AuthVerifier>,
    pub permissions: Arc<PermissionOracle>,
    pub registry: Arc<ReplicaRegistry>,
    pub worker: Arc<CompactionWorker>,
    /// Flips to `true` on graceful shutdown
    pub shutdown: watch::Receiver<bool>,
    pub started_at: Instant,
}

impl AppState {
    /// Seconds since startup (health endpoint).
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.db_pool.clone()
    }
}

impl FromRef<AppState> for Arc<ReplicaRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}

impl FromRef<AppState> for Arc<AuthVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}
