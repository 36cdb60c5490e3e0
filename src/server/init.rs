/**
 * Server Initialization
 *
 * Builds the shared application state in dependency order: database
 * pool and migrations first, then the blob client and its buckets,
 * then the auth/permission layer, the replica registry and the
 * compaction worker.
 *
 * Unlike optional features, every dependency here is load-bearing: a
 * failure at any step aborts startup and the process exits with code 1.
 */

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::auth::{AuthVerifier, PermissionOracle};
use crate::auth::verifier::DEFAULT_CACHE_CAPACITY;
use crate::collab::{CompactionWorker, ReplicaRegistry};
use crate::error::ServiceError;
use crate::server::config::Config;
use crate::server::state::AppState;
use crate::storage::{
    BlobStore, LogStore, PgLogStore, PgSnapshotStore, S3BlobStore, SnapshotStore,
    ATTACHMENTS_BUCKET, SNAPSHOT_BUCKET,
};

/// Build the full application state. Any error is a startup failure.
pub async fn build_state(
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<AppState, ServiceError> {
    let config = Arc::new(config);

    // Step 1: database pool + migrations
    tracing::info!(host = %config.db_host, db = %config.db_name, "connecting to database");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url())
        .await
        .map_err(|e| ServiceError::transient(format!("database unreachable: {}", e)))?;

    tracing::info!("running database migrations");
    sqlx::migrate!()
        .run(&db_pool)
        .await
        .map_err(|e| ServiceError::Fatal(format!("migrations failed: {}", e)))?;

    // Step 2: blob store + buckets
    tracing::info!(endpoint = %config.minio_endpoint(), "initializing blob store");
    let blob_store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(config.blob_config()));
    blob_store.ensure_bucket(SNAPSHOT_BUCKET).await?;
    blob_store.ensure_bucket(ATTACHMENTS_BUCKET).await?;

    // Step 3: auth verification + permissions
    let verifier = Arc::new(AuthVerifier::new(
        config.jwt_secret.clone(),
        config.auth_service_url.clone(),
        DEFAULT_CACHE_CAPACITY,
    ));
    if verifier.is_local() {
        tracing::info!("token verification: local HMAC");
    } else {
        tracing::info!(url = %config.auth_service_url, "token verification: remote introspection");
        verifier.probe_identity().await?;
    }
    let permissions = Arc::new(PermissionOracle::new(db_pool.clone()));

    // Step 4: stores, registry, worker
    let log_store: Arc<dyn LogStore> = Arc::new(PgLogStore::new(db_pool.clone()));
    let snapshot_store: Arc<dyn SnapshotStore> = Arc::new(PgSnapshotStore::new(
        db_pool.clone(),
        blob_store.clone(),
        config.snapshot_size_limit_bytes(),
    ));

    let registry = Arc::new(ReplicaRegistry::new(
        log_store.clone(),
        snapshot_store.clone(),
        config.registry_config(),
    ));

    let worker = Arc::new(CompactionWorker::new(
        db_pool.clone(),
        log_store.clone(),
        snapshot_store.clone(),
        registry.clone(),
        config.compactor_config(),
    ));

    tracing::info!("application state initialized");
    Ok(AppState {
        config,
        db_pool,
        blob_store,
        log_store,
        snapshot_store,
        verifier,
        permissions,
        registry,
        worker,
        shutdown,
        started_at: Instant::now(),
    })
}
