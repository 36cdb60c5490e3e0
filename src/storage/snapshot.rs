/**
 * Snapshot Store
 *
 * One snapshot per document, routed by size at write time: small
 * snapshots live inline in `crdt_snapshots` (BYTEA), large ones as an
 * object at `docs/{id}.bin`. The document row records which form is
 * current, its size and `last_snapshot_at`.
 *
 * # Form Transitions
 *
 * `save` keeps metadata and the physical form mutually consistent:
 * inline→blob puts the object first and deletes the inline row in the
 * same transaction that flips the metadata; blob→inline deletes the
 * object only after the inline upsert commits. A crash in between
 * leaves the previous committed form readable.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    snapshot_key, BlobError, BlobStore, SnapshotInfo, SnapshotReceipt, SnapshotStorage,
    SnapshotStore, SNAPSHOT_BUCKET,
};
use crate::error::ServiceError;

/// Snapshot store over Postgres metadata plus the blob adapter.
pub struct PgSnapshotStore {
    pool: PgPool,
    blob: Arc<dyn BlobStore>,
    size_limit_bytes: usize,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool, blob: Arc<dyn BlobStore>, size_limit_bytes: usize) -> Self {
        Self {
            pool,
            blob,
            size_limit_bytes,
        }
    }

    /// Current storage form recorded on the document row.
    ///
    /// `Err(NotFound)` when the document row itself is missing.
    async fn current_storage(&self, doc_id: Uuid) -> Result<Option<SnapshotStorage>, ServiceError> {
        let row: Option<Option<String>> =
            sqlx::query_scalar(r#"SELECT snapshot_storage FROM documents WHERE id = $1"#)
                .bind(doc_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            None => Err(ServiceError::NotFound(format!("document {}", doc_id))),
            Some(value) => Ok(value.as_deref().and_then(SnapshotStorage::parse)),
        }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, ServiceError> {
        let storage = match self.current_storage(doc_id).await {
            Ok(storage) => storage,
            Err(ServiceError::NotFound(_)) => return Ok(None),
            Err(other) => return Err(other),
        };

        match storage {
            None => Ok(None),
            Some(SnapshotStorage::Pg) => {
                let bytes: Option<Vec<u8>> = sqlx::query_scalar(
                    r#"SELECT snapshot FROM crdt_snapshots WHERE document_id = $1"#,
                )
                .bind(doc_id)
                .fetch_optional(&self.pool)
                .await?;

                if bytes.is_none() {
                    tracing::warn!(%doc_id, "snapshot_storage=pg but inline row is missing");
                }
                Ok(bytes)
            }
            Some(SnapshotStorage::Minio) => {
                match self.blob.get(SNAPSHOT_BUCKET, &snapshot_key(doc_id)).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(BlobError::NotFound) => {
                        tracing::warn!(%doc_id, "snapshot_storage=minio but object is missing");
                        Ok(None)
                    }
                    Err(other) => Err(other.into()),
                }
            }
        }
    }

    async fn save(
        &self,
        doc_id: Uuid,
        bytes: &[u8],
        taken_at: DateTime<Utc>,
    ) -> Result<SnapshotReceipt, ServiceError> {
        let previous = self.current_storage(doc_id).await?;
        let size_bytes = bytes.len() as i64;
        let target = if bytes.len() > self.size_limit_bytes {
            SnapshotStorage::Minio
        } else {
            SnapshotStorage::Pg
        };

        match target {
            SnapshotStorage::Minio => {
                // Object first; the metadata flip and inline-row delete
                // land in one transaction after the put succeeds.
                self.blob
                    .put(
                        SNAPSHOT_BUCKET,
                        &snapshot_key(doc_id),
                        bytes.to_vec(),
                        "application/octet-stream",
                    )
                    .await?;

                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET snapshot_storage = 'minio',
                        snapshot_size_bytes = $2,
                        last_snapshot_at = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(doc_id)
                .bind(size_bytes)
                .bind(taken_at)
                .execute(&mut *tx)
                .await?;
                sqlx::query(r#"DELETE FROM crdt_snapshots WHERE document_id = $1"#)
                    .bind(doc_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            SnapshotStorage::Pg => {
                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    r#"
                    INSERT INTO crdt_snapshots (document_id, snapshot)
                    VALUES ($1, $2)
                    ON CONFLICT (document_id) DO UPDATE SET
                        snapshot = EXCLUDED.snapshot,
                        updated_at = NOW()
                    "#,
                )
                .bind(doc_id)
                .bind(bytes)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET snapshot_storage = 'pg',
                        snapshot_size_bytes = $2,
                        last_snapshot_at = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(doc_id)
                .bind(size_bytes)
                .bind(taken_at)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                // Retire the blob object only after the inline form is
                // committed and readable.
                if previous == Some(SnapshotStorage::Minio) {
                    match self.blob.delete(SNAPSHOT_BUCKET, &snapshot_key(doc_id)).await {
                        Ok(()) | Err(BlobError::NotFound) => {}
                        Err(err) => {
                            tracing::warn!(%doc_id, error = %err, "failed to delete retired snapshot object");
                        }
                    }
                }
            }
        }

        tracing::debug!(%doc_id, storage = target.as_str(), size_bytes, "snapshot saved");
        Ok(SnapshotReceipt {
            storage: target,
            size_bytes,
        })
    }

    async fn info(&self, doc_id: Uuid) -> Result<Option<SnapshotInfo>, ServiceError> {
        let row = sqlx::query(
            r#"
            SELECT last_snapshot_at, snapshot_storage, snapshot_size_bytes
            FROM documents WHERE id = $1
            "#,
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_at: Option<DateTime<Utc>> = row.get("last_snapshot_at");
        let storage: Option<String> = row.get("snapshot_storage");
        let size_bytes: i64 = row.get("snapshot_size_bytes");

        match (last_at, storage.as_deref().and_then(SnapshotStorage::parse)) {
            (Some(last_at), Some(storage)) => Ok(Some(SnapshotInfo {
                last_at,
                storage,
                size_bytes,
            })),
            _ => Ok(None),
        }
    }

    async fn delete(&self, doc_id: Uuid) -> Result<(), ServiceError> {
        let previous = match self.current_storage(doc_id).await {
            Ok(previous) => previous,
            Err(ServiceError::NotFound(_)) => return Ok(()),
            Err(other) => return Err(other),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(r#"DELETE FROM crdt_snapshots WHERE document_id = $1"#)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE documents
            SET snapshot_storage = NULL,
                snapshot_size_bytes = 0,
                last_snapshot_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if previous == Some(SnapshotStorage::Minio) {
            match self.blob.delete(SNAPSHOT_BUCKET, &snapshot_key(doc_id)).await {
                Ok(()) | Err(BlobError::NotFound) => {}
                Err(err) => {
                    tracing::warn!(%doc_id, error = %err, "failed to delete snapshot object");
                }
            }
        }

        Ok(())
    }
}
