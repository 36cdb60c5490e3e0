//! Persistence: the blob adapter, the per-document update log and the
//! size-routed snapshot store.
//!
//! Each concern is a minimal capability trait so that the registry and
//! the compaction worker stay oblivious to the physical backend:
//!
//! - [`BlobStore`] - opaque key→bytes with presigned URLs (MinIO/S3)
//! - [`LogStore`] - append-only ordered updates per document (Postgres)
//! - [`SnapshotStore`] - one snapshot per document, inline or blob by size
//!
//! Stores never call back into replicas; ownership flows one way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ServiceError;

/// Blob adapter (S3/MinIO)
pub mod blob;

/// Append-only update log (Postgres)
pub mod log;

/// Size-routed snapshot store
pub mod snapshot;

#[cfg(test)]
pub mod memory;

pub use blob::S3BlobStore;
pub use log::PgLogStore;
pub use snapshot::PgSnapshotStore;

/// Bucket holding compacted document snapshots.
pub const SNAPSHOT_BUCKET: &str = "crdt-snapshots";

/// Bucket holding user-uploaded attachments.
pub const ATTACHMENTS_BUCKET: &str = "attachments";

/// Blob adapter failures. No retry happens at this layer; callers decide.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The object or bucket does not exist
    #[error("object not found")]
    NotFound,

    /// Network or backend failure
    #[error("blob transport error: {0}")]
    Transport(String),

    /// Credentials rejected by the backend
    #[error("blob auth failure: {0}")]
    AuthFailure(String),
}

/// Opaque key→bytes storage with presigned access.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError>;

    /// Presigned PUT URL valid for `ttl`.
    async fn presign_put(&self, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, BlobError>;

    /// Presigned GET URL valid for `ttl`.
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, BlobError>;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError>;
}

/// Append-only, totally ordered list of updates per document.
///
/// Ordering is by `created_at` with the insertion id as tie-break, both
/// assigned by the store. `read_since(None)` returns the full log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one update; returns the timestamp the store assigned.
    async fn append(&self, doc_id: Uuid, update: &[u8]) -> Result<DateTime<Utc>, ServiceError>;

    /// Number of updates at or after `since` (all of them when `None`).
    async fn count_since(
        &self,
        doc_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, ServiceError>;

    /// Updates at or after `since`, in log order.
    async fn read_since(
        &self,
        doc_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Vec<u8>>, ServiceError>;

    /// Drop updates strictly older than `before`; returns how many went.
    async fn truncate_before(&self, doc_id: Uuid, before: DateTime<Utc>)
        -> Result<u64, ServiceError>;

    /// Drop the whole log for a document.
    async fn delete_all(&self, doc_id: Uuid) -> Result<(), ServiceError>;
}

/// Physical form of a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStorage {
    /// Inline BYTEA row in the relational store
    Pg,
    /// Object at `docs/{id}.bin` in the blob store
    Minio,
}

impl SnapshotStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pg => "pg",
            Self::Minio => "minio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pg" => Some(Self::Pg),
            "minio" => Some(Self::Minio),
            _ => None,
        }
    }
}

/// Snapshot metadata as recorded on the document row.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub last_at: DateTime<Utc>,
    pub storage: SnapshotStorage,
    pub size_bytes: i64,
}

/// Outcome of a snapshot save.
#[derive(Debug, Clone)]
pub struct SnapshotReceipt {
    pub storage: SnapshotStorage,
    pub size_bytes: i64,
}

/// One snapshot per document, routed to the relational or blob store by
/// size at write time. Exactly one physical form exists at a time.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot bytes, or `None` when the document has none.
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, ServiceError>;

    /// Persist a new snapshot, atomically retiring the previous physical
    /// form and updating the document metadata.
    ///
    /// `taken_at` is recorded as `last_snapshot_at` and must be the
    /// moment the caller started reading the state it encoded. Updates
    /// logged after that moment are not in the snapshot, and hydration
    /// replays the log from `last_snapshot_at`, so a later mark would
    /// lose them.
    async fn save(
        &self,
        doc_id: Uuid,
        bytes: &[u8],
        taken_at: DateTime<Utc>,
    ) -> Result<SnapshotReceipt, ServiceError>;

    /// Snapshot metadata, or `None` when the document has no snapshot.
    async fn info(&self, doc_id: Uuid) -> Result<Option<SnapshotInfo>, ServiceError>;

    /// Remove the snapshot in whichever form it exists.
    async fn delete(&self, doc_id: Uuid) -> Result<(), ServiceError>;
}

/// Blob key for a document snapshot.
pub fn snapshot_key(doc_id: Uuid) -> String {
    format!("docs/{}.bin", doc_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_storage_round_trip() {
        assert_eq!(SnapshotStorage::parse("pg"), Some(SnapshotStorage::Pg));
        assert_eq!(SnapshotStorage::parse("minio"), Some(SnapshotStorage::Minio));
        assert_eq!(SnapshotStorage::parse("tape"), None);
        assert_eq!(SnapshotStorage::Pg.as_str(), "pg");
        assert_eq!(SnapshotStorage::Minio.as_str(), "minio");
    }

    #[test]
    fn test_snapshot_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            snapshot_key(id),
            "docs/00000000-0000-0000-0000-000000000000.bin"
        );
    }
}
