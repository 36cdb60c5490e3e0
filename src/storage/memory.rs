//! In-memory store doubles for tests.
//!
//! Behaviorally equivalent to the Postgres/MinIO implementations at the
//! trait surface: same ordering, same size routing, same single-form
//! invariant. Used by the registry, compactor and session tests so the
//! whole pipeline runs without external services.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::{
    snapshot_key, BlobError, BlobStore, LogStore, SnapshotInfo, SnapshotReceipt, SnapshotStorage,
    SnapshotStore, SNAPSHOT_BUCKET,
};
use crate::error::ServiceError;

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    buckets: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BlobError> {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or(BlobError::NotFound)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        Ok(format!(
            "memory://{}/{}?method=PUT&expires={}",
            bucket,
            key,
            ttl.as_secs()
        ))
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        Ok(format!(
            "memory://{}/{}?method=GET&expires={}",
            bucket,
            key,
            ttl.as_secs()
        ))
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError> {
        self.buckets.lock().unwrap().insert(bucket.to_string());
        Ok(())
    }
}

struct LogEntry {
    created_at: DateTime<Utc>,
    seq: u64,
    bytes: Vec<u8>,
}

/// In-memory append-only update log.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: Mutex<HashMap<Uuid, Vec<LogEntry>>>,
    seq: AtomicU64,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, doc_id: Uuid, update: &[u8]) -> Result<DateTime<Utc>, ServiceError> {
        let mut entries = self.entries.lock().unwrap();
        let log = entries.entry(doc_id).or_default();
        // Monotone non-decreasing per document, like DB-assigned times.
        let now = Utc::now();
        let created_at = log
            .last()
            .map(|prev| prev.created_at.max(now))
            .unwrap_or(now);
        log.push(LogEntry {
            created_at,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            bytes: update.to_vec(),
        });
        Ok(created_at)
    }

    async fn count_since(
        &self,
        doc_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, ServiceError> {
        let entries = self.entries.lock().unwrap();
        let count = entries
            .get(&doc_id)
            .map(|log| {
                log.iter()
                    .filter(|e| since.map(|t| e.created_at >= t).unwrap_or(true))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as i64)
    }

    async fn read_since(
        &self,
        doc_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Vec<u8>>, ServiceError> {
        let entries = self.entries.lock().unwrap();
        let Some(log) = entries.get(&doc_id) else {
            return Ok(Vec::new());
        };
        let mut selected: Vec<&LogEntry> = log
            .iter()
            .filter(|e| since.map(|t| e.created_at >= t).unwrap_or(true))
            .collect();
        selected.sort_by_key(|e| (e.created_at, e.seq));
        Ok(selected.into_iter().map(|e| e.bytes.clone()).collect())
    }

    async fn truncate_before(
        &self,
        doc_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let mut entries = self.entries.lock().unwrap();
        let Some(log) = entries.get_mut(&doc_id) else {
            return Ok(0);
        };
        let before_len = log.len();
        log.retain(|e| e.created_at >= before);
        Ok((before_len - log.len()) as u64)
    }

    async fn delete_all(&self, doc_id: Uuid) -> Result<(), ServiceError> {
        self.entries.lock().unwrap().remove(&doc_id);
        Ok(())
    }
}

struct StoredSnapshot {
    last_at: DateTime<Utc>,
    storage: SnapshotStorage,
    size_bytes: i64,
}

/// In-memory snapshot store with the same size-routing policy as the
/// Postgres implementation.
pub struct MemorySnapshotStore {
    inline: Mutex<HashMap<Uuid, Vec<u8>>>,
    meta: Mutex<HashMap<Uuid, StoredSnapshot>>,
    blob: Arc<MemoryBlobStore>,
    size_limit_bytes: usize,
}

impl MemorySnapshotStore {
    pub fn new(blob: Arc<MemoryBlobStore>, size_limit_bytes: usize) -> Self {
        Self {
            inline: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            blob,
            size_limit_bytes,
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, ServiceError> {
        let storage = self.meta.lock().unwrap().get(&doc_id).map(|m| m.storage);
        match storage {
            None => Ok(None),
            Some(SnapshotStorage::Pg) => Ok(self.inline.lock().unwrap().get(&doc_id).cloned()),
            Some(SnapshotStorage::Minio) => {
                match self.blob.get(SNAPSHOT_BUCKET, &snapshot_key(doc_id)).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(BlobError::NotFound) => Ok(None),
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
        let size_bytes = bytes.len() as i64;
        let storage = if bytes.len() > self.size_limit_bytes {
            SnapshotStorage::Minio
        } else {
            SnapshotStorage::Pg
        };

        match storage {
            SnapshotStorage::Minio => {
                self.blob
                    .put(
                        SNAPSHOT_BUCKET,
                        &snapshot_key(doc_id),
                        bytes.to_vec(),
                        "application/octet-stream",
                    )
                    .await?;
                self.inline.lock().unwrap().remove(&doc_id);
            }
            SnapshotStorage::Pg => {
                self.inline.lock().unwrap().insert(doc_id, bytes.to_vec());
                let _ = self.blob.delete(SNAPSHOT_BUCKET, &snapshot_key(doc_id)).await;
            }
        }

        self.meta.lock().unwrap().insert(
            doc_id,
            StoredSnapshot {
                last_at: taken_at,
                storage,
                size_bytes,
            },
        );

        Ok(SnapshotReceipt {
            storage,
            size_bytes,
        })
    }

    async fn info(&self, doc_id: Uuid) -> Result<Option<SnapshotInfo>, ServiceError> {
        Ok(self.meta.lock().unwrap().get(&doc_id).map(|m| SnapshotInfo {
            last_at: m.last_at,
            storage: m.storage,
            size_bytes: m.size_bytes,
        }))
    }

    async fn delete(&self, doc_id: Uuid) -> Result<(), ServiceError> {
        let previous = self.meta.lock().unwrap().remove(&doc_id);
        self.inline.lock().unwrap().remove(&doc_id);
        if previous.map(|m| m.storage) == Some(SnapshotStorage::Minio) {
            let _ = self.blob.delete(SNAPSHOT_BUCKET, &snapshot_key(doc_id)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_order_and_truncate() {
        let log = MemoryLogStore::new();
        let doc = Uuid::new_v4();

        log.append(doc, b"one").await.unwrap();
        let mark = log.append(doc, b"two").await.unwrap();
        log.append(doc, b"three").await.unwrap();

        let all = log.read_since(doc, None).await.unwrap();
        assert_eq!(all, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(log.count_since(doc, None).await.unwrap(), 3);

        let dropped = log.truncate_before(doc, mark).await.unwrap();
        assert_eq!(dropped, 1);
        let tail = log.read_since(doc, None).await.unwrap();
        assert_eq!(tail, vec![b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn test_snapshot_routing_at_the_limit() {
        let blob = Arc::new(MemoryBlobStore::new());
        let store = MemorySnapshotStore::new(blob.clone(), 8);
        let doc = Uuid::new_v4();

        // Exactly at the limit: inline.
        let receipt = store.save(doc, &[0u8; 8], Utc::now()).await.unwrap();
        assert_eq!(receipt.storage, SnapshotStorage::Pg);
        assert!(!blob.contains(SNAPSHOT_BUCKET, &snapshot_key(doc)));

        // One byte over: blob, inline form retired.
        let receipt = store.save(doc, &[0u8; 9], Utc::now()).await.unwrap();
        assert_eq!(receipt.storage, SnapshotStorage::Minio);
        assert_eq!(receipt.size_bytes, 9);
        assert!(blob.contains(SNAPSHOT_BUCKET, &snapshot_key(doc)));
        assert_eq!(store.load(doc).await.unwrap().unwrap().len(), 9);

        // Back under the limit: inline again, object removed.
        let receipt = store.save(doc, &[0u8; 4], Utc::now()).await.unwrap();
        assert_eq!(receipt.storage, SnapshotStorage::Pg);
        assert!(!blob.contains(SNAPSHOT_BUCKET, &snapshot_key(doc)));

        let info = store.info(doc).await.unwrap().unwrap();
        assert_eq!(info.storage, SnapshotStorage::Pg);
        assert_eq!(info.size_bytes, 4);
    }

    #[tokio::test]
    async fn test_blob_presign_shapes() {
        let blob = MemoryBlobStore::new();
        let url = blob
            .presign_put("attachments", "u/d/file.png", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.contains("method=PUT"));
        assert!(url.contains("expires=3600"));
    }
}
