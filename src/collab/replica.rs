//! Per-document replica: the authoritative in-memory CRDT state for one
//! live document plus everything needed to serve its sessions.
//!
//! A replica owns its state behind an async mutex. The lock is held
//! across merge + log append for one update, across hydrated-state
//! encodes, and across a store - which is what linearizes updates per
//! document and keeps "one store at a time" true. Broadcasts go through
//! a tokio broadcast channel of pre-encoded frames; the channel
//! capacity doubles as the per-client backpressure limit, and a lagging
//! receiver is the session's cue to drop the client.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::collab::protocol::Frame;
use crate::engine::DocState;
use crate::error::ServiceError;
use crate::storage::LogStore;

/// Identifies one WebSocket connection.
pub type ClientId = Uuid;

/// A pre-encoded frame published to every subscriber of a replica.
#[derive(Clone)]
pub struct Outbound {
    /// The client that caused this frame (receivers skip their own)
    pub from: ClientId,
    pub payload: Arc<Vec<u8>>,
}

#[derive(Default)]
struct DebounceState {
    first_dirty_at: Option<Instant>,
    last_change_at: Option<Instant>,
}

/// In-memory replica of one document.
pub struct Replica {
    doc_id: Uuid,
    state: tokio::sync::Mutex<DocState>,
    clients: std::sync::Mutex<HashSet<ClientId>>,
    awareness: std::sync::Mutex<HashMap<ClientId, Vec<u8>>>,
    broadcast: broadcast::Sender<Outbound>,
    log: Arc<dyn LogStore>,
    dirty: AtomicBool,
    quarantined: AtomicBool,
    /// One debounced store task at a time
    store_scheduled: AtomicBool,
    debounce: std::sync::Mutex<DebounceState>,
    /// Updates seen since the last known snapshot; drives triggered compaction
    pending_updates: AtomicI64,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("doc_id", &self.doc_id)
            .finish_non_exhaustive()
    }
}

impl Replica {
    pub fn new(
        doc_id: Uuid,
        state: DocState,
        log: Arc<dyn LogStore>,
        buffer: usize,
        tail_len: i64,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(buffer.max(1));
        Self {
            doc_id,
            state: tokio::sync::Mutex::new(state),
            clients: std::sync::Mutex::new(HashSet::new()),
            awareness: std::sync::Mutex::new(HashMap::new()),
            broadcast,
            log,
            dirty: AtomicBool::new(false),
            quarantined: AtomicBool::new(false),
            store_scheduled: AtomicBool::new(false),
            debounce: std::sync::Mutex::new(DebounceState::default()),
            pending_updates: AtomicI64::new(tail_len),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.broadcast.subscribe()
    }

    pub fn add_client(&self, client_id: ClientId) -> usize {
        let mut clients = self.clients.lock().unwrap();
        clients.insert(client_id);
        clients.len()
    }

    /// Remove a client and its awareness entry; returns how many remain.
    pub fn remove_client(&self, client_id: ClientId) -> usize {
        self.awareness.lock().unwrap().remove(&client_id);
        let mut clients = self.clients.lock().unwrap();
        clients.remove(&client_id);
        clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }

    pub fn set_quarantined(&self) {
        self.quarantined.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Merge one client update, append it to the log, and fan it out to
    /// the other clients.
    ///
    /// The broadcast happens strictly after merge + append, so a frame
    /// seen by any peer is already durable in the log.
    pub async fn apply_update(&self, from: ClientId, update: &[u8]) -> Result<(), ServiceError> {
        if self.is_quarantined() {
            return Err(ServiceError::Fatal(format!(
                "document {} is quarantined",
                self.doc_id
            )));
        }

        {
            let state = self.state.lock().await;
            state.merge(update)?;
            self.log.append(self.doc_id, update).await?;
        }

        self.dirty.store(true, Ordering::SeqCst);
        self.pending_updates.fetch_add(1, Ordering::SeqCst);
        {
            let mut debounce = self.debounce.lock().unwrap();
            let now = Instant::now();
            debounce.first_dirty_at.get_or_insert(now);
            debounce.last_change_at = Some(now);
        }

        let frame = Frame::Update(update.to_vec()).encode();
        let _ = self.broadcast.send(Outbound {
            from,
            payload: Arc::new(frame),
        });

        Ok(())
    }

    /// Full encoded state (initial sync frame payload).
    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.encode()
    }

    /// Diff against a client-supplied state vector.
    pub async fn diff_for(&self, state_vector: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let state = self.state.lock().await;
        Ok(state.diff(state_vector)?)
    }

    /// Record and fan out an awareness payload.
    pub fn set_awareness(&self, from: ClientId, payload: Vec<u8>) {
        let frame = Frame::Awareness(payload.clone()).encode();
        self.awareness.lock().unwrap().insert(from, payload);
        let _ = self.broadcast.send(Outbound {
            from,
            payload: Arc::new(frame),
        });
    }

    /// Current awareness entries, for catching up a joining client.
    pub fn awareness_snapshot(&self) -> Vec<(ClientId, Vec<u8>)> {
        self.awareness
            .lock()
            .unwrap()
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect()
    }

    /// Encode the full state and append it to the log as one update.
    ///
    /// Returns the log timestamp of the write, or `None` when the
    /// replica was clean and `force` was not set. Holding the state
    /// lock across encode + append keeps concurrent merges out and
    /// makes the encoded bytes a consistent cut.
    pub async fn store(&self, force: bool) -> Result<Option<DateTime<Utc>>, ServiceError> {
        if !force && !self.is_dirty() {
            return Ok(None);
        }

        let stored_at = {
            let state = self.state.lock().await;
            let encoded = state.encode();
            let stored_at = self.log.append(self.doc_id, &encoded).await?;
            self.dirty.store(false, Ordering::SeqCst);
            *self.debounce.lock().unwrap() = DebounceState::default();
            stored_at
        };

        tracing::debug!(doc_id = %self.doc_id, %stored_at, "replica state stored");
        Ok(Some(stored_at))
    }

    /// Ages of the debounce marks: `(since_first_dirty, since_last_change)`.
    /// `None` when the replica is clean.
    pub fn debounce_ages(&self) -> Option<(std::time::Duration, std::time::Duration)> {
        let debounce = self.debounce.lock().unwrap();
        match (debounce.first_dirty_at, debounce.last_change_at) {
            (Some(first), Some(last)) => Some((first.elapsed(), last.elapsed())),
            _ => None,
        }
    }

    /// Claim the single debounced-store slot. The caller must pair this
    /// with `end_store`.
    pub fn try_begin_store(&self) -> bool {
        self.store_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_store(&self) {
        self.store_scheduled.store(false, Ordering::SeqCst);
    }

    /// Consume the compaction trigger once `threshold` pending updates
    /// have accumulated.
    pub fn take_compaction_trigger(&self, threshold: i64) -> bool {
        let pending = self.pending_updates.load(Ordering::SeqCst);
        if pending >= threshold {
            self.pending_updates.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryLogStore;

    fn empty_replica(log: Arc<MemoryLogStore>) -> Replica {
        Replica::new(Uuid::new_v4(), DocState::empty(), log, 64, 0)
    }

    fn update_with_text(text: &str) -> Vec<u8> {
        use yrs::{ReadTxn, Text, Transact, WriteTxn};
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            let field = txn.get_or_insert_text("content");
            field.insert(&mut txn, 0, text);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    #[tokio::test]
    async fn test_apply_update_appends_then_broadcasts() {
        let log = Arc::new(MemoryLogStore::new());
        let replica = empty_replica(log.clone());
        let author = Uuid::new_v4();
        let mut rx = replica.subscribe();

        let update = update_with_text("hi");
        replica.apply_update(author, &update).await.unwrap();

        // Durable before the broadcast is observable.
        assert_eq!(log.count_since(replica.doc_id(), None).await.unwrap(), 1);
        let out = rx.recv().await.unwrap();
        assert_eq!(out.from, author);
        assert_eq!(
            Frame::decode(&out.payload).unwrap(),
            Frame::Update(update.clone())
        );
        assert!(replica.is_dirty());
    }

    #[tokio::test]
    async fn test_store_flushes_full_state_once() {
        let log = Arc::new(MemoryLogStore::new());
        let replica = empty_replica(log.clone());
        let author = Uuid::new_v4();

        replica
            .apply_update(author, &update_with_text("flush me"))
            .await
            .unwrap();
        let stored = replica.store(false).await.unwrap();
        assert!(stored.is_some());
        assert!(!replica.is_dirty());
        assert_eq!(log.count_since(replica.doc_id(), None).await.unwrap(), 2);

        // Clean replica, no force: nothing happens.
        assert!(replica.store(false).await.unwrap().is_none());
        assert_eq!(log.count_since(replica.doc_id(), None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_quarantined_replica_rejects_updates() {
        let log = Arc::new(MemoryLogStore::new());
        let replica = empty_replica(log.clone());
        replica.set_quarantined();

        let err = replica
            .apply_update(Uuid::new_v4(), &update_with_text("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Fatal(_)));
        assert_eq!(log.count_since(replica.doc_id(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_client_bookkeeping_and_awareness() {
        let log = Arc::new(MemoryLogStore::new());
        let replica = empty_replica(log);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(replica.add_client(a), 1);
        assert_eq!(replica.add_client(b), 2);

        replica.set_awareness(a, b"cursor@3".to_vec());
        assert_eq!(replica.awareness_snapshot().len(), 1);

        // Leaving clears the awareness entry too.
        assert_eq!(replica.remove_client(a), 1);
        assert!(replica.awareness_snapshot().is_empty());
        assert_eq!(replica.remove_client(b), 0);
    }

    #[tokio::test]
    async fn test_compaction_trigger_fires_at_threshold() {
        let log = Arc::new(MemoryLogStore::new());
        let replica = empty_replica(log);
        let author = Uuid::new_v4();

        for text in ["a", "b", "c"] {
            replica
                .apply_update(author, &update_with_text(text))
                .await
                .unwrap();
        }

        assert!(!replica.take_compaction_trigger(4));
        assert!(replica.take_compaction_trigger(3));
        // Consumed: a second take needs new appends.
        assert!(!replica.take_compaction_trigger(3));
    }
}
