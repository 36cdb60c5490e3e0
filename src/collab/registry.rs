//! Process-wide replica registry.
//!
//! One mutex guards the docId → slot map and nothing else; it is never
//! held across I/O. Hydration runs behind a `Pending` placeholder so
//! concurrent acquirers of the same document block on the placeholder
//! and reuse the single hydrated replica - at most one replica per
//! document exists in the process at any instant.
//!
//! Lifetime: a replica lives while it has clients or a debounced store
//! pending. When the last client leaves, eviction waits `idle_ttl`,
//! performs one final store and removes the entry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::collab::replica::{ClientId, Replica};
use crate::engine::DocState;
use crate::error::ServiceError;
use crate::storage::{LogStore, SnapshotStore};

/// Tunables for replica lifetime and write coalescing.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Quiet period before a debounced store fires
    pub debounce: Duration,
    /// Hard ceiling from the first unflushed change to the store
    pub max_debounce: Duration,
    /// Grace period before an idle replica is evicted
    pub idle_ttl: Duration,
    /// Pending-update count that triggers compaction
    pub snapshot_threshold: i64,
    /// Per-client outbound buffer (frames); overflow drops the client
    pub client_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2_000),
            max_debounce: Duration::from_millis(10_000),
            idle_ttl: Duration::from_millis(30_000),
            snapshot_threshold: 200,
            client_buffer: 64,
        }
    }
}

enum Slot {
    /// Hydration in flight; waiters park on the notify
    Pending(Arc<Notify>),
    Ready(Arc<Replica>),
}

/// Process-wide docId → replica map.
pub struct ReplicaRegistry {
    slots: std::sync::Mutex<HashMap<Uuid, Slot>>,
    log: Arc<dyn LogStore>,
    snapshots: Arc<dyn SnapshotStore>,
    config: RegistryConfig,
    /// Documents flagged by live replicas for the next worker tick
    flagged: std::sync::Mutex<HashSet<Uuid>>,
    /// Documents whose persisted data failed to decode
    quarantined: std::sync::Mutex<HashSet<Uuid>>,
    shutting_down: AtomicBool,
}

impl ReplicaRegistry {
    pub fn new(
        log: Arc<dyn LogStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            slots: std::sync::Mutex::new(HashMap::new()),
            log,
            snapshots,
            config,
            flagged: std::sync::Mutex::new(HashSet::new()),
            quarantined: std::sync::Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a client to a document, hydrating the replica on first use.
    ///
    /// Concurrent acquirers for the same document block on the
    /// placeholder and share the hydration result. A failed hydration
    /// removes the placeholder and surfaces the error to every waiter's
    /// retry.
    pub async fn acquire(
        self: &Arc<Self>,
        doc_id: Uuid,
        client_id: ClientId,
    ) -> Result<Arc<Replica>, ServiceError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::transient("service is shutting down"));
        }

        loop {
            enum Next {
                Use(Arc<Replica>),
                Wait(Arc<Notify>),
                Hydrate,
            }

            let next = {
                let mut slots = self.slots.lock().unwrap();
                match slots.get(&doc_id) {
                    Some(Slot::Ready(replica)) => Next::Use(replica.clone()),
                    Some(Slot::Pending(notify)) => Next::Wait(notify.clone()),
                    None => {
                        slots.insert(doc_id, Slot::Pending(Arc::new(Notify::new())));
                        Next::Hydrate
                    }
                }
            };

            match next {
                Next::Use(replica) => {
                    replica.add_client(client_id);
                    return Ok(replica);
                }
                Next::Wait(notify) => {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    {
                        // Register interest while re-checking the slot so a
                        // wake between unlock and await cannot be missed.
                        let slots = self.slots.lock().unwrap();
                        match slots.get(&doc_id) {
                            Some(Slot::Pending(_)) => notified.as_mut().enable(),
                            _ => continue,
                        };
                    }
                    notified.await;
                    continue;
                }
                Next::Hydrate => {
                    let hydrated = self.hydrate(doc_id).await;
                    let mut slots = self.slots.lock().unwrap();
                    let notify = match slots.remove(&doc_id) {
                        Some(Slot::Pending(notify)) => Some(notify),
                        other => {
                            // Placeholder vanished (shutdown); restore nothing.
                            drop(other);
                            None
                        }
                    };

                    match hydrated {
                        Ok(replica) => {
                            let replica = Arc::new(replica);
                            if self.quarantined.lock().unwrap().contains(&doc_id) {
                                replica.set_quarantined();
                            }
                            replica.add_client(client_id);
                            slots.insert(doc_id, Slot::Ready(replica.clone()));
                            drop(slots);
                            if let Some(notify) = notify {
                                notify.notify_waiters();
                            }
                            tracing::info!(%doc_id, "replica hydrated");
                            return Ok(replica);
                        }
                        Err(err) => {
                            drop(slots);
                            if let Some(notify) = notify {
                                notify.notify_waiters();
                            }
                            tracing::error!(%doc_id, error = %err, "replica hydration failed");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Load snapshot + log tail and build the in-memory state.
    async fn hydrate(&self, doc_id: Uuid) -> Result<Replica, ServiceError> {
        let info = self.snapshots.info(doc_id).await?;
        let snapshot = self.snapshots.load(doc_id).await?;
        let since = info.map(|i| i.last_at);
        let tail = self.log.read_since(doc_id, since).await?;

        let state = DocState::hydrate(snapshot.as_deref(), tail.iter().map(|u| u.as_slice()))?;

        Ok(Replica::new(
            doc_id,
            state,
            self.log.clone(),
            self.config.client_buffer,
            tail.len() as i64,
        ))
    }

    /// Detach a client. The last client out schedules eviction.
    pub fn release(self: &Arc<Self>, doc_id: Uuid, client_id: ClientId) {
        let Some(replica) = self.get_live(doc_id) else {
            return;
        };
        let remaining = replica.remove_client(client_id);
        if remaining == 0 && !self.shutting_down.load(Ordering::SeqCst) {
            let registry = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(registry.config.idle_ttl).await;
                registry.evict_if_idle(doc_id).await;
            });
        }
    }

    async fn evict_if_idle(self: &Arc<Self>, doc_id: Uuid) {
        let Some(replica) = self.get_live(doc_id) else {
            return;
        };
        if replica.client_count() > 0 {
            return;
        }

        // Final flush; every individual update is already in the log, so
        // eviction proceeds even if this write fails.
        if let Err(err) = replica.store(false).await {
            tracing::warn!(%doc_id, error = %err, "final store before eviction failed");
        }

        let mut slots = self.slots.lock().unwrap();
        let still_idle = matches!(
            slots.get(&doc_id),
            Some(Slot::Ready(r)) if r.client_count() == 0
        );
        if still_idle {
            slots.remove(&doc_id);
            tracing::info!(%doc_id, "idle replica evicted");
        }
    }

    /// Coalesce a burst of changes into one store. Call after marking a
    /// replica dirty; a no-op while a store task is already pending.
    pub fn schedule_store(self: &Arc<Self>, replica: &Arc<Replica>) {
        if !replica.try_begin_store() {
            return;
        }

        let registry = self.clone();
        let replica = replica.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(registry.config.debounce).await;
                match replica.debounce_ages() {
                    // Cleaned up under us (forced store or eviction).
                    None => break,
                    Some((since_first, since_last)) => {
                        if since_last >= registry.config.debounce
                            || since_first >= registry.config.max_debounce
                        {
                            break;
                        }
                    }
                }
            }

            if let Err(err) = replica.store(false).await {
                tracing::warn!(doc_id = %replica.doc_id(), error = %err, "debounced store failed");
            }
            replica.end_store();

            // Changes that landed after the encode get their own window.
            if replica.is_dirty() {
                registry.schedule_store(&replica);
            }
        });
    }

    /// Force a store for one document (used by shutdown and tests).
    pub async fn store(&self, doc_id: Uuid, force: bool) -> Result<(), ServiceError> {
        if let Some(replica) = self.get_live(doc_id) {
            replica.store(force).await?;
        }
        Ok(())
    }

    fn get_live(&self, doc_id: Uuid) -> Option<Arc<Replica>> {
        let slots = self.slots.lock().unwrap();
        match slots.get(&doc_id) {
            Some(Slot::Ready(replica)) => Some(replica.clone()),
            _ => None,
        }
    }

    /// All hydrated replicas (compaction worker, shutdown).
    pub fn live_replicas(&self) -> Vec<Arc<Replica>> {
        let slots = self.slots.lock().unwrap();
        slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(replica) => Some(replica.clone()),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Flag a document for the worker's next tick.
    pub fn mark_for_compaction(&self, doc_id: Uuid) {
        self.flagged.lock().unwrap().insert(doc_id);
    }

    /// Drain the triggered-compaction flags.
    pub fn take_compaction_flags(&self) -> Vec<Uuid> {
        self.flagged.lock().unwrap().drain().collect()
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.lock().unwrap().len()
    }

    /// Mark a document as carrying undecodable persisted data. Its
    /// replica (if live) turns read-only and compaction skips it.
    pub fn quarantine(&self, doc_id: Uuid) {
        self.quarantined.lock().unwrap().insert(doc_id);
        if let Some(replica) = self.get_live(doc_id) {
            replica.set_quarantined();
        }
        tracing::error!(%doc_id, "document quarantined: persisted CRDT data failed to decode");
    }

    pub fn is_quarantined(&self, doc_id: Uuid) -> bool {
        self.quarantined.lock().unwrap().contains(&doc_id)
    }

    /// Stop admissions and flush every live replica once.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for replica in self.live_replicas() {
            if let Err(err) = replica.store(false).await {
                tracing::warn!(doc_id = %replica.doc_id(), error = %err, "final store during shutdown failed");
            }
        }
        tracing::info!("registry flushed for shutdown");
    }
}
