/**
 * Snapshot Compaction Worker
 *
 * A single background task that periodically folds snapshot + log into
 * a fresh snapshot and truncates the log prefix it covered.
 *
 * # Election
 *
 * Each tick elects up to `batch_limit` documents whose pending update
 * count has reached the threshold, ordered by count descending, and
 * merges in the documents flagged by live replicas since the last tick.
 *
 * # Crash Safety
 *
 * The compaction mark `t_start` is taken before the log is read, the
 * snapshot save is transactional, and truncation only removes entries
 * strictly older than `t_start` after the save commits. A crash
 * anywhere in between leaves an over-long but correct log; the extra
 * updates replay onto the new snapshot and merge idempotently.
 */

use chrono::Utc;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::collab::registry::ReplicaRegistry;
use crate::engine::DocState;
use crate::error::ServiceError;
use crate::storage::{LogStore, SnapshotStore};

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub interval: Duration,
    pub snapshot_threshold: i64,
    /// Documents compacted per tick at most
    pub batch_limit: i64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            snapshot_threshold: 200,
            batch_limit: 10,
        }
    }
}

/// Fold one document's snapshot + full log into a new snapshot, then
/// truncate the covered prefix.
///
/// A decode failure quarantines the document and never truncates.
pub async fn compact_document(
    log: &Arc<dyn LogStore>,
    snapshots: &Arc<dyn SnapshotStore>,
    registry: &ReplicaRegistry,
    doc_id: Uuid,
) -> Result<(), ServiceError> {
    if registry.is_quarantined(doc_id) {
        tracing::debug!(%doc_id, "skipping compaction of quarantined document");
        return Ok(());
    }

    let t_start = Utc::now();
    let snapshot = snapshots.load(doc_id).await?;
    let updates = log.read_since(doc_id, None).await?;
    if snapshot.is_none() && updates.is_empty() {
        return Ok(());
    }

    let state = match DocState::hydrate(snapshot.as_deref(), updates.iter().map(|u| u.as_slice()))
    {
        Ok(state) => state,
        Err(err) => {
            registry.quarantine(doc_id);
            return Err(err.into());
        }
    };

    let encoded = state.encode();
    let receipt = snapshots.save(doc_id, &encoded, t_start).await?;
    let dropped = log.truncate_before(doc_id, t_start).await?;

    tracing::info!(
        %doc_id,
        folded = updates.len(),
        dropped,
        storage = receipt.storage.as_str(),
        size_bytes = receipt.size_bytes,
        "document compacted"
    );
    Ok(())
}

/// The background compaction worker.
pub struct CompactionWorker {
    pool: PgPool,
    log: Arc<dyn LogStore>,
    snapshots: Arc<dyn SnapshotStore>,
    registry: Arc<ReplicaRegistry>,
    config: CompactorConfig,
    running: AtomicBool,
    pending: AtomicUsize,
}

impl CompactionWorker {
    pub fn new(
        pool: PgPool,
        log: Arc<dyn LogStore>,
        snapshots: Arc<dyn SnapshotStore>,
        registry: Arc<ReplicaRegistry>,
        config: CompactorConfig,
    ) -> Self {
        Self {
            pool,
            log,
            snapshots,
            registry,
            config,
            running: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        }
    }

    /// True while the worker loop is alive (health endpoint).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Candidates seen on the last tick that still await compaction.
    pub fn pending_snapshots(&self) -> usize {
        self.pending.load(Ordering::SeqCst) + self.registry.flagged_count()
    }

    /// Run the worker until shutdown flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::SeqCst);
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = self.config.interval.as_millis() as u64,
                threshold = self.config.snapshot_threshold,
                "compaction worker started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            self.running.store(false, Ordering::SeqCst);
            tracing::info!("compaction worker stopped");
        })
    }

    /// One election + compaction pass. Failures are logged; the next
    /// tick retries.
    pub async fn tick(&self) {
        let mut candidates = match self.elect_candidates().await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(error = %err, "candidate election failed");
                Vec::new()
            }
        };

        for flagged in self.registry.take_compaction_flags() {
            if !candidates.contains(&flagged) {
                candidates.push(flagged);
            }
        }
        candidates.truncate(self.config.batch_limit as usize);
        self.pending.store(candidates.len(), Ordering::SeqCst);

        for doc_id in candidates {
            match compact_document(&self.log, &self.snapshots, &self.registry, doc_id).await {
                Ok(()) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::error!(%doc_id, error = %err, "compaction failed; will retry next tick");
                }
            }
        }
    }

    /// Documents whose pending update count reached the threshold,
    /// busiest first.
    async fn elect_candidates(&self) -> Result<Vec<Uuid>, ServiceError> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, COUNT(u.id) AS pending
            FROM documents d
            JOIN crdt_updates u
              ON u.document_id = d.id
             AND (d.last_snapshot_at IS NULL OR u.created_at >= d.last_snapshot_at)
            WHERE d.is_deleted = FALSE
            GROUP BY d.id
            HAVING COUNT(u.id) >= $1
            ORDER BY pending DESC
            LIMIT $2
            "#,
        )
        .bind(self.config.snapshot_threshold)
        .bind(self.config.batch_limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }
}
