//! Realtime collaboration core: the per-document replicas, the
//! process-wide registry that owns them, the WebSocket session runtime
//! and the snapshot compaction worker.
//!
//! Ownership is one-way: the registry owns replicas, replicas hold
//! handles to the stores, stores never call back up. The session
//! runtime and the compaction worker only go through the registry's
//! public API.

/// Binary frame codec for session traffic
pub mod protocol;

/// Per-document in-memory replica
pub mod replica;

/// Process-wide docId → replica map
pub mod registry;

/// WebSocket session runtime
pub mod session;

/// Snapshot compaction worker
pub mod compactor;

pub use compactor::CompactionWorker;
pub use registry::{RegistryConfig, ReplicaRegistry};
pub use replica::{ClientId, Replica};
