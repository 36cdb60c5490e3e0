//! XFDocs - Realtime Collaboration Backend
//!
//! XFDocs is the server side of a multi-tenant collaborative document
//! editor. It holds one in-memory CRDT replica per live document,
//! merges concurrent binary edits from many WebSocket clients into a
//! convergent state, and persists those edits durably through a
//! snapshot + update-log split with background compaction.
//!
//! # Module Structure
//!
//! - **`engine`** - Pure CRDT merge algebra (yrs-backed):
//!   hydrate / merge / encode / diff
//! - **`storage`** - Persistence: the S3/MinIO blob adapter, the
//!   Postgres update log, and the size-routed snapshot store
//! - **`auth`** - Bearer-token verification (local HMAC or remote
//!   introspection) and the document/vault permission oracle
//! - **`collab`** - The realtime core: per-document replicas, the
//!   process-wide registry, the WebSocket session runtime and the
//!   compaction worker
//! - **`routes`** - Health/readiness and the session endpoint
//! - **`server`** - Configuration, shared state, startup wiring
//! - **`error`** - Service-wide error kinds and HTTP/close-code mapping
//!
//! # Data Flow
//!
//! A client edit arrives as a binary frame, is merged into the replica
//! and appended to the update log under the replica lock, then fanned
//! out to the document's other clients. The compaction worker folds
//! long logs into fresh snapshots and truncates the covered prefix.
//! A client joining an idle document hydrates a new replica from the
//! latest snapshot plus the log tail.

pub mod auth;
pub mod collab;
pub mod engine;
pub mod error;
pub mod routes;
pub mod server;
pub mod storage;
