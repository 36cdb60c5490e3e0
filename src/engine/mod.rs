//! CRDT engine: the pure merge algebra behind every replica.
//!
//! Wraps a yrs `Doc` and exposes exactly the operations the rest of the
//! service needs:
//!
//! - `hydrate` - empty state + optional snapshot + ordered updates
//! - `merge` - in-place application of one binary update
//! - `encode` - full-state update (applied to an empty doc it reproduces
//!   an observationally equivalent state)
//! - `diff` - minimal update bringing a peer at `since` up to date
//!
//! Updates and snapshots are the lib0 v1 binary encoding. Application is
//! commutative and idempotent by the CRDT's own clocks, so replaying an
//! update that a snapshot already contains is a no-op. No I/O happens
//! here; state lives only inside a replica and is never shared.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Errors surfaced by the engine. All of them mean the input bytes were
/// not a valid v1 encoding.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A snapshot, update or state vector failed to decode
    #[error("crdt decode failed: {0}")]
    Decode(String),
}

/// In-memory CRDT state for a single document.
pub struct DocState {
    doc: Doc,
}

impl DocState {
    /// Create an empty state.
    pub fn empty() -> Self {
        Self { doc: Doc::new() }
    }

    /// Build state from an optional snapshot plus the tail of logged
    /// updates, applied in order.
    pub fn hydrate<'a, U>(snapshot: Option<&[u8]>, updates: U) -> Result<Self, EngineError>
    where
        U: IntoIterator<Item = &'a [u8]>,
    {
        let state = Self::empty();
        if let Some(bytes) = snapshot {
            state.merge(bytes)?;
        }
        for update in updates {
            state.merge(update)?;
        }
        Ok(state)
    }

    /// Apply one binary update in place.
    pub fn merge(&self, update: &[u8]) -> Result<(), EngineError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| EngineError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        Ok(())
    }

    /// Encode the full state as a single update.
    pub fn encode(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the minimal update that brings a peer at `since` (an
    /// encoded state vector) up to this state.
    pub fn diff(&self, since: &[u8]) -> Result<Vec<u8>, EngineError> {
        let sv = StateVector::decode_v1(since).map_err(|e| EngineError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// This state's encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Direct access to the underlying document (test helpers only).
    #[cfg(test)]
    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }
}
