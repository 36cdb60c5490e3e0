//! Service Error Module
//!
//! This module defines the error types used across the XFDocs session
//! service and their conversions to HTTP responses and WebSocket close
//! codes.
//!
//! # Module Structure
//!
//! ```text
//! error/
//! ├── mod.rs        - Module exports and documentation
//! ├── types.rs      - Error kinds and classification
//! └── conversion.rs - IntoResponse / From implementations
//! ```
//!
//! # Error Kinds
//!
//! - `AuthInvalid` / `AuthExpired` - bearer-token failures
//! - `Forbidden` - permission denied
//! - `NotFound` - missing document/vault/object
//! - `Conflict` - duplicate share and similar constraint violations
//! - `ValidationFailed` - malformed client input
//! - `Transient` - DB/blob/identity transport failures (retryable)
//! - `Fatal` - invariant violations (corrupt persisted data, etc.)

/// Error type definitions
pub mod types;

/// Error conversion implementations
pub mod conversion;

pub use types::ServiceError;
