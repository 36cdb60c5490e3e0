//! Session admission: bearer-token verification and the permission
//! oracle consulted on every WebSocket handshake.

/// Bearer-token verification with a TTL/LRU decision cache
pub mod verifier;

/// Document/vault permission resolution
pub mod permissions;

pub use permissions::{DocAccess, PermissionLevel, PermissionOracle};
pub use verifier::{AuthClaims, AuthVerifier};
