//! Router assembly. Two listeners, two routers: health/readiness on
//! the HTTP port, the document WebSocket endpoint on its own port.

/// Router construction
pub mod router;

/// Health and readiness handlers
pub mod health;

pub use router::{http_router, ws_router};
