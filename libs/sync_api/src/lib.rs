//! Types shared between the `syncd` daemon and its clients: session and
//! connection lifecycle states, sync modes, SyncML-aligned status codes and
//! the typed errors surfaced at the object-bus boundary.

pub mod error;
pub mod models;

pub use error::{ApiError, SyncStatus};
