//! Small shared utilities for the syncd workspace.

/// Exponential backoff helpers for retry loops.
pub mod backoff;

/// Flat key/value node files, the durable format for change tracking and
/// per-peer configuration state.
pub mod kvnode;

/// Logging initialization for binaries and tests.
pub mod logging;
