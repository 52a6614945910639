use serde::{Deserialize, Serialize};

/// SyncML-aligned status codes.
///
/// The 2xx/4xx/5xx block mirrors the wire protocol; codes at
/// `LOCAL_STATUS_BASE` and above are local to this implementation, matching
/// the engine's local-error numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncStatus(pub u32);

impl SyncStatus {
    pub const OK: SyncStatus = SyncStatus(0);
    pub const HTTP_OK: SyncStatus = SyncStatus(200);
    pub const ITEM_MERGED: SyncStatus = SyncStatus(207);
    pub const UNAUTHORIZED: SyncStatus = SyncStatus(401);
    pub const NOT_FOUND: SyncStatus = SyncStatus(404);
    pub const COMMAND_NOT_ALLOWED: SyncStatus = SyncStatus(405);
    pub const ALREADY_EXISTS: SyncStatus = SyncStatus(418);
    pub const FATAL: SyncStatus = SyncStatus(500);
    pub const SLOW_SYNC_508: SyncStatus = SyncStatus(508);
    pub const DATASTORE_FAILURE: SyncStatus = SyncStatus(510);

    pub const LOCAL_STATUS_BASE: u32 = 20000;
    /// Operation not implemented by the backend.
    pub const NOT_IMPLEMENTED: SyncStatus = SyncStatus(20000 + 30);
    /// Aborted on user request.
    pub const USER_ABORT: SyncStatus = SyncStatus(20000 + 17);
    /// Suspended on user request.
    pub const USER_SUSPEND: SyncStatus = SyncStatus(20000 + 18);
    /// Wire-level failure; the only status treated as temporary.
    pub const TRANSPORT_FAILURE: SyncStatus = SyncStatus(20000 + 43);
    /// Credentials were not supplied before the info-request timed out.
    pub const PASSWORD_TIMEOUT: SyncStatus = SyncStatus(22003);

    pub fn is_ok(&self) -> bool {
        matches!(*self, SyncStatus::OK | SyncStatus::HTTP_OK)
    }

    /// Temporary failures may be retried automatically (auto-sync); anything
    /// else latches the task's permanent-failure flag.
    pub fn is_temporary(&self) -> bool {
        *self == SyncStatus::TRANSPORT_FAILURE
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SyncStatus> for u32 {
    fn from(s: SyncStatus) -> u32 {
        s.0
    }
}

/// Errors surfaced to clients at the object-bus boundary.
///
/// `name()` is the stable, wire-visible error identifier clients dispatch
/// on.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no such config: {0}")]
    NoSuchConfig(String),

    #[error("config {config} has no source {source_name}")]
    NoSuchSource { config: String, source_name: String },

    #[error("source {source_name} unusable: {reason}")]
    SourceUnusable { source_name: String, reason: String },

    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("sync failed with status {status}: {message}")]
    Status { status: SyncStatus, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Dotted error name in the style clients of the original service
    /// expect.
    pub fn name(&self) -> &'static str {
        match self {
            ApiError::NoSuchConfig(_) => "org.syncevolution.NoSuchConfig",
            ApiError::NoSuchSource { .. } => "org.syncevolution.NoSuchSource",
            ApiError::SourceUnusable { .. } => "org.syncevolution.SourceUnusable",
            ApiError::InvalidCall(_) => "org.syncevolution.InvalidCall",
            ApiError::TransportFailure(_) => "org.syncevolution.TransportFailure",
            ApiError::Status { .. } => "org.syncevolution.Exception",
            ApiError::Internal(_) => "org.syncevolution.Exception",
        }
    }

    /// Map to the status code recorded in session results and reports.
    pub fn status(&self) -> SyncStatus {
        match self {
            ApiError::TransportFailure(_) => SyncStatus::TRANSPORT_FAILURE,
            ApiError::Status { status, .. } => *status,
            ApiError::NoSuchConfig(_)
            | ApiError::NoSuchSource { .. }
            | ApiError::InvalidCall(_) => SyncStatus::COMMAND_NOT_ALLOWED,
            ApiError::SourceUnusable { .. } => SyncStatus::DATASTORE_FAILURE,
            ApiError::Internal(_) => SyncStatus::FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failure_is_temporary() {
        assert!(SyncStatus::TRANSPORT_FAILURE.is_temporary());
        for s in [
            SyncStatus::OK,
            SyncStatus::FATAL,
            SyncStatus::DATASTORE_FAILURE,
            SyncStatus::USER_ABORT,
            SyncStatus::PASSWORD_TIMEOUT,
        ] {
            assert!(!s.is_temporary(), "{s} must be permanent");
        }
    }

    #[test]
    fn error_names_are_stable() {
        assert_eq!(
            ApiError::NoSuchConfig("foo".into()).name(),
            "org.syncevolution.NoSuchConfig"
        );
        assert_eq!(
            ApiError::InvalidCall("bad".into()).name(),
            "org.syncevolution.InvalidCall"
        );
    }
}
