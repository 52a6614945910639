use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle of a session as visible to clients.
///
/// `Queued` sessions wait for the config lock, `Idle` sessions hold it and
/// accept commands, `Running` sessions execute exactly one operation.
/// Terminal sessions stay queryable for a grace period before the scheduler
/// drops them.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Queued,
    Idle,
    Running,
    Aborting,
    Suspending,
    Done,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done)
    }
}

/// State of a server-mode connection.
///
/// `Final` means the engine has produced its last message and we are waiting
/// for the peer to acknowledge by closing normally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Setup,
    Processing,
    Waiting,
    Final,
    Done,
    Failed,
}

/// Per-source synchronization mode, as stored in the `sync` config property.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    TwoWay,
    Slow,
    RefreshFromClient,
    RefreshFromServer,
    OneWayFromClient,
    OneWayFromServer,
    Disabled,
}

impl SyncMode {
    /// True if the peer may send items to us in this mode.
    pub fn receives_items(&self) -> bool {
        !matches!(
            self,
            SyncMode::OneWayFromClient | SyncMode::RefreshFromClient | SyncMode::Disabled
        )
    }

    /// True if we may send items to the peer in this mode.
    pub fn sends_items(&self) -> bool {
        !matches!(
            self,
            SyncMode::OneWayFromServer | SyncMode::RefreshFromServer | SyncMode::Disabled
        )
    }
}

/// Scheduling priority of a session. Lower runs sooner; FIFO within equal
/// priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const CMDLINE: Priority = Priority(-10);
    pub const DEFAULT: Priority = Priority(0);
    pub const CONNECTION: Priority = Priority(10);
    pub const AUTOSYNC: Priority = Priority(20);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

/// Transport kinds tracked by the presence monitor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Http,
    Bluetooth,
    /// Anything that is neither HTTP nor OBEX/Bluetooth; assumed reachable.
    Other,
}

impl TransportKind {
    /// Classify a sync URL by its scheme prefix.
    pub fn of_url(url: &str) -> TransportKind {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("http") || lower.starts_with("local") {
            TransportKind::Http
        } else if lower.starts_with("obex-bt") {
            TransportKind::Bluetooth
        } else {
            TransportKind::Other
        }
    }
}

/// Per-source result within a session, reported through `GetStatus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStatus {
    /// Sync mode actually used for the source, empty until known.
    pub mode: String,
    /// Lifecycle phase of the source: "idle", "running", "done".
    pub status: String,
    /// SyncML status code, 0 while no error was seen.
    pub error: u32,
}

/// Per-source progress counters, reported through `GetProgress`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceProgress {
    /// "prepare", "send" or "receive"; empty before the data phase.
    pub phase: String,
    pub prepare_count: i32,
    pub prepare_total: i32,
    pub send_count: i32,
    pub send_total: i32,
    pub receive_count: i32,
    pub receive_total: i32,
}

/// One addressable database inside a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub uri: String,
    pub is_default: bool,
}

/// Aggregated outcome of one sync, persisted per session and returned by
/// `GetReports` newest-first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Wall-clock start, seconds since the epoch.
    pub start: u64,
    /// Wall-clock end, seconds since the epoch.
    pub end: u64,
    /// Overall SyncML status code, 0/200 on success.
    pub status: u32,
    pub peer_name: String,
    pub sources: BTreeMap<String, SourceReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub mode: String,
    pub status: u32,
    pub items_sent: u32,
    pub items_received: u32,
    pub items_added: u32,
    pub items_updated: u32,
    pub items_deleted: u32,
}

/// A config serialized for the bus: outer key is "" for peer-level
/// properties or `source/<name>` for per-source ones.
pub type ConfigDict = BTreeMap<String, BTreeMap<String, String>>;

/// Capability tokens announced by `GetCapabilities`.
pub const CAPABILITIES: &[&str] = &[
    "ConfigChanged",
    "GetConfigName",
    "NamedConfig",
    "Notifications",
    "Version",
    "SessionFlags",
    "SessionAttach",
    "DatabaseProperties",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_round_trips_through_config_spelling() {
        for (s, mode) in [
            ("two-way", SyncMode::TwoWay),
            ("refresh-from-server", SyncMode::RefreshFromServer),
            ("one-way-from-client", SyncMode::OneWayFromClient),
            ("disabled", SyncMode::Disabled),
        ] {
            assert_eq!(s.parse::<SyncMode>().unwrap(), mode);
            assert_eq!(mode.to_string(), s);
        }
    }

    #[test]
    fn priorities_order_cmdline_first() {
        assert!(Priority::CMDLINE < Priority::DEFAULT);
        assert!(Priority::DEFAULT < Priority::CONNECTION);
        assert!(Priority::CONNECTION < Priority::AUTOSYNC);
    }

    #[test]
    fn transport_kind_of_url() {
        assert_eq!(TransportKind::of_url("http://peer/sync"), TransportKind::Http);
        assert_eq!(TransportKind::of_url("HTTPS://peer"), TransportKind::Http);
        // local sync is driven over the HTTP-style loopback
        assert_eq!(TransportKind::of_url("local://@context"), TransportKind::Http);
        assert_eq!(
            TransportKind::of_url("obex-bt://00:11:22:33:44:55"),
            TransportKind::Bluetooth
        );
        assert_eq!(TransportKind::of_url("file:///tmp"), TransportKind::Other);
    }
}
