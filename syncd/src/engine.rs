//! Adapter between the sync engine and the per-source data layer.
//!
//! The protocol engine is a black box that drives a per-source callback
//! table during a session. [`DataOps`] is that table; [`adapter`] implements
//! it on top of a backend plus change tracker; [`ops`] provides the pre/post
//! signal wrapping every call gets; [`loopback`] is the in-process engine
//! and simulated peer used for local syncs and tests.

use sync_api::SyncStatus;

pub mod adapter;
pub mod loopback;
pub mod ops;

/// Which change set an item yielded by [`DataOps::read_next_item`] belongs
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextItemStatus {
    /// Reported during slow syncs, where every item is exchanged.
    Unchanged,
    Added,
    Updated,
    Deleted,
}

/// An item as handed to/from the engine: raw bytes plus the fields the
/// engine's item key exposes.
#[derive(Debug, Clone, Default)]
pub struct ItemKey {
    pub luid: String,
    pub data: Vec<u8>,
}

/// Result of pushing an item into the local store through the engine.
#[derive(Debug, Clone)]
pub struct EnginePut {
    pub luid: String,
    /// The stored data differs from what was submitted; schedule an
    /// upstream update.
    pub merged: bool,
    /// The backend refused the write because it conflicts with this other
    /// item; nothing was stored and the engine has to merge with it first.
    pub needs_merge: Option<String>,
}

/// One entry of the engine's LUID<->GUID mapping (server mode).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapItem {
    pub local_id: String,
    pub remote_id: String,
    pub flags: u32,
}

/// The callback table one source presents to the engine.
///
/// Calls arrive strictly in the engine's order: a read bracket, item
/// iteration, a write bracket, admin/map persistence around them. Errors
/// are returned as SyncML status codes; the session continues unless the
/// code is fatal.
pub trait DataOps {
    /// Called before the first outbound or inbound message, per the
    /// source's early-start flag. A non-empty `resume_token` overrides
    /// `last_token`. May fail with [`SyncStatus::SLOW_SYNC_508`] to force
    /// the peer into slow sync.
    fn begin_data_read(&mut self, last_token: &str, resume_token: &str)
        -> Result<(), SyncStatus>;

    /// The snapshot is frozen.
    fn end_data_read(&mut self) -> Result<(), SyncStatus>;

    fn start_data_write(&mut self) -> Result<(), SyncStatus>;

    /// Close the write phase; the returned token identifies this session
    /// for future resume.
    fn end_data_write(&mut self, success: bool) -> Result<String, SyncStatus>;

    /// Iterate added, then updated, then deleted items. `first` restarts the
    /// iteration; after the final item every further call keeps returning
    /// `None`.
    fn read_next_item(
        &mut self,
        first: bool,
    ) -> Result<Option<(String, NextItemStatus)>, SyncStatus>;

    /// Populate an item key from the backend's bytes.
    fn read_item_by_key(&mut self, luid: &str) -> Result<ItemKey, SyncStatus>;

    fn insert_item_as_key(&mut self, key: &ItemKey) -> Result<EnginePut, SyncStatus>;

    fn update_item_as_key(&mut self, key: &ItemKey, luid: &str) -> Result<EnginePut, SyncStatus>;

    fn delete_item(&mut self, luid: &str) -> Result<(), SyncStatus>;

    /// Opaque per-peer state owned by the engine.
    fn load_admin_data(&mut self, local: &str, remote: &str) -> Result<String, SyncStatus>;

    fn save_admin_data(&mut self, data: &str) -> Result<(), SyncStatus>;

    /// Iterate the persisted LUID<->GUID map.
    fn read_next_map_item(&mut self, first: bool) -> Result<Option<MapItem>, SyncStatus>;

    fn insert_map_item(&mut self, item: &MapItem) -> Result<(), SyncStatus>;

    fn update_map_item(&mut self, item: &MapItem) -> Result<(), SyncStatus>;

    fn delete_map_item(&mut self, item: &MapItem) -> Result<(), SyncStatus>;

    /// Streaming attachment access, keyed by `(luid, blob_id)`.
    fn read_blob(&mut self, luid: &str, blob_id: &str) -> Result<Vec<u8>, SyncStatus>;

    fn write_blob(&mut self, luid: &str, blob_id: &str, data: &[u8]) -> Result<(), SyncStatus>;

    fn delete_blob(&mut self, luid: &str, blob_id: &str) -> Result<(), SyncStatus>;
}

/// Events the engine reports while running; the session folds them into
/// status/progress emission.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The sync advanced into a new coarse phase.
    Step(crate::progress::Step),
    /// A message is about to go out.
    SendStart,
    /// A reply has been fully received.
    ReceiveEnd,
    /// Local items are being prepared for sending.
    ItemPrepare { source: String },
    /// One incoming item was applied.
    ItemReceive {
        source: String,
        count: i32,
        total: i32,
    },
    /// A source finished with the given status.
    SourceDone { source: String, status: SyncStatus },
    /// The engine is blocked waiting for the peer.
    Waiting(bool),
    /// The session got past initialization; a sync is really happening.
    SyncStarted,
}
