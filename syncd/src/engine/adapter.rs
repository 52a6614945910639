//! [`DataOps`] implementation on top of a backend, its change tracker and
//! the per-source durable nodes (admin data, LUID<->GUID map, blobs).

use std::collections::VecDeque;

use camino::{Utf8Path, Utf8PathBuf};
use sync_api::models::SyncMode;
use sync_api::SyncStatus;
use tracing::{debug, warn};
use utils::kvnode::{escape, KvNode};

use crate::backend::{BackendError, Disposition, SyncBackend};
use crate::tracker::{ChangeMode, ChangeSet, ChangeTracker, TrackerError};

use super::ops::Operation;
use super::{DataOps, EnginePut, ItemKey, MapItem, NextItemStatus};

pub const TRACKING_NODE: &str = "change.node";
pub const ADMIN_NODE: &str = "admin.node";
pub const MAP_NODE: &str = "map.node";
pub const BLOB_DIR: &str = "blobs";

const ADMIN_DATA_KEY: &str = "admin-data";
const LAST_TOKEN_KEY: &str = "last-token";
const RESUME_TOKEN_KEY: &str = "resume-token";

fn status_of_backend(err: &BackendError) -> SyncStatus {
    err.status()
}

fn status_of_tracker(err: &TrackerError) -> SyncStatus {
    match err {
        TrackerError::Backend(inner) => inner.status(),
        _ => SyncStatus::DATASTORE_FAILURE,
    }
}

/// Pre/post signal slots, one wrapper per engine operation.
#[derive(Default)]
pub struct Operations {
    pub begin_data_read: Operation<(String, String)>,
    pub end_data_read: Operation<()>,
    pub start_data_write: Operation<()>,
    pub end_data_write: Operation<bool>,
    pub read_next_item: Operation<bool>,
    pub read_item_by_key: Operation<String>,
    pub insert_item_as_key: Operation<ItemKey>,
    pub update_item_as_key: Operation<(ItemKey, String)>,
    pub delete_item: Operation<String>,
    pub load_admin_data: Operation<(String, String)>,
    pub save_admin_data: Operation<String>,
    pub read_next_map_item: Operation<bool>,
    pub insert_map_item: Operation<MapItem>,
    pub update_map_item: Operation<MapItem>,
    pub delete_map_item: Operation<MapItem>,
    pub read_blob: Operation<(String, String)>,
    pub write_blob: Operation<(String, String)>,
    pub delete_blob: Operation<(String, String)>,
}

struct ItemIter {
    queue: VecDeque<(String, NextItemStatus)>,
    exhausted: bool,
}

/// One source as the engine sees it during a session.
pub struct SourceAdapter {
    name: String,
    backend: Box<dyn SyncBackend>,
    tracker: ChangeTracker,
    admin: KvNode,
    map: KvNode,
    blob_dir: Utf8PathBuf,
    sync_mode: SyncMode,
    /// Report changes before the first outbound message instead of waiting
    /// for the first inbound one.
    early_start: bool,
    changes: Option<ChangeSet>,
    iter: Option<ItemIter>,
    map_iter: Option<VecDeque<MapItem>>,
    token_counter: u64,
    pub ops: Operations,
}

impl SourceAdapter {
    pub fn open(
        name: &str,
        mut backend: Box<dyn SyncBackend>,
        source_dir: &Utf8Path,
        sync_mode: SyncMode,
        granularity: std::time::Duration,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(source_dir)?;
        backend.open().map_err(|e| {
            anyhow::anyhow!(crate::backend::wrap(name, "open")(e))
        })?;
        Ok(SourceAdapter {
            name: name.to_string(),
            backend,
            tracker: ChangeTracker::load(source_dir.join(TRACKING_NODE), granularity)?,
            admin: KvNode::load(source_dir.join(ADMIN_NODE))?,
            map: KvNode::load(source_dir.join(MAP_NODE))?,
            blob_dir: source_dir.join(BLOB_DIR),
            sync_mode,
            early_start: false,
            changes: None,
            iter: None,
            map_iter: None,
            token_counter: 0,
            ops: Operations::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn early_start(&self) -> bool {
        self.early_start
    }

    pub fn set_early_start(&mut self, early: bool) {
        self.early_start = early;
    }

    pub fn backend_mut(&mut self) -> &mut dyn SyncBackend {
        self.backend.as_mut()
    }

    /// Hold the caller until the tracker's quiescence window has passed;
    /// called once at session end.
    pub async fn quiesce(&self) {
        self.tracker.quiesce().await;
    }

    pub fn close(&mut self) -> Result<(), BackendError> {
        self.backend.close()
    }

    fn change_mode(&self) -> ChangeMode {
        match self.sync_mode {
            SyncMode::Slow | SyncMode::RefreshFromClient => ChangeMode::Slow,
            _ => ChangeMode::Full,
        }
    }

    fn detect(&mut self, resume: bool) -> Result<(), SyncStatus> {
        let mode = self.change_mode();
        let allow_empty = self.sync_mode == SyncMode::RefreshFromServer;
        let current = match mode {
            ChangeMode::None => Default::default(),
            _ => self
                .backend
                .list_all()
                .map_err(|e| status_of_backend(&e))?,
        };
        let changes = self
            .tracker
            .detect_changes(mode, current, allow_empty)
            .map_err(|e| status_of_tracker(&e))?;
        debug!(
            source = %self.name,
            added = changes.added.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            resume,
            "change detection complete"
        );
        self.changes = Some(changes);
        self.iter = None;
        Ok(())
    }

    fn build_iter(&mut self) -> ItemIter {
        let Some(changes) = &self.changes else {
            return ItemIter {
                queue: VecDeque::new(),
                exhausted: true,
            };
        };
        let mut queue = VecDeque::new();
        if matches!(self.sync_mode, SyncMode::Slow | SyncMode::RefreshFromClient) {
            // slow sync: every current item is exchanged
            for luid in changes.all.keys() {
                queue.push_back((luid.clone(), NextItemStatus::Unchanged));
            }
        } else {
            for luid in &changes.added {
                queue.push_back((luid.clone(), NextItemStatus::Added));
            }
            for luid in &changes.updated {
                queue.push_back((luid.clone(), NextItemStatus::Updated));
            }
            for luid in &changes.deleted {
                queue.push_back((luid.clone(), NextItemStatus::Deleted));
            }
        }
        ItemIter {
            queue,
            exhausted: false,
        }
    }

    fn blob_path(&self, luid: &str, blob_id: &str) -> Utf8PathBuf {
        // luids may contain path separators; hex-escape those too
        let safe = |s: &str| escape(s).replace('/', "!2f");
        self.blob_dir
            .join(format!("{}.{}.blob", safe(luid), safe(blob_id)))
    }

    fn next_token(&mut self) -> String {
        self.token_counter += 1;
        format!(
            "{}-{}",
            chrono::Utc::now().timestamp(),
            self.token_counter
        )
    }
}

/// Temporarily moves the signal table out of `self` so the wrapped body can
/// borrow the adapter mutably.
macro_rules! wrapped {
    ($self:ident, $op:ident, $args:expr, |$me:ident| $body:expr) => {{
        let args = $args;
        let mut ops = std::mem::take(&mut $self.ops);
        let result = ops.$op.invoke(&args, || {
            let $me = &mut *$self;
            $body
        });
        $self.ops = ops;
        result
    }};
}

impl DataOps for SourceAdapter {
    fn begin_data_read(
        &mut self,
        last_token: &str,
        resume_token: &str,
    ) -> Result<(), SyncStatus> {
        let last = last_token.to_string();
        let resume = resume_token.to_string();
        wrapped!(self, begin_data_read, (last, resume), |me| {
            let resuming = !resume_token.is_empty();
            let stored = me.admin.get(LAST_TOKEN_KEY).unwrap_or("");
            let effective = if resuming { resume_token } else { last_token };
            // a two-way sync without a matching token cannot trust the
            // persisted map; force the peer into a slow sync
            if me.sync_mode == SyncMode::TwoWay && (stored.is_empty() || effective != stored) {
                warn!(
                    source = %me.name,
                    engine_token = effective,
                    stored_token = stored,
                    "sync token mismatch, requesting slow sync"
                );
                return Err(SyncStatus::SLOW_SYNC_508);
            }
            me.detect(resuming)
        })
    }

    fn end_data_read(&mut self) -> Result<(), SyncStatus> {
        wrapped!(self, end_data_read, (), |me| {
            // snapshot frozen; iteration restarts from it
            me.iter = None;
            Ok(())
        })
    }

    fn start_data_write(&mut self) -> Result<(), SyncStatus> {
        wrapped!(self, start_data_write, (), |_me| Ok(()))
    }

    fn end_data_write(&mut self, success: bool) -> Result<String, SyncStatus> {
        wrapped!(self, end_data_write, success, |me| {
            if !success {
                return Err(SyncStatus::FATAL);
            }
            // Outbound changes are delivered now; advance the persisted
            // map. In modes where nothing is sent the local change sets
            // were never delivered and must stay pending.
            if me.sync_mode.sends_items() {
                if let Some(changes) = me.changes.take() {
                    me.tracker
                        .commit(&changes)
                        .map_err(|e| status_of_tracker(&e))?;
                }
            } else if me.sync_mode == SyncMode::RefreshFromServer {
                // after a refresh the local store mirrors the peer; the
                // persisted map has to match it exactly
                let current = me
                    .backend
                    .list_all()
                    .map_err(|e| status_of_backend(&e))?;
                me.tracker
                    .set_all(&current)
                    .map_err(|e| status_of_tracker(&e))?;
            }
            let token = me.next_token();
            me.admin.set(LAST_TOKEN_KEY, token.clone());
            me.admin.remove(RESUME_TOKEN_KEY);
            me.admin
                .save()
                .map_err(|_| SyncStatus::DATASTORE_FAILURE)?;
            Ok(token)
        })
    }

    fn read_next_item(
        &mut self,
        first: bool,
    ) -> Result<Option<(String, NextItemStatus)>, SyncStatus> {
        wrapped!(self, read_next_item, first, |me| {
            if first || me.iter.is_none() {
                let iter = me.build_iter();
                me.iter = Some(iter);
            }
            let iter = me.iter.as_mut().expect("just initialized");
            if iter.exhausted {
                // done stays sticky however often we are called
                return Ok(None);
            }
            match iter.queue.pop_front() {
                Some(next) => Ok(Some(next)),
                None => {
                    iter.exhausted = true;
                    Ok(None)
                }
            }
        })
    }

    fn read_item_by_key(&mut self, luid: &str) -> Result<ItemKey, SyncStatus> {
        wrapped!(self, read_item_by_key, luid.to_string(), |me| {
            let data = me
                .backend
                .read(luid)
                .map_err(|e| status_of_backend(&e))?;
            Ok(ItemKey {
                luid: luid.to_string(),
                data,
            })
        })
    }

    fn insert_item_as_key(&mut self, key: &ItemKey) -> Result<EnginePut, SyncStatus> {
        wrapped!(self, insert_item_as_key, key.clone(), |me| {
            let put = me
                .backend
                .insert(None, &key.data)
                .map_err(|e| status_of_backend(&e))?;
            // a refused write leaves the store and the tracker untouched
            if let Disposition::NeedsMerge(other) = put.disposition {
                return Ok(EnginePut {
                    luid: put.luid,
                    merged: false,
                    needs_merge: Some(other),
                });
            }
            me.tracker
                .update_revision(None, &put.luid, &put.revision)
                .map_err(|e| status_of_tracker(&e))?;
            Ok(EnginePut {
                luid: put.luid,
                merged: matches!(put.disposition, Disposition::Merged),
                needs_merge: None,
            })
        })
    }

    fn update_item_as_key(&mut self, key: &ItemKey, luid: &str) -> Result<EnginePut, SyncStatus> {
        wrapped!(
            self,
            update_item_as_key,
            (key.clone(), luid.to_string()),
            |me| {
                let put = me
                    .backend
                    .insert(Some(luid), &key.data)
                    .map_err(|e| status_of_backend(&e))?;
                // a refused write leaves the store and the tracker untouched
                if let Disposition::NeedsMerge(other) = put.disposition {
                    return Ok(EnginePut {
                        luid: put.luid,
                        merged: false,
                        needs_merge: Some(other),
                    });
                }
                me.tracker
                    .update_revision(Some(luid), &put.luid, &put.revision)
                    .map_err(|e| status_of_tracker(&e))?;
                Ok(EnginePut {
                    luid: put.luid,
                    merged: matches!(put.disposition, Disposition::Merged),
                    needs_merge: None,
                })
            }
        )
    }

    fn delete_item(&mut self, luid: &str) -> Result<(), SyncStatus> {
        wrapped!(self, delete_item, luid.to_string(), |me| {
            me.backend
                .delete(luid)
                .map_err(|e| status_of_backend(&e))?;
            me.tracker
                .delete_revision(luid)
                .map_err(|e| status_of_tracker(&e))?;
            Ok(())
        })
    }

    fn load_admin_data(&mut self, local: &str, remote: &str) -> Result<String, SyncStatus> {
        wrapped!(
            self,
            load_admin_data,
            (local.to_string(), remote.to_string()),
            |me| Ok(me.admin.get(ADMIN_DATA_KEY).unwrap_or("").to_string())
        )
    }

    fn save_admin_data(&mut self, data: &str) -> Result<(), SyncStatus> {
        wrapped!(self, save_admin_data, data.to_string(), |me| {
            me.admin.set(ADMIN_DATA_KEY, data);
            me.admin
                .save()
                .map_err(|_| SyncStatus::DATASTORE_FAILURE)
        })
    }

    fn read_next_map_item(&mut self, first: bool) -> Result<Option<MapItem>, SyncStatus> {
        wrapped!(self, read_next_map_item, first, |me| {
            if first || me.map_iter.is_none() {
                let items = me
                    .map
                    .iter()
                    .map(|(local_id, value)| {
                        let (remote_id, flags) = value.split_once(' ').unwrap_or((value, "0"));
                        MapItem {
                            local_id: local_id.to_string(),
                            remote_id: remote_id.to_string(),
                            flags: flags.parse().unwrap_or(0),
                        }
                    })
                    .collect();
                me.map_iter = Some(items);
            }
            Ok(me.map_iter.as_mut().expect("just initialized").pop_front())
        })
    }

    fn insert_map_item(&mut self, item: &MapItem) -> Result<(), SyncStatus> {
        wrapped!(self, insert_map_item, item.clone(), |me| {
            me.map
                .set(&item.local_id, format!("{} {}", item.remote_id, item.flags));
            me.map.save().map_err(|_| SyncStatus::DATASTORE_FAILURE)
        })
    }

    fn update_map_item(&mut self, item: &MapItem) -> Result<(), SyncStatus> {
        self.insert_map_item(item)
    }

    fn delete_map_item(&mut self, item: &MapItem) -> Result<(), SyncStatus> {
        wrapped!(self, delete_map_item, item.clone(), |me| {
            me.map.remove(&item.local_id);
            me.map.save().map_err(|_| SyncStatus::DATASTORE_FAILURE)
        })
    }

    fn read_blob(&mut self, luid: &str, blob_id: &str) -> Result<Vec<u8>, SyncStatus> {
        wrapped!(
            self,
            read_blob,
            (luid.to_string(), blob_id.to_string()),
            |me| {
                std::fs::read(me.blob_path(luid, blob_id)).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        SyncStatus::NOT_FOUND
                    } else {
                        SyncStatus::DATASTORE_FAILURE
                    }
                })
            }
        )
    }

    fn write_blob(&mut self, luid: &str, blob_id: &str, data: &[u8]) -> Result<(), SyncStatus> {
        wrapped!(
            self,
            write_blob,
            (luid.to_string(), blob_id.to_string()),
            |me| {
                std::fs::create_dir_all(&me.blob_dir)
                    .and_then(|()| std::fs::write(me.blob_path(luid, blob_id), data))
                    .map_err(|_| SyncStatus::DATASTORE_FAILURE)
            }
        )
    }

    fn delete_blob(&mut self, luid: &str, blob_id: &str) -> Result<(), SyncStatus> {
        wrapped!(
            self,
            delete_blob,
            (luid.to_string(), blob_id.to_string()),
            |me| {
                std::fs::remove_file(me.blob_path(luid, blob_id))
                    .map_err(|_| SyncStatus::NOT_FOUND)
            }
        )
    }
}
