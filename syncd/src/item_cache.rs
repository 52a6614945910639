//! Content-addressed item snapshots for backup and restore.
//!
//! Each item is stored as `<counter>-<suffix>=<hexdigest>` inside the
//! snapshot directory; `counter` gives a stable sort, the suffix names the
//! hash algorithm so older snapshot generations remain recognizable. A
//! sibling metadata node maps `luid -> "<counter> <revision>"`. A snapshot
//! without its metadata node is invalid and must be discarded.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use utils::kvnode::KvNode;

use crate::backend::{Disposition, SourceError, SyncBackend};

/// Suffix of the hash currently written.
const HASH_SUFFIX: &str = "sha256";
/// Older snapshots may carry this weaker hash; they are still readable.
const LEGACY_HASH_SUFFIX: &str = "md5";

pub const META_NODE_NAME: &str = "backup.node";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("snapshot {0} has no metadata node, treating as invalid")]
    InvalidSnapshot(Utf8PathBuf),

    #[error(transparent)]
    Node(#[from] utils::kvnode::NodeError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Counters filled by backup/restore for the caller's report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub items: u32,
    /// Items whose bytes were reused (linked) from the previous snapshot.
    pub reused: u32,
    pub added: u32,
    pub updated: u32,
    pub deleted: u32,
}

fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn legacy_hash_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn file_name(counter: u64, suffix: &str, digest: &str) -> String {
    format!("{counter}-{suffix}={digest}")
}

/// Parse `<counter>-<suffix>=<hex>`; returns (counter, suffix, digest).
fn parse_file_name(name: &str) -> Option<(u64, &str, &str)> {
    let (prefix, digest) = name.split_once('=')?;
    let (counter, suffix) = prefix.split_once('-')?;
    let counter = counter.parse().ok()?;
    if suffix != HASH_SUFFIX && suffix != LEGACY_HASH_SUFFIX {
        return None;
    }
    Some((counter, suffix, digest))
}

/// Writer for one new snapshot, optionally reusing an older one.
pub struct ItemCache {
    dir: Utf8PathBuf,
    meta: KvNode,
    /// digest -> path in the old snapshot, for reuse without copying
    old_by_digest: HashMap<String, Utf8PathBuf>,
    counter: u64,
    report: SnapshotReport,
}

impl ItemCache {
    /// Prepare writing a snapshot into `new_dir`. If `old_dir` points to a
    /// valid previous snapshot its files can be reused by hash.
    pub fn init(old_dir: Option<&Utf8Path>, new_dir: &Utf8Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(new_dir)?;

        let mut old_by_digest = HashMap::new();
        if let Some(old_dir) = old_dir {
            // An old snapshot missing its metadata node was interrupted
            // mid-write; ignore it rather than resurrecting partial data.
            if old_dir.join(META_NODE_NAME).exists() {
                for entry in old_dir.read_dir_utf8()? {
                    let entry = entry?;
                    if let Some((_, _, digest)) = parse_file_name(entry.file_name()) {
                        old_by_digest.insert(digest.to_string(), entry.path().to_path_buf());
                    }
                }
            }
        }

        Ok(ItemCache {
            dir: new_dir.to_path_buf(),
            meta: KvNode::new(new_dir.join(META_NODE_NAME)),
            old_by_digest,
            counter: 0,
            report: SnapshotReport::default(),
        })
    }

    /// Add one item to the snapshot, hard-linking the old snapshot's file
    /// when the content hash matches. Old snapshots written with the weak
    /// hash are still reusable: their digests are recognized by suffix and
    /// matched with the same algorithm.
    pub fn backup_item(&mut self, data: &[u8], luid: &str, revision: &str) -> Result<(), CacheError> {
        self.counter += 1;
        let digest = hash_hex(data);
        let target = self.dir.join(file_name(self.counter, HASH_SUFFIX, &digest));

        let old_match = self
            .old_by_digest
            .get(&digest)
            .or_else(|| self.old_by_digest.get(&legacy_hash_hex(data)));
        match old_match {
            Some(old_path) => {
                if std::fs::hard_link(old_path, &target).is_ok() {
                    self.report.reused += 1;
                } else {
                    // cross-device or similar; fall back to copying
                    std::fs::copy(old_path, &target)?;
                }
            }
            None => {
                std::fs::write(&target, data)?;
            }
        }

        self.meta
            .set(luid, format!("{} {revision}", self.counter));
        self.report.items += 1;
        Ok(())
    }

    /// Write the metadata node, making the snapshot valid.
    pub fn finalize(mut self) -> Result<SnapshotReport, CacheError> {
        self.meta.set("#items", self.report.items.to_string());
        self.meta.save()?;
        Ok(self.report)
    }

    /// Discard a partially written snapshot so a retry starts cleanly.
    pub fn reset(self) -> Result<(), CacheError> {
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            std::fs::remove_file(entry.path())?;
        }
        Ok(())
    }
}

/// One item of a readable snapshot.
pub struct SnapshotItem {
    pub luid: String,
    pub revision: String,
    pub data: Vec<u8>,
}

/// Read access to a finalized snapshot.
pub struct Snapshot {
    dir: Utf8PathBuf,
    meta: KvNode,
}

impl Snapshot {
    pub fn open(dir: &Utf8Path) -> Result<Self, CacheError> {
        let meta_path = dir.join(META_NODE_NAME);
        if !meta_path.exists() {
            return Err(CacheError::InvalidSnapshot(dir.to_path_buf()));
        }
        Ok(Snapshot {
            dir: dir.to_path_buf(),
            meta: KvNode::load(meta_path)?,
        })
    }

    pub fn items(&self) -> Result<Vec<SnapshotItem>, CacheError> {
        // counter -> file path
        let mut files = HashMap::new();
        for entry in self.dir.read_dir_utf8()? {
            let entry = entry?;
            if let Some((counter, _, _)) = parse_file_name(entry.file_name()) {
                files.insert(counter, entry.path().to_path_buf());
            }
        }

        let mut items = Vec::new();
        for (luid, value) in self.meta.iter() {
            if luid.starts_with('#') {
                continue;
            }
            let (counter, revision) = value.split_once(' ').unwrap_or((value, ""));
            let Ok(counter) = counter.parse::<u64>() else {
                continue;
            };
            let Some(path) = files.get(&counter) else {
                return Err(CacheError::InvalidSnapshot(self.dir.clone()));
            };
            items.push(SnapshotItem {
                luid: luid.to_string(),
                revision: revision.to_string(),
                data: std::fs::read(path)?,
            });
        }
        // counter order = original backup order
        items.sort_by_key(|item| {
            self.meta
                .get(&item.luid)
                .and_then(|v| v.split(' ').next())
                .and_then(|c| c.parse::<u64>().ok())
                .unwrap_or(u64::MAX)
        });
        Ok(items)
    }

    /// Bring the backend to the snapshot's state: insert every snapshot
    /// item under its luid, then delete current items the snapshot does not
    /// know. With `dry_run` only the report is produced.
    pub fn restore(
        &self,
        source_name: &str,
        backend: &mut dyn SyncBackend,
        dry_run: bool,
    ) -> Result<SnapshotReport, CacheError> {
        use crate::backend::wrap;

        let mut report = SnapshotReport::default();
        let items = self.items()?;

        let existing = backend
            .list_all()
            .map_err(wrap(source_name, "list for restore"))?;
        let mut already_removed = std::collections::BTreeSet::new();

        for item in &items {
            report.items += 1;
            let known = existing.contains_key(&item.luid);
            if known {
                report.updated += 1;
            } else {
                report.added += 1;
            }
            if !dry_run {
                let put = backend
                    .insert(Some(&item.luid), &item.data)
                    .map_err(wrap(source_name, "restore item"))?;
                // the snapshot is authoritative: a current item standing in
                // the way of this luid gets dropped, then the write retried
                if let Disposition::NeedsMerge(other) = put.disposition {
                    backend
                        .delete(&other)
                        .map_err(wrap(source_name, "restore delete"))?;
                    report.deleted += 1;
                    already_removed.insert(other);
                    backend
                        .insert(Some(&item.luid), &item.data)
                        .map_err(wrap(source_name, "restore item"))?;
                }
            }
        }

        for luid in existing.keys() {
            if already_removed.contains(luid) {
                continue;
            }
            if !items.iter().any(|item| &item.luid == luid) {
                report.deleted += 1;
                if !dry_run {
                    backend
                        .delete(luid)
                        .map_err(wrap(source_name, "restore delete"))?;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryStore, JOHN_DOE};

    #[test]
    fn file_name_round_trip() {
        let name = file_name(12, HASH_SUFFIX, "abcd");
        assert_eq!(parse_file_name(&name), Some((12, "sha256", "abcd")));
        assert_eq!(parse_file_name("12-md5=ffff"), Some((12, "md5", "ffff")));
        assert_eq!(parse_file_name("garbage"), None);
        assert_eq!(parse_file_name("1-crc32=aa"), None);
    }

    #[test]
    fn backup_then_open() {
        let dir = camino_tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("snap");
        let mut cache = ItemCache::init(None, &snap_dir).unwrap();
        cache.backup_item(JOHN_DOE.as_bytes(), "luid-1", "rev-7").unwrap();
        let report = cache.finalize().unwrap();
        assert_eq!(report.items, 1);

        let snapshot = Snapshot::open(&snap_dir).unwrap();
        let items = snapshot.items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].luid, "luid-1");
        assert_eq!(items[0].revision, "rev-7");
        assert_eq!(items[0].data, JOHN_DOE.as_bytes());
    }

    #[test]
    fn snapshot_without_meta_is_invalid() {
        let dir = camino_tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("partial");
        let mut cache = ItemCache::init(None, &snap_dir).unwrap();
        cache.backup_item(b"data", "l", "r").unwrap();
        // finalize() never ran
        assert!(matches!(
            Snapshot::open(&snap_dir),
            Err(CacheError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reset_discards_partial_snapshot() {
        let dir = camino_tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("partial");
        let mut cache = ItemCache::init(None, &snap_dir).unwrap();
        cache.backup_item(b"data", "l", "r").unwrap();
        cache.reset().unwrap();
        assert_eq!(snap_dir.read_dir_utf8().unwrap().count(), 0);
    }

    #[test]
    fn second_generation_reuses_unchanged_items() {
        let dir = camino_tempfile::tempdir().unwrap();
        let first_dir = dir.path().join("1");
        let mut first = ItemCache::init(None, &first_dir).unwrap();
        first.backup_item(JOHN_DOE.as_bytes(), "l1", "r1").unwrap();
        first.finalize().unwrap();

        let second_dir = dir.path().join("2");
        let mut second = ItemCache::init(Some(&first_dir), &second_dir).unwrap();
        second.backup_item(JOHN_DOE.as_bytes(), "l1", "r1").unwrap();
        second.backup_item(b"new item", "l2", "r1").unwrap();
        let report = second.finalize().unwrap();
        assert_eq!(report.items, 2);
        assert_eq!(report.reused, 1);
    }

    #[test]
    fn restore_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("snap");

        let store = MemoryStore::new();
        let mut backend = MemoryBackend::with_store("addressbook", store);
        backend.open().unwrap();
        let put = backend.insert(None, JOHN_DOE.as_bytes()).unwrap();

        let mut cache = ItemCache::init(None, &snap_dir).unwrap();
        cache
            .backup_item(JOHN_DOE.as_bytes(), &put.luid, &put.revision)
            .unwrap();
        cache.finalize().unwrap();

        // diverge: delete the item, add an unrelated one
        backend.delete(&put.luid).unwrap();
        backend
            .insert(None, b"BEGIN:VCARD\nFN:Stray\nEND:VCARD")
            .unwrap();

        let snapshot = Snapshot::open(&snap_dir).unwrap();
        let report = snapshot.restore("addressbook", &mut backend, false).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.deleted, 1);

        let all = backend.list_all().unwrap();
        assert_eq!(all.len(), 1);
        let data = backend.read(all.keys().next().unwrap()).unwrap();
        assert_eq!(data, JOHN_DOE.as_bytes());
    }

    #[test]
    fn restore_replaces_a_conflicting_survivor() {
        let dir = camino_tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("snap");
        let mut cache = ItemCache::init(None, &snap_dir).unwrap();
        cache.backup_item(JOHN_DOE.as_bytes(), "l1", "r1").unwrap();
        cache.finalize().unwrap();

        // the live store holds the same contact under a different luid
        let mut backend = MemoryBackend::with_store("a", MemoryStore::new());
        backend.open().unwrap();
        let stray = backend.insert(None, JOHN_DOE.as_bytes()).unwrap();

        let snapshot = Snapshot::open(&snap_dir).unwrap();
        let report = snapshot.restore("a", &mut backend, false).unwrap();
        assert_eq!(report.deleted, 1);

        let all = backend.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("l1"));
        assert!(!all.contains_key(&stray.luid));
    }

    #[test]
    fn restore_dry_run_touches_nothing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("snap");
        let mut cache = ItemCache::init(None, &snap_dir).unwrap();
        cache.backup_item(JOHN_DOE.as_bytes(), "l1", "r1").unwrap();
        cache.finalize().unwrap();

        let mut backend = MemoryBackend::with_store("a", MemoryStore::new());
        backend.open().unwrap();

        let snapshot = Snapshot::open(&snap_dir).unwrap();
        let report = snapshot.restore("a", &mut backend, true).unwrap();
        assert_eq!(report.added, 1);
        assert!(backend.list_all().unwrap().is_empty());
    }
}
