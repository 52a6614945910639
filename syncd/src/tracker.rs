//! Revision-based change tracking.
//!
//! Diffs the persisted `{luid -> revision}` map against the backend's
//! current snapshot and yields the added/updated/deleted sets for one sync
//! cycle. The persisted map is only ever advanced by the per-item
//! [`ChangeTracker::update_revision`]/[`ChangeTracker::delete_revision`]
//! calls, i.e. after an item change was durably delivered or applied, so the
//! on-disk state always reflects what the peer is believed to have.

use std::collections::BTreeSet;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::time::Instant;
use utils::kvnode::KvNode;

use crate::backend::{BackendError, RevisionMap};

/// How [`ChangeTracker::detect_changes`] obtains its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    /// Enumerate the backend and diff against the previous map.
    Full,
    /// Like `Full`, but the caller treats every current item as seen fresh
    /// (slow sync).
    Slow,
    /// The caller knows nothing changed; skip enumeration entirely and use
    /// the previous map as the authoritative snapshot.
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("luid '{0}' has an empty revision outside of a full refresh")]
    EmptyRevision(String),

    #[error(transparent)]
    Node(#[from] utils::kvnode::NodeError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One cycle's worth of detected changes.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    /// The current snapshot the sets were derived from.
    pub all: RevisionMap,
}

impl ChangeSet {
    /// A luid must never appear in more than one set.
    pub fn assert_disjoint(&self) {
        debug_assert!(self.added.is_disjoint(&self.updated));
        debug_assert!(self.added.is_disjoint(&self.deleted));
        debug_assert!(self.updated.is_disjoint(&self.deleted));
    }
}

pub struct ChangeTracker {
    node: KvNode,
    /// Revision resolution of the backend: a modification and a snapshot
    /// within the same `granularity` window may be indistinguishable.
    granularity: Duration,
    last_modification: Option<Instant>,
}

impl ChangeTracker {
    pub fn load(path: impl Into<Utf8PathBuf>, granularity: Duration) -> Result<Self, TrackerError> {
        Ok(ChangeTracker {
            node: KvNode::load(path)?,
            granularity,
            last_modification: None,
        })
    }

    /// The persisted map as of the last completed cycle.
    pub fn previous(&self) -> RevisionMap {
        self.node
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Compute the change sets for this cycle.
    ///
    /// `allow_empty_revisions` is only true during a forced full refresh
    /// from the peer; any other empty revision is a backend bug.
    pub fn detect_changes(
        &mut self,
        mode: ChangeMode,
        current: RevisionMap,
        allow_empty_revisions: bool,
    ) -> Result<ChangeSet, TrackerError> {
        let previous = self.previous();

        let current = match mode {
            ChangeMode::Full | ChangeMode::Slow => current,
            // nothing changed externally; the saved map is the snapshot
            ChangeMode::None => previous.clone(),
        };

        if !allow_empty_revisions {
            if let Some((luid, _)) = current.iter().find(|(_, rev)| rev.is_empty()) {
                return Err(TrackerError::EmptyRevision(luid.clone()));
            }
        }

        let mut set = ChangeSet {
            all: current.clone(),
            ..Default::default()
        };
        if mode != ChangeMode::None {
            for (luid, revision) in &current {
                match previous.get(luid) {
                    None => {
                        set.added.insert(luid.clone());
                    }
                    Some(prev_revision) if prev_revision != revision => {
                        set.updated.insert(luid.clone());
                    }
                    Some(_) => {}
                }
            }
            for luid in previous.keys() {
                if !current.contains_key(luid) {
                    set.deleted.insert(luid.clone());
                }
            }
        }
        set.assert_disjoint();
        Ok(set)
    }

    /// Record a successful add or update. A rename (old luid differs from
    /// the new one) drops the old entry.
    pub fn update_revision(
        &mut self,
        old_luid: Option<&str>,
        new_luid: &str,
        revision: &str,
    ) -> Result<(), TrackerError> {
        if revision.is_empty() {
            return Err(TrackerError::EmptyRevision(new_luid.to_string()));
        }
        if let Some(old) = old_luid {
            if old != new_luid {
                self.node.remove(old);
            }
        }
        self.node.set(new_luid, revision);
        self.database_modified();
        self.node.save()?;
        Ok(())
    }

    /// Record a successful delete.
    pub fn delete_revision(&mut self, luid: &str) -> Result<(), TrackerError> {
        self.node.remove(luid);
        self.database_modified();
        self.node.save()?;
        Ok(())
    }

    /// Commit one cycle's outbound changes after the peer acknowledged
    /// them: adds/updates from the detected snapshot are recorded, deleted
    /// luids dropped. Entries touched by inbound per-item operations in the
    /// meantime are left alone.
    pub fn commit(&mut self, set: &ChangeSet) -> Result<(), TrackerError> {
        for (luid, revision) in &set.all {
            if self.node.get(luid).is_none() || set.added.contains(luid) || set.updated.contains(luid)
            {
                self.node.set(luid, revision);
            }
        }
        for luid in &set.deleted {
            self.node.remove(luid);
        }
        self.database_modified();
        self.node.save()?;
        Ok(())
    }

    /// Overwrite the persisted map wholesale, used after a refresh where the
    /// current snapshot is authoritative.
    pub fn set_all(&mut self, revisions: &RevisionMap) -> Result<(), TrackerError> {
        self.node.clear();
        for (luid, revision) in revisions {
            self.node.set(luid, revision);
        }
        self.database_modified();
        self.node.save()?;
        Ok(())
    }

    pub fn contains(&self, luid: &str) -> bool {
        self.node.get(luid).is_some()
    }

    fn database_modified(&mut self) {
        self.last_modification = Some(Instant::now());
    }

    /// Hold the session end until at least `granularity` has passed since
    /// the last local mutation. Backends whose revision is a coarse
    /// timestamp would otherwise miss a modification made in the same tick
    /// as the snapshot.
    pub async fn quiesce(&self) {
        let (Some(last), granularity) = (self.last_modification, self.granularity) else {
            return;
        };
        if granularity.is_zero() {
            return;
        }
        let due = last + granularity;
        let now = Instant::now();
        if due > now {
            tokio::time::sleep_until(due).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &camino_tempfile::Utf8TempDir) -> ChangeTracker {
        ChangeTracker::load(dir.path().join("source.node"), Duration::from_secs(1)).unwrap()
    }

    fn revmap(entries: &[(&str, &str)]) -> RevisionMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn full_mode_computes_set_algebra() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        t.set_all(&revmap(&[("a", "1"), ("b", "1"), ("c", "1")]))
            .unwrap();

        let set = t
            .detect_changes(
                ChangeMode::Full,
                revmap(&[("a", "1"), ("b", "2"), ("d", "1")]),
                false,
            )
            .unwrap();
        assert_eq!(set.added, BTreeSet::from(["d".to_string()]));
        assert_eq!(set.updated, BTreeSet::from(["b".to_string()]));
        assert_eq!(set.deleted, BTreeSet::from(["c".to_string()]));
    }

    #[test]
    fn none_mode_uses_previous_map() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        t.set_all(&revmap(&[("a", "1")])).unwrap();

        // snapshot from the backend is deliberately absent
        let set = t
            .detect_changes(ChangeMode::None, RevisionMap::new(), false)
            .unwrap();
        assert!(set.added.is_empty());
        assert!(set.updated.is_empty());
        assert!(set.deleted.is_empty());
        assert_eq!(set.all, revmap(&[("a", "1")]));
    }

    #[test]
    fn empty_revision_rejected_outside_refresh() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        let err = t
            .detect_changes(ChangeMode::Full, revmap(&[("a", "")]), false)
            .unwrap_err();
        assert!(matches!(err, TrackerError::EmptyRevision(_)));
        assert!(t
            .detect_changes(ChangeMode::Full, revmap(&[("a", "")]), true)
            .is_ok());
    }

    #[test]
    fn rename_drops_old_luid() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        t.update_revision(None, "old", "1").unwrap();
        t.update_revision(Some("old"), "new", "2").unwrap();
        assert!(!t.contains("old"));
        assert!(t.contains("new"));
    }

    #[test]
    fn deleted_luid_absent_from_saved_map() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("source.node");
        {
            let mut t = ChangeTracker::load(path.clone(), Duration::ZERO).unwrap();
            t.update_revision(None, "a", "1").unwrap();
            t.delete_revision("a").unwrap();
        }
        let reloaded = ChangeTracker::load(path, Duration::ZERO).unwrap();
        assert!(!reloaded.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn quiesce_waits_out_the_granularity() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut t = tracker(&dir);
        t.update_revision(None, "a", "1").unwrap();

        let before = Instant::now();
        t.quiesce().await;
        assert!(Instant::now() - before >= Duration::from_secs(1));

        // nothing modified since: no further delay
        let before = Instant::now();
        t.quiesce().await;
        assert_eq!(Instant::now(), before);
    }
}
