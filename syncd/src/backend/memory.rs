//! In-memory backend, used by source self-tests and by the test suite.
//!
//! Holds vCard-flavoured items; duplicates are detected via the item's
//! domain key (`UID`, falling back to `N`/`FN`), which is what lets an add
//! come back as [`Disposition::Replaced`]. Several [`MemoryBackend`]
//! instances may share one store, which models separate source views of the
//! same database.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use sync_api::models::Database;

use super::{BackendError, Disposition, ItemPut, RevisionMap, SourceParams, SyncBackend};

/// Named stores shared across backend instances, so that separate sessions
/// (and separate source views) addressing the same database URI see the
/// same data, like any real store would.
static STORES: Lazy<Mutex<BTreeMap<String, MemoryStore>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

/// The store registered under `uri`, created on first use.
pub fn store_for(uri: &str) -> MemoryStore {
    STORES
        .lock()
        .unwrap()
        .entry(uri.to_string())
        .or_default()
        .clone()
}

#[derive(Debug, Default)]
struct Store {
    /// luid -> (revision, data)
    items: BTreeMap<String, (String, Vec<u8>)>,
    next_luid: u64,
    next_revision: u64,
}

impl Store {
    fn bump_revision(&mut self) -> String {
        self.next_revision += 1;
        self.next_revision.to_string()
    }
}

/// Shared handle to an in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<Mutex<Store>>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently stored.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemoryBackend {
    name: String,
    database: String,
    store: MemoryStore,
    open: bool,
}

impl MemoryBackend {
    /// Instantiate against the shared store named by the source's database
    /// URI (falling back to the source name).
    pub fn new(params: &SourceParams) -> Self {
        let uri = if params.database.is_empty() {
            &params.source_name
        } else {
            &params.database
        };
        MemoryBackend {
            name: params.source_name.clone(),
            database: params.database.clone(),
            store: store_for(uri),
            open: false,
        }
    }

    /// A backend view onto an existing store.
    pub fn with_store(name: &str, store: MemoryStore) -> Self {
        MemoryBackend {
            name: name.to_string(),
            database: String::new(),
            store,
            open: false,
        }
    }

    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.open {
            Ok(())
        } else {
            Err(BackendError::NotOpen)
        }
    }
}

/// Extract the line value for `prop` from unfolded vCard-ish text.
fn property_value(data: &[u8], prop: &str) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            // ignore parameters such as TEL;TYPE=HOME
            let name = name.split(';').next().unwrap_or(name);
            if name.eq_ignore_ascii_case(prop) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// The key under which two items count as "the same" for duplicate
/// detection: UID if present, otherwise the structured name.
pub fn domain_key(data: &[u8]) -> Option<String> {
    property_value(data, "UID")
        .map(|uid| format!("uid:{uid}"))
        .or_else(|| property_value(data, "N").map(|n| format!("n:{n}")))
        .or_else(|| property_value(data, "FN").map(|fn_| format!("fn:{fn_}")))
}

/// Reduce an item to the fields that matter for semantic comparison,
/// whitespace-insensitively. Two items with equal normal forms count as the
/// same contact.
pub fn normalize(data: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for prop in ["FN", "N", "TEL", "EMAIL", "BDAY"] {
        if let Some(value) = property_value(data, prop) {
            let squashed: String = value.split_whitespace().collect::<Vec<_>>().join(" ");
            out.insert(prop.to_string(), squashed);
        }
    }
    out
}

impl SyncBackend for MemoryBackend {
    fn databases(&self) -> Result<Vec<Database>, BackendError> {
        Ok(vec![Database {
            name: self.name.clone(),
            uri: if self.database.is_empty() {
                "memory".to_string()
            } else {
                self.database.clone()
            },
            is_default: true,
        }])
    }

    fn open(&mut self) -> Result<(), BackendError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.open = false;
        Ok(())
    }

    fn list_all(&mut self) -> Result<RevisionMap, BackendError> {
        self.check_open()?;
        let store = self.store.0.lock().unwrap();
        Ok(store
            .items
            .iter()
            .map(|(luid, (rev, _))| (luid.clone(), rev.clone()))
            .collect())
    }

    fn read(&mut self, luid: &str) -> Result<Vec<u8>, BackendError> {
        self.check_open()?;
        let store = self.store.0.lock().unwrap();
        store
            .items
            .get(luid)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| BackendError::ItemNotFound(luid.to_string()))
    }

    fn insert(&mut self, luid: Option<&str>, data: &[u8]) -> Result<ItemPut, BackendError> {
        self.check_open()?;
        let mut store = self.store.0.lock().unwrap();

        if let Some(luid) = luid {
            // An update (or re-creation under a caller-chosen luid, during
            // restore). When the new content carries the domain key of a
            // *different* item, the write is refused and the caller has to
            // merge with that item first.
            if let Some(key) = domain_key(data) {
                let conflict = store
                    .items
                    .iter()
                    .find(|(other, (_, stored))| {
                        other.as_str() != luid && domain_key(stored).as_deref() == Some(&key)
                    })
                    .map(|(other, _)| other.clone());
                if let Some(other) = conflict {
                    let revision = store
                        .items
                        .get(luid)
                        .map(|(rev, _)| rev.clone())
                        .unwrap_or_default();
                    return Ok(ItemPut {
                        luid: luid.to_string(),
                        revision,
                        disposition: Disposition::NeedsMerge(other),
                    });
                }
            }
            let revision = store.bump_revision();
            store
                .items
                .insert(luid.to_string(), (revision.clone(), data.to_vec()));
            return Ok(ItemPut {
                luid: luid.to_string(),
                revision,
                disposition: Disposition::Ok,
            });
        }

        // an add; check for a duplicate via the domain key first
        if let Some(key) = domain_key(data) {
            let existing = store
                .items
                .iter()
                .find(|(_, (_, stored))| domain_key(stored).as_deref() == Some(&key))
                .map(|(luid, _)| luid.clone());
            if let Some(existing) = existing {
                let revision = store.bump_revision();
                store
                    .items
                    .insert(existing.clone(), (revision.clone(), data.to_vec()));
                return Ok(ItemPut {
                    luid: existing,
                    revision,
                    disposition: Disposition::Replaced,
                });
            }
        }

        store.next_luid += 1;
        let luid = format!("mem-{}", store.next_luid);
        let revision = store.bump_revision();
        store
            .items
            .insert(luid.clone(), (revision.clone(), data.to_vec()));
        Ok(ItemPut {
            luid,
            revision,
            disposition: Disposition::Ok,
        })
    }

    fn delete(&mut self, luid: &str) -> Result<(), BackendError> {
        self.check_open()?;
        let mut store = self.store.0.lock().unwrap();
        store
            .items
            .remove(luid)
            .map(|_| ())
            .ok_or_else(|| BackendError::ItemNotFound(luid.to_string()))
    }

    fn is_empty(&mut self) -> Result<bool, BackendError> {
        self.check_open()?;
        Ok(self.store.0.lock().unwrap().items.is_empty())
    }
}

pub const JOHN_DOE: &str = "BEGIN:VCARD\nVERSION:3.0\nFN:John Doe\nN:Doe;John\nEND:VCARD";

#[cfg(test)]
mod tests {
    use super::*;

    fn open_backend() -> MemoryBackend {
        let mut b = MemoryBackend::with_store("addressbook", MemoryStore::new());
        b.open().unwrap();
        b
    }

    #[test]
    fn insert_read_delete() {
        let mut b = open_backend();
        let put = b.insert(None, JOHN_DOE.as_bytes()).unwrap();
        assert_eq!(put.disposition, Disposition::Ok);
        assert_eq!(b.read(&put.luid).unwrap(), JOHN_DOE.as_bytes());
        b.delete(&put.luid).unwrap();
        assert!(matches!(
            b.delete(&put.luid),
            Err(BackendError::ItemNotFound(_))
        ));
    }

    #[test]
    fn update_changes_revision_keeps_luid() {
        let mut b = open_backend();
        let put = b.insert(None, JOHN_DOE.as_bytes()).unwrap();
        let updated = b
            .insert(
                Some(&put.luid),
                JOHN_DOE.replace("John", "Johnny").as_bytes(),
            )
            .unwrap();
        assert_eq!(updated.luid, put.luid);
        assert_ne!(updated.revision, put.revision);
    }

    #[test]
    fn duplicate_add_replaces_existing() {
        let mut b = open_backend();
        let first = b.insert(None, JOHN_DOE.as_bytes()).unwrap();
        let second = b
            .insert(None, JOHN_DOE.replace("END", "TEL:555-0100\nEND").as_bytes())
            .unwrap();
        assert_eq!(second.disposition, Disposition::Replaced);
        assert_eq!(second.luid, first.luid);
        assert_eq!(b.list_all().unwrap().len(), 1);
    }

    #[test]
    fn colliding_update_wants_a_merge() {
        let mut b = open_backend();
        let john = b.insert(None, JOHN_DOE.as_bytes()).unwrap();
        let jane = b
            .insert(None, b"BEGIN:VCARD\nVERSION:3.0\nFN:Jane Roe\nN:Roe;Jane\nEND:VCARD")
            .unwrap();

        // turning Jane's entry into John's contact collides with John
        let put = b.insert(Some(&jane.luid), JOHN_DOE.as_bytes()).unwrap();
        assert_eq!(put.disposition, Disposition::NeedsMerge(john.luid.clone()));
        assert_eq!(put.luid, jane.luid);
        // nothing was written
        assert_eq!(put.revision, jane.revision);
        let stored = b.read(&jane.luid).unwrap();
        assert!(String::from_utf8_lossy(&stored).contains("Jane"));
    }

    #[test]
    fn closed_backend_refuses_access() {
        let mut b = MemoryBackend::with_store("a", MemoryStore::new());
        assert!(matches!(b.list_all(), Err(BackendError::NotOpen)));
        b.open().unwrap();
        b.open().unwrap(); // idempotent
        b.close().unwrap();
        assert!(matches!(b.read("x"), Err(BackendError::NotOpen)));
    }

    #[test]
    fn normalize_ignores_whitespace_only_differences() {
        let a = normalize(JOHN_DOE.as_bytes());
        let b = normalize("BEGIN:VCARD\nVERSION:3.0\nFN:John  Doe\nN:Doe;John\nEND:VCARD".as_bytes());
        assert_eq!(a, b);
    }
}
