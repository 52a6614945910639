//! The contract every PIM backend has to satisfy.
//!
//! A backend provides a uniform view of one data store: enumerate items,
//! read/write them by stable local id, and report a per-item revision string
//! that changes iff the item's content changes. Everything above this layer
//! (change tracking, the engine adapter, backup/restore) is written against
//! [`SyncBackend`] only.

use std::collections::BTreeMap;

use sync_api::models::Database;
use sync_api::SyncStatus;

pub mod memory;

/// `{luid -> revision}` snapshot of a store.
pub type RevisionMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("item '{0}' not found")]
    ItemNotFound(String),

    #[error("backend not open")]
    NotOpen,

    #[error("datastore failure: {0}")]
    Datastore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn status(&self) -> SyncStatus {
        match self {
            BackendError::ItemNotFound(_) => SyncStatus::NOT_FOUND,
            _ => SyncStatus::DATASTORE_FAILURE,
        }
    }
}

/// A backend error annotated with the source it came from and the action
/// that was attempted, the form in which backend failures propagate.
#[derive(Debug, thiserror::Error)]
#[error("source {source}: {action}: {inner}")]
pub struct SourceError {
    pub source: String,
    pub action: &'static str,
    #[source]
    pub inner: BackendError,
}

pub(crate) fn wrap<'a>(
    source: &'a str,
    action: &'static str,
) -> impl FnOnce(BackendError) -> SourceError + 'a {
    move |inner| SourceError {
        source: source.to_string(),
        action,
        inner,
    }
}

/// What happened to an [`SyncBackend::insert`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Stored exactly as submitted.
    Ok,
    /// An add turned out to match an existing item via its domain key; the
    /// returned luid is the existing item's.
    Replaced,
    /// The stored content differs from the submitted bytes; the caller must
    /// read it back and schedule an upstream update.
    Merged,
    /// The item conflicts with another one that has to be merged first.
    NeedsMerge(String),
}

/// Result of an insert or update.
#[derive(Debug, Clone)]
pub struct ItemPut {
    pub luid: String,
    pub revision: String,
    pub disposition: Disposition,
}

/// Uniform view of a PIM data store.
///
/// All operations may fail with a typed error and must not leak
/// partially-applied state when they do. `open()`/`close()` are idempotent
/// and cheap; no native handle survives `close()`. Luids are stable across
/// process restarts and invariant across updates of the same item.
pub trait SyncBackend: Send + Sync {
    /// Enumerate addressable stores behind this backend.
    fn databases(&self) -> Result<Vec<Database>, BackendError>;

    fn open(&mut self) -> Result<(), BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;

    /// Full enumeration. Expensive; called at most once per session.
    fn list_all(&mut self) -> Result<RevisionMap, BackendError>;

    /// Current item data in the backend's interchange format.
    fn read(&mut self, luid: &str) -> Result<Vec<u8>, BackendError>;

    /// With `Some(luid)` this is an update, with `None` an add. An add may
    /// still return [`Disposition::Replaced`] when the backend detects a
    /// duplicate through a domain-specific key.
    fn insert(&mut self, luid: Option<&str>, data: &[u8]) -> Result<ItemPut, BackendError>;

    /// Deleting a non-existent luid is an error, not a no-op.
    fn delete(&mut self, luid: &str) -> Result<(), BackendError>;

    /// Fast path used only to decide whether a first slow sync may run
    /// without asking the user.
    fn is_empty(&mut self) -> Result<bool, BackendError> {
        Ok(self.list_all()?.is_empty())
    }
}

/// Instantiation parameters for a backend, from the source's `type`
/// property (`<backend>:<mime>[:<version>]`) and `uri`.
#[derive(Debug, Clone, Default)]
pub struct SourceParams {
    pub source_name: String,
    pub backend: String,
    pub mime_type: String,
    pub mime_version: String,
    pub database: String,
}

impl SourceParams {
    /// Parse the `type` config property.
    pub fn from_type_property(source_name: &str, type_prop: &str, uri: &str) -> Self {
        let mut parts = type_prop.splitn(4, ':');
        let backend = parts.next().unwrap_or_default().to_string();
        let mime_type = parts.next().unwrap_or_default().to_string();
        let mime_version = parts.next().unwrap_or_default().to_string();
        SourceParams {
            source_name: source_name.to_string(),
            backend,
            mime_type,
            mime_version,
            database: uri.to_string(),
        }
    }
}

pub type BackendFactory = Box<dyn Fn(&SourceParams) -> anyhow::Result<Box<dyn SyncBackend>> + Send + Sync>;

/// Maps backend names (the first component of the `type` property) to
/// constructors. The daemon registers built-in backends at startup; tests
/// register their fixtures.
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = BackendRegistry {
            factories: BTreeMap::new(),
        };
        registry.register("memory", |params| {
            Ok(Box::new(memory::MemoryBackend::new(params)) as Box<dyn SyncBackend>)
        });
        registry
    }
}

impl BackendRegistry {
    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&SourceParams) -> anyhow::Result<Box<dyn SyncBackend>> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, params: &SourceParams) -> anyhow::Result<Box<dyn SyncBackend>> {
        let factory = self
            .factories
            .get(&params.backend)
            .ok_or_else(|| anyhow::anyhow!("unknown backend '{}'", params.backend))?;
        factory(params)
    }

    pub fn known(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_property_parsing() {
        let p = SourceParams::from_type_property("addressbook", "memory:text/vcard:3.0", "card");
        assert_eq!(p.backend, "memory");
        assert_eq!(p.mime_type, "text/vcard");
        assert_eq!(p.mime_version, "3.0");
        assert_eq!(p.database, "card");
    }

    #[test]
    fn registry_knows_memory_backend() {
        let registry = BackendRegistry::default();
        let params = SourceParams::from_type_property("a", "memory:text/vcard:3.0", "");
        assert!(registry.create(&params).is_ok());
        let params = SourceParams::from_type_property("a", "carddav:text/vcard", "");
        assert!(registry.create(&params).is_err());
    }
}
