//! The per-peer configuration tree.
//!
//! Configs are named, stored hierarchically under the daemon workdir and
//! addressed by normalized name. Every config carries peer-level properties
//! plus an ordered set of sources; temporary overlays ("filters") are
//! validated against the same property registry and applied at sync time
//! without touching the durable tree. Sync reports live next to the config
//! they belong to and are returned newest-first.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use sync_api::models::{ConfigDict, SyncMode, SyncReport};
use sync_api::ApiError;
use utils::kvnode::KvNode;

pub const SOURCE_PREFIX: &str = "source/";
const CONFIG_NODE: &str = "config.node";
const SOURCES_DIR: &str = "sources";
const REPORTS_DIR: &str = "reports";

/// Resolve aliases of a config name to its unique key: case-insensitive,
/// with the default context stripped.
pub fn normalize_config_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower
        .strip_suffix("@default")
        .map(|s| s.to_string())
        .unwrap_or(lower)
}

type Validator = fn(&str) -> Result<(), String>;

struct PropertySpec {
    name: &'static str,
    validate: Validator,
}

fn any(_: &str) -> Result<(), String> {
    Ok(())
}

fn seconds(value: &str) -> Result<(), String> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| "expected a number of seconds".to_string())
}

fn auto_sync_value(value: &str) -> Result<(), String> {
    let lower = value.to_ascii_lowercase();
    if matches!(lower.as_str(), "" | "0" | "1" | "t" | "f" | "true" | "false") {
        return Ok(());
    }
    for part in lower.split(',') {
        match part.trim() {
            "http" | "obex-bt" => {}
            other => return Err(format!("unknown transport '{other}'")),
        }
    }
    Ok(())
}

fn sync_mode(value: &str) -> Result<(), String> {
    value
        .parse::<SyncMode>()
        .map(|_| ())
        .map_err(|_| format!("unknown sync mode '{value}'"))
}

fn notify_level(value: &str) -> Result<(), String> {
    match value {
        "0" | "1" | "2" | "3" => Ok(()),
        _ => Err("expected a level 0-3".to_string()),
    }
}

static PEER_REGISTRY: Lazy<Vec<PropertySpec>> = Lazy::new(|| {
    vec![
        PropertySpec { name: "syncURL", validate: any },
        PropertySpec { name: "username", validate: any },
        PropertySpec { name: "password", validate: any },
        PropertySpec { name: "autoSync", validate: auto_sync_value },
        PropertySpec { name: "autoSyncInterval", validate: seconds },
        PropertySpec { name: "autoSyncDelay", validate: seconds },
        PropertySpec { name: "RetryDuration", validate: seconds },
        PropertySpec { name: "remoteDeviceId", validate: any },
        PropertySpec { name: "PeerName", validate: any },
        PropertySpec { name: "notifyLevel", validate: notify_level },
        PropertySpec { name: "deviceId", validate: any },
    ]
});

static SOURCE_REGISTRY: Lazy<Vec<PropertySpec>> = Lazy::new(|| {
    vec![
        PropertySpec { name: "sync", validate: sync_mode },
        PropertySpec { name: "type", validate: any },
        PropertySpec { name: "uri", validate: any },
        PropertySpec { name: "database", validate: any },
    ]
});

fn check_property(registry: &[PropertySpec], name: &str, value: &str) -> Result<(), ApiError> {
    let spec = registry
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ApiError::InvalidCall(format!("unknown property '{name}'")))?;
    (spec.validate)(value).map_err(|reason| {
        ApiError::InvalidCall(format!("invalid value '{value}' for property '{name}': {reason}"))
    })
}

/// A validated set of temporary overrides for one config.
#[derive(Debug, Clone, Default)]
pub struct ConfigFilter {
    pub peer: BTreeMap<String, String>,
    pub sources: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigFilter {
    /// Parse and validate the bus representation. Read-only presentation
    /// properties are ignored rather than rejected.
    pub fn from_dict(dict: &ConfigDict) -> Result<ConfigFilter, ApiError> {
        const IGNORED: &[&str] = &[
            "configName",
            "description",
            "score",
            "deviceName",
            "hardwareName",
            "templateName",
            "fingerprint",
        ];

        let mut filter = ConfigFilter::default();
        for (outer, entries) in dict {
            if outer.is_empty() {
                for (name, value) in entries {
                    if IGNORED.iter().any(|p| p.eq_ignore_ascii_case(name)) {
                        continue;
                    }
                    check_property(&PEER_REGISTRY, name, value)?;
                    filter.peer.insert(name.clone(), value.clone());
                }
            } else if let Some(source) = outer.strip_prefix(SOURCE_PREFIX) {
                let target = filter.sources.entry(source.to_string()).or_default();
                for (name, value) in entries {
                    check_property(&SOURCE_REGISTRY, name, value)?;
                    target.insert(name.clone(), value.clone());
                }
            } else {
                return Err(ApiError::InvalidCall(format!(
                    "invalid config entry '{outer}'"
                )));
            }
        }
        Ok(filter)
    }

    /// Merge `other` on top of this filter (update semantics).
    pub fn merge(&mut self, other: ConfigFilter) {
        self.peer.extend(other.peer);
        for (source, entries) in other.sources {
            self.sources.entry(source).or_default().extend(entries);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peer.is_empty() && self.sources.is_empty()
    }
}

/// One config's durable content.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub peer: BTreeMap<String, String>,
    pub sources: BTreeMap<String, BTreeMap<String, String>>,
}

impl PeerConfig {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.peer.get(name).map(|s| s.as_str())
    }

    /// `syncURL` is a whitespace-separated list.
    pub fn sync_urls(&self) -> Vec<String> {
        self.get("syncURL")
            .unwrap_or("")
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn auto_sync(&self) -> &str {
        self.get("autoSync").unwrap_or("")
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(
            self.get("autoSyncInterval")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        )
    }

    pub fn auto_sync_delay(&self) -> Duration {
        Duration::from_secs(
            self.get("autoSyncDelay")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        )
    }

    /// Timeout for connection waits; zero means the built-in default.
    pub fn retry_duration(&self) -> Duration {
        Duration::from_secs(
            self.get("RetryDuration")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        )
    }

    pub fn remote_device_id(&self) -> &str {
        self.get("remoteDeviceId").unwrap_or("")
    }

    pub fn peer_name(&self) -> &str {
        self.get("PeerName").unwrap_or("")
    }

    /// Apply a temporary overlay.
    pub fn apply_filter(&mut self, filter: &ConfigFilter) {
        for (name, value) in &filter.peer {
            self.peer.insert(name.clone(), value.clone());
        }
        for (source, entries) in &filter.sources {
            let target = self.sources.entry(source.clone()).or_default();
            for (name, value) in entries {
                target.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn to_dict(&self) -> ConfigDict {
        let mut dict = ConfigDict::new();
        dict.insert(String::new(), self.peer.clone());
        for (source, entries) in &self.sources {
            dict.insert(format!("{SOURCE_PREFIX}{source}"), entries.clone());
        }
        dict
    }

    pub fn from_dict(dict: &ConfigDict) -> Result<PeerConfig, ApiError> {
        let filter = ConfigFilter::from_dict(dict)?;
        Ok(PeerConfig {
            peer: filter.peer,
            sources: filter.sources,
        })
    }
}

/// Filesystem-backed store of all configs.
pub struct ConfigTree {
    root: Utf8PathBuf,
}

impl ConfigTree {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        ConfigTree { root: root.into() }
    }

    pub fn config_dir(&self, name: &str) -> Utf8PathBuf {
        self.root.join(normalize_config_name(name))
    }

    /// Durable state directory of one source, also used for its change
    /// tracking and admin nodes.
    pub fn source_dir(&self, config: &str, source: &str) -> Utf8PathBuf {
        self.config_dir(config).join(SOURCES_DIR).join(source)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.config_dir(name).join(CONFIG_NODE).exists()
    }

    /// All config names, sorted.
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = self.root.read_dir_utf8() else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(CONFIG_NODE).exists())
            .map(|e| e.file_name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn load(&self, name: &str) -> Result<PeerConfig, ApiError> {
        if !self.exists(name) {
            return Err(ApiError::NoSuchConfig(name.to_string()));
        }
        let dir = self.config_dir(name);
        let node = KvNode::load(dir.join(CONFIG_NODE))
            .map_err(|e| ApiError::Internal(e.into()))?;
        let mut config = PeerConfig {
            peer: node.entries().clone(),
            sources: BTreeMap::new(),
        };

        let sources_dir = dir.join(SOURCES_DIR);
        if let Ok(entries) = sources_dir.read_dir_utf8() {
            for entry in entries.filter_map(|e| e.ok()) {
                let source_node = entry.path().join(CONFIG_NODE);
                if source_node.exists() {
                    let node = KvNode::load(source_node)
                        .map_err(|e| ApiError::Internal(e.into()))?;
                    config
                        .sources
                        .insert(entry.file_name().to_string(), node.entries().clone());
                }
            }
        }
        Ok(config)
    }

    pub fn save(&self, name: &str, config: &PeerConfig) -> Result<(), ApiError> {
        let dir = self.config_dir(name);
        let mut node = KvNode::new(dir.join(CONFIG_NODE));
        node.replace(config.peer.clone());
        node.save().map_err(|e| ApiError::Internal(e.into()))?;

        for (source, entries) in &config.sources {
            let mut node = KvNode::new(dir.join(SOURCES_DIR).join(source).join(CONFIG_NODE));
            node.replace(entries.clone());
            node.save().map_err(|e| ApiError::Internal(e.into()))?;
        }

        // drop source dirs that are no longer configured
        let sources_dir = dir.join(SOURCES_DIR);
        if let Ok(entries) = sources_dir.read_dir_utf8() {
            for entry in entries.filter_map(|e| e.ok()) {
                if !config.sources.contains_key(entry.file_name()) {
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Delete the whole config including its state and reports.
    pub fn remove(&self, name: &str) -> Result<(), ApiError> {
        let dir = self.config_dir(name);
        if !dir.exists() {
            return Err(ApiError::NoSuchConfig(name.to_string()));
        }
        std::fs::remove_dir_all(&dir)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    pub fn reports_dir(&self, name: &str) -> Utf8PathBuf {
        self.config_dir(name).join(REPORTS_DIR)
    }

    pub fn save_report(&self, name: &str, report: &SyncReport) -> Result<(), ApiError> {
        let dir = self.reports_dir(name);
        std::fs::create_dir_all(&dir).map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
        // zero-padded start time sorts chronologically by file name
        let path = dir.join(format!("{:020}.json", report.start));
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
        std::fs::write(path, json).map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    /// Reports newest-first, skipping `start`, at most `count` (0 = all).
    pub fn load_reports(
        &self,
        name: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<SyncReport>, ApiError> {
        let dir = self.reports_dir(name);
        let mut files: Vec<Utf8PathBuf> = match dir.read_dir_utf8() {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path().to_path_buf())
                .filter(|p| p.extension() == Some("json"))
                .collect(),
            Err(_) => return Ok(Vec::new()),
        };
        files.sort();
        files.reverse();

        let mut reports = Vec::new();
        for path in files.into_iter().skip(start as usize) {
            if count != 0 && reports.len() >= count as usize {
                break;
            }
            let data =
                std::fs::read(&path).map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
            match serde_json::from_slice(&data) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(%path, "skipping unreadable report: {e}"),
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_resolves_aliases() {
        assert_eq!(normalize_config_name("MyPhone"), "myphone");
        assert_eq!(normalize_config_name("myphone@default"), "myphone");
        assert_eq!(normalize_config_name("work@corp"), "work@corp");
    }

    #[test]
    fn unknown_property_is_rejected() {
        let mut dict = ConfigDict::new();
        dict.entry(String::new())
            .or_default()
            .insert("frobnicate".into(), "yes".into());
        let err = ConfigFilter::from_dict(&dict).unwrap_err();
        assert!(matches!(err, ApiError::InvalidCall(_)));
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let mut dict = ConfigDict::new();
        dict.entry(String::new())
            .or_default()
            .insert("autoSyncInterval".into(), "soon".into());
        assert!(ConfigFilter::from_dict(&dict).is_err());

        let mut dict = ConfigDict::new();
        dict.entry("source/addressbook".to_string())
            .or_default()
            .insert("sync".into(), "sideways".into());
        assert!(ConfigFilter::from_dict(&dict).is_err());
    }

    #[test]
    fn auto_sync_accepts_documented_values() {
        for v in ["1", "0", "true", "false", "t", "f", "http", "obex-bt", "http,obex-bt"] {
            assert!(auto_sync_value(v).is_ok(), "{v}");
        }
        assert!(auto_sync_value("carrier-pigeon").is_err());
    }

    #[test]
    fn save_load_remove_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let tree = ConfigTree::new(dir.path().to_path_buf());

        let mut config = PeerConfig::default();
        config.peer.insert("syncURL".into(), "http://peer/sync".into());
        config
            .sources
            .entry("addressbook".into())
            .or_default()
            .insert("sync".into(), "two-way".into());
        tree.save("MyPhone", &config).unwrap();

        assert!(tree.exists("myphone"));
        assert_eq!(tree.names(), vec!["myphone".to_string()]);

        let loaded = tree.load("MyPhone@default").unwrap();
        assert_eq!(loaded.sync_urls(), vec!["http://peer/sync".to_string()]);
        assert_eq!(loaded.sources["addressbook"]["sync"], "two-way");

        tree.remove("myphone").unwrap();
        assert!(!tree.exists("myphone"));
        assert!(matches!(
            tree.load("myphone"),
            Err(ApiError::NoSuchConfig(_))
        ));
    }

    #[test]
    fn reports_come_back_newest_first() {
        let dir = camino_tempfile::tempdir().unwrap();
        let tree = ConfigTree::new(dir.path().to_path_buf());
        tree.save("peer", &PeerConfig::default()).unwrap();

        for start in [100u64, 300, 200] {
            let report = SyncReport {
                start,
                end: start + 10,
                status: 200,
                ..Default::default()
            };
            tree.save_report("peer", &report).unwrap();
        }

        let reports = tree.load_reports("peer", 0, 0).unwrap();
        let starts: Vec<u64> = reports.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![300, 200, 100]);

        let paged = tree.load_reports("peer", 1, 1).unwrap();
        assert_eq!(paged[0].start, 200);
    }

    #[test]
    fn filter_merge_is_update_semantics() {
        let mut base = ConfigFilter::default();
        base.peer.insert("syncURL".into(), "http://old".into());
        base.peer.insert("PeerName".into(), "Old Phone".into());

        let mut update = ConfigFilter::default();
        update.peer.insert("syncURL".into(), "http://new".into());
        base.merge(update);

        assert_eq!(base.peer["syncURL"], "http://new");
        assert_eq!(base.peer["PeerName"], "Old Phone");
    }
}
