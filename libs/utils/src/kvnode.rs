//! Flat key/value node files.
//!
//! One entry per line, `key = value`. Keys and values are escaped so that
//! arbitrary strings (luids, revision tokens) survive the round trip:
//! characters outside the printable ASCII range, plus `=`, `!` and
//! whitespace, are written as `!xx` hex sequences.
//!
//! Writes go through a temp file in the same directory followed by a rename,
//! so a crashed writer leaves either the old or the new content.

use std::collections::BTreeMap;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

pub const TEMP_SUFFIX: &str = ".temp";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("node {path}: malformed line {line}")]
    Malformed { path: Utf8PathBuf, line: usize },
}

fn is_safe(b: u8) -> bool {
    (0x21..=0x7e).contains(&b) && b != b'=' && b != b'!'
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_safe(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("!{b:02x}"));
        }
    }
    out
}

pub fn unescape(s: &str) -> Option<String> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'!' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// An in-memory key/value map bound to a file path.
#[derive(Debug, Clone)]
pub struct KvNode {
    path: Utf8PathBuf,
    entries: BTreeMap<String, String>,
}

impl KvNode {
    /// Bind to `path` without touching the filesystem.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        KvNode {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load an existing node. A missing file yields an empty node, so first
    /// use and reuse look the same to callers.
    pub fn load(path: impl Into<Utf8PathBuf>) -> Result<Self, NodeError> {
        let path = path.into();
        let mut node = KvNode {
            path: path.clone(),
            entries: BTreeMap::new(),
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(node),
            Err(e) => return Err(NodeError::Io { path, source: e }),
        };
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(" = ").ok_or(NodeError::Malformed {
                path: path.clone(),
                line: lineno + 1,
            })?;
            let key = unescape(key).ok_or(NodeError::Malformed {
                path: path.clone(),
                line: lineno + 1,
            })?;
            let value = unescape(value).ok_or(NodeError::Malformed {
                path: path.clone(),
                line: lineno + 1,
            })?;
            node.entries.insert(key, value);
        }
        Ok(node)
    }

    /// Write atomically: temp file next to the target, then rename.
    pub fn save(&self) -> Result<(), NodeError> {
        let io = |source| NodeError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{}{TEMP_SUFFIX}", self.path));
        {
            let mut f = std::fs::File::create(&tmp_path).map_err(io)?;
            for (key, value) in &self.entries {
                writeln!(f, "{} = {}", escape(key), escape(value)).map_err(io)?;
            }
            f.sync_all().map_err(io)?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(io)?;
        Ok(())
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace the whole map.
    pub fn replace(&mut self, entries: BTreeMap<String, String>) {
        self.entries = entries;
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}
