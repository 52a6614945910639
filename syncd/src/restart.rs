//! Shutdown-on-upgrade support.
//!
//! The daemon watches every file mapped executable into its address space.
//! When one of them changes on disk (package upgrade), the scheduler stops
//! accepting work and, after a quiescence period, either exits or re-execs
//! itself with the startup environment captured here.

use std::ffi::CString;
use std::sync::{Arc, Weak};

use anyhow::Context;
use camino::Utf8PathBuf;
use notify::Watcher;
use tracing::{debug, warn};

use crate::server::Server;

/// Captured startup environment for a later `execve`. Assumes `argv[0]` is
/// the executable to run.
pub struct Restart {
    argv: Vec<CString>,
    env: Vec<CString>,
}

impl Restart {
    pub fn from_current_process() -> anyhow::Result<Restart> {
        let argv = std::env::args()
            .map(|a| CString::new(a).context("argv contains NUL"))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let env = std::env::vars()
            .map(|(k, v)| CString::new(format!("{k}={v}")).context("environment contains NUL"))
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!argv.is_empty(), "cannot restart without argv[0]");
        Ok(Restart { argv, env })
    }

    /// Replace this process with a fresh copy of itself. Only returns on
    /// failure.
    pub fn exec(&self) -> anyhow::Error {
        match nix::unistd::execve(&self.argv[0], &self.argv, &self.env) {
            Err(errno) => anyhow::anyhow!(
                "restarting {} failed: {errno}",
                self.argv[0].to_string_lossy()
            ),
            Ok(infallible) => match infallible {},
        }
    }
}

/// Files to watch: everything mapped readable and executable, per
/// `/proc/self/maps`.
pub fn mapped_executable_files() -> Vec<Utf8PathBuf> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };
    let mut files: Vec<Utf8PathBuf> = maps
        .lines()
        .filter(|line| line.contains(" r-xp "))
        .filter_map(|line| {
            let path = &line[line.find('/')?..];
            Some(Utf8PathBuf::from(path))
        })
        .collect();
    files.sort();
    files.dedup();
    files
}

/// Start watching the mapped files; modifications flip the server into
/// shutdown mode. The returned watcher must be kept alive.
pub fn watch_mapped_files(server: &Arc<Server>) -> anyhow::Result<notify::RecommendedWatcher> {
    let files = mapped_executable_files();
    let server: Weak<Server> = Arc::downgrade(server);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else { return };
        if matches!(
            event.kind,
            notify::EventKind::Modify(_)
                | notify::EventKind::Create(_)
                | notify::EventKind::Remove(_)
        ) {
            if let Some(server) = server.upgrade() {
                server.file_modified();
            }
        }
    })
    .context("creating file watcher")?;

    for file in &files {
        // individual files may be gone already (deleted libraries); that
        // alone is no reason to skip the watch of the rest
        match watcher.watch(file.as_std_path(), notify::RecursiveMode::NonRecursive) {
            Ok(()) => debug!(%file, "watching for upgrades"),
            Err(e) => warn!(%file, "cannot watch: {e}"),
        }
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_parsing_finds_the_executable() {
        let files = mapped_executable_files();
        // the test binary itself is always mapped executable
        assert!(
            files.iter().any(|f| f.as_str().contains("syncd")
                || f.as_str().contains("deps")
                || f.as_str().ends_with(".so")),
            "{files:?}"
        );
    }

    #[test]
    fn restart_captures_argv() {
        let restart = Restart::from_current_process().unwrap();
        assert!(!restart.argv.is_empty());
    }
}
