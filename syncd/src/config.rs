//! Daemon-level configuration.
//!
//! Read from `syncd.toml` in the workdir, supplemented by CLI arguments.
//! This is about how the daemon itself behaves; peer configurations live in
//! the config tree (see [`crate::sync_config`]).

use std::time::Duration;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use toml_edit::{Document, Item};
use utils::logging::LogFormat;

use crate::server::ServerOptions;

pub mod defaults {
    pub const DEFAULT_LOG_FORMAT: &str = "plain";
    pub const DEFAULT_SESSION_LINGER: &str = "60 s";
    pub const DEFAULT_SHUTDOWN_QUIESCENCE: &str = "10 s";
    pub const DEFAULT_REVISION_GRANULARITY: &str = "1 s";
}

pub const CONFIG_FILE_NAME: &str = "syncd.toml";

#[derive(Debug, Clone)]
pub struct SyncdConf {
    pub workdir: Utf8PathBuf,
    pub log_format: LogFormat,
    /// How long finished sessions stay queryable.
    pub session_linger: Duration,
    /// Quiescence after binary modifications before exit/re-exec.
    pub shutdown_quiescence: Duration,
    /// Terminate after this much idle time; absent = run forever.
    pub auto_term: Option<Duration>,
    /// Change-tracker quiescence for coarse revision backends.
    pub revision_granularity: Duration,
}

impl SyncdConf {
    pub fn dummy(workdir: &Utf8Path) -> Self {
        SyncdConf {
            workdir: workdir.to_path_buf(),
            log_format: LogFormat::Plain,
            session_linger: humantime::parse_duration(defaults::DEFAULT_SESSION_LINGER).unwrap(),
            shutdown_quiescence: humantime::parse_duration(defaults::DEFAULT_SHUTDOWN_QUIESCENCE)
                .unwrap(),
            auto_term: None,
            revision_granularity: humantime::parse_duration(
                defaults::DEFAULT_REVISION_GRANULARITY,
            )
            .unwrap(),
        }
    }

    /// Parse a config document; unknown keys are rejected so typos do not
    /// silently change behavior.
    pub fn parse(workdir: &Utf8Path, document: &Document) -> anyhow::Result<Self> {
        let mut conf = SyncdConf::dummy(workdir);

        for (key, item) in document.iter() {
            match key {
                "log_format" => {
                    conf.log_format = LogFormat::from_config(parse_str(key, item)?)?;
                }
                "session_linger" => {
                    conf.session_linger = parse_duration(key, item)?;
                }
                "shutdown_quiescence" => {
                    conf.shutdown_quiescence = parse_duration(key, item)?;
                }
                "auto_term" => {
                    conf.auto_term = Some(parse_duration(key, item)?);
                }
                "revision_granularity" => {
                    conf.revision_granularity = parse_duration(key, item)?;
                }
                _ => bail!("unrecognized syncd option '{key}'"),
            }
        }
        Ok(conf)
    }

    pub fn configs_path(&self) -> Utf8PathBuf {
        self.workdir.join("configs")
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            session_linger: self.session_linger,
            shutdown_quiescence: self.shutdown_quiescence,
            auto_term: self.auto_term,
            revision_granularity: self.revision_granularity,
        }
    }
}

fn parse_str<'a>(key: &str, item: &'a Item) -> anyhow::Result<&'a str> {
    item.as_str()
        .with_context(|| format!("option '{key}' must be a string"))
}

fn parse_duration(key: &str, item: &Item) -> anyhow::Result<Duration> {
    humantime::parse_duration(parse_str(key, item)?)
        .with_context(|| format!("option '{key}' must be a duration like '60 s'"))
}
