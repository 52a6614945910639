//! Main entry point for the sync daemon executable.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, Command};
use tracing::{error, info, warn};

use syncd::backend::BackendRegistry;
use syncd::bus::Bus;
use syncd::config::{SyncdConf, CONFIG_FILE_NAME};
use syncd::restart::{watch_mapped_files, Restart};
use syncd::server::{RunOutcome, Server};
use syncd::sync_config::ConfigTree;
use utils::logging;

fn main() -> anyhow::Result<()> {
    // capture the startup environment before anything mutates it, so a
    // binary upgrade can re-exec us exactly as we were started
    let restart = Restart::from_current_process()?;

    let arg_matches = cli().get_matches();

    let workdir = arg_matches
        .get_one::<String>("workdir")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| Utf8PathBuf::from(".syncd"));
    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("Error creating workdir '{workdir}'"))?;
    let workdir = workdir
        .canonicalize_utf8()
        .with_context(|| format!("Error opening workdir '{workdir}'"))?;

    let cfg_file_path = workdir.join(CONFIG_FILE_NAME);
    let conf = if cfg_file_path.is_file() {
        let contents = std::fs::read_to_string(&cfg_file_path)
            .with_context(|| format!("Failed to read config at '{cfg_file_path}'"))?;
        let document = contents
            .parse::<toml_edit::Document>()
            .with_context(|| format!("Failed to parse config at '{cfg_file_path}'"))?;
        SyncdConf::parse(&workdir, &document)?
    } else {
        SyncdConf::dummy(&workdir)
    };

    // logging must be up before the panic hook below; every line is also
    // forwarded to attached clients through the scheduler
    logging::init_with_forward(
        conf.log_format,
        logging::Output::Stdout,
        Some(Box::new(syncd::server::forward_log)),
    )?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    info!(version = env!("CARGO_PKG_VERSION"), %workdir, "starting syncd");

    // single-threaded cooperative core: all components share one runtime
    // thread, parallelism comes from helper processes only
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let outcome = runtime.block_on(run_server(&conf))?;

    match outcome {
        RunOutcome::Exit => {
            info!("shutdown complete");
            Ok(())
        }
        RunOutcome::Restart => {
            info!("restarting because files loaded into memory were modified on disk");
            // never returns on success
            Err(restart.exec())
        }
    }
}

async fn run_server(conf: &SyncdConf) -> anyhow::Result<RunOutcome> {
    let tree = Arc::new(ConfigTree::new(conf.configs_path()));
    let backends = Arc::new(BackendRegistry::default());
    let server = Server::new(conf.server_options(), tree, backends);

    // shutdown-on-upgrade: watch the binaries this process runs from
    let _watcher = match watch_mapped_files(&server) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("upgrade watching disabled: {e}");
            None
        }
    };

    // SIGINT/SIGTERM wind the scheduler down cleanly
    {
        let server = server.clone();
        tokio::spawn(async move {
            let interrupted = async {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
                let mut int =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                std::io::Result::Ok(())
            };
            match interrupted.await {
                Ok(()) => {
                    info!("received termination signal");
                    server.request_shutdown();
                }
                Err(e) => error!("cannot listen for signals: {e}"),
            }
        });
    }

    // the bus facade is what an IPC front end would bind to; constructing
    // it here keeps the daemon usable in-process as well
    let bus = Bus::new(server.clone());

    let outcome = bus.server().run().await;
    Ok(outcome)
}

fn cli() -> Command {
    Command::new("syncd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("PIM synchronization daemon")
        .arg(
            Arg::new("workdir")
                .short('D')
                .long("workdir")
                .help("Working directory with configs and per-peer state"),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .action(ArgAction::SetTrue)
                .help("Accepted for compatibility; the process always runs in the foreground"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses() {
        cli().debug_assert();
        let matches = cli().get_matches_from(["syncd", "--workdir", "/tmp/x"]);
        assert_eq!(matches.get_one::<String>("workdir").unwrap(), "/tmp/x");
    }
}
