//! One logical sync (or administrative operation) against one peer.
//!
//! A session is created queued, becomes *active* when the scheduler grants
//! it the config lock, accepts exactly one operation (sync, restore or
//! command execution) and then runs it to completion. Status and progress
//! are pushed to clients through rate-limited broadcast signals; terminal
//! transitions always flush.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use sync_api::models::{
    ConfigDict, Priority, SessionState, SourceProgress, SourceStatus, SyncMode, SyncReport,
};
use sync_api::{ApiError, SyncStatus};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backend::{BackendRegistry, SourceParams};
use crate::engine::adapter::SourceAdapter;
use crate::engine::loopback::{ClientEngine, EngineControl, ServerEngine, SyncOutcome};
use crate::engine::EngineEvent;
use crate::info_req::{InfoBroker, InfoMap, InfoReqError, DEFAULT_TIMEOUT as INFO_TIMEOUT};
use crate::item_cache::Snapshot;
use crate::progress::ProgressData;
use crate::sync_config::{ConfigFilter, ConfigTree, PeerConfig};
use crate::transport::{ChannelTransport, HttpTransport, TransportAgent};

/// Status signals are collapsed to roughly ten per second.
const STATUS_INTERVAL: Duration = Duration::from_millis(100);
/// Progress signals to roughly twenty per second.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// How long a finished session stays queryable after the last client
/// detached. A policy for late status queries; configurable at the server.
pub const DEFAULT_SESSION_LINGER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOperation {
    Null,
    Sync,
    Restore,
    Cmdline,
}

impl RunOperation {
    fn describe(&self) -> &'static str {
        match self {
            RunOperation::Null => "",
            RunOperation::Sync => "sync",
            RunOperation::Restore => "restore",
            RunOperation::Cmdline => "cmdline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncParams {
    pub mode: String,
    pub source_modes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct RestoreParams {
    dir: Utf8PathBuf,
    before: bool,
    sources: Vec<String>,
}

#[derive(Debug, Clone)]
struct ExecuteParams {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

enum PendingOp {
    Sync(SyncParams),
    Restore(RestoreParams),
    Execute(ExecuteParams),
}

/// `StatusChanged` payload.
#[derive(Debug, Clone)]
pub struct StatusSignal {
    pub status: String,
    pub error: u32,
    pub sources: BTreeMap<String, SourceStatus>,
}

/// `ProgressChanged` payload.
#[derive(Debug, Clone)]
pub struct ProgressSignal {
    pub percent: i32,
    pub sources: BTreeMap<String, SourceProgress>,
}

/// Server-side collaborators a session needs; cloned into each instance so
/// sessions never hold a reference back to the scheduler itself.
#[derive(Clone)]
pub struct SessionServices {
    pub config_tree: Arc<ConfigTree>,
    pub backends: Arc<BackendRegistry>,
    pub info: InfoBroker,
    pub presence: crate::presence::PresenceMonitor,
    /// Change-tracker quiescence for coarse revision backends.
    pub revision_granularity: Duration,
}

struct OpState {
    run_op: RunOperation,
    pending: Option<PendingOp>,
}

struct FilterState {
    filter: ConfigFilter,
    /// Temporary config set through the bus.
    temp_config: bool,
    /// Durable config was modified through this session.
    set_config: bool,
}

struct StatusState {
    error: u32,
    sources: BTreeMap<String, SourceStatus>,
    last_emit: Option<Instant>,
}

struct ProgressState {
    data: ProgressData,
    sources: BTreeMap<String, SourceProgress>,
    last_emit: Option<Instant>,
    last_percent: i32,
}

pub struct Session {
    session_id: String,
    config_name: String,
    peer_device_id: String,
    flags: Vec<String>,
    services: SessionServices,

    priority: Mutex<Priority>,
    state: watch::Sender<SessionState>,
    active: AtomicBool,
    waiting: AtomicBool,
    attach_count: AtomicUsize,
    remote_initiated: AtomicBool,
    server_alerted: AtomicBool,

    /// Initial message of a server-alerted/server-mode session.
    initial_message: Mutex<Option<(Vec<u8>, String)>>,
    /// Error preset by the connection, overwritten when it closes.
    connection_error: Mutex<String>,
    connection_id: Mutex<Option<String>>,

    op: Mutex<OpState>,
    ready: Notify,
    control: EngineControl,
    transport_override: Mutex<Option<Box<dyn TransportAgent>>>,
    filters: Mutex<FilterState>,

    status: Mutex<StatusState>,
    progress: Mutex<ProgressState>,
    status_tx: broadcast::Sender<StatusSignal>,
    progress_tx: broadcast::Sender<ProgressSignal>,
    done_tx: broadcast::Sender<SyncStatus>,
    sync_started_tx: broadcast::Sender<()>,

    #[allow(clippy::type_complexity)]
    on_activate: Mutex<Vec<Box<dyn FnOnce(&Arc<Session>) + Send>>>,
}

impl Session {
    pub fn create(
        services: SessionServices,
        peer_device_id: &str,
        config_name: &str,
        session_id: &str,
        flags: Vec<String>,
    ) -> Arc<Session> {
        let (state, _) = watch::channel(SessionState::Queued);
        let (status_tx, _) = broadcast::channel(128);
        let (progress_tx, _) = broadcast::channel(128);
        let (done_tx, _) = broadcast::channel(16);
        let (sync_started_tx, _) = broadcast::channel(16);
        Arc::new(Session {
            session_id: session_id.to_string(),
            config_name: crate::sync_config::normalize_config_name(config_name),
            peer_device_id: peer_device_id.to_string(),
            flags,
            services,
            priority: Mutex::new(Priority::DEFAULT),
            state,
            active: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            attach_count: AtomicUsize::new(0),
            remote_initiated: AtomicBool::new(false),
            server_alerted: AtomicBool::new(false),
            initial_message: Mutex::new(None),
            connection_error: Mutex::new(String::new()),
            connection_id: Mutex::new(None),
            op: Mutex::new(OpState {
                run_op: RunOperation::Null,
                pending: None,
            }),
            ready: Notify::new(),
            control: EngineControl::new(),
            transport_override: Mutex::new(None),
            filters: Mutex::new(FilterState {
                filter: ConfigFilter::default(),
                temp_config: false,
                set_config: false,
            }),
            status: Mutex::new(StatusState {
                error: 0,
                sources: BTreeMap::new(),
                last_emit: None,
            }),
            progress: Mutex::new(ProgressState {
                data: ProgressData::new(),
                sources: BTreeMap::new(),
                last_emit: None,
                last_percent: 0,
            }),
            status_tx,
            progress_tx,
            done_tx,
            sync_started_tx,
            on_activate: Mutex::new(Vec::new()),
        })
    }

    // ---- identity and simple accessors, always allowed

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn peer_device_id(&self) -> &str {
        &self.peer_device_id
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock().unwrap()
    }

    pub fn set_priority(&self, priority: Priority) {
        *self.priority.lock().unwrap() = priority;
    }

    pub fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.current_state() == SessionState::Done
    }

    pub fn set_remote_initiated(&self, remote: bool) {
        self.remote_initiated.store(remote, Ordering::SeqCst);
    }

    pub fn set_server_alerted(&self, alerted: bool) {
        self.server_alerted.store(alerted, Ordering::SeqCst);
    }

    /// Turn this into a server-mode session fed by a connection.
    pub fn init_server(&self, initial_message: Vec<u8>, message_type: &str) {
        *self.initial_message.lock().unwrap() = Some((initial_message, message_type.to_string()));
    }

    pub fn is_server_mode(&self) -> bool {
        self.initial_message.lock().unwrap().is_some()
    }

    pub fn set_connection(&self, connection_id: &str) {
        *self.connection_id.lock().unwrap() = Some(connection_id.to_string());
        // reset only when the connection shuts down cleanly
        *self.connection_error.lock().unwrap() = "closed prematurely".to_string();
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().unwrap().clone()
    }

    pub fn set_connection_error(&self, error: &str) {
        *self.connection_error.lock().unwrap() = error.to_string();
    }

    /// Use this transport for the next sync instead of deriving one from
    /// the sync URL. Server-mode wiring and tests go through here.
    pub fn inject_transport(&self, transport: Box<dyn TransportAgent>) {
        *self.transport_override.lock().unwrap() = Some(transport);
    }

    // ---- client attachment

    pub fn attach(&self) {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn detach(&self) -> usize {
        let before = self.attach_count.load(Ordering::SeqCst);
        if before == 0 {
            return 0;
        }
        self.attach_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }

    // ---- signals

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusSignal> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressSignal> {
        self.progress_tx.subscribe()
    }

    pub fn subscribe_done(&self) -> broadcast::Receiver<SyncStatus> {
        self.done_tx.subscribe()
    }

    pub fn subscribe_sync_started(&self) -> broadcast::Receiver<()> {
        self.sync_started_tx.subscribe()
    }

    /// Register a hook to run when the scheduler activates this session.
    pub fn on_activate(&self, hook: impl FnOnce(&Arc<Session>) + Send + 'static) {
        self.on_activate.lock().unwrap().push(Box::new(hook));
    }

    /// Called by the scheduler when this session gets the config lock.
    pub fn activate(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_modify(|state| {
            if *state == SessionState::Queued {
                *state = SessionState::Idle;
            }
        });
        let hooks = std::mem::take(&mut *self.on_activate.lock().unwrap());
        for hook in hooks {
            hook(self);
        }
    }

    /// Called by the scheduler when the session gives the lock back.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    // ---- state checks

    fn check_active(&self) -> Result<(), ApiError> {
        if !self.is_active() {
            return Err(ApiError::InvalidCall(
                "session is not active, call not allowed at this time".to_string(),
            ));
        }
        Ok(())
    }

    fn check_no_operation(&self) -> Result<(), ApiError> {
        let op = self.op.lock().unwrap();
        if op.run_op != RunOperation::Null {
            return Err(ApiError::InvalidCall(format!(
                "{} started, cannot start another operation at this time",
                op.run_op.describe()
            )));
        }
        Ok(())
    }

    // ---- configuration

    pub fn get_config(&self) -> Result<ConfigDict, ApiError> {
        self.get_named_config(&self.config_name)
    }

    pub fn get_named_config(&self, name: &str) -> Result<ConfigDict, ApiError> {
        Ok(self.services.config_tree.load(name)?.to_dict())
    }

    /// Reachability of this session's peer right now.
    pub fn check_presence(&self) -> Result<(String, Vec<String>), ApiError> {
        let config = self.services.config_tree.load(&self.config_name)?;
        Ok(self.services.presence.check_presence(&config))
    }

    pub fn set_config(
        self: &Arc<Self>,
        update: bool,
        temporary: bool,
        config: &ConfigDict,
    ) -> Result<(), ApiError> {
        self.set_named_config(&self.config_name.clone(), update, temporary, config)
    }

    pub fn set_named_config(
        self: &Arc<Self>,
        config_name: &str,
        update: bool,
        temporary: bool,
        config: &ConfigDict,
    ) -> Result<(), ApiError> {
        self.check_active()?;
        self.check_no_operation()?;

        let target = crate::sync_config::normalize_config_name(config_name);
        if target != self.config_name {
            let all_configs = self.flags.iter().any(|f| f.eq_ignore_ascii_case("all-configs"));
            if !all_configs {
                return Err(ApiError::InvalidCall(
                    "SetNamedConfig() only allowed in 'all-configs' sessions".to_string(),
                ));
            }
            if temporary {
                return Err(ApiError::InvalidCall(
                    "SetNamedConfig() with temporary config change only supported for the \
                     config named when starting the session"
                        .to_string(),
                ));
            }
        }

        // replacing with nothing deletes the whole config
        if !update && !temporary && config.is_empty() {
            self.services.config_tree.remove(&target)?;
            self.filters.lock().unwrap().set_config = true;
            return Ok(());
        }

        // validation happens before anything is touched
        let filter = ConfigFilter::from_dict(config)?;

        if temporary {
            let mut filters = self.filters.lock().unwrap();
            if update {
                filters.filter.merge(filter);
            } else {
                filters.filter = filter;
            }
            filters.temp_config = true;
        } else {
            let tree = &self.services.config_tree;
            let mut durable = if update {
                tree.load(&target)?
            } else {
                PeerConfig::default()
            };
            durable.apply_filter(&filter);
            if !update {
                // replace semantics: sources not named vanish
                durable.sources.retain(|name, _| filter.sources.contains_key(name));
            }
            tree.save(&target, &durable)?;
            self.filters.lock().unwrap().set_config = true;
        }
        Ok(())
    }

    /// Whether this session changed durable configuration.
    pub fn config_was_modified(&self) -> bool {
        self.filters.lock().unwrap().set_config
    }

    /// Whether a temporary config overlay is in effect for this session.
    pub fn has_temporary_config(&self) -> bool {
        self.filters.lock().unwrap().temp_config
    }

    // ---- operations

    pub fn sync(
        self: &Arc<Self>,
        mode: &str,
        source_modes: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.check_active()?;
        self.check_no_operation()?;

        if !mode.is_empty() {
            mode.parse::<SyncMode>()
                .map_err(|_| ApiError::InvalidCall(format!("unknown sync mode '{mode}'")))?;
        }
        let config = self.services.config_tree.load(&self.config_name)?;

        {
            // referencing a source creates its default status/progress entry
            let mut status = self.status.lock().unwrap();
            let mut progress = self.progress.lock().unwrap();
            for source in config.sources.keys() {
                status.sources.entry(source.clone()).or_default();
                progress.sources.entry(source.clone()).or_default();
            }
        }

        {
            let mut op = self.op.lock().unwrap();
            op.run_op = RunOperation::Sync;
            op.pending = Some(PendingOp::Sync(SyncParams {
                mode: mode.to_string(),
                source_modes,
            }));
        }
        self.fire_status(true);
        self.fire_progress(true);
        self.ready.notify_one();
        Ok(())
    }

    pub fn restore(
        self: &Arc<Self>,
        dir: &str,
        before: bool,
        sources: Vec<String>,
    ) -> Result<(), ApiError> {
        self.check_active()?;
        self.check_no_operation()?;
        {
            let mut op = self.op.lock().unwrap();
            op.run_op = RunOperation::Restore;
            op.pending = Some(PendingOp::Restore(RestoreParams {
                dir: Utf8PathBuf::from(dir),
                before,
                sources,
            }));
        }
        self.fire_status(true);
        self.ready.notify_one();
        Ok(())
    }

    pub fn execute(
        self: &Arc<Self>,
        argv: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.check_active()?;
        self.check_no_operation()?;
        if argv.is_empty() {
            return Err(ApiError::InvalidCall("empty command line".to_string()));
        }
        {
            let mut op = self.op.lock().unwrap();
            op.run_op = RunOperation::Cmdline;
            op.pending = Some(PendingOp::Execute(ExecuteParams {
                argv,
                env,
            }));
        }
        self.fire_status(true);
        self.ready.notify_one();
        Ok(())
    }

    pub fn abort(&self) -> Result<(), ApiError> {
        let op = self.op.lock().unwrap().run_op;
        if op != RunOperation::Sync && op != RunOperation::Cmdline {
            return Err(ApiError::InvalidCall(
                "sync not started, cannot abort at this time".to_string(),
            ));
        }
        self.state.send_modify(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Aborting;
            }
        });
        self.control.request_abort();
        self.fire_status(true);
        Ok(())
    }

    pub fn suspend(&self) -> Result<(), ApiError> {
        let op = self.op.lock().unwrap().run_op;
        if op != RunOperation::Sync && op != RunOperation::Cmdline {
            return Err(ApiError::InvalidCall(
                "sync not started, cannot suspend at this time".to_string(),
            ));
        }
        self.state.send_modify(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Suspending;
            }
        });
        self.control.request_suspend();
        self.fire_status(true);
        Ok(())
    }

    // ---- status / progress

    fn status_string(&self) -> String {
        let base = match self.current_state() {
            SessionState::Queued => "queueing",
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Aborting => "aborting",
            SessionState::Suspending => "suspending",
            SessionState::Done => "done",
        };
        if self.waiting.load(Ordering::SeqCst) {
            format!("{base};waiting")
        } else {
            base.to_string()
        }
    }

    pub fn get_status(&self) -> (String, u32, BTreeMap<String, SourceStatus>) {
        let status = self.status.lock().unwrap();
        (self.status_string(), status.error, status.sources.clone())
    }

    pub fn get_progress(&self) -> (i32, BTreeMap<String, SourceProgress>) {
        let progress = self.progress.lock().unwrap();
        (
            progress.last_percent.max(progress.data.percent()),
            progress.sources.clone(),
        )
    }

    /// Emit `StatusChanged` unless one was emitted too recently;
    /// `flush` forces it out.
    fn fire_status(&self, flush: bool) {
        let signal = {
            let mut status = self.status.lock().unwrap();
            let now = Instant::now();
            if !flush
                && status
                    .last_emit
                    .is_some_and(|last| now - last < STATUS_INTERVAL)
            {
                return;
            }
            status.last_emit = Some(now);
            StatusSignal {
                status: self.status_string(),
                error: status.error,
                sources: status.sources.clone(),
            }
        };
        let _ = self.status_tx.send(signal);
    }

    /// Like `fire_status` for `ProgressChanged`; keeps the reported
    /// percentage monotonic non-decreasing.
    fn fire_progress(&self, flush: bool) {
        let signal = {
            let mut progress = self.progress.lock().unwrap();
            let now = Instant::now();
            if !flush
                && progress
                    .last_emit
                    .is_some_and(|last| now - last < PROGRESS_INTERVAL)
            {
                return;
            }
            progress.last_emit = Some(now);
            let percent = progress.data.percent().max(progress.last_percent);
            progress.last_percent = percent;
            ProgressSignal {
                percent,
                sources: progress.sources.clone(),
            }
        };
        let _ = self.progress_tx.send(signal);
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Step(step) => {
                self.progress.lock().unwrap().data.set_step(step);
                self.fire_progress(false);
            }
            EngineEvent::SendStart => {
                self.progress.lock().unwrap().data.send_start();
                self.fire_progress(false);
            }
            EngineEvent::ReceiveEnd => {
                self.progress.lock().unwrap().data.receive_end();
                self.fire_progress(false);
            }
            EngineEvent::ItemPrepare { source } => {
                {
                    let mut progress = self.progress.lock().unwrap();
                    progress.data.item_prepare();
                    let entry = progress.sources.entry(source).or_default();
                    entry.phase = "preparing".to_string();
                    entry.prepare_count += 1;
                }
                self.fire_progress(false);
            }
            EngineEvent::ItemReceive {
                source,
                count,
                total,
            } => {
                {
                    let mut progress = self.progress.lock().unwrap();
                    progress.data.item_receive(&source, count, total);
                    let entry = progress.sources.entry(source).or_default();
                    entry.phase = "receiving".to_string();
                    entry.receive_count = count;
                    entry.receive_total = total;
                }
                self.fire_progress(false);
            }
            EngineEvent::SourceDone { source, status } => {
                {
                    let mut state = self.status.lock().unwrap();
                    let entry = state.sources.entry(source).or_default();
                    entry.status = "done".to_string();
                    entry.error = status.0;
                }
                self.fire_status(false);
            }
            EngineEvent::Waiting(waiting) => {
                self.waiting.store(waiting, Ordering::SeqCst);
                self.fire_status(false);
            }
            EngineEvent::SyncStarted => {
                {
                    let mut state = self.status.lock().unwrap();
                    for entry in state.sources.values_mut() {
                        entry.status = "running".to_string();
                    }
                }
                let _ = self.sync_started_tx.send(());
                self.fire_status(false);
            }
        }
    }

    /// Wait until an operation was requested. The scheduler calls this on
    /// the active session before invoking [`Session::run`].
    pub async fn wait_ready(&self) {
        loop {
            if self.op.lock().unwrap().pending.is_some() {
                return;
            }
            self.ready.notified().await;
        }
    }

    pub fn has_pending_operation(&self) -> bool {
        self.op.lock().unwrap().pending.is_some()
    }

    // ---- running

    /// Execute the requested operation to completion. Returns the final
    /// status, which is also broadcast through the done signal.
    pub async fn run(self: &Arc<Self>) -> SyncStatus {
        let pending = self.op.lock().unwrap().pending.take();
        let Some(pending) = pending else {
            return SyncStatus::OK;
        };

        self.state.send_replace(SessionState::Running);
        self.fire_status(true);

        let status = match pending {
            PendingOp::Sync(params) => {
                self.run_sync(params)
                    .instrument(info_span!("sync", session_id = %self.session_id, config = %self.config_name))
                    .await
            }
            PendingOp::Restore(params) => {
                self.run_restore(params)
                    .instrument(info_span!("restore", session_id = %self.session_id))
                    .await
            }
            PendingOp::Execute(params) => {
                self.run_execute(params)
                    .instrument(info_span!("execute", session_id = %self.session_id))
                    .await
            }
        };

        {
            let mut state = self.status.lock().unwrap();
            if !status.is_ok() && state.error == 0 {
                state.error = status.0;
            }
        }
        if status.is_ok() {
            self.progress.lock().unwrap().data.done();
        }
        self.state.send_replace(SessionState::Done);
        self.fire_progress(true);
        self.fire_status(true);
        let _ = self.done_tx.send(status);
        info!(session_id = %self.session_id, %status, "session done");
        status
    }

    /// The effective config for this run: durable tree content plus the
    /// session's temporary filter.
    fn effective_config(&self) -> Result<PeerConfig, ApiError> {
        let mut config = self.services.config_tree.load(&self.config_name)?;
        config.apply_filter(&self.filters.lock().unwrap().filter);
        Ok(config)
    }

    fn build_adapters(
        &self,
        config: &PeerConfig,
        params: &SyncParams,
    ) -> Result<Vec<SourceAdapter>, ApiError> {
        let mut adapters = Vec::new();
        for (source_name, props) in &config.sources {
            let mode_str = params
                .source_modes
                .get(source_name)
                .cloned()
                .or_else(|| {
                    (!params.mode.is_empty()).then(|| params.mode.clone())
                })
                .or_else(|| props.get("sync").cloned())
                .unwrap_or_else(|| "two-way".to_string());
            let mode: SyncMode = mode_str
                .parse()
                .map_err(|_| ApiError::InvalidCall(format!("unknown sync mode '{mode_str}'")))?;
            if mode == SyncMode::Disabled {
                debug!(source = %source_name, "source disabled, skipping");
                continue;
            }

            let default_type = "memory:text/vcard:3.0".to_string();
            let type_prop = props.get("type").unwrap_or(&default_type);
            let uri = props.get("uri").map(|s| s.as_str()).unwrap_or("");
            let source_params = SourceParams::from_type_property(source_name, type_prop, uri);
            let backend = self
                .services
                .backends
                .create(&source_params)
                .map_err(|e| ApiError::NoSuchSource {
                    config: self.config_name.clone(),
                    source_name: format!("{source_name}: {e}"),
                })?;
            let dir = self
                .services
                .config_tree
                .source_dir(&self.config_name, source_name);
            let adapter = SourceAdapter::open(
                source_name,
                backend,
                &dir,
                mode,
                self.services.revision_granularity,
            )
            .map_err(ApiError::Internal)?;

            {
                let mut status = self.status.lock().unwrap();
                let entry = status.sources.entry(source_name.clone()).or_default();
                entry.mode = mode.to_string();
                entry.status = "running".to_string();
            }
            self.progress.lock().unwrap().data.add_sync_mode(mode);
            adapters.push(adapter);
        }
        Ok(adapters)
    }

    fn pick_transport(
        &self,
        config: &PeerConfig,
    ) -> Result<Box<dyn TransportAgent>, SyncStatus> {
        if let Some(transport) = self.transport_override.lock().unwrap().take() {
            return Ok(transport);
        }
        for url in config.sync_urls() {
            if url.starts_with("http") {
                let mut transport = Box::new(HttpTransport::new());
                transport.set_url(&url);
                let retry = config.retry_duration();
                if !retry.is_zero() {
                    transport.set_timeout(retry);
                }
                return Ok(transport);
            }
        }
        warn!(config = %self.config_name, "no usable sync URL");
        Err(SyncStatus::TRANSPORT_FAILURE)
    }

    /// Ask the user for a password through the scheduler's info-request
    /// broker.
    pub async fn request_password(
        &self,
        description: &str,
        key: InfoMap,
    ) -> Result<String, SyncStatus> {
        let mut parameters = key;
        parameters.insert("description".to_string(), description.to_string());
        let handle = self
            .services
            .info
            .create("password", parameters, &self.session_id);
        let id = handle.id.clone();
        match handle.wait(INFO_TIMEOUT).await {
            Ok(response) => Ok(response.get("password").cloned().unwrap_or_default()),
            Err(InfoReqError::Timeout) => {
                self.services.info.remove(&id);
                warn!("password request timed out");
                Err(SyncStatus::PASSWORD_TIMEOUT)
            }
            Err(InfoReqError::Cancelled) => Err(SyncStatus::USER_ABORT),
        }
    }

    async fn run_sync(self: &Arc<Self>, params: SyncParams) -> SyncStatus {
        let started = std::time::SystemTime::now();

        let mut config = match self.effective_config() {
            Ok(config) => config,
            Err(err) => {
                warn!("cannot load config: {err}");
                return err.status();
            }
        };

        // a configured username without a stored password has to be asked
        // for before the transport is opened
        let username = config.get("username").unwrap_or("").to_string();
        if !username.is_empty() && config.get("password").unwrap_or("").is_empty() {
            let mut key = InfoMap::new();
            key.insert("username".to_string(), username);
            key.insert("config".to_string(), self.config_name.clone());
            match self.request_password("peer credentials", key).await {
                Ok(password) => {
                    config.peer.insert("password".to_string(), password);
                }
                Err(status) => return status,
            }
        }

        let mut adapters = match self.build_adapters(&config, &params) {
            Ok(adapters) => adapters,
            Err(err) => {
                warn!("cannot set up sources: {err}");
                return err.status();
            }
        };
        if adapters.is_empty() {
            warn!(config = %self.config_name, "no enabled sources");
            return SyncStatus::COMMAND_NOT_ALLOWED;
        }

        let outcome;
        if self.is_server_mode() {
            outcome = self.run_sync_server(adapters).await;
        } else {
            let mut transport = match self.pick_transport(&config) {
                Ok(transport) => transport,
                Err(status) => return status,
            };

            let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
            let device_id = config
                .get("deviceId")
                .filter(|s| !s.is_empty())
                .unwrap_or("syncd-client")
                .to_string();
            let mut engine = ClientEngine::new(
                &self.session_id,
                &device_id,
                self.control.clone(),
                events_tx,
            );

            outcome = {
                let run = engine.run(&mut adapters, transport.as_mut());
                let mut run = std::pin::pin!(run);
                loop {
                    tokio::select! {
                        outcome = &mut run => break outcome,
                        Some(event) = events_rx.recv() => self.handle_engine_event(event),
                    }
                }
            };
            while let Ok(event) = events_rx.try_recv() {
                self.handle_engine_event(event);
            }
            transport.shutdown().await;

            for adapter in &mut adapters {
                if let Err(e) = adapter.close() {
                    warn!(source = %adapter.name(), "closing backend failed: {e}");
                }
            }
        }

        // final per-source status and the durable report
        {
            let mut status = self.status.lock().unwrap();
            for (name, report) in &outcome.per_source {
                let entry = status.sources.entry(name.clone()).or_default();
                entry.status = "done".to_string();
                entry.error = report.status;
            }
        }
        let ended = std::time::SystemTime::now();
        let epoch = |t: std::time::SystemTime| {
            t.duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        };
        let report = SyncReport {
            start: epoch(started),
            end: epoch(ended),
            status: outcome.status.0,
            peer_name: config.peer_name().to_string(),
            sources: outcome.per_source.clone(),
        };
        if let Err(e) = self.services.config_tree.save_report(&self.config_name, &report) {
            warn!("cannot save sync report: {e}");
        }

        outcome.status
    }

    /// Server mode: the engine answers the messages a connection feeds us.
    async fn run_sync_server(self: &Arc<Self>, adapters: Vec<SourceAdapter>) -> SyncOutcome {
        let Some((initial, _type)) = self.initial_message.lock().unwrap().take() else {
            return SyncOutcome {
                status: SyncStatus::FATAL,
                per_source: BTreeMap::new(),
                resume_token: None,
            };
        };
        let Some(transport) = self.transport_override.lock().unwrap().take() else {
            warn!("server-mode session without connection transport");
            return SyncOutcome {
                status: SyncStatus::TRANSPORT_FAILURE,
                per_source: BTreeMap::new(),
                resume_token: None,
            };
        };
        let mut transport = transport;
        let mut engine = ServerEngine::new(&self.session_id, adapters);

        let mut message = initial;
        let status = loop {
            if self.control.aborted() {
                break SyncStatus::USER_ABORT;
            }
            let reply = match engine.process_bytes(&message) {
                Ok(reply) => reply,
                Err(status) => break status,
            };
            if transport.send(reply.encode()).is_err() {
                break SyncStatus::TRANSPORT_FAILURE;
            }
            if engine.is_done() {
                break SyncStatus::OK;
            }
            self.waiting.store(true, Ordering::SeqCst);
            self.fire_status(false);
            let abort = self.control.abort_token();
            let result = tokio::select! {
                _ = abort.cancelled() => {
                    self.waiting.store(false, Ordering::SeqCst);
                    break SyncStatus::USER_ABORT;
                }
                result = transport.wait(true) => result,
            };
            self.waiting.store(false, Ordering::SeqCst);
            match result {
                crate::transport::WaitResult::GotReply => {
                    let Some((data, _)) = transport.get_reply() else {
                        break SyncStatus::TRANSPORT_FAILURE;
                    };
                    message = data;
                }
                crate::transport::WaitResult::Active => continue,
                _ => {
                    let preset = self.connection_error.lock().unwrap().clone();
                    warn!(error = %preset, "connection went away mid-session");
                    break SyncStatus::TRANSPORT_FAILURE;
                }
            }
        };

        let mut per_source = BTreeMap::new();
        for mut adapter in engine.into_adapters() {
            let mut report = sync_api::models::SourceReport::default();
            report.mode = adapter.sync_mode().to_string();
            report.status = status.0;
            per_source.insert(adapter.name().to_string(), report);
            if let Err(e) = adapter.close() {
                warn!(source = %adapter.name(), "closing backend failed: {e}");
            }
        }
        SyncOutcome {
            status,
            per_source,
            resume_token: None,
        }
    }

    async fn run_restore(self: &Arc<Self>, params: RestoreParams) -> SyncStatus {
        let config = match self.effective_config() {
            Ok(config) => config,
            Err(err) => return err.status(),
        };

        let selected: Vec<String> = if params.sources.is_empty() {
            config.sources.keys().cloned().collect()
        } else {
            params.sources.clone()
        };

        let total = selected.len() as i32;
        for (index, source_name) in selected.iter().enumerate() {
            let Some(props) = config.sources.get(source_name) else {
                warn!(source = %source_name, "not configured, skipping restore");
                return SyncStatus::NOT_FOUND;
            };
            let default_type = "memory:text/vcard:3.0".to_string();
            let type_prop = props.get("type").unwrap_or(&default_type);
            let uri = props.get("uri").map(|s| s.as_str()).unwrap_or("");
            let source_params = SourceParams::from_type_property(source_name, type_prop, uri);
            let mut backend = match self.services.backends.create(&source_params) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(source = %source_name, "cannot create backend: {e}");
                    return SyncStatus::DATASTORE_FAILURE;
                }
            };
            if backend.open().is_err() {
                return SyncStatus::DATASTORE_FAILURE;
            }

            let which = if params.before { "before" } else { "after" };
            let snapshot_dir = params.dir.join(source_name).join(which);
            let result = Snapshot::open(&snapshot_dir)
                .and_then(|snapshot| snapshot.restore(source_name, backend.as_mut(), false));
            let _ = backend.close();
            match result {
                Ok(report) => {
                    debug!(
                        source = %source_name,
                        added = report.added,
                        updated = report.updated,
                        deleted = report.deleted,
                        "restore complete"
                    );
                    let mut progress = self.progress.lock().unwrap();
                    progress.last_percent =
                        (100 * (index as i32 + 1) / total.max(1)).clamp(0, 100);
                    drop(progress);
                    self.fire_progress(true);
                }
                Err(e) => {
                    warn!(source = %source_name, "restore failed: {e}");
                    return SyncStatus::DATASTORE_FAILURE;
                }
            }
        }
        SyncStatus::OK
    }

    async fn run_execute(self: &Arc<Self>, params: ExecuteParams) -> SyncStatus {
        let mut command = tokio::process::Command::new(&params.argv[0]);
        command.args(&params.argv[1..]);
        command.envs(params.env.iter());
        let abort = self.control.abort_token();
        let status = command.status();
        let mut status = std::pin::pin!(status);
        tokio::select! {
            _ = abort.cancelled() => SyncStatus::USER_ABORT,
            result = &mut status => match result {
                Ok(exit) if exit.success() => SyncStatus::OK,
                Ok(exit) => {
                    warn!(?exit, argv = ?params.argv, "command failed");
                    SyncStatus::FATAL
                }
                Err(e) => {
                    warn!(argv = ?params.argv, "cannot run command: {e}");
                    SyncStatus::FATAL
                }
            }
        }
    }

    /// Server-mode helper: a paired transport endpoint for the connection
    /// side, with the session's endpoint installed as override.
    pub fn connect_channel_transport(&self) -> ChannelTransport {
        let (session_end, connection_end) = ChannelTransport::pair();
        self.inject_transport(Box::new(session_end));
        connection_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackPeer;

    fn services(dir: &camino::Utf8Path) -> SessionServices {
        SessionServices {
            config_tree: Arc::new(ConfigTree::new(dir.join("configs"))),
            backends: Arc::new(BackendRegistry::default()),
            info: InfoBroker::default(),
            presence: crate::presence::PresenceMonitor::new(),
            revision_granularity: Duration::ZERO,
        }
    }

    fn seed_config(services: &SessionServices, name: &str) {
        let mut config = PeerConfig::default();
        config
            .peer
            .insert("syncURL".into(), "http://peer/sync".into());
        let source = config.sources.entry("addressbook".into()).or_default();
        source.insert("sync".into(), "two-way".into());
        source.insert("type".into(), "memory:text/vcard:3.0".into());
        // unique store per test run
        source.insert(
            "uri".into(),
            format!("{}-{name}", services.config_tree.config_dir("").as_str()),
        );
        services.config_tree.save(name, &config).unwrap();
    }

    #[tokio::test]
    async fn operations_require_active_session() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");
        let session = Session::create(services, "", "peer", "1", vec![]);

        let err = session.sync("", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ApiError::InvalidCall(_)));
        let err = session
            .set_config(true, true, &ConfigDict::new())
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCall(_)));

        session.activate();
        assert_eq!(session.current_state(), SessionState::Idle);
        session.sync("", BTreeMap::new()).unwrap();
        // a second operation on the same session is rejected
        let err = session.sync("", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ApiError::InvalidCall(_)));
    }

    #[tokio::test]
    async fn abort_requires_running_operation() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");
        let session = Session::create(services, "", "peer", "1", vec![]);
        session.activate();
        assert!(session.abort().is_err());
        assert!(session.suspend().is_err());
    }

    #[tokio::test]
    async fn temporary_empty_update_is_a_noop() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");
        let session = Session::create(services.clone(), "", "peer", "1", vec![]);
        session.activate();

        session.set_config(true, true, &ConfigDict::new()).unwrap();
        assert!(!session.config_was_modified());
        // the durable config is untouched
        assert!(services.config_tree.exists("peer"));
        let config = services.config_tree.load("peer").unwrap();
        assert_eq!(config.sync_urls(), vec!["http://peer/sync".to_string()]);
    }

    #[tokio::test]
    async fn replace_with_empty_config_deletes_it() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");
        let session = Session::create(services.clone(), "", "peer", "1", vec![]);
        session.activate();

        session.set_config(false, false, &ConfigDict::new()).unwrap();
        assert!(session.config_was_modified());
        assert!(!services.config_tree.exists("peer"));
    }

    #[tokio::test]
    async fn set_named_config_needs_all_configs_flag() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");
        seed_config(&services, "other");
        let session = Session::create(services.clone(), "", "peer", "1", vec![]);
        session.activate();
        assert!(session
            .set_named_config("other", true, false, &ConfigDict::new())
            .is_err());

        let session = Session::create(
            services,
            "",
            "peer",
            "2",
            vec!["all-configs".to_string()],
        );
        session.activate();
        let mut dict = ConfigDict::new();
        dict.entry(String::new())
            .or_default()
            .insert("PeerName".into(), "Other".into());
        session
            .set_named_config("other", true, false, &dict)
            .unwrap();
    }

    #[tokio::test]
    async fn sync_against_loopback_peer_reaches_done() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");

        // put one contact into the local store the memory backend will
        // freshly create; seeding through the registry keeps it shared
        let session = Session::create(services.clone(), "", "peer", "1", vec![]);
        session.activate();

        let peer = LoopbackPeer::new(&dir.path().join("peer-state"), &["addressbook"]);
        let (session_end, peer_end) = ChannelTransport::pair();
        session.inject_transport(Box::new(session_end));
        let server = tokio::spawn(peer.serve(peer_end));

        let mut progress_rx = session.subscribe_progress();
        let mut status_rx = session.subscribe_status();

        session.sync("slow", BTreeMap::new()).unwrap();
        let status = session.run().await;
        assert_eq!(status, SyncStatus::OK);
        assert_eq!(session.current_state(), SessionState::Done);

        // progress was monotonic and ended at 100
        let mut last = 0;
        let mut saw_hundred = false;
        while let Ok(signal) = progress_rx.try_recv() {
            assert!(signal.percent >= last, "progress went backwards");
            last = signal.percent;
            saw_hundred = signal.percent == 100;
        }
        assert!(saw_hundred);

        // the final status signal is flushed and carries "done"
        let mut final_status = None;
        while let Ok(signal) = status_rx.try_recv() {
            final_status = Some(signal);
        }
        assert_eq!(final_status.unwrap().status, "done");

        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_password_times_out() {
        let dir = camino_tempfile::tempdir().unwrap();
        let services = services(dir.path());
        seed_config(&services, "peer");
        // a username without password forces an info request
        let mut config = services.config_tree.load("peer").unwrap();
        config.peer.insert("username".into(), "user".into());
        services.config_tree.save("peer", &config).unwrap();

        let session = Session::create(services, "", "peer", "1", vec![]);
        session.activate();
        session.sync("slow", BTreeMap::new()).unwrap();
        let status = session.run().await;
        assert_eq!(status, SyncStatus::PASSWORD_TIMEOUT);
    }
}
