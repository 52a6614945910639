//! The process-wide scheduler.
//!
//! Owns every session and connection, serializes them through a priority
//! queue with at most one active session (the config lock), tracks attached
//! clients, brokers info requests, forwards log output, and decides between
//! exiting and re-exec'ing when the installed binaries change underneath
//! the daemon.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sync_api::models::{ConfigDict, Database, SyncReport, CAPABILITIES};
use sync_api::ApiError;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::auto_sync::AutoSyncManager;
use crate::backend::{BackendRegistry, SourceParams};
use crate::connection::{Connection, ConnectionHost};
use crate::info_req::{InfoBroker, InfoMap};
use crate::metrics::SESSION_EVENTS;
use crate::presence::PresenceMonitor;
use crate::session::{Session, SessionServices, DEFAULT_SESSION_LINGER};
use crate::sync_config::{normalize_config_name, ConfigTree, PeerConfig};

/// Quiescence after the last binary modification before shutdown/restart.
pub const SHUTDOWN_QUIESCENCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// How long finished sessions stay queryable.
    pub session_linger: Duration,
    pub shutdown_quiescence: Duration,
    /// Exit after this much idle time; `None` keeps the daemon running.
    pub auto_term: Option<Duration>,
    /// Quiescence window of the per-source change trackers.
    pub revision_granularity: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            session_linger: DEFAULT_SESSION_LINGER,
            shutdown_quiescence: SHUTDOWN_QUIESCENCE,
            auto_term: None,
            revision_granularity: Duration::from_secs(1),
        }
    }
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Plain shutdown.
    Exit,
    /// Re-exec wanted: auto-sync tasks exist, the daemon should come back
    /// with the new binaries.
    Restart,
}

/// `LogOutput` signal payload.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Object path of the active session, or the server's own.
    pub path: String,
    pub level: String,
    pub text: String,
}

pub const SERVER_PATH: &str = "/org/syncevolution/Server";

/// Process-wide log fan-out. The scheduler is a singleton and is itself a
/// logger: lines emitted anywhere are forwarded to listening clients,
/// tagged with the active session's object path.
static LOG_CHANNEL: once_cell::sync::Lazy<broadcast::Sender<LogRecord>> =
    once_cell::sync::Lazy::new(|| broadcast::channel(256).0);
static ACTIVE_LOG_PATH: Mutex<Option<String>> = Mutex::new(None);

/// Entry point for the logging layer (see `utils::logging`): forward one
/// formatted line to attached clients.
pub fn forward_log(level: &str, text: &str) {
    let path = ACTIVE_LOG_PATH
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| SERVER_PATH.to_string());
    let _ = LOG_CHANNEL.send(LogRecord {
        path,
        level: level.to_string(),
        text: text.to_string(),
    });
}

struct ClientInfo {
    attach_count: usize,
    notifications: bool,
}

struct ServerState {
    clients: BTreeMap<String, ClientInfo>,
    /// Priority-ordered; FIFO within one priority.
    queue: VecDeque<Weak<Session>>,
    active: Option<Weak<Session>>,
    sessions: BTreeMap<String, Arc<Session>>,
    connections: BTreeMap<String, Arc<Connection>>,
    session_counter: u32,
    used_ids: HashSet<String>,
    shutdown_requested: bool,
    last_file_mod: Option<Instant>,
    last_activity: Instant,
}

pub struct Server {
    options: ServerOptions,
    tree: Arc<ConfigTree>,
    backends: Arc<BackendRegistry>,
    info: InfoBroker,
    presence: PresenceMonitor,
    state: Mutex<ServerState>,
    wake: Notify,
    auto_sync: Mutex<Option<Arc<AutoSyncManager>>>,

    session_changed_tx: broadcast::Sender<(String, bool)>,
    config_changed_tx: broadcast::Sender<String>,
    templates_changed_tx: broadcast::Sender<()>,
    presence_tx: broadcast::Sender<PresenceSignal>,
}

/// `Presence` signal payload: one peer's reachability changed.
#[derive(Debug, Clone)]
pub struct PresenceSignal {
    pub peer: String,
    pub status: String,
    pub transports: Vec<String>,
}

impl Server {
    pub fn new(
        options: ServerOptions,
        tree: Arc<ConfigTree>,
        backends: Arc<BackendRegistry>,
    ) -> Arc<Server> {
        let (session_changed_tx, _) = broadcast::channel(64);
        let (config_changed_tx, _) = broadcast::channel(64);
        let (templates_changed_tx, _) = broadcast::channel(16);
        let (presence_tx, _) = broadcast::channel(64);

        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);

        let server = Arc::new(Server {
            options,
            tree,
            backends,
            info: InfoBroker::default(),
            presence: PresenceMonitor::new(),
            state: Mutex::new(ServerState {
                clients: BTreeMap::new(),
                queue: VecDeque::new(),
                active: None,
                sessions: BTreeMap::new(),
                connections: BTreeMap::new(),
                session_counter: seed,
                used_ids: HashSet::new(),
                shutdown_requested: false,
                last_file_mod: None,
                last_activity: Instant::now(),
            }),
            wake: Notify::new(),
            auto_sync: Mutex::new(None),
            session_changed_tx,
            config_changed_tx,
            templates_changed_tx,
            presence_tx,
        });
        let auto_sync = AutoSyncManager::create(&server);
        *server.auto_sync.lock().unwrap() = Some(auto_sync);

        // fan transport edges out as per-peer presence signals
        {
            let weak = Arc::downgrade(&server);
            let mut edges = server.presence.subscribe();
            tokio::spawn(async move {
                while let Ok(_edge) = edges.recv().await {
                    let Some(server) = weak.upgrade() else { return };
                    for name in server.tree.names() {
                        let Ok(config) = server.tree.load(&name) else {
                            continue;
                        };
                        let (status, transports) = server.presence.check_presence(&config);
                        let _ = server.presence_tx.send(PresenceSignal {
                            peer: name,
                            status,
                            transports,
                        });
                    }
                }
            });
        }
        server
    }

    fn session_services(&self) -> SessionServices {
        SessionServices {
            config_tree: self.tree.clone(),
            backends: self.backends.clone(),
            info: self.info.clone(),
            presence: self.presence.clone(),
            revision_granularity: self.options.revision_granularity,
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn config_tree(&self) -> &Arc<ConfigTree> {
        &self.tree
    }

    pub fn presence(&self) -> &PresenceMonitor {
        &self.presence
    }

    pub fn info_broker(&self) -> &InfoBroker {
        &self.info
    }

    pub fn auto_sync(&self) -> Arc<AutoSyncManager> {
        self.auto_sync
            .lock()
            .unwrap()
            .clone()
            .expect("auto-sync manager is created with the server")
    }

    // ---- capabilities and versions

    pub fn get_capabilities(&self) -> Vec<String> {
        CAPABILITIES.iter().map(|s| s.to_string()).collect()
    }

    pub fn get_versions(&self) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        versions.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        versions.insert(
            "backends".to_string(),
            self.backends.known().collect::<Vec<_>>().join(", "),
        );
        versions
    }

    // ---- signals

    pub fn subscribe_session_changed(&self) -> broadcast::Receiver<(String, bool)> {
        self.session_changed_tx.subscribe()
    }

    pub fn subscribe_config_changed(&self) -> broadcast::Receiver<String> {
        self.config_changed_tx.subscribe()
    }

    pub fn subscribe_templates_changed(&self) -> broadcast::Receiver<()> {
        self.templates_changed_tx.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceSignal> {
        self.presence_tx.subscribe()
    }

    pub fn subscribe_log_output(&self) -> broadcast::Receiver<LogRecord> {
        LOG_CHANNEL.subscribe()
    }

    /// Emit a log line to attached clients, attributed to the active
    /// session when there is one.
    pub fn log_output(&self, level: &str, text: &str) {
        forward_log(level, text);
    }

    // ---- client registry

    pub fn attach_client(&self, client_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();
        let entry = state
            .clients
            .entry(client_id.to_string())
            .or_insert(ClientInfo {
                attach_count: 0,
                notifications: true,
            });
        entry.attach_count += 1;
    }

    pub fn detach_client(&self, client_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.clients.get_mut(client_id) {
            entry.attach_count = entry.attach_count.saturating_sub(1);
            if entry.attach_count == 0 {
                state.clients.remove(client_id);
            }
        }
        state.last_activity = Instant::now();
    }

    /// A client disappeared from the bus without detaching.
    pub fn client_gone(&self, client_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.clients.remove(client_id).is_some() {
            debug!(client = %client_id, "client has disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    pub fn set_notifications(&self, client_id: &str, enabled: bool) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        match state.clients.get_mut(client_id) {
            Some(entry) if entry.attach_count > 0 => {
                entry.notifications = enabled;
                Ok(())
            }
            _ => Err(ApiError::InvalidCall(
                "client not attached, not allowed to change notifications".to_string(),
            )),
        }
    }

    /// Notifications go out only when no attached client vetoed them.
    pub fn notifications_enabled(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .clients
            .values()
            .all(|c| c.notifications)
    }

    // ---- session management

    /// Random part plus monotonically increasing counter; collisions are
    /// rejected against all ids ever used by this process.
    fn next_session_id(&self) -> String {
        let mut state = self.state.lock().unwrap();
        loop {
            state.session_counter = state.session_counter.wrapping_add(1);
            if state.session_counter == 0 {
                continue;
            }
            let id = format!("{}{}", rand::random::<u32>(), state.session_counter);
            if state.used_ids.insert(id.clone()) {
                return id;
            }
        }
    }

    fn check_not_shutting_down(&self) -> Result<(), ApiError> {
        if self.state.lock().unwrap().shutdown_requested {
            return Err(ApiError::InvalidCall("server shutting down".to_string()));
        }
        Ok(())
    }

    /// Create a session owned by this server; the caller decides when to
    /// enqueue it.
    pub fn new_session(
        &self,
        config: &str,
        peer_device_id: &str,
        flags: Vec<String>,
    ) -> Result<Arc<Session>, ApiError> {
        self.check_not_shutting_down()?;
        let id = self.next_session_id();
        let session = Session::create(self.session_services(), peer_device_id, config, &id, flags);
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(id, session.clone());
        state.last_activity = Instant::now();
        Ok(session)
    }

    /// `StartSession`/`StartSessionWithFlags`.
    pub fn start_session(
        &self,
        config: &str,
        flags: Vec<String>,
    ) -> Result<Arc<Session>, ApiError> {
        let session = self.new_session(config, "", flags)?;
        self.enqueue(&session);
        Ok(session)
    }

    /// Insert by priority, FIFO within one priority.
    pub fn enqueue(&self, session: &Arc<Session>) {
        {
            let mut state = self.state.lock().unwrap();
            let priority = session.priority();
            let mut index = state.queue.len();
            while index > 0 {
                let ahead = state.queue[index - 1]
                    .upgrade()
                    .map(|s| s.priority())
                    .unwrap_or_default();
                if ahead <= priority {
                    break;
                }
                index -= 1;
            }
            state.queue.insert(index, Arc::downgrade(session));
            state.last_activity = Instant::now();
        }
        SESSION_EVENTS.with_label_values(&["enqueued"]).inc();
        self.wake.notify_one();
    }

    /// Promote the next queued session when no session is active.
    pub fn check_queue(&self) {
        let promoted = {
            let mut state = self.state.lock().unwrap();
            if state.shutdown_requested {
                return;
            }
            if state
                .active
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .is_some()
            {
                return;
            }
            let mut promoted = None;
            while let Some(weak) = state.queue.pop_front() {
                if let Some(session) = weak.upgrade() {
                    state.active = Some(Arc::downgrade(&session));
                    promoted = Some(session);
                    break;
                }
            }
            promoted
        };
        if let Some(session) = promoted {
            info!(session_id = %session.session_id(), "session activated");
            session.activate();
            let _ = self
                .session_changed_tx
                .send((session.session_id().to_string(), true));
        }
    }

    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.state.lock().unwrap().sessions.get(id).cloned()
    }

    /// `GetSessions`: the active session first, then the queue.
    pub fn get_sessions(&self) -> Vec<Arc<Session>> {
        let state = self.state.lock().unwrap();
        let mut sessions = Vec::new();
        if let Some(active) = state.active.as_ref().and_then(|weak| weak.upgrade()) {
            sessions.push(active);
        }
        for weak in &state.queue {
            if let Some(session) = weak.upgrade() {
                sessions.push(session);
            }
        }
        sessions
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.active.as_ref().and_then(|weak| weak.upgrade()).is_none()
            && !state
                .queue
                .iter()
                .any(|weak| weak.upgrade().is_some())
    }

    /// Release the active slot after a session finished or was killed.
    fn dequeue(&self, session: &Arc<Session>) {
        let was_active = {
            let mut state = self.state.lock().unwrap();
            state
                .queue
                .retain(|weak| !weak.upgrade().is_some_and(|s| Arc::ptr_eq(&s, session)));
            let was_active = state
                .active
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .is_some_and(|s| Arc::ptr_eq(&s, session));
            if was_active {
                state.active = None;
            }
            was_active
        };
        if was_active {
            session.deactivate();
            let _ = self
                .session_changed_tx
                .send((session.session_id().to_string(), false));
            self.wake.notify_one();
        }
    }

    fn session_done(self: &Arc<Self>, session: &Arc<Session>) {
        SESSION_EVENTS.with_label_values(&["finished"]).inc();
        self.dequeue(session);
        self.delay_session_destruction(session);
    }

    /// Keep a finished session queryable for the configured linger time.
    pub fn delay_session_destruction(self: &Arc<Self>, session: &Arc<Session>) {
        let linger = self.options.session_linger;
        let id = session.session_id().to_string();
        let this = Arc::downgrade(self);
        debug!(session_id = %id, "delaying destruction of finished session");
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            if let Some(server) = this.upgrade() {
                let mut state = server.state.lock().unwrap();
                if let Some(session) = state.sessions.get(&id) {
                    if session.is_done() || session.attach_count() == 0 {
                        state.sessions.remove(&id);
                    }
                }
            }
        });
    }

    /// Drop every session bound to this peer device: pending ones are
    /// unqueued, an active one is aborted.
    pub fn kill_sessions_by_device(&self, peer_device_id: &str) -> usize {
        let (victims, active_victim) = {
            let mut state = self.state.lock().unwrap();
            let mut victims = Vec::new();
            state.queue.retain(|weak| {
                let Some(session) = weak.upgrade() else {
                    return false;
                };
                if session.peer_device_id() == peer_device_id {
                    victims.push(session);
                    false
                } else {
                    true
                }
            });
            let active_victim = state
                .active
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .filter(|s| s.peer_device_id() == peer_device_id);
            (victims, active_victim)
        };

        let mut count = victims.len();
        for session in &victims {
            debug!(
                session_id = %session.session_id(),
                device_id = %peer_device_id,
                "removing pending session for preempted device"
            );
            let mut state = self.state.lock().unwrap();
            state.sessions.remove(session.session_id());
        }
        if let Some(active) = active_victim {
            debug!(
                session_id = %active.session_id(),
                device_id = %peer_device_id,
                "aborting active session for preempted device"
            );
            // abort fails when nothing runs yet; drop the session either way
            let _ = active.abort();
            self.dequeue(&active);
            count += 1;
        }
        count
    }

    // ---- connections

    /// `Connect`: a new server-mode connection for an incoming peer.
    pub fn connect(
        &self,
        peer: BTreeMap<String, String>,
        must_authenticate: bool,
        session: &str,
    ) -> Result<Arc<Connection>, ApiError> {
        self.check_not_shutting_down()?;
        if !session.is_empty() {
            // reconnecting to an old connection is not implemented
            return Err(ApiError::InvalidCall(
                "reconnecting to an existing session is not implemented".to_string(),
            ));
        }
        let id = self.next_session_id();
        let connection = Connection::new(&id, peer, must_authenticate);
        info!(connection = %connection.description(), id = %id, "new connection");
        self.state
            .lock()
            .unwrap()
            .connections
            .insert(id, connection.clone());
        Ok(connection)
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.state.lock().unwrap().connections.get(id).cloned()
    }

    pub fn remove_connection(&self, id: &str) {
        self.state.lock().unwrap().connections.remove(id);
    }

    // ---- read operations

    /// `GetConfigs`: stored config names, or template names.
    pub fn get_configs(&self, templates: bool) -> Vec<String> {
        if templates {
            // only the built-in fallback template is shipped here
            vec!["default".to_string()]
        } else {
            self.tree.names()
        }
    }

    pub fn get_config(&self, name: &str, template: bool) -> Result<ConfigDict, ApiError> {
        if template {
            // the fallback template: an empty skeleton to fill in
            let mut dict = ConfigDict::new();
            dict.insert(String::new(), BTreeMap::new());
            return Ok(dict);
        }
        Ok(self.tree.load(name)?.to_dict())
    }

    pub fn get_reports(
        &self,
        name: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<SyncReport>, ApiError> {
        self.tree.load_reports(name, start, count)
    }

    fn source_params(&self, config: &str, source: &str) -> Result<SourceParams, ApiError> {
        let peer_config = self.tree.load(config)?;
        let props = peer_config
            .sources
            .get(source)
            .ok_or_else(|| ApiError::NoSuchSource {
                config: config.to_string(),
                source_name: source.to_string(),
            })?;
        let default_type = "memory:text/vcard:3.0".to_string();
        let type_prop = props.get("type").unwrap_or(&default_type);
        let uri = props.get("uri").map(|s| s.as_str()).unwrap_or("");
        Ok(SourceParams::from_type_property(source, type_prop, uri))
    }

    /// `CheckSource`: open the backend and run its cheap self-test.
    pub fn check_source(&self, config: &str, source: &str) -> Result<(), ApiError> {
        let params = self.source_params(config, source)?;
        let mut backend =
            self.backends
                .create(&params)
                .map_err(|e| ApiError::SourceUnusable {
                    source_name: source.to_string(),
                    reason: e.to_string(),
                })?;
        let result = backend
            .open()
            .and_then(|()| backend.list_all().map(|_| ()))
            .map_err(|e| ApiError::SourceUnusable {
                source_name: source.to_string(),
                reason: e.to_string(),
            });
        let _ = backend.close();
        result
    }

    pub fn get_databases(&self, config: &str, source: &str) -> Result<Vec<Database>, ApiError> {
        let params = self.source_params(config, source)?;
        let backend = self
            .backends
            .create(&params)
            .map_err(|e| ApiError::SourceUnusable {
                source_name: source.to_string(),
                reason: e.to_string(),
            })?;
        backend.databases().map_err(|e| ApiError::SourceUnusable {
            source_name: source.to_string(),
            reason: e.to_string(),
        })
    }

    /// `CheckPresence`.
    pub fn check_presence(&self, peer: &str) -> Result<(String, Vec<String>), ApiError> {
        let config = self.tree.load(peer)?;
        Ok(self.presence.check_presence(&config))
    }

    /// A config was created, modified or removed through a session.
    pub fn config_changed(&self, name: &str) {
        let _ = self
            .config_changed_tx
            .send(normalize_config_name(name));
    }

    // ---- info requests

    pub fn info_response(&self, caller: &str, id: &str, state: &str, response: &InfoMap) {
        self.info.respond(caller, id, state, response);
    }

    // ---- shutdown / restart

    /// A file mapped into the process was modified; begin the quiescence
    /// dance.
    pub fn file_modified(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_file_mod = Some(Instant::now());
        if !state.shutdown_requested {
            info!("file modified, initiating shutdown");
        }
        state.shutdown_requested = true;
        drop(state);
        self.wake.notify_one();
    }

    /// External shutdown request (signal handler).
    pub fn request_shutdown(&self) {
        self.state.lock().unwrap().shutdown_requested = true;
        self.wake.notify_one();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.state.lock().unwrap().shutdown_requested
    }

    /// Ready to leave once no session runs and the quiescence window after
    /// the last modification has passed. `None` = keep running, or wait
    /// the returned duration first.
    fn shutdown_decision(&self) -> ShutdownDecision {
        let state = self.state.lock().unwrap();
        if !state.shutdown_requested {
            return ShutdownDecision::KeepRunning;
        }
        if state
            .active
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .is_some()
        {
            // quiescence starts only after the active session completed
            return ShutdownDecision::KeepRunning;
        }
        match state.last_file_mod {
            None => ShutdownDecision::Now,
            Some(last) => {
                let due = last + self.options.shutdown_quiescence;
                let now = Instant::now();
                if due <= now {
                    ShutdownDecision::Now
                } else {
                    ShutdownDecision::After(due - now)
                }
            }
        }
    }

    /// Outer loop: activate sessions, run them, schedule auto-syncs, and
    /// wind down on shutdown.
    pub async fn run(self: &Arc<Self>) -> RunOutcome {
        info!(
            capabilities = ?self.get_capabilities(),
            "server ready to run"
        );
        let auto_sync = self.auto_sync();
        let mut last_idle = Instant::now();
        // re-exec is only for picking up new binaries; plain shutdowns and
        // idle termination always exit
        let mut upgrade_shutdown = false;

        loop {
            match self.shutdown_decision() {
                ShutdownDecision::Now => {
                    upgrade_shutdown = self.state.lock().unwrap().last_file_mod.is_some();
                    break;
                }
                ShutdownDecision::After(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.wake.notified() => {}
                    }
                    continue;
                }
                ShutdownDecision::KeepRunning => {}
            }

            self.check_queue();

            if let Some(session) = self.active_session() {
                last_idle = Instant::now();
                tokio::select! {
                    _ = session.wait_ready() => {
                        *ACTIVE_LOG_PATH.lock().unwrap() = Some(format!(
                            "{}{}",
                            crate::bus::SESSION_PATH_PREFIX,
                            session.session_id()
                        ));
                        let status = session.run().await;
                        *ACTIVE_LOG_PATH.lock().unwrap() = None;
                        debug!(session_id = %session.session_id(), %status, "session finished");
                        self.session_done(&session);
                        auto_sync.schedule("session finished").await;
                    }
                    _ = self.wake.notified() => {}
                }
            } else {
                auto_sync.schedule("server idle").await;

                // automatic termination of an idle daemon
                let auto_term_deadline = self.options.auto_term.and_then(|idle| {
                    let state = self.state.lock().unwrap();
                    let eligible = state.clients.is_empty()
                        && state.sessions.is_empty()
                        && !auto_sync.prevent_term();
                    eligible.then(|| state.last_activity.max(last_idle) + idle)
                });

                match auto_term_deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {
                                info!("idle for too long, terminating");
                                break;
                            }
                            _ = self.wake.notified() => {}
                        }
                    }
                    None => self.wake.notified().await,
                }
            }
        }

        if upgrade_shutdown && auto_sync.prevent_term() {
            info!("server restarting, auto-sync tasks remain eligible");
            RunOutcome::Restart
        } else {
            info!("server shutting down");
            RunOutcome::Exit
        }
    }

    /// Wake the run loop; used by collaborators that changed queue or
    /// shutdown state out of band.
    pub fn poke(&self) {
        self.wake.notify_one();
    }
}

enum ShutdownDecision {
    KeepRunning,
    After(Duration),
    Now,
}

impl ConnectionHost for Server {
    fn config_names(&self) -> Vec<String> {
        self.tree.names()
    }

    fn load_config(&self, name: &str) -> Result<PeerConfig, ApiError> {
        self.tree.load(name)
    }

    fn create_session(
        &self,
        config: &str,
        peer_device_id: &str,
    ) -> Result<Arc<Session>, ApiError> {
        self.new_session(config, peer_device_id, vec![])
    }

    fn kill_sessions(&self, peer_device_id: &str) -> usize {
        self.kill_sessions_by_device(peer_device_id)
    }

    fn enqueue(&self, session: &Arc<Session>) {
        Server::enqueue(self, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_api::models::Priority;

    fn server(dir: &camino::Utf8Path) -> Arc<Server> {
        let options = ServerOptions {
            session_linger: Duration::from_secs(60),
            revision_granularity: Duration::ZERO,
            ..Default::default()
        };
        let server = Server::new(
            options,
            Arc::new(ConfigTree::new(dir.join("configs"))),
            Arc::new(BackendRegistry::default()),
        );
        let mut config = PeerConfig::default();
        config.peer.insert("syncURL".into(), "http://peer".into());
        config.sources.entry("addressbook".into()).or_default();
        server.config_tree().save("peer", &config).unwrap();
        server
    }

    #[tokio::test]
    async fn attach_detach_leaves_no_trace() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());
        server.attach_client(":1.1");
        server.detach_client(":1.1");
        server.attach_client(":1.1");
        server.detach_client(":1.1");
        assert_eq!(server.client_count(), 0);
        // changing notifications without being attached is rejected
        assert!(server.set_notifications(":1.1", false).is_err());
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let mut seen = HashSet::new();
        for _ in 0..500 {
            assert!(seen.insert(server.next_session_id()));
        }
    }

    #[tokio::test]
    async fn at_most_one_session_is_active() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let first = server.start_session("peer", vec![]).unwrap();
        let second = server.start_session("peer", vec![]).unwrap();
        server.check_queue();
        server.check_queue();

        assert!(first.is_active());
        assert!(!second.is_active());

        server.session_done(&first);
        server.check_queue();
        assert!(second.is_active());
    }

    #[tokio::test]
    async fn queue_respects_priority_then_fifo() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let auto1 = server.new_session("peer", "", vec![]).unwrap();
        auto1.set_priority(Priority::AUTOSYNC);
        let auto2 = server.new_session("peer", "", vec![]).unwrap();
        auto2.set_priority(Priority::AUTOSYNC);
        let cmdline = server.new_session("peer", "", vec![]).unwrap();
        cmdline.set_priority(Priority::CMDLINE);

        server.enqueue(&auto1);
        server.enqueue(&auto2);
        server.enqueue(&cmdline);

        let order: Vec<String> = server
            .get_sessions()
            .iter()
            .map(|s| s.session_id().to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                cmdline.session_id().to_string(),
                auto1.session_id().to_string(),
                auto2.session_id().to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn kill_sessions_by_device_preempts() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let doomed = server.new_session("peer", "dev-1", vec![]).unwrap();
        server.enqueue(&doomed);
        let unrelated = server.new_session("peer", "dev-2", vec![]).unwrap();
        server.enqueue(&unrelated);

        assert_eq!(server.kill_sessions_by_device("dev-1"), 1);
        let remaining: Vec<String> = server
            .get_sessions()
            .iter()
            .map(|s| s.peer_device_id().to_string())
            .collect();
        assert_eq!(remaining, vec!["dev-2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_sessions_linger_for_late_queries() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let session = server.start_session("peer", vec![]).unwrap();
        let id = session.session_id().to_string();
        server.check_queue();
        server.session_done(&session);
        drop(session);

        // still queryable right after completion
        assert!(server.get_session(&id).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(server.get_session(&id).is_none());
    }

    #[tokio::test]
    async fn presence_signal_fans_out_per_peer() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let mut rx = server.subscribe_presence();

        server.presence().register_network_provider();
        server
            .presence()
            .update(sync_api::models::TransportKind::Http, true);
        // the fan-out task needs a tick to observe the edge
        tokio::task::yield_now().await;

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.peer, "peer");
        assert_eq!(signal.transports, vec!["http://peer".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server(dir.path());
        server.file_modified();
        assert!(server.start_session("peer", vec![]).is_err());
        assert!(server
            .connect(BTreeMap::new(), false, "")
            .is_err());
    }
}
