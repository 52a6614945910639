//! Automatic time-based syncs.
//!
//! Once a config enables `autoSync`, the manager tracks when its transports
//! became available and how long ago it last synced, and enqueues a session
//! when a sync URL is ready. Automatic syncs run only while the scheduler
//! is otherwise idle; the decision loop re-runs when the scheduler goes
//! idle, when a transport comes up and when a per-task timer fires.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sync_api::models::{Priority, TransportKind};
use sync_api::SyncStatus;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::AUTO_SYNC_RUNS;
use crate::server::Server;
use crate::session::Session;

/// Facade over the OS notification service; the real binding lives in the
/// front end.
pub trait Notifier: Send + Sync {
    fn publish(&self, summary: &str, body: &str);
}

/// Default notifier: notifications end up in the log.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, summary: &str, body: &str) {
        info!(summary, body, "notification");
    }
}

/// Cached per-config information. Entries are created on first sight and
/// never removed, so `last_sync_time` survives config deletion and
/// re-creation.
struct AutoSyncTask {
    peer_name: String,
    notify_level: u8,
    sync_success_start: bool,
    /// Latched on any non-temporary failure; cleared by config changes.
    permanent_failure: bool,
    delay: Duration,
    interval: Duration,
    /// Monotonic, so clock jumps cannot trigger sync storms.
    last_sync_time: Instant,
    urls: Vec<(TransportKind, String)>,
    interval_timer: Option<CancellationToken>,
    transport_timer: Option<CancellationToken>,
}

impl AutoSyncTask {
    fn new(now: Instant) -> AutoSyncTask {
        AutoSyncTask {
            peer_name: String::new(),
            notify_level: 3,
            sync_success_start: false,
            permanent_failure: false,
            delay: Duration::ZERO,
            interval: Duration::ZERO,
            // pessimistic: assume the last sync just happened, which also
            // avoids a burst of syncs right after daemon startup
            last_sync_time: now,
            urls: Vec::new(),
            interval_timer: None,
            transport_timer: None,
        }
    }

    fn eligible(&self) -> bool {
        !self.interval.is_zero() && !self.permanent_failure && !self.urls.is_empty()
    }
}

pub struct AutoSyncManager {
    server: Weak<Server>,
    tasks: Mutex<BTreeMap<String, AutoSyncTask>>,
    notifier: Mutex<Arc<dyn Notifier>>,
    /// The auto-sync session currently queued or running, if any.
    session: Mutex<Option<Arc<Session>>>,
}

/// Parse the `autoSync` property into (http, bluetooth, any-other).
fn parse_auto_sync(value: &str) -> (bool, bool, bool) {
    let lower = value.trim().to_ascii_lowercase();
    match lower.as_str() {
        "" | "0" | "f" | "false" => (false, false, false),
        "1" | "t" | "true" => (true, true, true),
        _ => {
            let mut http = false;
            let mut bt = false;
            for part in lower.split(',') {
                match part.trim() {
                    "http" => http = true,
                    "obex-bt" => bt = true,
                    _ => {}
                }
            }
            (http, bt, false)
        }
    }
}

impl AutoSyncManager {
    pub fn create(server: &Arc<Server>) -> Arc<AutoSyncManager> {
        let manager = Arc::new(AutoSyncManager {
            server: Arc::downgrade(server),
            tasks: Mutex::new(BTreeMap::new()),
            notifier: Mutex::new(Arc::new(LogNotifier)),
            session: Mutex::new(None),
        });

        for name in server.config_tree().names() {
            manager.init_config(&name);
        }

        // config changes refresh the cached task data
        {
            let weak = Arc::downgrade(&manager);
            let mut rx = server.subscribe_config_changed();
            tokio::spawn(async move {
                while let Ok(name) = rx.recv().await {
                    let Some(manager) = weak.upgrade() else { return };
                    manager.init_config(&name);
                    manager.schedule("config change").await;
                }
            });
        }

        // transport edges re-run the decision loop
        {
            let weak = Arc::downgrade(&manager);
            let mut rx = server.presence().subscribe();
            tokio::spawn(async move {
                while let Ok(edge) = rx.recv().await {
                    let Some(manager) = weak.upgrade() else { return };
                    if edge.available {
                        manager.schedule("presence change").await;
                    }
                }
            });
        }

        // watch all sessions: any sync for a known config updates the
        // task's bookkeeping
        {
            let weak = Arc::downgrade(&manager);
            let server_weak = Arc::downgrade(server);
            let mut rx = server.subscribe_session_changed();
            tokio::spawn(async move {
                while let Ok((id, active)) = rx.recv().await {
                    if !active {
                        continue;
                    }
                    let Some(manager) = weak.upgrade() else { return };
                    let Some(server) = server_weak.upgrade() else { return };
                    let Some(session) = server.get_session(&id) else {
                        continue;
                    };
                    manager.session_started(&session);
                }
            });
        }

        manager
    }

    /// Replace the notifier facade (the UI wires in the real one).
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.lock().unwrap() = notifier;
    }

    /// Refresh the cached task for `config_name` after a config change.
    pub fn init_config(&self, config_name: &str) {
        let Some(server) = self.server.upgrade() else { return };
        let name = crate::sync_config::normalize_config_name(config_name);
        if name.is_empty() {
            // anything might have changed: refresh every known config
            for name in server.config_tree().names() {
                self.init_config(&name);
            }
            return;
        }

        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .entry(name.clone())
            .or_insert_with(|| AutoSyncTask::new(Instant::now()));

        let Ok(config) = server.config_tree().load(&name) else {
            // deleted: clearing the URLs disables auto-syncing, the rest
            // of the entry stays for a possible re-creation
            task.urls.clear();
            return;
        };

        let (http, bt, any) = parse_auto_sync(config.auto_sync());
        task.peer_name = if config.peer_name().is_empty() {
            name.clone()
        } else {
            config.peer_name().to_string()
        };
        task.interval = config.auto_sync_interval();
        task.delay = config.auto_sync_delay();
        task.notify_level = config
            .get("notifyLevel")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        // whatever was changed might have fixed the problem
        task.permanent_failure = false;

        task.urls.clear();
        for url in config.sync_urls() {
            let kind = TransportKind::of_url(&url);
            let enabled = match kind {
                TransportKind::Http => http,
                TransportKind::Bluetooth => bt,
                TransportKind::Other => any,
            };
            if enabled {
                task.urls.push((kind, url));
            }
        }
        debug!(
            config = %name,
            interval = ?task.interval,
            delay = ?task.delay,
            urls = task.urls.len(),
            "auto sync: updated task"
        );
    }

    /// True when any task might still want to run; the scheduler prefers
    /// re-exec over exit while this holds.
    pub fn prevent_term(&self) -> bool {
        self.tasks.lock().unwrap().values().any(|t| t.eligible())
    }

    fn arm_timer(
        self: &Arc<Self>,
        slot: &mut Option<CancellationToken>,
        delay: Duration,
        reason: &'static str,
    ) {
        if let Some(old) = slot.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(manager) = weak.upgrade() {
                        manager.schedule(reason).await;
                    }
                }
            }
        });
    }

    /// The decision loop: run the first task that is ready, arm timers for
    /// the rest.
    pub async fn schedule(self: &Arc<Self>, reason: &str) {
        debug!(reason, "auto sync: reschedule");
        let Some(server) = self.server.upgrade() else { return };
        if !self.prevent_term() {
            return;
        }
        if !server.is_idle() || server.shutdown_requested() {
            // only schedule when nothing else is going on; the server
            // pokes us once it is idle again
            return;
        }

        let now = Instant::now();
        let ready = {
            let mut tasks = self.tasks.lock().unwrap();
            let mut ready = None;
            for (name, task) in tasks.iter_mut() {
                if !task.eligible() {
                    continue;
                }

                let due = task.last_sync_time + task.interval;
                if now < due {
                    debug!(config = %name, in_seconds = (due - now).as_secs(), "auto sync: interval pending");
                    self.arm_timer(
                        &mut task.interval_timer,
                        due - now + Duration::from_secs(1),
                        "interval timer",
                    );
                    continue;
                }

                let mut ready_url = None;
                for (kind, url) in &task.urls {
                    match kind {
                        TransportKind::Other => {
                            // some other transport, assumed to be online
                            ready_url = Some(url.clone());
                            break;
                        }
                        kind => match server.presence().available_since(*kind) {
                            Some(since) => {
                                if task.delay.is_zero() || since + task.delay <= now {
                                    ready_url = Some(url.clone());
                                    break;
                                }
                                // present but not aged enough yet
                                let wait = since + task.delay - now + Duration::from_secs(1);
                                debug!(config = %name, in_seconds = wait.as_secs(), "auto sync: presence delay pending");
                                self.arm_timer(&mut task.transport_timer, wait, "transport timer");
                            }
                            None => {
                                // offline; the presence-edge listener will
                                // call us when it comes up
                            }
                        },
                    }
                }

                if let Some(url) = ready_url {
                    task.sync_success_start = false;
                    task.last_sync_time = now;
                    ready = Some((name.clone(), url));
                    break;
                }
            }
            ready
        };

        let Some((config_name, url)) = ready else {
            debug!("auto sync: nothing to do");
            return;
        };

        info!(config = %config_name, url = %url, "auto sync: starting session");
        let session = match server.new_session(&config_name, "", vec![]) {
            Ok(session) => session,
            Err(e) => {
                warn!("auto sync: cannot create session: {e}");
                return;
            }
        };
        session.set_priority(Priority::AUTOSYNC);

        // once active: narrow the config to the chosen URL and start the
        // sync right away
        session.on_activate(move |session| {
            let mut overlay = sync_api::models::ConfigDict::new();
            overlay
                .entry(String::new())
                .or_default()
                .insert("syncURL".to_string(), url.clone());
            if let Err(e) = session.set_config(true, true, &overlay) {
                warn!("auto sync: cannot narrow sync URL: {e}");
            }
            if let Err(e) = session.sync("", BTreeMap::new()) {
                warn!("auto sync: cannot start sync: {e}");
            }
        });

        self.watch_own_session(&session, &config_name);
        *self.session.lock().unwrap() = Some(session.clone());
        server.enqueue(&session);
        AUTO_SYNC_RUNS.with_label_values(&["started"]).inc();
    }

    /// Bookkeeping for any session of a known config (including manual
    /// ones): record the start time and watch the outcome.
    fn session_started(self: &Arc<Self>, session: &Arc<Session>) {
        let config_name = session.config_name().to_string();
        {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get_mut(&config_name) else {
                debug!(config = %config_name, "auto sync: ignoring session without task");
                return;
            };
            task.last_sync_time = Instant::now();
        }

        let weak = Arc::downgrade(self);
        let mut done_rx = session.subscribe_done();
        tokio::spawn(async move {
            let Ok(status) = done_rx.recv().await else { return };
            let Some(manager) = weak.upgrade() else { return };
            manager.any_sync_done(&config_name, status);
        });
    }

    /// Extra monitoring for sessions this manager created itself: user
    /// notifications at start and completion.
    fn watch_own_session(self: &Arc<Self>, session: &Arc<Session>, config_name: &str) {
        let weak = Arc::downgrade(self);
        let name = config_name.to_string();
        let mut started_rx = session.subscribe_sync_started();
        tokio::spawn(async move {
            if started_rx.recv().await.is_ok() {
                if let Some(manager) = weak.upgrade() {
                    manager.auto_sync_success_start(&name);
                }
            }
        });

        let weak = Arc::downgrade(self);
        let name = config_name.to_string();
        let mut done_rx = session.subscribe_done();
        tokio::spawn(async move {
            let Ok(status) = done_rx.recv().await else { return };
            let Some(manager) = weak.upgrade() else { return };
            manager.auto_sync_done(&name, status);
        });
    }

    fn notifications_allowed(&self, level_needed: u8, config_name: &str) -> bool {
        let Some(server) = self.server.upgrade() else {
            return false;
        };
        if !server.notifications_enabled() {
            return false;
        }
        self.tasks
            .lock()
            .unwrap()
            .get(config_name)
            .map(|t| t.notify_level >= level_needed)
            .unwrap_or(false)
    }

    fn auto_sync_success_start(&self, config_name: &str) {
        let peer_name = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get_mut(config_name) else { return };
            task.sync_success_start = true;
            task.peer_name.clone()
        };
        info!(config = %config_name, "automatic sync started");
        if self.notifications_allowed(3, config_name) {
            self.notifier.lock().unwrap().publish(
                &format!("{peer_name} is syncing"),
                &format!("We have just started to sync your computer with the {peer_name} sync service."),
            );
        }
    }

    fn auto_sync_done(&self, config_name: &str, status: SyncStatus) {
        let (peer_name, success_start) = {
            let tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get(config_name) else { return };
            (task.peer_name.clone(), task.sync_success_start)
        };
        info!(config = %config_name, %status, "automatic sync done");
        AUTO_SYNC_RUNS
            .with_label_values(&[if status.is_ok() { "ok" } else { "failed" }])
            .inc();

        if success_start && status.is_ok() {
            if self.notifications_allowed(3, config_name) {
                self.notifier.lock().unwrap().publish(
                    &format!("{peer_name} sync complete"),
                    &format!("We have just finished syncing your computer with the {peer_name} sync service."),
                );
            }
        } else if success_start || !status.is_temporary() {
            // started but failed, or never started with an error that
            // needs attention; temporary failures stay silent
            if self.notifications_allowed(1, config_name) {
                self.notifier.lock().unwrap().publish(
                    "Sync problem.",
                    "Sorry, there's a problem with your sync that you need to attend to.",
                );
            }
        }

        *self.session.lock().unwrap() = None;
    }

    /// Record the latest outcome for any sync of this config.
    fn any_sync_done(&self, config_name: &str, status: SyncStatus) {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(config_name) else { return };
        task.permanent_failure = !status.is_ok() && !status.is_temporary();
        debug!(
            config = %config_name,
            %status,
            permanent_failure = task.permanent_failure,
            "auto sync: session outcome recorded"
        );
    }

    #[cfg(test)]
    fn force_last_sync_time(&self, config_name: &str, when: Instant) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(config_name) {
            task.last_sync_time = when;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::server::ServerOptions;
    use crate::sync_config::{ConfigTree, PeerConfig};

    fn server_with_auto_config(
        dir: &camino::Utf8Path,
        interval: u64,
        delay: u64,
    ) -> Arc<Server> {
        let server = Server::new(
            ServerOptions {
                revision_granularity: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(ConfigTree::new(dir.join("configs"))),
            Arc::new(BackendRegistry::default()),
        );
        let mut config = PeerConfig::default();
        config.peer.insert("syncURL".into(), "http://peer/sync".into());
        config.peer.insert("autoSync".into(), "1".into());
        config
            .peer
            .insert("autoSyncInterval".into(), interval.to_string());
        config.peer.insert("autoSyncDelay".into(), delay.to_string());
        config.sources.entry("addressbook".into()).or_default();
        server.config_tree().save("phone", &config).unwrap();
        server.auto_sync().init_config("phone");
        server
    }

    #[tokio::test(start_paused = true)]
    async fn delay_blocks_until_transport_aged() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server_with_auto_config(dir.path(), 60, 30);
        let auto_sync = server.auto_sync();

        // the task was just created; get the interval out of the way
        auto_sync.force_last_sync_time("phone", Instant::now() - Duration::from_secs(61));

        // HTTP came up just now (t0)
        server.presence().register_network_provider();
        server
            .presence()
            .update(sync_api::models::TransportKind::Http, true);

        tokio::time::advance(Duration::from_secs(10)).await;
        auto_sync.schedule("test, t0+10").await;
        assert!(server.get_sessions().is_empty(), "session before the delay");

        tokio::time::advance(Duration::from_secs(20)).await;
        auto_sync.schedule("test, t0+30").await;
        let sessions = server.get_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].priority(), Priority::AUTOSYNC);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_floor_is_respected() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server_with_auto_config(dir.path(), 60, 0);
        let auto_sync = server.auto_sync();

        // a task never runs before last_sync_time + interval
        auto_sync.schedule("test, fresh task").await;
        assert!(server.get_sessions().is_empty());

        tokio::time::advance(Duration::from_secs(59)).await;
        auto_sync.schedule("test, t+59").await;
        assert!(server.get_sessions().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        auto_sync.schedule("test, t+61").await;
        assert_eq!(server.get_sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_suppresses_retries() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server_with_auto_config(dir.path(), 60, 0);
        let auto_sync = server.auto_sync();

        auto_sync.any_sync_done("phone", SyncStatus::FATAL);
        assert!(!auto_sync.prevent_term());
        tokio::time::advance(Duration::from_secs(120)).await;
        auto_sync.schedule("test").await;
        assert!(server.get_sessions().is_empty());

        // a temporary failure would not have latched
        auto_sync.init_config("phone");
        auto_sync.any_sync_done("phone", SyncStatus::TRANSPORT_FAILURE);
        assert!(auto_sync.prevent_term());
    }

    #[tokio::test]
    async fn auto_sync_property_parsing() {
        assert_eq!(parse_auto_sync("1"), (true, true, true));
        assert_eq!(parse_auto_sync("true"), (true, true, true));
        assert_eq!(parse_auto_sync("0"), (false, false, false));
        assert_eq!(parse_auto_sync(""), (false, false, false));
        assert_eq!(parse_auto_sync("http"), (true, false, false));
        assert_eq!(parse_auto_sync("obex-bt,http"), (true, true, false));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_scheduler_defers_auto_sync() {
        let dir = camino_tempfile::tempdir().unwrap();
        let server = server_with_auto_config(dir.path(), 60, 0);
        let auto_sync = server.auto_sync();
        auto_sync.force_last_sync_time("phone", Instant::now() - Duration::from_secs(61));

        // a manual session occupies the scheduler
        let manual = server.start_session("phone", vec![]).unwrap();
        server.check_queue();
        assert!(manual.is_active());

        auto_sync.schedule("test, busy").await;
        // only the manual session is known
        assert_eq!(server.get_sessions().len(), 1);
    }
}
