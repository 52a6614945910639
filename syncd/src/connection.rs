//! Server-side connection front end.
//!
//! A connection receives framed byte buffers from a remote peer (through
//! whatever transport hosts it), picks or creates the matching config,
//! creates a server-mode session and then shuttles messages between the
//! peer and that session. Replies travel outward as `Reply` signals; the
//! hosting transport feeds follow-up messages back in through
//! [`Connection::process`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Deserialize;
use sync_api::models::{ConnectionState, Priority};
use sync_api::ApiError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::loopback::Message;
use crate::session::Session;
use crate::sync_config::PeerConfig;
use crate::transport::{
    ChannelTransport, Envelope, CONTENT_TYPE_HTTP_CONFIG, CONTENT_TYPE_LOOPBACK,
    CONTENT_TYPE_SAN, CONTENT_TYPE_SYNCML_WBXML, CONTENT_TYPE_SYNCML_XML,
};

/// What the scheduler provides to connections; keeps the dependency
/// one-directional (connections never own the scheduler).
pub trait ConnectionHost: Send + Sync {
    fn config_names(&self) -> Vec<String>;

    fn load_config(&self, name: &str) -> Result<PeerConfig, ApiError>;

    /// Create a session owned by the scheduler, not yet queued.
    fn create_session(
        &self,
        config: &str,
        peer_device_id: &str,
    ) -> Result<Arc<Session>, ApiError>;

    /// Drop queued sessions for this device and abort a matching active
    /// one. Returns how many were hit.
    fn kill_sessions(&self, peer_device_id: &str) -> usize;

    fn enqueue(&self, session: &Arc<Session>);
}

/// `Reply` signal payload: one outbound message for the peer.
#[derive(Debug, Clone)]
pub struct ReplySignal {
    pub data: Vec<u8>,
    pub content_type: String,
    pub meta: BTreeMap<String, String>,
    pub is_final: bool,
    pub session_id: String,
}

/// Server-Alerted-Notification payload. The binary SAN codec lives in the
/// engine; on this framing the package arrives as JSON.
#[derive(Debug, Deserialize)]
struct SanPackage {
    server_id: String,
    #[serde(default)]
    sync_mode: String,
}

/// Pull the first `<LocURI>` out of a SyncML header without a full parse;
/// it carries the peer's device id in the initial message.
fn extract_loc_uri(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let start = text.find("<LocURI>")? + "<LocURI>".len();
    let end = text[start..].find("</LocURI>")? + start;
    let uri = text[start..end].trim();
    (!uri.is_empty()).then(|| uri.to_string())
}

/// `"<desc> (<id> via <transport> <transport_desc>)"`, computed once for
/// logging.
pub fn build_description(peer: &BTreeMap<String, String>) -> String {
    let mut buffer = String::new();
    if let Some(desc) = peer.get("description") {
        buffer.push_str(desc);
    }
    let id = peer.get("id");
    let transport = peer.get("transport");
    if id.is_some() || transport.is_some() {
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push('(');
        if let Some(id) = id {
            buffer.push_str(id);
            if transport.is_some() {
                buffer.push_str(" via ");
            }
        }
        if let Some(transport) = transport {
            buffer.push_str(transport);
            if let Some(trans_desc) = peer.get("transport_description") {
                buffer.push(' ');
                buffer.push_str(trans_desc);
            }
        }
        buffer.push(')');
    }
    buffer
}

pub struct Connection {
    /// Equal to the session id of the session this connection feeds.
    id: String,
    peer: BTreeMap<String, String>,
    must_authenticate: bool,
    description: String,

    state: Mutex<ConnectionState>,
    failure: Mutex<String>,
    session: Mutex<Option<Weak<Session>>>,
    /// Stored peer messages travel through here into the session's
    /// transport.
    inbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,

    reply_tx: broadcast::Sender<ReplySignal>,
    abort_tx: broadcast::Sender<()>,
    abort_sent: AtomicBool,

    /// Wait timeout from the peer config's `RetryDuration`; zero disables.
    wait_timeout: Mutex<Duration>,
    timeout_guard: Mutex<Option<CancellationToken>>,
}

impl Connection {
    pub fn new(
        id: &str,
        peer: BTreeMap<String, String>,
        must_authenticate: bool,
    ) -> Arc<Connection> {
        let (reply_tx, _) = broadcast::channel(32);
        let (abort_tx, _) = broadcast::channel(4);
        let description = build_description(&peer);
        Arc::new(Connection {
            id: id.to_string(),
            peer,
            must_authenticate,
            description,
            state: Mutex::new(ConnectionState::Setup),
            failure: Mutex::new(String::new()),
            session: Mutex::new(None),
            inbound: Mutex::new(None),
            reply_tx,
            abort_tx,
            abort_sent: AtomicBool::new(false),
            wait_timeout: Mutex::new(Duration::ZERO),
            timeout_guard: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn must_authenticate(&self) -> bool {
        self.must_authenticate
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn subscribe_reply(&self) -> broadcast::Receiver<ReplySignal> {
        self.reply_tx.subscribe()
    }

    pub fn subscribe_abort(&self) -> broadcast::Receiver<()> {
        self.abort_tx.subscribe()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// One-shot abort signal towards the peer.
    pub fn abort(&self) {
        if !self.abort_sent.swap(true, Ordering::SeqCst) {
            let _ = self.abort_tx.send(());
        }
    }

    fn failed(&self, reason: &str) {
        debug!(connection = %self.description, "connection failed: {reason}");
        let reason_class = if reason.starts_with("timeout") {
            "timeout"
        } else {
            "error"
        };
        crate::metrics::CONNECTION_FAILURES
            .with_label_values(&[reason_class])
            .inc();
        {
            let mut failure = self.failure.lock().unwrap();
            if failure.is_empty() {
                *failure = reason.to_string();
                if let Some(session) = self.session() {
                    session.set_connection_error(reason);
                }
            }
        }
        self.abort();
        *self.state.lock().unwrap() = ConnectionState::Failed;
        self.disarm_timeout();
    }

    fn disarm_timeout(&self) {
        if let Some(guard) = self.timeout_guard.lock().unwrap().take() {
            guard.cancel();
        }
    }

    fn arm_timeout(self: &Arc<Self>) {
        let timeout = *self.wait_timeout.lock().unwrap();
        if timeout.is_zero() {
            return;
        }
        let guard = CancellationToken::new();
        if let Some(old) = self
            .timeout_guard
            .lock()
            .unwrap()
            .replace(guard.clone())
        {
            old.cancel();
        }
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(connection) = this.upgrade() {
                        warn!(connection = %connection.description, "timeout while waiting for peer");
                        connection.failed("timeout, peer not responding");
                    }
                }
            }
        });
    }

    /// Wire a freshly created server-mode session to this connection. The
    /// session talks through a channel transport; outbound envelopes
    /// become `Reply` signals.
    fn attach_session(self: &Arc<Self>, session: &Arc<Session>) {
        let (to_session_tx, to_session_rx) = mpsc::unbounded_channel();
        let (from_session_tx, mut from_session_rx) = mpsc::unbounded_channel();
        session.inject_transport(Box::new(ChannelTransport::new(
            from_session_tx,
            to_session_rx,
        )));
        *self.inbound.lock().unwrap() = Some(to_session_tx);
        *self.session.lock().unwrap() = Some(Arc::downgrade(session));

        let this = Arc::downgrade(self);
        let session_id = session.session_id().to_string();
        tokio::spawn(async move {
            while let Some(envelope) = from_session_rx.recv().await {
                let Some(connection) = this.upgrade() else {
                    return;
                };
                connection.forward_reply(&session_id, envelope);
            }
            // the session dropped its transport: the exchange is complete
            if let Some(connection) = this.upgrade() {
                connection.send_final(&session_id);
            }
        });
    }

    fn forward_reply(self: &Arc<Self>, session_id: &str, envelope: Envelope) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Failed | ConnectionState::Done => return,
                _ => *state = ConnectionState::Waiting,
            }
        }
        self.arm_timeout();
        let _ = self.reply_tx.send(ReplySignal {
            data: envelope.data,
            content_type: envelope.content_type,
            meta: BTreeMap::new(),
            is_final: false,
            session_id: session_id.to_string(),
        });
    }

    fn send_final(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        match *state {
            ConnectionState::Failed | ConnectionState::Done => return,
            _ => *state = ConnectionState::Final,
        }
        drop(state);
        self.disarm_timeout();
        let _ = self.reply_tx.send(ReplySignal {
            data: Vec::new(),
            content_type: String::new(),
            meta: BTreeMap::new(),
            is_final: true,
            session_id: session_id.to_string(),
        });
    }

    /// In `SETUP`: decide which config the message belongs to.
    ///
    /// Returns `(config, server_mode, peer_device_id, server_alerted,
    /// alerted_mode)`.
    fn identify_peer(
        &self,
        host: &dyn ConnectionHost,
        message: &[u8],
        message_type: &str,
    ) -> Result<(String, bool, String, bool, String), ApiError> {
        // relaxed checking: ignore trailing parameters like "; charset=UTF-8"
        let base_type = message_type.split(';').next().unwrap_or(message_type).trim();

        if base_type == CONTENT_TYPE_HTTP_CONFIG {
            // test-only type: the payload *is* the config name
            let config = String::from_utf8(message.to_vec())
                .map_err(|_| ApiError::InvalidCall("malformed config name".to_string()))?;
            return Ok((config, false, String::new(), false, String::new()));
        }

        if base_type == CONTENT_TYPE_SAN {
            let san: SanPackage = serde_json::from_slice(message).map_err(|e| {
                ApiError::InvalidCall(format!("unparsable notification: {e}"))
            })?;

            // (a) exact server-ID match against configured sync URLs
            let mut config = String::new();
            for name in host.config_names() {
                let Ok(peer_config) = host.load_config(&name) else {
                    continue;
                };
                if peer_config.sync_urls().iter().any(|url| url == &san.server_id) {
                    config = name;
                    break;
                }
            }

            // (b) Bluetooth: match the peer's MAC against obex-bt URLs
            if config.is_empty() {
                if let (Some(transport), Some(id)) =
                    (self.peer.get("transport"), self.peer.get("id"))
                {
                    if transport == "org.openobex.obexd" {
                        let mac = id.split('+').next().unwrap_or(id);
                        'outer: for name in host.config_names() {
                            let Ok(peer_config) = host.load_config(&name) else {
                                continue;
                            };
                            for url in peer_config.sync_urls() {
                                let url = url.split('+').next().unwrap_or(&url);
                                if let Some(url_mac) = url.strip_prefix("obex-bt://") {
                                    if url_mac == mac {
                                        config = name;
                                        break 'outer;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            // (c) a config literally named like the server ID
            if config.is_empty() {
                let normalized = crate::sync_config::normalize_config_name(&san.server_id);
                if host.config_names().contains(&normalized) {
                    config = normalized;
                }
            }

            if config.is_empty() {
                config = format!(
                    "{}_{}",
                    san.server_id,
                    chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
                );
                debug!(
                    server_id = %san.server_id,
                    config = %config,
                    "unknown SAN server ID, minting config name"
                );
            }
            return Ok((config, false, String::new(), true, san.sync_mode));
        }

        if base_type == CONTENT_TYPE_SYNCML_XML
            || base_type == CONTENT_TYPE_SYNCML_WBXML
            || base_type == CONTENT_TYPE_LOOPBACK
        {
            // peek at the initial message to extract the peer device id
            let device_id = match Message::decode(message) {
                Ok(Message::Init(init)) => Some(init.device_id),
                _ => extract_loc_uri(message),
            }
            .ok_or_else(|| {
                ApiError::InvalidCall(
                    "could not extract LocURI=deviceID from initial message".to_string(),
                )
            })?;

            // first match wins; names sort so "foo" is found before
            // "foo.old"
            for name in host.config_names() {
                let Ok(peer_config) = host.load_config(&name) else {
                    continue;
                };
                if peer_config.remote_device_id() == device_id {
                    info!(device_id = %device_id, config = %name, "matched inbound sync");
                    return Ok((name, true, device_id, false, String::new()));
                }
            }
            return Err(ApiError::NoSuchConfig(format!(
                "no configuration found for peer device {device_id}"
            )));
        }

        Err(ApiError::InvalidCall(format!(
            "message type '{message_type}' not supported for starting a sync"
        )))
    }

    /// Feed one inbound message. The dispatch depends on the connection
    /// state; any error fails the connection permanently.
    pub fn process(
        self: &Arc<Self>,
        host: &dyn ConnectionHost,
        message: &[u8],
        message_type: &str,
    ) -> Result<(), ApiError> {
        let state = self.current_state();
        let result = self.process_inner(host, message, message_type);
        if let Err(err) = &result {
            // errors mid-exchange poison the connection; messages arriving
            // after the final reply are rejected without a state change
            match state {
                ConnectionState::Final | ConnectionState::Done | ConnectionState::Failed => {}
                _ => self.failed(&err.to_string()),
            }
        }
        result
    }

    fn process_inner(
        self: &Arc<Self>,
        host: &dyn ConnectionHost,
        message: &[u8],
        message_type: &str,
    ) -> Result<(), ApiError> {
        let state = self.current_state();
        match state {
            ConnectionState::Setup => {
                let (config, server_mode, peer_device_id, server_alerted, alerted_mode) =
                    self.identify_peer(host, message, message_type)?;

                *self.state.lock().unwrap() = ConnectionState::Processing;

                let session = host.create_session(&config, &peer_device_id)?;
                session.set_priority(Priority::CONNECTION);
                session.set_server_alerted(server_alerted);
                session.set_connection(&self.id);
                if server_mode {
                    session.init_server(message.to_vec(), message_type);
                }
                if server_alerted {
                    // peer asked us to start syncing with it
                    let mode = alerted_mode;
                    session.on_activate(move |session| {
                        if let Err(e) = session.sync(&mode, BTreeMap::new()) {
                            warn!("server-alerted sync could not start: {e}");
                        }
                    });
                }
                self.attach_session(&session);

                if let Ok(peer_config) = host.load_config(&config) {
                    *self.wait_timeout.lock().unwrap() = peer_config.retry_duration();
                }

                // preempt older sessions of the same peer; the new one is
                // enqueued afterwards and therefore survives
                if !peer_device_id.is_empty() {
                    let killed = host.kill_sessions(&peer_device_id);
                    if killed > 0 {
                        info!(device_id = %peer_device_id, killed, "preempted conflicting sessions");
                    }
                }
                host.enqueue(&session);
                Ok(())
            }
            ConnectionState::Waiting => {
                let sender = self.inbound.lock().unwrap().clone();
                let Some(sender) = sender else {
                    return Err(ApiError::InvalidCall(
                        "connection has no session".to_string(),
                    ));
                };
                sender
                    .send(Envelope {
                        data: message.to_vec(),
                        content_type: message_type.to_string(),
                    })
                    .map_err(|_| ApiError::TransportFailure("session gone".to_string()))?;
                *self.state.lock().unwrap() = ConnectionState::Processing;
                self.disarm_timeout();
                Ok(())
            }
            ConnectionState::Processing => Err(ApiError::InvalidCall(
                "protocol error: already processing a message".to_string(),
            )),
            ConnectionState::Final => Err(ApiError::InvalidCall(
                "protocol error: final reply sent, no further message processing possible"
                    .to_string(),
            )),
            ConnectionState::Done => Err(ApiError::InvalidCall(
                "protocol error: connection closed, no further message processing possible"
                    .to_string(),
            )),
            ConnectionState::Failed => {
                Err(ApiError::TransportFailure(self.failure.lock().unwrap().clone()))
            }
        }
    }

    /// Peer closed the connection. A normal close is only valid once the
    /// final reply went out.
    pub fn close(&self, normal: bool, error: &str) {
        if !normal || self.current_state() != ConnectionState::Final {
            let reason = if error.is_empty() {
                "connection closed unexpectedly"
            } else {
                error
            };
            self.failed(reason);
        } else {
            *self.state.lock().unwrap() = ConnectionState::Done;
            if let Some(session) = self.session() {
                session.set_connection_error("");
            }
        }
        self.disarm_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::info_req::InfoBroker;
    use crate::session::SessionServices;
    use crate::sync_config::ConfigTree;

    struct MockHost {
        tree: ConfigTree,
        services: SessionServices,
        created: Mutex<Vec<Arc<Session>>>,
        killed: Mutex<Vec<String>>,
    }

    impl MockHost {
        fn new(dir: &camino::Utf8Path) -> MockHost {
            let tree_path = dir.join("configs");
            MockHost {
                tree: ConfigTree::new(tree_path.clone()),
                services: SessionServices {
                    config_tree: Arc::new(ConfigTree::new(tree_path)),
                    backends: Arc::new(BackendRegistry::default()),
                    info: InfoBroker::default(),
                    presence: crate::presence::PresenceMonitor::new(),
                    revision_granularity: Duration::ZERO,
                },
                created: Mutex::new(Vec::new()),
                killed: Mutex::new(Vec::new()),
            }
        }

        fn seed(&self, name: &str, device_id: &str) {
            let mut config = PeerConfig::default();
            config
                .peer
                .insert("remoteDeviceId".into(), device_id.into());
            config
                .peer
                .insert("syncURL".into(), format!("http://{name}/sync"));
            self.tree.save(name, &config).unwrap();
        }
    }

    impl ConnectionHost for MockHost {
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
            let session = Session::create(
                self.services.clone(),
                peer_device_id,
                config,
                &format!("test-{}", self.created.lock().unwrap().len() + 1),
                vec![],
            );
            self.created.lock().unwrap().push(session.clone());
            Ok(session)
        }

        fn kill_sessions(&self, peer_device_id: &str) -> usize {
            self.killed.lock().unwrap().push(peer_device_id.to_string());
            0
        }

        fn enqueue(&self, _session: &Arc<Session>) {}
    }

    fn init_message(device_id: &str) -> Vec<u8> {
        Message::Init(crate::engine::loopback::InitRequest {
            session_id: "s1".to_string(),
            device_id: device_id.to_string(),
            sources: vec![],
        })
        .encode()
    }

    #[tokio::test]
    async fn http_config_type_picks_config_by_payload() {
        let dir = camino_tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        host.seed("myphone", "dev-1");

        let connection = Connection::new("c1", BTreeMap::new(), false);
        connection
            .process(&host, b"myphone", CONTENT_TYPE_HTTP_CONFIG)
            .unwrap();
        assert_eq!(connection.current_state(), ConnectionState::Processing);
        let created = host.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].config_name(), "myphone");
    }

    #[tokio::test]
    async fn initial_sync_message_matches_remote_device_id() {
        let dir = camino_tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        host.seed("myphone", "dev-1");
        host.seed("otherphone", "dev-2");

        let connection = Connection::new("c1", BTreeMap::new(), false);
        connection
            .process(&host, &init_message("dev-2"), CONTENT_TYPE_LOOPBACK)
            .unwrap();
        let created = host.created.lock().unwrap();
        assert_eq!(created[0].config_name(), "otherphone");
        assert_eq!(created[0].peer_device_id(), "dev-2");
        assert!(created[0].is_server_mode());
        // conflicting sessions for the same device were preempted
        assert_eq!(*host.killed.lock().unwrap(), vec!["dev-2".to_string()]);
    }

    #[tokio::test]
    async fn unknown_device_fails_the_connection() {
        let dir = camino_tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());
        host.seed("myphone", "dev-1");

        let connection = Connection::new("c1", BTreeMap::new(), false);
        let err = connection
            .process(&host, &init_message("stranger"), CONTENT_TYPE_LOOPBACK)
            .unwrap_err();
        assert!(matches!(err, ApiError::NoSuchConfig(_)));
        assert_eq!(connection.current_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn san_mints_config_when_nothing_matches() {
        let dir = camino_tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());

        let connection = Connection::new("c1", BTreeMap::new(), false);
        connection
            .process(
                &host,
                br#"{"server_id": "pc-suite"}"#,
                CONTENT_TYPE_SAN,
            )
            .unwrap();
        let created = host.created.lock().unwrap();
        assert!(created[0].config_name().starts_with("pc-suite_"));
    }

    #[tokio::test]
    async fn process_in_final_fails_without_state_change() {
        let dir = camino_tempfile::tempdir().unwrap();
        let host = MockHost::new(dir.path());

        let connection = Connection::new("c1", BTreeMap::new(), false);
        *connection.state.lock().unwrap() = ConnectionState::Final;
        let err = connection
            .process(&host, b"x", CONTENT_TYPE_LOOPBACK)
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCall(_)));
        assert_eq!(connection.current_state(), ConnectionState::Final);
        // repeating the mistake keeps failing the same way
        assert!(connection.process(&host, b"x", CONTENT_TYPE_LOOPBACK).is_err());
        assert_eq!(connection.current_state(), ConnectionState::Final);
    }

    #[tokio::test]
    async fn close_in_final_is_a_normal_shutdown() {
        let dir = camino_tempfile::tempdir().unwrap();
        let _host = MockHost::new(dir.path());

        let connection = Connection::new("c1", BTreeMap::new(), false);
        *connection.state.lock().unwrap() = ConnectionState::Final;
        connection.close(true, "");
        assert_eq!(connection.current_state(), ConnectionState::Done);

        let connection = Connection::new("c2", BTreeMap::new(), false);
        connection.close(true, "");
        assert_eq!(connection.current_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn abort_signal_is_one_shot() {
        let connection = Connection::new("c1", BTreeMap::new(), false);
        let mut rx = connection.subscribe_abort();
        connection.abort();
        connection.abort();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn description_has_the_documented_shape() {
        let mut peer = BTreeMap::new();
        peer.insert("description".to_string(), "Nokia N900".to_string());
        peer.insert("id".to_string(), "00:11:22:33:44:55".to_string());
        peer.insert("transport".to_string(), "org.openobex.obexd".to_string());
        peer.insert("transport_description".to_string(), "obex".to_string());
        assert_eq!(
            build_description(&peer),
            "Nokia N900 (00:11:22:33:44:55 via org.openobex.obexd obex)"
        );
    }

    #[test]
    fn loc_uri_extraction() {
        let msg = b"<SyncML><SyncHdr><Source><LocURI>IMEI:1234</LocURI></Source></SyncHdr></SyncML>";
        assert_eq!(extract_loc_uri(msg), Some("IMEI:1234".to_string()));
        assert_eq!(extract_loc_uri(b"<SyncML/>"), None);
    }
}
