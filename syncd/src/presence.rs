//! Transport presence tracking.
//!
//! For each transport kind the monitor holds whether it is available and
//! the monotonic instant it most recently came up (`None` = offline).
//! OS-level providers (ConnMan/NetworkManager-style network state, a
//! Bluetooth manager) push edges in; with no network provider registered
//! HTTP is assumed up. Bluetooth is always assumed up, since the managers
//! cannot report it reliably.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use sync_api::models::TransportKind;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::info;

use crate::sync_config::PeerConfig;

/// Peer reachability as reported through `CheckPresence`. The empty string
/// means "might work", matching what clients historically parse.
pub const STATUS_MIGHT_WORK: &str = "";
pub const STATUS_NO_TRANSPORT: &str = "no transport";

/// One availability edge.
#[derive(Debug, Clone)]
pub struct PresenceEdge {
    pub kind: TransportKind,
    pub available: bool,
}

#[derive(Default)]
struct MonitorState {
    /// Set while available; value is when the transport came up.
    since: BTreeMap<TransportKind, Instant>,
    /// At least one network provider has identified itself.
    has_network_provider: bool,
}

/// Process-wide presence state with edge signals.
#[derive(Clone)]
pub struct PresenceMonitor {
    state: Arc<Mutex<MonitorState>>,
    edges: broadcast::Sender<PresenceEdge>,
}

impl Default for PresenceMonitor {
    fn default() -> Self {
        let (edges, _) = broadcast::channel(32);
        let monitor = PresenceMonitor {
            state: Arc::default(),
            edges,
        };
        // No provider yet: assume both transports are up. A network
        // provider replacing that assumption announces itself first.
        monitor.update(TransportKind::Http, true);
        monitor.update(TransportKind::Bluetooth, true);
        monitor
    }
}

impl PresenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEdge> {
        self.edges.subscribe()
    }

    /// A network-state provider is attached; stop assuming HTTP is up and
    /// let the provider's updates drive it.
    pub fn register_network_provider(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.has_network_provider {
            state.has_network_provider = true;
            state.since.remove(&TransportKind::Http);
        }
    }

    /// Record an availability update; emits a signal only on edges.
    pub fn update(&self, kind: TransportKind, available: bool) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let was = state.since.contains_key(&kind);
            if available && !was {
                state.since.insert(kind, Instant::now());
                true
            } else if !available && was {
                state.since.remove(&kind);
                true
            } else {
                false
            }
        };
        if changed {
            info!(?kind, available, "transport presence changed");
            let kind_label = kind.to_string();
            crate::metrics::PRESENCE_EDGES
                .with_label_values(&[&kind_label, if available { "up" } else { "down" }])
                .inc();
            let _ = self.edges.send(PresenceEdge { kind, available });
        }
    }

    pub fn is_available(&self, kind: TransportKind) -> bool {
        match kind {
            // anything that is neither HTTP nor Bluetooth is assumed usable
            TransportKind::Other => true,
            _ => self.state.lock().unwrap().since.contains_key(&kind),
        }
    }

    /// When the transport most recently became available.
    pub fn available_since(&self, kind: TransportKind) -> Option<Instant> {
        self.state.lock().unwrap().since.get(&kind).copied()
    }

    /// Whether a URL's transport is up and has been up for at least
    /// `delay`.
    pub fn url_usable(&self, url: &str, delay: std::time::Duration) -> bool {
        match TransportKind::of_url(url) {
            TransportKind::Other => true,
            kind => match self.available_since(kind) {
                None => false,
                Some(since) => delay.is_zero() || since + delay <= Instant::now(),
            },
        }
    }

    /// `CheckPresence`: overall status plus the currently usable URLs, in
    /// configured order. The per-peer `autoSyncDelay` is *not* applied
    /// here; clients only ask whether a sync could work right now.
    pub fn check_presence(&self, config: &PeerConfig) -> (String, Vec<String>) {
        let urls: Vec<String> = config
            .sync_urls()
            .into_iter()
            .filter(|url| match TransportKind::of_url(url) {
                TransportKind::Other => true,
                kind => self.is_available(kind),
            })
            .collect();
        if urls.is_empty() {
            (STATUS_NO_TRANSPORT.to_string(), urls)
        } else {
            (STATUS_MIGHT_WORK.to_string(), urls)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn defaults_assume_everything_up() {
        let monitor = PresenceMonitor::new();
        assert!(monitor.is_available(TransportKind::Http));
        assert!(monitor.is_available(TransportKind::Bluetooth));
        assert!(monitor.is_available(TransportKind::Other));
    }

    #[tokio::test]
    async fn network_provider_takes_over_http() {
        let monitor = PresenceMonitor::new();
        monitor.register_network_provider();
        assert!(!monitor.is_available(TransportKind::Http));
        // but Bluetooth assumption stays
        assert!(monitor.is_available(TransportKind::Bluetooth));

        monitor.update(TransportKind::Http, true);
        assert!(monitor.is_available(TransportKind::Http));
    }

    #[tokio::test]
    async fn edges_fire_only_on_changes() {
        let monitor = PresenceMonitor::new();
        monitor.register_network_provider();
        let mut rx = monitor.subscribe();

        monitor.update(TransportKind::Http, true);
        monitor.update(TransportKind::Http, true);
        monitor.update(TransportKind::Http, false);

        let edge = rx.try_recv().unwrap();
        assert!(edge.available);
        let edge = rx.try_recv().unwrap();
        assert!(!edge.available);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn url_usable_honors_delay() {
        let monitor = PresenceMonitor::new();
        monitor.register_network_provider();
        monitor.update(TransportKind::Http, true);

        let delay = Duration::from_secs(30);
        assert!(!monitor.url_usable("http://peer", delay));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.url_usable("http://peer", delay));
        assert!(monitor.url_usable("http://peer", Duration::ZERO));
    }

    #[tokio::test]
    async fn check_presence_reports_usable_urls() {
        let monitor = PresenceMonitor::new();
        monitor.register_network_provider();

        let mut config = PeerConfig::default();
        config.peer.insert(
            "syncURL".into(),
            "http://peer/sync obex-bt://00:11:22:33:44:55".into(),
        );

        let (status, urls) = monitor.check_presence(&config);
        assert_eq!(status, STATUS_MIGHT_WORK);
        assert_eq!(urls, vec!["obex-bt://00:11:22:33:44:55".to_string()]);

        monitor.update(TransportKind::Bluetooth, false);
        let (status, urls) = monitor.check_presence(&config);
        assert_eq!(status, STATUS_NO_TRANSPORT);
        assert!(urls.is_empty());
    }
}
