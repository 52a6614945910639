//! Object-model surface for IPC bindings.
//!
//! The wire binding itself (D-Bus or otherwise) is provided by the front
//! end; this module maps its object vocabulary — object paths, method
//! names, signal shapes — onto the scheduler, sessions and connections.
//! Every method here corresponds to one method of the published interface.

use std::collections::BTreeMap;
use std::sync::Arc;

use sync_api::models::{ConfigDict, Database, SyncReport};
use sync_api::ApiError;

use crate::connection::Connection;
use crate::info_req::InfoMap;
use crate::server::Server;
use crate::session::Session;

pub const SESSION_PATH_PREFIX: &str = "/org/syncevolution/Session/";
pub const CONNECTION_PATH_PREFIX: &str = "/org/syncevolution/Connection/";

pub fn session_path(session: &Session) -> String {
    format!("{SESSION_PATH_PREFIX}{}", session.session_id())
}

pub fn connection_path(connection: &Connection) -> String {
    format!("{CONNECTION_PATH_PREFIX}{}", connection.id())
}

/// The server object as exposed to clients.
pub struct Bus {
    server: Arc<Server>,
}

impl Bus {
    pub fn new(server: Arc<Server>) -> Bus {
        Bus { server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    // ---- Server object

    pub fn get_capabilities(&self) -> Vec<String> {
        self.server.get_capabilities()
    }

    pub fn get_versions(&self) -> BTreeMap<String, String> {
        self.server.get_versions()
    }

    pub fn attach(&self, caller: &str) {
        self.server.attach_client(caller);
    }

    pub fn detach(&self, caller: &str) {
        self.server.detach_client(caller);
    }

    pub fn enable_notifications(&self, caller: &str) -> Result<(), ApiError> {
        self.server.set_notifications(caller, true)
    }

    pub fn disable_notifications(&self, caller: &str) -> Result<(), ApiError> {
        self.server.set_notifications(caller, false)
    }

    /// `NotificationAction`: the user clicked a notification; bring up a
    /// session for its config. The UI itself is out of scope, the hook is
    /// kept so front ends can route the action.
    pub fn notification_action(&self) {
        tracing::debug!("notification action received");
    }

    pub fn connect(
        &self,
        caller: &str,
        peer: BTreeMap<String, String>,
        must_authenticate: bool,
        session: &str,
    ) -> Result<String, ApiError> {
        self.server.attach_client(caller);
        let connection = self.server.connect(peer, must_authenticate, session)?;
        Ok(connection_path(&connection))
    }

    pub fn start_session(&self, caller: &str, config: &str) -> Result<String, ApiError> {
        self.start_session_with_flags(caller, config, vec![])
    }

    pub fn start_session_with_flags(
        &self,
        caller: &str,
        config: &str,
        flags: Vec<String>,
    ) -> Result<String, ApiError> {
        self.server.attach_client(caller);
        let session = self.server.start_session(config, flags)?;
        session.attach();
        Ok(session_path(&session))
    }

    pub fn get_configs(&self, templates: bool) -> Vec<String> {
        self.server.get_configs(templates)
    }

    pub fn get_config(&self, name: &str, template: bool) -> Result<ConfigDict, ApiError> {
        self.server.get_config(name, template)
    }

    pub fn get_reports(
        &self,
        name: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<SyncReport>, ApiError> {
        self.server.get_reports(name, start, count)
    }

    pub fn check_source(&self, config: &str, source: &str) -> Result<(), ApiError> {
        self.server.check_source(config, source)
    }

    pub fn get_databases(&self, config: &str, source: &str) -> Result<Vec<Database>, ApiError> {
        self.server.get_databases(config, source)
    }

    pub fn check_presence(&self, peer: &str) -> Result<(String, Vec<String>), ApiError> {
        self.server.check_presence(peer)
    }

    pub fn get_sessions(&self) -> Vec<String> {
        self.server
            .get_sessions()
            .iter()
            .map(|s| session_path(s))
            .collect()
    }

    pub fn info_response(&self, caller: &str, id: &str, state: &str, response: &InfoMap) {
        self.server.info_response(caller, id, state, response);
    }

    // ---- object resolution for the per-instance interfaces

    pub fn resolve_session(&self, path: &str) -> Result<Arc<Session>, ApiError> {
        path.strip_prefix(SESSION_PATH_PREFIX)
            .and_then(|id| self.server.get_session(id))
            .ok_or_else(|| ApiError::InvalidCall(format!("unknown session '{path}'")))
    }

    pub fn resolve_connection(&self, path: &str) -> Result<Arc<Connection>, ApiError> {
        path.strip_prefix(CONNECTION_PATH_PREFIX)
            .and_then(|id| self.server.get_connection(id))
            .ok_or_else(|| ApiError::InvalidCall(format!("unknown connection '{path}'")))
    }

    // ---- Connection object

    pub fn connection_process(
        &self,
        path: &str,
        message: &[u8],
        message_type: &str,
    ) -> Result<(), ApiError> {
        let connection = self.resolve_connection(path)?;
        connection.process(self.server.as_ref(), message, message_type)
    }

    pub fn connection_close(&self, path: &str, normal: bool, error: &str) -> Result<(), ApiError> {
        let connection = self.resolve_connection(path)?;
        connection.close(normal, error);
        self.server
            .remove_connection(connection.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::server::ServerOptions;
    use crate::sync_config::{ConfigTree, PeerConfig};
    use std::time::Duration;

    fn bus(dir: &camino::Utf8Path) -> Bus {
        let server = Server::new(
            ServerOptions {
                revision_granularity: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(ConfigTree::new(dir.join("configs"))),
            Arc::new(BackendRegistry::default()),
        );
        let mut config = PeerConfig::default();
        config.peer.insert("syncURL".into(), "http://peer".into());
        config
            .sources
            .entry("addressbook".into())
            .or_default()
            .insert("type".into(), "memory:text/vcard:3.0".into());
        server.config_tree().save("peer", &config).unwrap();
        Bus::new(server)
    }

    #[tokio::test]
    async fn capability_tokens_are_declared() {
        let dir = camino_tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let caps = bus.get_capabilities();
        for token in [
            "ConfigChanged",
            "GetConfigName",
            "Notifications",
            "Version",
            "SessionFlags",
            "SessionAttach",
            "DatabaseProperties",
        ] {
            assert!(caps.iter().any(|c| c == token), "missing {token}");
        }
    }

    #[tokio::test]
    async fn session_paths_resolve_back() {
        let dir = camino_tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let path = bus.start_session(":1.1", "peer").unwrap();
        assert!(path.starts_with(SESSION_PATH_PREFIX));
        let session = bus.resolve_session(&path).unwrap();
        assert_eq!(session.config_name(), "peer");
        assert!(bus.resolve_session("/org/syncevolution/Session/nope").is_err());
    }

    #[tokio::test]
    async fn check_source_and_databases() {
        let dir = camino_tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.check_source("peer", "addressbook").unwrap();
        let err = bus.check_source("peer", "calendar").unwrap_err();
        assert!(matches!(err, ApiError::NoSuchSource { .. }));

        let databases = bus.get_databases("peer", "addressbook").unwrap();
        assert_eq!(databases.len(), 1);
        assert!(databases[0].is_default);
    }
}
