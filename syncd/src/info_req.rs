//! Out-of-band information requests.
//!
//! When a session needs something only a user can provide (typically a
//! password the keyring did not have), it asks the scheduler to mint an
//! info request. The request id is broadcast to clients; whichever client
//! answers first becomes the request's handler. The requester waits with a
//! timeout.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

pub type InfoMap = BTreeMap<String, String>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle as shown to clients: a fresh request, one a client has begun
/// to work on, and a finished one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoState {
    Request,
    Waiting,
    Done,
}

impl InfoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfoState::Request => "request",
            InfoState::Waiting => "waiting",
            InfoState::Done => "done",
        }
    }
}

/// Signal payload emitted when a request is created or changes state.
#[derive(Debug, Clone)]
pub struct InfoRequestSignal {
    pub id: String,
    pub session: String,
    pub state: &'static str,
    pub handler: String,
    pub req_type: String,
    pub parameters: InfoMap,
}

struct PendingRequest {
    session: String,
    req_type: String,
    parameters: InfoMap,
    state: InfoState,
    handler: String,
    tx: Option<oneshot::Sender<InfoMap>>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: u64,
    pending: BTreeMap<String, PendingRequest>,
}

/// Mints request ids, routes responses back, and feeds the signal stream.
#[derive(Clone)]
pub struct InfoBroker {
    inner: Arc<Mutex<BrokerInner>>,
    signals: tokio::sync::broadcast::Sender<InfoRequestSignal>,
}

impl Default for InfoBroker {
    fn default() -> Self {
        let (signals, _) = tokio::sync::broadcast::channel(64);
        InfoBroker {
            inner: Arc::default(),
            signals,
        }
    }
}

/// The requester's side of one pending request.
pub struct InfoReqHandle {
    pub id: String,
    rx: oneshot::Receiver<InfoMap>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InfoReqError {
    Timeout,
    Cancelled,
}

impl InfoReqHandle {
    /// Wait for the response or give up after `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<InfoMap, InfoReqError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(InfoReqError::Cancelled),
            Err(_) => Err(InfoReqError::Timeout),
        }
    }
}

impl InfoBroker {
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<InfoRequestSignal> {
        self.signals.subscribe()
    }

    /// Create a request and broadcast it.
    pub fn create(
        &self,
        req_type: &str,
        parameters: InfoMap,
        session: &str,
    ) -> InfoReqHandle {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = inner.next_id.to_string();
            inner.pending.insert(
                id.clone(),
                PendingRequest {
                    session: session.to_string(),
                    req_type: req_type.to_string(),
                    parameters: parameters.clone(),
                    state: InfoState::Request,
                    handler: String::new(),
                    tx: Some(tx),
                },
            );
            id
        };
        let _ = self.signals.send(InfoRequestSignal {
            id: id.clone(),
            session: session.to_string(),
            state: InfoState::Request.as_str(),
            handler: String::new(),
            req_type: req_type.to_string(),
            parameters,
        });
        InfoReqHandle { id, rx }
    }

    /// Client response routing. Unknown ids are ignored, matching the
    /// tolerant behavior clients rely on.
    pub fn respond(&self, caller: &str, id: &str, state: &str, response: &InfoMap) {
        let signal = {
            let mut inner = self.inner.lock().unwrap();
            let Some(request) = inner.pending.get_mut(id) else {
                debug!(id, "response for unknown info request ignored");
                return;
            };
            match state {
                "working" => {
                    request.state = InfoState::Waiting;
                    request.handler = caller.to_string();
                }
                "response" => {
                    request.state = InfoState::Done;
                    request.handler = caller.to_string();
                    if let Some(tx) = request.tx.take() {
                        let _ = tx.send(response.clone());
                    }
                }
                _ => {
                    debug!(id, state, "unknown info response state ignored");
                    return;
                }
            }
            InfoRequestSignal {
                id: id.to_string(),
                session: request.session.clone(),
                state: request.state.as_str(),
                handler: request.handler.clone(),
                req_type: request.req_type.clone(),
                parameters: request.parameters.clone(),
            }
        };
        let _ = self.signals.send(signal);
        if state == "response" {
            self.remove(id);
        }
    }

    /// Drop a request, e.g. after a timeout.
    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().pending.remove(id);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_reaches_requester() {
        let broker = InfoBroker::default();
        let handle = broker.create("password", InfoMap::new(), "session-1");
        let id = handle.id.clone();

        let broker2 = broker.clone();
        tokio::spawn(async move {
            let mut response = InfoMap::new();
            response.insert("password".into(), "hunter2".into());
            broker2.respond(":1.42", &id, "response", &response);
        });

        let response = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response["password"], "hunter2");
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires() {
        let broker = InfoBroker::default();
        let handle = broker.create("password", InfoMap::new(), "session-1");
        let id = handle.id.clone();
        let result = handle.wait(DEFAULT_TIMEOUT).await;
        assert_eq!(result.unwrap_err(), InfoReqError::Timeout);
        broker.remove(&id);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_ignored() {
        let broker = InfoBroker::default();
        broker.respond(":1.1", "999", "response", &InfoMap::new());
        assert_eq!(broker.pending_count(), 0);
    }
}
