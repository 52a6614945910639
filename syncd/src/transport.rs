//! Transport agents: the message pump between a running session's engine
//! and the peer.
//!
//! `send()` never blocks; the caller then polls [`TransportAgent::wait`]
//! until a reply arrived, the peer closed, the timeout fired or the
//! transport failed. Cancellation is cooperative through
//! [`TransportAgent::cancel`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CONTENT_TYPE_SYNCML_XML: &str = "application/vnd.syncml+xml";
pub const CONTENT_TYPE_SYNCML_WBXML: &str = "application/vnd.syncml+wbxml";
pub const CONTENT_TYPE_SAN: &str = "application/vnd.syncml.notification";
/// Test-only type whose payload *is* the config name.
pub const CONTENT_TYPE_HTTP_CONFIG: &str = "HTTP Config";
/// Framing used by the in-process engine.
pub const CONTENT_TYPE_LOOPBACK: &str = "application/x-syncd+json";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failure(String),

    #[error("no message to send on this transport state")]
    BadState,
}

/// Outcome of one [`TransportAgent::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A reply message is available via `get_reply()`.
    GotReply,
    /// Nothing happened yet; call `wait` again.
    Active,
    /// Transport went inactive without a reply.
    Inactive,
    /// The peer closed the channel normally.
    Closed,
    /// Timeout or wire-level failure.
    Failed,
}

/// Message pump contract between engine and wire.
#[async_trait]
pub trait TransportAgent: Send {
    fn set_url(&mut self, url: &str);

    fn set_content_type(&mut self, content_type: &str);

    /// Hard cap on each `wait` interval.
    fn set_timeout(&mut self, timeout: Duration);

    /// Hand a message to the transport; returns immediately.
    fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Block cooperatively until a reply, closure, failure or timeout.
    async fn wait(&mut self, expect_reply: bool) -> WaitResult;

    /// Valid only immediately after `wait` returned [`WaitResult::GotReply`].
    fn get_reply(&mut self) -> Option<(Vec<u8>, String)>;

    fn cancel(&mut self);

    async fn shutdown(&mut self);
}

/// HTTP transport: POST each message, the response body is the reply.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    content_type: String,
    timeout: Duration,
    cancel: CancellationToken,
    state: HttpState,
}

enum HttpState {
    Idle,
    /// Request in flight.
    Waiting(tokio::task::JoinHandle<Result<(Vec<u8>, String), String>>),
    Reply(Vec<u8>, String),
    Closed,
}

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            url: String::new(),
            content_type: CONTENT_TYPE_SYNCML_XML.to_string(),
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
            state: HttpState::Idle,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAgent for HttpTransport {
    fn set_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client.clone();
        let url = self.url.clone();
        let content_type = self.content_type.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            // wire-level hiccups get a couple of resends before the session
            // sees a transport failure
            let result = utils::backoff::retry(
                || {
                    let request = client
                        .post(url.as_str())
                        .header("Content-Type", content_type.clone())
                        .body(data.clone());
                    async move {
                        let response = request.send().await.map_err(|e| e.to_string())?;
                        let response = response.error_for_status().map_err(|e| e.to_string())?;
                        let reply_type = response
                            .headers()
                            .get("Content-Type")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let body = response.bytes().await.map_err(|e| e.to_string())?;
                        Ok((body.to_vec(), reply_type))
                    }
                },
                |_| false,
                1,
                2,
                "posting sync message",
                &cancel,
            )
            .await;
            result.unwrap_or_else(|| Err("cancelled".to_string()))
        });
        self.state = HttpState::Waiting(handle);
        Ok(())
    }

    async fn wait(&mut self, expect_reply: bool) -> WaitResult {
        let mut handle = match std::mem::replace(&mut self.state, HttpState::Idle) {
            HttpState::Waiting(handle) => handle,
            other @ HttpState::Reply(..) => {
                self.state = other;
                return WaitResult::GotReply;
            }
            HttpState::Closed => {
                self.state = HttpState::Closed;
                return WaitResult::Closed;
            }
            HttpState::Idle => return WaitResult::Inactive,
        };

        let (state, result) = tokio::select! {
            _ = self.cancel.cancelled() => {
                handle.abort();
                (HttpState::Closed, WaitResult::Failed)
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(url = %self.url, "HTTP request timed out");
                handle.abort();
                (HttpState::Closed, WaitResult::Failed)
            }
            joined = &mut handle => match joined {
                Ok(Ok((body, content_type))) => {
                    if expect_reply {
                        (HttpState::Reply(body, content_type), WaitResult::GotReply)
                    } else {
                        (HttpState::Idle, WaitResult::Inactive)
                    }
                }
                Ok(Err(err)) => {
                    warn!(url = %self.url, %err, "HTTP request failed");
                    (HttpState::Closed, WaitResult::Failed)
                }
                Err(_) => (HttpState::Closed, WaitResult::Failed),
            }
        };
        self.state = state;
        result
    }

    fn get_reply(&mut self) -> Option<(Vec<u8>, String)> {
        match std::mem::replace(&mut self.state, HttpState::Idle) {
            HttpState::Reply(body, content_type) => Some((body, content_type)),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.state = HttpState::Closed;
    }
}

/// A message as it travels through a [`ChannelTransport`].
#[derive(Debug, Clone)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Transport over a pair of in-process channels.
///
/// Server-mode sessions use this to talk to their hosting connection (the
/// connection pushes stored peer messages into `incoming` and forwards
/// `outgoing` to the wire); tests use pairs of them as a fake network.
pub struct ChannelTransport {
    outgoing: mpsc::UnboundedSender<Envelope>,
    incoming: mpsc::UnboundedReceiver<Envelope>,
    content_type: String,
    timeout: Duration,
    cancel: CancellationToken,
    reply: Option<Envelope>,
    url: String,
}

impl ChannelTransport {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Envelope>,
        incoming: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        ChannelTransport {
            outgoing,
            incoming,
            content_type: CONTENT_TYPE_LOOPBACK.to_string(),
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
            reply: None,
            url: String::new(),
        }
    }

    /// A connected pair: what one side sends the other receives.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            ChannelTransport::new(tx_a, rx_b),
            ChannelTransport::new(tx_b, rx_a),
        )
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl TransportAgent for ChannelTransport {
    fn set_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.outgoing
            .send(Envelope {
                data,
                content_type: self.content_type.clone(),
            })
            .map_err(|_| TransportError::Failure("peer endpoint gone".to_string()))
    }

    async fn wait(&mut self, expect_reply: bool) -> WaitResult {
        if self.reply.is_some() {
            return WaitResult::GotReply;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("transport wait cancelled");
                WaitResult::Failed
            }
            _ = tokio::time::sleep(self.timeout) => WaitResult::Failed,
            received = self.incoming.recv() => match received {
                Some(envelope) => {
                    if expect_reply {
                        self.reply = Some(envelope);
                        WaitResult::GotReply
                    } else {
                        WaitResult::Inactive
                    }
                }
                None => WaitResult::Closed,
            }
        }
    }

    fn get_reply(&mut self) -> Option<(Vec<u8>, String)> {
        self.reply.take().map(|e| (e.data, e.content_type))
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.incoming.close();
    }
}
