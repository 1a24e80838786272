//! Legacy SSE transport: one long-lived GET event stream carries server
//! messages, and client messages are POSTed to the endpoint the stream
//! announces.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::event_stream::{scan_event_stream, SseEvent, SseEventParser};
use super::handshake;
use super::http::{
    header_map, is_event_stream_content_type, is_json_content_type, require_http_url,
    response_media_type, MCP_EVENT_STREAM_CONTENT_TYPE, MCP_JSON_AND_SSE_ACCEPT,
    MCP_JSON_CONTENT_TYPE,
};
use super::pending::PendingRequests;
use super::{McpTransport, McpTransportKind, RpcChannel};
use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    encode_notification, encode_request, reply_to_server_request, IncomingMessage,
    JsonRpcNotification, JsonRpcRequest,
};

/// How long `start()` waits for an `endpoint` event before posting to the
/// stream URL itself.
pub const ENDPOINT_WAIT: Duration = Duration::from_millis(1500);

/// State shared between the stream reader and the POST side.
struct SseShared {
    server_id: String,
    client: reqwest::Client,
    headers: HeaderMap,
    pending: Arc<PendingRequests>,
}

impl SseShared {
    /// Resolves responses and answers server requests carried by `payload`.
    fn dispatch(self: &Arc<Self>, payload: &[u8], reply_to: &Url) {
        let messages = match IncomingMessage::parse_batch(payload) {
            Ok(messages) => messages,
            Err(err) => {
                debug!(server_id = %self.server_id, error = %err, "Ignoring non-JSON SSE message");
                return;
            }
        };
        for message in messages {
            match message {
                IncomingMessage::Request { id, method, .. } => {
                    debug!(server_id = %self.server_id, method = %method, "Received MCP SSE request");
                    let shared = Arc::clone(self);
                    let url = reply_to.clone();
                    tokio::spawn(async move {
                        let sent = match reply_to_server_request(id, &method) {
                            Ok(reply) => shared.post(&url, reply).await.map(|_| ()),
                            Err(err) => Err(err),
                        };
                        if let Err(err) = sent {
                            warn!(server_id = %shared.server_id, error = %err, "Failed to answer MCP server request");
                        }
                    });
                }
                IncomingMessage::Notification { method, .. } => {
                    debug!(server_id = %self.server_id, method = %method, "Received MCP SSE notification");
                }
                IncomingMessage::Error { id: None, error } => {
                    warn!(server_id = %self.server_id, error = %error.format(), "Received MCP error without id");
                }
                response => {
                    if let Some((id, outcome)) = response.into_outcome() {
                        self.pending.resolve(id, outcome);
                    }
                }
            }
        }
    }

    async fn post(&self, url: &Url, payload: Vec<u8>) -> Result<reqwest::Response, McpError> {
        let response = self
            .client
            .post(url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, MCP_JSON_CONTENT_TYPE)
            .header(ACCEPT, MCP_JSON_AND_SSE_ACCEPT)
            .body(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Http {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

/// The POST side of a live session. The target follows the most recent
/// `endpoint` event and falls back to the stream URL until one arrives.
struct SseChannel {
    shared: Arc<SseShared>,
    stream_url: Url,
    endpoint: watch::Receiver<Option<Url>>,
    stream_open: Arc<AtomicBool>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl SseChannel {
    fn target(&self) -> Url {
        self.endpoint
            .borrow()
            .clone()
            .unwrap_or_else(|| self.stream_url.clone())
    }

    /// POSTs a message. Servers usually answer with 202 and deliver the result
    /// on the stream, but some answer inline; both are handled.
    async fn send(&self, payload: Vec<u8>) -> Result<(), McpError> {
        let target = self.target();
        let response = self.shared.post(&target, payload).await?;
        let content_type = response_media_type(&response);
        if is_json_content_type(&content_type) {
            let body = response.bytes().await?;
            if !body.iter().all(u8::is_ascii_whitespace) {
                self.shared.dispatch(&body, &target);
            }
        } else if is_event_stream_content_type(&content_type) {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let scan = scan_event_stream(response, |event: &SseEvent| {
                    shared.dispatch(event.data.as_bytes(), &target);
                    None::<()>
                });
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(server_id = %shared.server_id, "Dropping inline MCP event stream");
                    }
                    scanned = scan => {
                        if let Err(err) = scanned {
                            debug!(server_id = %shared.server_id, error = %err, "Inline MCP event stream failed");
                        }
                    }
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for SseChannel {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let response = self.shared.pending.register(method);
        // The reader flips the flag before rejecting, so a request registered
        // after the stream closed is caught here.
        if !self.stream_open.load(Ordering::SeqCst) {
            return Err(McpError::Disconnected("stream ended".to_string()));
        }
        let payload = encode_request(&JsonRpcRequest::new(response.id(), method, params))?;
        self.send(payload).await?;
        response.wait(self.timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let payload = encode_notification(&JsonRpcNotification::new(method, params))?;
        self.send(payload).await
    }
}

struct SseSession {
    channel: Arc<SseChannel>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl SseSession {
    fn shutdown(self) {
        self.cancel.cancel();
        self.reader.abort();
    }
}

pub struct SseTransport {
    url: Url,
    timeout: Duration,
    shared: Arc<SseShared>,
    session: Mutex<Option<SseSession>>,
    generation: Arc<AtomicU64>,
    stream_open: Arc<AtomicBool>,
    ready: AtomicBool,
}

impl SseTransport {
    pub fn from_config(config: &McpServerConfig, client: reqwest::Client) -> Result<Self, McpError> {
        let url = require_http_url(config)?;
        let headers = header_map(config.headers.as_ref())?;
        Ok(Self {
            url,
            timeout: config.request_timeout(),
            shared: Arc::new(SseShared {
                server_id: config.id.clone(),
                client,
                headers,
                pending: PendingRequests::new(),
            }),
            session: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            stream_open: Arc::new(AtomicBool::new(false)),
            ready: AtomicBool::new(false),
        })
    }

    async fn open_stream(&self) -> Result<reqwest::Response, McpError> {
        let response = self
            .shared
            .client
            .get(self.url.clone())
            .headers(self.shared.headers.clone())
            .header(ACCEPT, MCP_EVENT_STREAM_CONTENT_TYPE)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Http {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn spawn_reader(
        &self,
        response: reqwest::Response,
        endpoint_tx: watch::Sender<Option<Url>>,
        cancel: CancellationToken,
        generation: u64,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let base = self.url.clone();
        let current_generation = Arc::clone(&self.generation);
        let stream_open = Arc::clone(&self.stream_open);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseEventParser::default();
            let reason = loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    None => break "stream ended".to_string(),
                    Some(Err(err)) => break err.to_string(),
                    Some(Ok(bytes)) => {
                        for event in parser.push(&bytes) {
                            handle_stream_event(&shared, &event, &base, &endpoint_tx);
                        }
                    }
                }
            };
            for event in parser.finish() {
                handle_stream_event(&shared, &event, &base, &endpoint_tx);
            }

            if current_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            stream_open.store(false, Ordering::SeqCst);
            let rejected = shared
                .pending
                .reject_all(|| McpError::Disconnected(reason.clone()));
            warn!(
                server_id = %shared.server_id,
                reason = %reason,
                rejected,
                "MCP SSE stream closed"
            );
        })
    }

    async fn current_channel(&self) -> Result<Arc<SseChannel>, McpError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| Arc::clone(&session.channel))
            .ok_or(McpError::NotConnected)
    }
}

fn handle_stream_event(
    shared: &Arc<SseShared>,
    event: &SseEvent,
    base: &Url,
    endpoint_tx: &watch::Sender<Option<Url>>,
) {
    if event.is_endpoint() {
        match base.join(event.data.trim()) {
            Ok(endpoint) => {
                debug!(server_id = %shared.server_id, endpoint = %endpoint, "MCP SSE endpoint announced");
                endpoint_tx.send_replace(Some(endpoint));
            }
            Err(err) => {
                warn!(server_id = %shared.server_id, error = %err, "Ignoring invalid MCP SSE endpoint");
            }
        }
        return;
    }
    let reply_to = endpoint_tx.borrow().clone().unwrap_or_else(|| base.clone());
    shared.dispatch(event.data.as_bytes(), &reply_to);
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Sse
    }

    async fn start(&self) -> Result<(), McpError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.shutdown();
        }
        self.ready.store(false, Ordering::SeqCst);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let response = self.open_stream().await?;
        self.stream_open.store(true, Ordering::SeqCst);

        let (endpoint_tx, mut endpoint_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let reader = self.spawn_reader(response, endpoint_tx, cancel.clone(), generation);

        let announced = tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx.wait_for(Option::is_some))
            .await
            .is_ok_and(|waited| waited.is_ok());
        if !announced {
            debug!(
                server_id = %self.shared.server_id,
                "No MCP SSE endpoint event yet; posting to the stream URL"
            );
        }

        let session = SseSession {
            channel: Arc::new(SseChannel {
                shared: Arc::clone(&self.shared),
                stream_url: self.url.clone(),
                endpoint: endpoint_rx,
                stream_open: Arc::clone(&self.stream_open),
                cancel: cancel.clone(),
                timeout: self.timeout,
            }),
            cancel,
            reader,
        };

        let handshake = handshake::initialize(session.channel.as_ref(), &self.shared.server_id).await;
        match handshake {
            Ok(_) if self.stream_open.load(Ordering::SeqCst) => {
                *slot = Some(session);
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(_) => {
                session.shutdown();
                Err(McpError::Disconnected("stream ended".to_string()))
            }
            Err(err) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.stream_open.store(false, Ordering::SeqCst);
                session.shutdown();
                Err(err)
            }
        }
    }

    async fn stop(&self) {
        let mut slot = self.session.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.stream_open.store(false, Ordering::SeqCst);
        let rejected = self.shared.pending.reject_all(|| McpError::Stopped);
        if let Some(session) = slot.take() {
            debug!(server_id = %self.shared.server_id, rejected, "Closing MCP SSE stream");
            session.shutdown();
        }
    }

    fn is_connected(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.stream_open.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let channel = self.current_channel().await?;
        channel.call(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let channel = self.current_channel().await?;
        RpcChannel::notify(channel.as_ref(), method, params).await
    }
}
