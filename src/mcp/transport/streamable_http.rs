//! Streamable HTTP transport: every client message is its own POST, and the
//! response body carries the matching reply either as JSON or as an event
//! stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use serde_json::Value;
use tracing::{debug, warn};

use super::event_stream::{scan_event_stream, SseEvent};
use super::handshake;
use super::http::{
    apply_streamable_http_client_post_headers, apply_streamable_http_protocol_version_header,
    header_map, is_event_stream_content_type, is_json_content_type, require_http_url,
    response_media_type, MCP_SESSION_ID_HEADER,
};
use super::pending::PendingRequests;
use super::{McpTransport, McpTransportKind, RpcChannel};
use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    encode_notification, encode_request, reply_to_server_request, IncomingMessage,
    JsonRpcNotification, JsonRpcRequest,
};

#[derive(Debug, Default, Clone)]
struct SessionState {
    session_id: Option<String>,
    protocol_version: Option<String>,
}

type ServerRequest = (Value, String);

pub struct StreamableHttpTransport {
    server_id: String,
    url: Url,
    client: reqwest::Client,
    headers: HeaderMap,
    timeout: Duration,
    pending: Arc<PendingRequests>,
    session: Mutex<SessionState>,
    lifecycle: tokio::sync::Mutex<()>,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn from_config(config: &McpServerConfig, client: reqwest::Client) -> Result<Self, McpError> {
        let url = require_http_url(config)?;
        let headers = header_map(config.headers.as_ref())?;
        Ok(Self {
            server_id: config.id.clone(),
            url,
            client,
            headers,
            timeout: config.request_timeout(),
            pending: PendingRequests::new(),
            session: Mutex::new(SessionState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
        })
    }

    fn session(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session().session_id.clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.session().protocol_version.clone()
    }

    async fn post(&self, payload: Vec<u8>) -> Result<reqwest::Response, McpError> {
        let state = self.session().clone();
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone());
        request = apply_streamable_http_client_post_headers(request);
        request = apply_streamable_http_protocol_version_header(
            request,
            Some(
                state
                    .protocol_version
                    .as_deref()
                    .unwrap_or(LATEST_PROTOCOL_VERSION),
            ),
        );
        if let Some(session_id) = state.session_id.as_deref() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }

        let response = request.body(payload).send().await?;
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            self.session().session_id = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::NOT_FOUND && state.session_id.is_some() {
                debug!(server_id = %self.server_id, "MCP session expired");
                self.session().session_id = None;
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(McpError::Http {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Routes one inbound message. Returns true when it answered `expected`.
    fn route(
        &self,
        message: IncomingMessage,
        expected: u64,
        server_requests: &mut Vec<ServerRequest>,
    ) -> bool {
        match message {
            IncomingMessage::Request { id, method, .. } => {
                server_requests.push((id, method));
                false
            }
            IncomingMessage::Notification { method, .. } => {
                debug!(server_id = %self.server_id, method = %method, "Received MCP HTTP notification");
                false
            }
            IncomingMessage::Error { id: None, error } => {
                // An id-less error in a per-request body can only be about that request.
                self.pending.resolve(expected, Err(error.into_error()));
                true
            }
            response => {
                let matched = response.response_id() == Some(expected);
                if let Some((id, outcome)) = response.into_outcome() {
                    self.pending.resolve(id, outcome);
                }
                matched
            }
        }
    }

    async fn answer(&self, server_requests: Vec<ServerRequest>) {
        for (id, method) in server_requests {
            debug!(server_id = %self.server_id, method = %method, "Received MCP HTTP request");
            let sent = match reply_to_server_request(id, &method) {
                Ok(reply) => self.post(reply).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                warn!(server_id = %self.server_id, error = %err, "Failed to answer MCP server request");
            }
        }
    }

    /// POSTs a request and resolves its pending entry from the response body.
    async fn exchange(&self, payload: Vec<u8>, id: u64) -> Result<(), McpError> {
        let response = self.post(payload).await?;
        let content_type = response_media_type(&response);
        let mut server_requests = Vec::new();

        let answered = if is_json_content_type(&content_type) {
            let body = response.bytes().await?;
            let mut answered = false;
            for message in IncomingMessage::parse_batch(&body)? {
                answered |= self.route(message, id, &mut server_requests);
            }
            answered
        } else if is_event_stream_content_type(&content_type) {
            scan_event_stream(response, |event: &SseEvent| {
                let messages = IncomingMessage::parse_batch(event.data.as_bytes()).ok()?;
                let mut answered = false;
                for message in messages {
                    answered |= self.route(message, id, &mut server_requests);
                }
                answered.then_some(())
            })
            .await?
            .is_some()
        } else {
            let content_type = if content_type.is_empty() {
                "missing".to_string()
            } else {
                content_type
            };
            return Err(McpError::UnsupportedContentType(content_type));
        };

        self.answer(server_requests).await;
        if answered {
            Ok(())
        } else {
            Err(McpError::MalformedResponse(format!(
                "response body did not answer request {id}"
            )))
        }
    }
}

#[async_trait]
impl RpcChannel for StreamableHttpTransport {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let response = self.pending.register(method);
        let id = response.id();
        let payload = encode_request(&JsonRpcRequest::new(id, method, params))?;

        let wait = response.wait(self.timeout);
        tokio::pin!(wait);
        tokio::select! {
            result = &mut wait => return result,
            exchanged = self.exchange(payload, id) => {
                if let Err(err) = exchanged {
                    self.pending.resolve(id, Err(err));
                }
            }
        }
        wait.await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let payload = encode_notification(&JsonRpcNotification::new(method, params))?;
        self.post(payload).await.map(|_| ())
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::StreamableHttp
    }

    async fn start(&self) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        *self.session() = SessionState::default();

        let result = handshake::initialize(self, &self.server_id).await?;
        self.session().protocol_version = Some(result.protocol_version);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        let rejected = self.pending.reject_all(|| McpError::Stopped);
        debug!(server_id = %self.server_id, rejected, "Stopping MCP HTTP transport");
        *self.session() = SessionState::default();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }
        self.call(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }
        RpcChannel::notify(self, method, params).await
    }
}
