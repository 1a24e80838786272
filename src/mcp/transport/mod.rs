//! Shared MCP transport abstractions.
//!
//! Implementations normalize protocol differences across stdio, SSE, and
//! streamable HTTP so higher-level code can preserve common state invariants.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;

pub mod event_stream;
pub mod handshake;
pub mod http;
pub mod pending;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

#[cfg(test)]
pub(crate) mod test_support;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::Sse`] for servers pairing an SSE stream with POSTs.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpTransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl McpTransportKind {
    /// Resolves the transport from config. Without an explicit transport, a
    /// configured command means stdio and anything else streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = config
            .transport
            .as_deref()
            .map(str::trim)
            .filter(|transport| !transport.is_empty())
            .map(str::to_ascii_lowercase);
        let Some(transport) = transport else {
            let has_command = config
                .command
                .as_deref()
                .is_some_and(|command| !command.trim().is_empty());
            return Ok(if has_command {
                McpTransportKind::Stdio
            } else {
                McpTransportKind::StreamableHttp
            });
        };
        match transport.as_str() {
            "streamable-http" | "streamable_http" | "http" => Ok(McpTransportKind::StreamableHttp),
            "sse" => Ok(McpTransportKind::Sse),
            "stdio" => Ok(McpTransportKind::Stdio),
            other => Err(McpError::Config(format!(
                "Unsupported MCP transport: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransportKind::Stdio => "stdio",
            McpTransportKind::Sse => "sse",
            McpTransportKind::StreamableHttp => "streamable-http",
        }
    }
}

impl std::fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
/// Transport contract required by discovery and tool invocation.
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> McpTransportKind;

    /// Connects and performs the `initialize` handshake. Calling it again while
    /// connected is a no-op.
    async fn start(&self) -> Result<(), McpError>;

    /// Rejects all in-flight requests and releases OS resources.
    async fn stop(&self);

    fn is_connected(&self) -> bool;

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Recent diagnostic output, when the transport has any.
    fn stderr_tail(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A connected request/notification channel. Each transport implements this
/// for its live session so the handshake can run before the transport is
/// marked started.
#[async_trait]
pub(crate) trait RpcChannel: Send + Sync {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;
}

/// Checks that the transport-appropriate endpoint is configured.
pub fn require_endpoint(config: &McpServerConfig) -> Result<McpTransportKind, McpError> {
    let kind = McpTransportKind::from_config(config)?;
    match kind {
        McpTransportKind::Stdio => {
            stdio::require_stdio_command(config)?;
        }
        McpTransportKind::Sse | McpTransportKind::StreamableHttp => {
            http::require_http_url(config)?;
        }
    }
    Ok(kind)
}

/// Builds the transport for a server configuration.
pub fn build_transport(
    config: &McpServerConfig,
    http_client: &reqwest::Client,
) -> Result<Arc<dyn McpTransport>, McpError> {
    let transport: Arc<dyn McpTransport> = match require_endpoint(config)? {
        McpTransportKind::Stdio => Arc::new(StdioTransport::from_config(config)?),
        McpTransportKind::Sse => Arc::new(SseTransport::from_config(config, http_client.clone())?),
        McpTransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::from_config(
            config,
            http_client.clone(),
        )?),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_aliases_and_defaults() {
        let mut config = McpServerConfig::stdio("alpha", "cmd");
        assert_eq!(
            McpTransportKind::from_config(&config).ok(),
            Some(McpTransportKind::Stdio)
        );

        config.transport = None;
        assert_eq!(
            McpTransportKind::from_config(&config).ok(),
            Some(McpTransportKind::Stdio)
        );

        config.command = None;
        assert_eq!(
            McpTransportKind::from_config(&config).ok(),
            Some(McpTransportKind::StreamableHttp)
        );

        for (raw, kind) in [
            ("SSE", McpTransportKind::Sse),
            ("streamable_http", McpTransportKind::StreamableHttp),
            ("http", McpTransportKind::StreamableHttp),
        ] {
            config.transport = Some(raw.to_string());
            assert_eq!(McpTransportKind::from_config(&config).ok(), Some(kind));
        }

        config.transport = Some("carrier-pigeon".to_string());
        let err = McpTransportKind::from_config(&config).expect_err("unknown transport");
        assert_eq!(err.to_string(), "Unsupported MCP transport: carrier-pigeon");
    }

    #[test]
    fn require_endpoint_reports_missing_fields() {
        let stdio = McpServerConfig {
            command: Some("  ".to_string()),
            ..McpServerConfig::stdio("alpha", "x")
        };
        assert_eq!(
            require_endpoint(&stdio).expect_err("blank command").to_string(),
            "MCP command is required for stdio transport."
        );

        let sse = McpServerConfig {
            url: None,
            ..McpServerConfig::http("beta", "sse", "")
        };
        assert_eq!(
            require_endpoint(&sse).expect_err("missing url").to_string(),
            "MCP url is required for HTTP transports."
        );

        let ok = McpServerConfig::http("gamma", "sse", "http://127.0.0.1:1/sse");
        assert_eq!(require_endpoint(&ok).ok(), Some(McpTransportKind::Sse));
    }
}
