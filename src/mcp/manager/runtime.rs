use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::core::config::{McpServerConfig, NormalizedServerConfig};
use crate::mcp::client::{McpClient, ToolDescriptor};
use crate::mcp::transport::{require_endpoint, McpTransportKind};

pub const SERVER_DISABLED_MESSAGE: &str = "Server is disabled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Disabled,
    Disconnected,
    Connecting,
    Connected,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Disabled => "disabled",
            RuntimeState::Disconnected => "disconnected",
            RuntimeState::Connecting => "connecting",
            RuntimeState::Connected => "connected",
        }
    }

    fn initial(config: &McpServerConfig) -> Self {
        if config.is_enabled() {
            RuntimeState::Disconnected
        } else {
            RuntimeState::Disabled
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one server for callers outside the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub transport: String,
    pub enabled: bool,
    pub state: RuntimeState,
    pub connected: bool,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stderr_tail: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    pub alias: String,
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: Value,
}

/// Per-server state owned by the manager.
///
/// `generation` moves forward every time the configuration is replaced so an
/// in-flight connect that finishes afterwards can tell its result is stale.
pub(crate) struct ServerRuntime {
    config: McpServerConfig,
    normalized: NormalizedServerConfig,
    pub(crate) state: RuntimeState,
    pub(crate) client: Option<Arc<McpClient>>,
    pub(crate) tools: Vec<ToolDescriptor>,
    pub(crate) last_error: Option<String>,
    generation: u64,
}

impl ServerRuntime {
    pub(crate) fn new(config: McpServerConfig) -> Self {
        Self {
            state: RuntimeState::initial(&config),
            normalized: config.normalized(),
            config,
            client: None,
            tools: Vec::new(),
            last_error: None,
            generation: 0,
        }
    }

    pub(crate) fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    pub(crate) fn same_config(&self, config: &McpServerConfig) -> bool {
        self.normalized == config.normalized()
    }

    /// Installs a new configuration and returns the client it made obsolete.
    pub(crate) fn replace_config(&mut self, config: McpServerConfig) -> Option<Arc<McpClient>> {
        self.state = RuntimeState::initial(&config);
        self.normalized = config.normalized();
        self.config = config;
        self.tools.clear();
        self.last_error = None;
        self.generation += 1;
        self.client.take()
    }

    /// The reason this server cannot be contacted right now, if any.
    pub(crate) fn unavailable_reason(&self) -> Option<String> {
        if !self.is_enabled() {
            return Some(SERVER_DISABLED_MESSAGE.to_string());
        }
        require_endpoint(&self.config).err().map(|err| err.to_string())
    }

    pub(crate) fn mark_unavailable(&mut self, reason: String) {
        self.state = if self.is_enabled() {
            RuntimeState::Disconnected
        } else {
            RuntimeState::Disabled
        };
        self.tools.clear();
        self.last_error = Some(reason);
    }

    pub(crate) fn mark_connected(&mut self, tools: Vec<ToolDescriptor>) {
        self.state = RuntimeState::Connected;
        self.tools = tools;
        self.last_error = None;
    }

    /// Records a failure and detaches `failed` if it is still the live client.
    pub(crate) fn mark_failed(
        &mut self,
        failed: &Arc<McpClient>,
        message: String,
    ) -> Option<Arc<McpClient>> {
        self.state = RuntimeState::Disconnected;
        self.tools.clear();
        self.last_error = Some(message);
        match &self.client {
            Some(current) if Arc::ptr_eq(current, failed) => self.client.take(),
            _ => None,
        }
    }

    pub(crate) fn transport_label(&self) -> String {
        match McpTransportKind::from_config(&self.config) {
            Ok(kind) => kind.as_str().to_string(),
            Err(_) => self
                .config
                .transport
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }

    pub(crate) fn status(&self) -> ServerStatus {
        let connected = self.state == RuntimeState::Connected
            && self.client.as_ref().is_some_and(|client| client.is_connected());
        ServerStatus {
            id: self.config.id.clone(),
            transport: self.transport_label(),
            enabled: self.is_enabled(),
            state: self.state,
            connected,
            tool_count: self.tools.len(),
            last_error: self.last_error.clone(),
            stderr_tail: self
                .client
                .as_ref()
                .map(|client| client.stderr_tail())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::test_support::MockTransport;

    #[test]
    fn initial_state_follows_enabled_flag() {
        let runtime = ServerRuntime::new(McpServerConfig::stdio("alpha", "echo-mcp"));
        assert_eq!(runtime.state, RuntimeState::Disconnected);
        assert!(runtime.unavailable_reason().is_none());

        let mut disabled = McpServerConfig::stdio("beta", "echo-mcp");
        disabled.enabled = Some(false);
        let runtime = ServerRuntime::new(disabled);
        assert_eq!(runtime.state, RuntimeState::Disabled);
        assert_eq!(
            runtime.unavailable_reason().as_deref(),
            Some(SERVER_DISABLED_MESSAGE)
        );
    }

    #[test]
    fn missing_url_is_reported_as_unavailable() {
        let runtime = ServerRuntime::new(McpServerConfig {
            id: "remote".to_string(),
            transport: Some("sse".to_string()),
            ..McpServerConfig::default()
        });
        assert_eq!(
            runtime.unavailable_reason().as_deref(),
            Some("MCP url is required for HTTP transports.")
        );
        assert_eq!(runtime.transport_label(), "sse");
    }

    #[test]
    fn replacing_config_bumps_generation_and_detaches_client() {
        let mut runtime = ServerRuntime::new(McpServerConfig::stdio("alpha", "echo-mcp"));
        runtime.client = Some(Arc::new(McpClient::new("alpha", MockTransport::with_tools(&[]))));
        runtime.last_error = Some("old".to_string());

        let detached = runtime.replace_config(McpServerConfig::stdio("alpha", "other-mcp"));
        assert!(detached.is_some());
        assert!(runtime.client.is_none());
        assert!(runtime.last_error.is_none());
        assert_eq!(runtime.generation(), 1);
        assert!(runtime.same_config(&McpServerConfig::stdio("alpha", "other-mcp")));
    }

    #[test]
    fn failure_only_detaches_the_matching_client() {
        let mut runtime = ServerRuntime::new(McpServerConfig::stdio("alpha", "echo-mcp"));
        let live = Arc::new(McpClient::new("alpha", MockTransport::with_tools(&[])));
        let stale = Arc::new(McpClient::new("alpha", MockTransport::with_tools(&[])));
        runtime.client = Some(Arc::clone(&live));

        assert!(runtime.mark_failed(&stale, "boom".to_string()).is_none());
        assert!(runtime.client.is_some());
        assert!(runtime.mark_failed(&live, "boom".to_string()).is_some());
        assert_eq!(runtime.state, RuntimeState::Disconnected);
        assert_eq!(runtime.status().last_error.as_deref(), Some("boom"));
    }
}
