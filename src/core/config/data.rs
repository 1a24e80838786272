use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::defaults::{
    DEFAULT_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS,
};
use crate::mcp::transport::McpTransportKind;

/// One named MCP server as supplied by external settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// `stdio`, `sse`, or `streamable-http`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Per-request timeout; clamped to 1s..=120s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl McpServerConfig {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: Some("stdio".to_string()),
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn http(id: impl Into<String>, transport: &str, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: Some(transport.to_string()),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(clamp_timeout_ms(self.timeout_ms))
    }

    /// The comparison form used to decide whether a reconfiguration is material.
    pub fn normalized(&self) -> NormalizedServerConfig {
        NormalizedServerConfig {
            id: self.id.trim().to_string(),
            transport: McpTransportKind::from_config(self).map_err(|err| err.to_string()),
            command: non_blank(self.command.as_deref()),
            args: self
                .args
                .iter()
                .flatten()
                .map(|arg| arg.to_string())
                .collect(),
            env: sorted(self.env.as_ref()),
            cwd: self.cwd.clone().filter(|cwd| !cwd.as_os_str().is_empty()),
            url: non_blank(self.url.as_deref()),
            headers: sorted(self.headers.as_ref()),
            enabled: self.is_enabled(),
            timeout_ms: clamp_timeout_ms(self.timeout_ms),
        }
    }
}

/// Trimmed, defaulted, order-independent view of a [`McpServerConfig`].
/// Display-only fields are excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedServerConfig {
    pub id: String,
    pub transport: Result<McpTransportKind, String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub timeout_ms: u64,
}

pub fn clamp_timeout_ms(timeout_ms: Option<u64>) -> u64 {
    timeout_ms
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)
        .clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn sorted(map: Option<&HashMap<String, String>>) -> BTreeMap<String, String> {
    map.into_iter()
        .flatten()
        .map(|(key, value)| (key.trim().to_string(), value.clone()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// MCP servers, keyed by their `id`
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

/// Server ids are compared exactly after trimming, the same rule the manager
/// applies when it keys runtimes.
fn same_server_id(left: &str, right: &str) -> bool {
    left.trim() == right.trim()
}

impl Config {
    /// Adds a server, replacing any existing entry with the same id.
    pub fn upsert_mcp_server(&mut self, server: McpServerConfig) {
        match self
            .mcp_servers
            .iter_mut()
            .find(|existing| same_server_id(&existing.id, &server.id))
        {
            Some(existing) => *existing = server,
            None => self.mcp_servers.push(server),
        }
    }

    pub fn remove_mcp_server(&mut self, id: &str) {
        self.mcp_servers
            .retain(|server| !same_server_id(&server.id, id));
    }

    pub fn get_mcp_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| same_server_id(&server.id, id))
    }
}
