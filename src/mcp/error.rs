//! Error types shared by the MCP transports, client, and manager.

use thiserror::Error;

/// Errors produced while talking to an MCP server.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server configuration is missing a required field or is otherwise unusable.
    #[error("{0}")]
    Config(String),

    /// The child process for a stdio server could not be spawned.
    #[error("failed to spawn MCP server '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The `initialize` handshake did not complete.
    #[error("MCP initialize failed: {0}")]
    Handshake(String),

    /// An HTTP exchange returned a non-success status.
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    /// I/O or network failure below the JSON-RPC layer.
    #[error("MCP transport error: {0}")]
    Transport(String),

    /// The server answered with a JSON-RPC error object.
    #[error("{message}")]
    Rpc { code: Option<i64>, message: String },

    /// No matching response arrived before the request deadline. `stderr`
    /// holds whatever a stdio server printed, if anything.
    #[error("MCP request '{method}' timed out after {timeout_ms}ms{}", stderr_suffix(stderr))]
    Timeout {
        method: String,
        timeout_ms: u64,
        stderr: String,
    },

    /// A response body could not be interpreted.
    #[error("malformed MCP response: {0}")]
    MalformedResponse(String),

    /// The HTTP response used a content type the transport cannot parse.
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),

    /// The stdio server process terminated.
    #[error("{}", format_exit(*code, *signal, stderr))]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    /// The inbound event stream ended or failed.
    #[error("MCP event stream disconnected: {0}")]
    Disconnected(String),

    /// The transport was stopped while the request was in flight.
    #[error("MCP server stopped")]
    Stopped,

    /// A request was attempted before the transport was started.
    #[error("MCP client not connected.")]
    NotConnected,

    /// An alias did not resolve to any known tool.
    #[error("unknown MCP tool: '{0}'")]
    UnknownTool(String),
}

impl McpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// True for errors returned by the server itself rather than the transport.
    pub fn is_rpc(&self) -> bool {
        matches!(self, McpError::Rpc { .. })
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

fn format_exit(code: Option<i32>, signal: Option<i32>, stderr: &str) -> String {
    let code = code.map_or_else(|| "none".to_string(), |code| code.to_string());
    let signal = signal.map_or_else(|| "none".to_string(), |signal| signal.to_string());
    format!(
        "MCP server process exited (code: {code}, signal: {signal}){}",
        stderr_suffix(stderr)
    )
}

/// Renders captured server stderr as a trailing block, or nothing when empty.
pub(crate) fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("\nstderr:\n{}", stderr.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_exit_message_embeds_code_and_stderr() {
        let err = McpError::ProcessExited {
            code: Some(3),
            signal: None,
            stderr: "boom\n".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("code: 3"));
        assert!(message.contains("signal: none"));
        assert!(message.ends_with("stderr:\nboom"));
    }

    #[test]
    fn timeout_is_distinguishable() {
        let err = McpError::Timeout {
            method: "tools/list".to_string(),
            timeout_ms: 1000,
            stderr: String::new(),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
        assert!(!McpError::Stopped.is_timeout());
    }

    #[test]
    fn timeout_message_carries_server_stderr() {
        let err = McpError::Timeout {
            method: "initialize".to_string(),
            timeout_ms: 1000,
            stderr: "loading index\n".to_string(),
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "MCP request 'initialize' timed out after 1000ms\nstderr:\nloading index"
        );
    }
}
