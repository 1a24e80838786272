use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Builds the client shared by every HTTP-based transport of one manager.
///
/// No overall request timeout is set: SSE connections are long-lived and each
/// JSON-RPC request carries its own deadline.
pub fn build_mcp_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Transport(format!("Failed to build HTTP client: {err}")))
}

pub fn require_http_url(config: &McpServerConfig) -> Result<reqwest::Url, McpError> {
    let url = config
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| McpError::Config("MCP url is required for HTTP transports.".to_string()))?;
    reqwest::Url::parse(url)
        .map_err(|err| McpError::Config(format!("Invalid MCP url '{url}': {err}")))
}

/// Converts configured headers into a header map, rejecting invalid names or values.
pub fn header_map(headers: Option<&HashMap<String, String>>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    let Some(headers) = headers else {
        return Ok(map);
    };
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|err| McpError::Config(format!("Invalid header name '{name}': {err}")))?;
        let header_value = HeaderValue::from_str(value.trim())
            .map_err(|err| McpError::Config(format!("Invalid value for header '{name}': {err}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

pub fn apply_streamable_http_client_post_headers(
    request: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_streamable_http_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

/// The media type of a response, lower-cased and stripped of parameters.
pub fn response_media_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(media_type)
        .unwrap_or_default()
}

pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    media_type(content_type) == MCP_EVENT_STREAM_CONTENT_TYPE
}

pub fn is_json_content_type(content_type: &str) -> bool {
    let media_type = media_type(content_type);
    media_type == MCP_JSON_CONTENT_TYPE || media_type.ends_with("+json")
}
