//! Tool discovery and invocation layered over any [`McpTransport`].

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::protocol::MCP_METHOD_NOT_FOUND;
use crate::mcp::transport::{build_transport, McpTransport, McpTransportKind};

mod operations;

pub use operations::{extract_output, ToolCallOutcome};

/// Upper bound on `tools/list` pages fetched in one discovery pass.
pub const MAX_TOOL_PAGES: usize = 20;

pub const TOOLS_LIST_METHOD: &str = "tools/list";
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// A validated entry from `tools/list`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Returns `None` for entries without a usable name.
    pub fn from_value(value: &Value) -> Option<Self> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())?
            .to_string();
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input_schema = normalize_input_schema(value.get("inputSchema"));
        Some(Self {
            name,
            description,
            input_schema,
        })
    }
}

/// Coerces a tool's input schema into an object schema with an object
/// `properties` member. `required` survives only as an array of strings.
/// Other keys are kept as-is.
pub fn normalize_input_schema(schema: Option<&Value>) -> Value {
    let mut schema = match schema {
        Some(Value::Object(object)) => object.clone(),
        _ => Map::new(),
    };
    schema.insert("type".to_string(), Value::String("object".to_string()));

    if !matches!(schema.get("properties"), Some(Value::Object(_))) {
        schema.insert("properties".to_string(), Value::Object(Map::new()));
    }

    match schema.remove("required") {
        Some(Value::Array(required)) => {
            let required: Vec<Value> = required
                .into_iter()
                .filter(|entry| entry.is_string())
                .collect();
            if !required.is_empty() {
                schema.insert("required".to_string(), Value::Array(required));
            }
        }
        Some(_) | None => {}
    }

    Value::Object(schema)
}

fn next_cursor(result: &Value) -> Option<String> {
    result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string)
}

/// Walks `tools/list` pages through `fetch` until the cursor runs out or
/// [`MAX_TOOL_PAGES`] pages have been read.
pub async fn collect_tool_pages<F, Fut>(mut fetch: F) -> Result<Vec<ToolDescriptor>, McpError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Value, McpError>>,
{
    let mut tools = Vec::new();
    let mut cursor = None;

    for page in 1..=MAX_TOOL_PAGES {
        let result = fetch(cursor.take()).await?;
        let entries = result
            .get("tools")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let before = tools.len();
        tools.extend(entries.iter().filter_map(ToolDescriptor::from_value));
        let dropped = entries.len() - (tools.len() - before);
        if dropped > 0 {
            debug!(page, dropped, "Dropped MCP tools without a name");
        }

        cursor = next_cursor(&result);
        if cursor.is_none() {
            break;
        }
        if page == MAX_TOOL_PAGES {
            debug!(pages = MAX_TOOL_PAGES, "Stopping MCP tool discovery at the page limit");
        }
    }

    Ok(tools)
}

/// One server's connection plus its discovered tools.
pub struct McpClient {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    tools: Mutex<Vec<ToolDescriptor>>,
}

impl McpClient {
    pub fn new(server_id: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            server_id: server_id.into(),
            transport,
            tools: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &McpServerConfig,
        http_client: &reqwest::Client,
    ) -> Result<Self, McpError> {
        Ok(Self::new(config.id.clone(), build_transport(config, http_client)?))
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn transport_kind(&self) -> McpTransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.transport.stderr_tail()
    }

    pub async fn start(&self) -> Result<(), McpError> {
        self.transport.start().await
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    pub fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the cached tools unless the cache is empty or `force_refresh`
    /// is set, in which case the server is asked again.
    pub async fn list_tools(&self, force_refresh: bool) -> Result<Vec<ToolDescriptor>, McpError> {
        if !force_refresh {
            let cached = self.cached_tools();
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        self.start().await?;
        let transport = Arc::clone(&self.transport);
        let listed = collect_tool_pages(|cursor| {
            let transport = Arc::clone(&transport);
            async move {
                let params = cursor.map(|cursor| json!({ "cursor": cursor }));
                transport.request(TOOLS_LIST_METHOD, params).await
            }
        })
        .await;

        let tools = match listed {
            Ok(tools) => tools,
            Err(McpError::Rpc {
                code: Some(MCP_METHOD_NOT_FOUND),
                ..
            }) => {
                debug!(server_id = %self.server_id, "MCP server does not support tools/list");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        debug!(server_id = %self.server_id, count = tools.len(), "Listed MCP tools");
        *self.tools.lock().unwrap_or_else(PoisonError::into_inner) = tools.clone();
        Ok(tools)
    }

    /// Invokes a tool. Server-reported failures (`isError` or a JSON-RPC error)
    /// come back as [`ToolCallOutcome::Failed`]; only transport problems are `Err`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome, McpError> {
        self.start().await?;
        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Ok(ToolCallOutcome::Failed(format!(
                    "Tool arguments must be a JSON object, got {other}"
                )))
            }
        };
        let params = json!({ "name": name, "arguments": arguments });
        debug!(server_id = %self.server_id, tool = %name, "Calling MCP tool");

        match self.transport.request(TOOLS_CALL_METHOD, Some(params)).await {
            Ok(result) => Ok(ToolCallOutcome::from_result(&result)),
            Err(err) if err.is_rpc() => Ok(ToolCallOutcome::Failed(err.to_string())),
            Err(err) => Err(err),
        }
    }
}
