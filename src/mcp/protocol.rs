//! JSON-RPC 2.0 envelope codec.
//!
//! Outbound messages are built from typed structs; inbound payloads are
//! classified exactly once into [`IncomingMessage`] so transports never have to
//! re-inspect raw JSON after dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::McpError;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

const UNKNOWN_ERROR_MESSAGE: &str = "Unknown MCP error";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// The `error` member of a JSON-RPC response. Every field is optional because
/// misbehaving servers routinely omit them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: Some(message.into()),
            data: None,
        }
    }

    /// Human-readable rendering: `<message> (<code>) data=<json>`.
    pub fn format(&self) -> String {
        let mut output = self
            .message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .unwrap_or(UNKNOWN_ERROR_MESSAGE)
            .to_string();
        if let Some(code) = self.code {
            output.push_str(&format!(" ({code})"));
        }
        if let Some(data) = &self.data {
            output.push_str(" data=");
            output.push_str(&data.to_string());
        }
        output
    }

    pub fn into_error(self) -> McpError {
        McpError::Rpc {
            code: self.code,
            message: self.format(),
        }
    }
}

/// Serialized error response sent back for server-initiated requests.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub error: RpcErrorObject,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResultResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
}

/// A classified inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response {
        id: u64,
        result: Value,
    },
    Error {
        id: Option<u64>,
        error: RpcErrorObject,
    },
    /// A server-initiated request. The raw id is kept so it can be echoed back verbatim.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl IncomingMessage {
    /// Classifies a single JSON-RPC object. Returns `None` for values that are
    /// not recognisable JSON-RPC messages.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };

        let method = object
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = object.remove("params");
        let raw_id = object.remove("id").filter(|id| !id.is_null());

        if let Some(method) = method {
            return Some(match raw_id {
                Some(id) => IncomingMessage::Request { id, method, params },
                None => IncomingMessage::Notification { method, params },
            });
        }

        let id = raw_id.as_ref().and_then(parse_id);
        if let Some(error) = object.remove("error") {
            let error = serde_json::from_value::<RpcErrorObject>(error).unwrap_or_default();
            return Some(IncomingMessage::Error { id, error });
        }

        let id = id?;
        let result = object.remove("result").unwrap_or(Value::Null);
        Some(IncomingMessage::Response { id, result })
    }

    /// Parses raw bytes into zero or more messages. JSON arrays are treated as
    /// batches; members that are not JSON-RPC messages are skipped.
    pub fn parse_batch(bytes: &[u8]) -> Result<Vec<Self>, McpError> {
        let value = serde_json::from_slice::<Value>(bytes)
            .map_err(|err| McpError::MalformedResponse(err.to_string()))?;
        Ok(Self::from_json(value))
    }

    pub fn from_json(value: Value) -> Vec<Self> {
        match value {
            Value::Array(items) => items.into_iter().filter_map(Self::from_value).collect(),
            other => Self::from_value(other).into_iter().collect(),
        }
    }

    /// The id this message answers, if it is a response.
    pub fn response_id(&self) -> Option<u64> {
        match self {
            IncomingMessage::Response { id, .. } => Some(*id),
            IncomingMessage::Error { id, .. } => *id,
            _ => None,
        }
    }

    /// Converts a response into the outcome a pending request resolves with.
    pub fn into_outcome(self) -> Option<(u64, Result<Value, McpError>)> {
        match self {
            IncomingMessage::Response { id, result } => Some((id, Ok(result))),
            IncomingMessage::Error { id: Some(id), error } => Some((id, Err(error.into_error()))),
            _ => None,
        }
    }
}

/// Accepts numeric ids and numeric strings; servers differ in how they echo ids.
fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

pub fn encode_request(request: &JsonRpcRequest) -> Result<Vec<u8>, McpError> {
    serde_json::to_vec(request).map_err(|err| McpError::Transport(err.to_string()))
}

pub fn encode_notification(notification: &JsonRpcNotification) -> Result<Vec<u8>, McpError> {
    serde_json::to_vec(notification).map_err(|err| McpError::Transport(err.to_string()))
}

/// Builds the reply for a server-initiated request. Only `ping` is supported.
pub fn reply_to_server_request(id: Value, method: &str) -> Result<Vec<u8>, McpError> {
    let encoded = if method == "ping" {
        serde_json::to_vec(&JsonRpcResultResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Value::Object(Default::default()),
        })
    } else {
        serde_json::to_vec(&JsonRpcErrorResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            error: RpcErrorObject::new(MCP_METHOD_NOT_FOUND, "Method not found"),
        })
    };
    encoded.map_err(|err| McpError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_missing_params() {
        let encoded = serde_json::to_value(JsonRpcRequest::new(7, "tools/list", None))
            .expect("request should serialize");
        assert_eq!(
            encoded,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})
        );
    }

    #[test]
    fn notification_has_no_id() {
        let encoded = serde_json::to_value(JsonRpcNotification::new(
            "notifications/initialized",
            Some(json!({})),
        ))
        .expect("notification should serialize");
        assert!(encoded.get("id").is_none());
        assert_eq!(encoded["method"], "notifications/initialized");
    }

    #[test]
    fn classifies_responses_errors_requests_and_notifications() {
        let response = IncomingMessage::from_value(json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}}));
        assert_eq!(
            response,
            Some(IncomingMessage::Response {
                id: 1,
                result: json!({"ok": true})
            })
        );

        let error = IncomingMessage::from_value(
            json!({"jsonrpc":"2.0","id":"2","error":{"code":-32000,"message":"nope"}}),
        )
        .expect("error should classify");
        assert_eq!(error.response_id(), Some(2));

        let request =
            IncomingMessage::from_value(json!({"jsonrpc":"2.0","id":"abc","method":"ping"}));
        assert!(matches!(request, Some(IncomingMessage::Request { ref method, .. }) if method == "ping"));

        let notification = IncomingMessage::from_value(
            json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"}),
        );
        assert!(matches!(
            notification,
            Some(IncomingMessage::Notification { .. })
        ));
    }

    #[test]
    fn rejects_non_messages() {
        assert_eq!(IncomingMessage::from_value(json!("hello")), None);
        assert_eq!(IncomingMessage::from_value(json!({"jsonrpc":"2.0"})), None);
        assert!(IncomingMessage::parse_batch(b"not json").is_err());
    }

    #[test]
    fn splits_batches() {
        let messages = IncomingMessage::parse_batch(
            br#"[{"jsonrpc":"2.0","id":1,"result":1},42,{"jsonrpc":"2.0","id":2,"result":2}]"#,
        )
        .expect("batch should parse");
        let ids: Vec<_> = messages.iter().filter_map(IncomingMessage::response_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn formats_rpc_errors() {
        let full = RpcErrorObject {
            code: Some(-32602),
            message: Some("Invalid params".to_string()),
            data: Some(json!({"field": "name"})),
        };
        assert_eq!(
            full.format(),
            r#"Invalid params (-32602) data={"field":"name"}"#
        );
        assert_eq!(RpcErrorObject::default().format(), "Unknown MCP error");

        let message = IncomingMessage::from_value(json!({"jsonrpc":"2.0","id":3,"error":"bad"}))
            .and_then(IncomingMessage::into_outcome)
            .expect("error with unparseable body still resolves");
        let err = message.1.expect_err("should be an error");
        assert_eq!(err.to_string(), "Unknown MCP error");
    }

    #[test]
    fn ping_is_answered_and_other_requests_are_rejected() {
        let pong: Value = serde_json::from_slice(
            &reply_to_server_request(json!(5), "ping").expect("ping reply"),
        )
        .expect("reply should be json");
        assert_eq!(pong, json!({"jsonrpc":"2.0","id":5,"result":{}}));

        let rejected: Value = serde_json::from_slice(
            &reply_to_server_request(json!("x"), "sampling/createMessage").expect("reply"),
        )
        .expect("reply should be json");
        assert_eq!(rejected["error"]["code"], MCP_METHOD_NOT_FOUND);
    }
}
