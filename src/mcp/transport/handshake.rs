use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;
use tracing::debug;

use super::RpcChannel;
use crate::mcp::error::McpError;

pub const INITIALIZE_METHOD: &str = "initialize";
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

pub(crate) fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("mcpmux MCP client".to_string()),
            description: Some("Multi-transport MCP client runtime".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub(crate) fn parse_initialize_result(value: Value) -> Result<InitializeResult, McpError> {
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| McpError::Handshake(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Handshake(
            "Unexpected initialize response.".to_string(),
        ));
    }
    Ok(result)
}

/// Sends `initialize` followed by `notifications/initialized`.
pub(crate) async fn initialize(
    channel: &dyn RpcChannel,
    server_id: &str,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::to_value(client_details())
        .map_err(|err| McpError::Handshake(err.to_string()))?;
    let response = channel
        .call(INITIALIZE_METHOD, Some(params))
        .await
        .map_err(|err| match err {
            McpError::Rpc { .. } | McpError::MalformedResponse(_) => {
                McpError::Handshake(err.to_string())
            }
            other => other,
        })?;
    let result = parse_initialize_result(response)?;
    debug!(
        server_id = %server_id,
        protocol_version = %result.protocol_version,
        server_name = %result.server_info.name,
        "MCP initialize completed"
    );
    channel.notify(INITIALIZED_NOTIFICATION, None).await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedChannel {
        response: Result<Value, McpError>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn call(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
            self.sent.lock().unwrap().push(method.to_string());
            self.response.clone()
        }

        async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
            self.sent.lock().unwrap().push(method.to_string());
            Ok(())
        }
    }

    #[test]
    fn client_details_advertise_latest_protocol() {
        let value = serde_json::to_value(client_details()).expect("params serialize");
        assert_eq!(value["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(value["clientInfo"]["name"], "mcpmux");
        assert!(value.get("capabilities").is_some());
    }

    #[test]
    fn parse_initialize_rejects_blank_protocol_version() {
        let value = json!({
            "capabilities": {},
            "protocolVersion": " ",
            "serverInfo": {"name": "x", "version": "1.0.0"}
        });
        assert!(parse_initialize_result(value).is_err());
    }

    #[tokio::test]
    async fn initialize_sends_initialized_notification() {
        let channel = ScriptedChannel {
            response: Ok(json!({
                "capabilities": {"tools": {}},
                "protocolVersion": "2025-06-18",
                "serverInfo": {"name": "mock", "version": "0.1.0"}
            })),
            sent: Mutex::new(Vec::new()),
        };
        let result = initialize(&channel, "mock").await.expect("handshake");
        assert_eq!(result.protocol_version, "2025-06-18");
        assert_eq!(
            *channel.sent.lock().unwrap(),
            vec![INITIALIZE_METHOD.to_string(), INITIALIZED_NOTIFICATION.to_string()]
        );
    }

    #[tokio::test]
    async fn initialize_error_is_a_handshake_failure() {
        let channel = ScriptedChannel {
            response: Err(McpError::Rpc {
                code: Some(-32600),
                message: "bad".to_string(),
            }),
            sent: Mutex::new(Vec::new()),
        };
        let err = initialize(&channel, "mock").await.expect_err("should fail");
        assert!(matches!(err, McpError::Handshake(_)));
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }
}
