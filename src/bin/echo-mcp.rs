//! Minimal stdio MCP server used by the integration tests and for manual
//! smoke tests of `mcpmux`.
//!
//! Exposes an `echo` tool that returns `arguments.text`. With `--crash-tool`
//! it also lists a `crash` tool that makes the process exit mid-request.

use std::io::{self, Read, Write};

use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use serde_json::{json, Value};
use tracing::{debug, warn};

use mcpmux::mcp::protocol::{
    IncomingMessage, JsonRpcErrorResponse, JsonRpcResultResponse, RpcErrorObject,
    JSONRPC_VERSION, MCP_METHOD_NOT_FOUND,
};
use mcpmux::mcp::transport::stdio::{encode_frame, FrameDecoder};

const INVALID_PARAMS: i64 = -32602;
const CRASH_EXIT_CODE: i32 = 3;

struct Options {
    crash_tool: bool,
}

impl Options {
    fn from_args() -> Self {
        Self {
            crash_tool: std::env::args().skip(1).any(|arg| arg == "--crash-tool"),
        }
    }
}

fn tool_list(options: &Options) -> Value {
    let mut tools = vec![json!({
        "name": "echo",
        "description": "Echo the provided text back.",
        "inputSchema": {
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }
    })];
    if options.crash_tool {
        tools.push(json!({
            "name": "crash",
            "description": "Exit the server process immediately.",
            "inputSchema": {"type": "object", "properties": {}}
        }));
    }
    json!({ "tools": tools })
}

fn call_tool(options: &Options, params: Option<&Value>) -> Result<Value, RpcErrorObject> {
    let name = params
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let arguments = params.and_then(|params| params.get("arguments"));

    match name {
        "echo" => {
            let text = arguments
                .and_then(|arguments| arguments.get("text"))
                .and_then(Value::as_str);
            Ok(match text {
                Some(text) => json!({"content": [{"type": "text", "text": text}]}),
                None => json!({
                    "isError": true,
                    "content": [{"type": "text", "text": "Missing string argument 'text'."}]
                }),
            })
        }
        "crash" if options.crash_tool => {
            eprintln!("echo-mcp: crash tool invoked, exiting");
            std::process::exit(CRASH_EXIT_CODE);
        }
        other => Err(RpcErrorObject::new(
            INVALID_PARAMS,
            format!("Unknown tool: {other}"),
        )),
    }
}

fn handle_request(options: &Options, method: &str, params: Option<&Value>) -> Result<Value, RpcErrorObject> {
    match method {
        "initialize" => {
            let protocol_version = params
                .and_then(|params| params.get("protocolVersion"))
                .and_then(Value::as_str)
                .unwrap_or(LATEST_PROTOCOL_VERSION);
            Ok(json!({
                "protocolVersion": protocol_version,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "echo-mcp", "version": env!("CARGO_PKG_VERSION")}
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(tool_list(options)),
        "tools/call" => call_tool(options, params),
        other => Err(RpcErrorObject::new(
            MCP_METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

fn encode_reply(id: Value, outcome: Result<Value, RpcErrorObject>) -> serde_json::Result<Vec<u8>> {
    match outcome {
        Ok(result) => serde_json::to_vec(&JsonRpcResultResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
        }),
        Err(error) => serde_json::to_vec(&JsonRpcErrorResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            error,
        }),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let options = Options::from_args();
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    let mut decoder = FrameDecoder::default();
    let mut chunk = [0_u8; 8192];

    loop {
        let read = stdin.read(&mut chunk)?;
        if read == 0 {
            debug!("stdin closed, exiting");
            return Ok(());
        }

        for payload in decoder.push(&chunk[..read]) {
            let messages = match IncomingMessage::parse_batch(&payload) {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(error = %err, "Ignoring malformed frame");
                    continue;
                }
            };

            for message in messages {
                match message {
                    IncomingMessage::Request { id, method, params } => {
                        debug!(method = %method, "Handling request");
                        let outcome = handle_request(&options, &method, params.as_ref());
                        stdout.write_all(&encode_frame(&encode_reply(id, outcome)?))?;
                        stdout.flush()?;
                    }
                    IncomingMessage::Notification { method, .. } => {
                        debug!(method = %method, "Ignoring notification");
                    }
                    other => debug!(message = ?other, "Ignoring response"),
                }
            }
        }
    }
}
