use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::{McpTransport, McpTransportKind};
use crate::mcp::error::McpError;

pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn rpc_method(&self) -> String {
        self.json()
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn rpc_id(&self) -> Value {
        self.json().get("id").cloned().unwrap_or(Value::Null)
    }
}

pub(crate) async fn read_http_request(stream: &mut TcpStream) -> Result<HttpRequest, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = memchr::memmem::find(&buffer, b"\r\n\r\n").map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

/// A complete `connection: close` response.
pub(crate) fn http_response(
    status: &str,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

/// Headers for an open-ended event stream; the body lasts until the socket closes.
pub(crate) fn event_stream_head() -> &'static str {
    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n"
}

pub(crate) fn initialize_response(id: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock", "version": "0.1.0"}
        }
    })
}

pub(crate) fn test_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("test client should build")
}

type Handler = Box<dyn Fn(&str, Option<&Value>) -> Result<Value, McpError> + Send + Sync>;

/// In-memory transport answering requests through a closure.
pub(crate) struct MockTransport {
    handler: Handler,
    connected: AtomicBool,
    fail_start: Mutex<Option<McpError>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub requests: Mutex<Vec<(String, Option<Value>)>>,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&str, Option<&Value>) -> Result<Value, McpError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            connected: AtomicBool::new(false),
            fail_start: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// A server exposing `tools` whose calls echo `arguments.text`.
    pub fn with_tools(tools: &[&str]) -> Arc<Self> {
        let listed: Vec<Value> = tools
            .iter()
            .map(|name| json!({"name": name, "description": format!("{name} tool")}))
            .collect();
        Self::new(move |method, params| match method {
            "tools/list" => Ok(json!({ "tools": listed })),
            "tools/call" => {
                let text = params
                    .and_then(|params| params.get("arguments"))
                    .and_then(|arguments| arguments.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!({"content": [{"type": "text", "text": text}]}))
            }
            other => Err(McpError::Rpc {
                code: Some(-32601),
                message: format!("Method not found: {other}"),
            }),
        })
    }

    pub fn fail_next_start(&self, err: McpError) {
        *self.fail_start.lock().unwrap() = Some(err);
    }

    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Stdio
    }

    async fn start(&self) -> Result<(), McpError> {
        if let Some(err) = self.fail_start.lock().unwrap().take() {
            return Err(err);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        (self.handler)(method, params.as_ref())
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
        Ok(())
    }
}
