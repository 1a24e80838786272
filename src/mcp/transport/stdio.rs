//! Stdio transport: a spawned child process speaking Content-Length framed
//! JSON-RPC over its stdin/stdout.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::handshake;
use super::pending::PendingRequests;
use super::{McpTransport, McpTransportKind, RpcChannel};
use crate::core::config::data::McpServerConfig;
use crate::mcp::error::{stderr_suffix, McpError};
use crate::mcp::protocol::{
    encode_notification, encode_request, reply_to_server_request, IncomingMessage,
    JsonRpcNotification, JsonRpcRequest,
};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const STDOUT_READ_CHUNK: usize = 8 * 1024;
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const STDERR_TAIL_LINES: usize = 20;

pub fn require_stdio_command(config: &McpServerConfig) -> Result<String, McpError> {
    config
        .command
        .as_deref()
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .map(str::to_string)
        .ok_or_else(|| McpError::Config("MCP command is required for stdio transport.".to_string()))
}

/// Prefixes a payload with its `Content-Length` header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Incremental Content-Length frame decoder for a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Appends `chunk` and returns every frame body that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        self.drain_frames()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(relative) = memchr::memmem::find(&self.buffer[start..], HEADER_TERMINATOR) {
            let header_end = start + relative;
            let body_start = header_end + HEADER_TERMINATOR.len();
            let Some(length) = parse_content_length(&self.buffer[start..header_end]) else {
                warn!("Discarding MCP frame header without a valid Content-Length");
                start = body_start;
                continue;
            };
            if self.buffer.len() - body_start < length {
                break;
            }
            frames.push(self.buffer[body_start..body_start + length].to_vec());
            start = body_start + length;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        frames
    }
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(header)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
}

/// Ring buffer of the most recent stderr lines of a child process.
#[derive(Debug, Default)]
pub struct StderrTail {
    lines: std::sync::Mutex<VecDeque<String>>,
}

impl StderrTail {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn joined(&self) -> String {
        self.snapshot().join("\n")
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Debug, Clone)]
struct StdioLaunch {
    command: String,
    args: Vec<String>,
    env: Option<HashMap<String, String>>,
    cwd: Option<PathBuf>,
}

/// The write side of a live child process plus request correlation.
struct StdioConnection {
    server_id: String,
    stdin: Mutex<ChildStdin>,
    pending: Arc<PendingRequests>,
    timeout: Duration,
}

impl StdioConnection {
    async fn write_payload(&self, payload: &[u8]) -> Result<(), McpError> {
        let frame = encode_frame(payload);
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        };
        match tokio::time::timeout(STDIN_WRITE_TIMEOUT, write).await {
            Ok(result) => result.map_err(McpError::from),
            Err(_) => Err(McpError::Transport(
                "Timed out writing to MCP server stdin.".to_string(),
            )),
        }
    }

    async fn dispatch(&self, frame: &[u8]) {
        let messages = match IncomingMessage::parse_batch(frame) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(server_id = %self.server_id, error = %err, "Dropping malformed MCP frame");
                return;
            }
        };

        for message in messages {
            match message {
                IncomingMessage::Request { id, method, .. } => {
                    debug!(server_id = %self.server_id, method = %method, "Received MCP stdio request");
                    let reply = reply_to_server_request(id, &method);
                    let sent = match reply {
                        Ok(reply) => self.write_payload(&reply).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        warn!(server_id = %self.server_id, error = %err, "Failed to answer MCP server request");
                    }
                }
                IncomingMessage::Notification { method, .. } => {
                    debug!(server_id = %self.server_id, method = %method, "Received MCP stdio notification");
                }
                IncomingMessage::Error { id: None, error } => {
                    warn!(server_id = %self.server_id, error = %error.format(), "Received MCP error without id");
                }
                response => {
                    if let Some((id, outcome)) = response.into_outcome() {
                        self.pending.resolve(id, outcome);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RpcChannel for StdioConnection {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let response = self.pending.register(method);
        let payload = encode_request(&JsonRpcRequest::new(response.id(), method, params))?;
        self.write_payload(&payload).await?;
        response.wait(self.timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let payload = encode_notification(&JsonRpcNotification::new(method, params))?;
        self.write_payload(&payload).await
    }
}

struct StdioProcess {
    connection: Arc<StdioConnection>,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioProcess {
    fn shutdown(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type ProcessSlot = Arc<Mutex<Option<StdioProcess>>>;

/// Spawns the configured command on `start()` and keeps at most one live child.
pub struct StdioTransport {
    server_id: String,
    launch: StdioLaunch,
    timeout: Duration,
    pending: Arc<PendingRequests>,
    stderr_tail: Arc<StderrTail>,
    process: ProcessSlot,
    generation: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let command = require_stdio_command(config)?;
        Ok(Self {
            server_id: config.id.clone(),
            launch: StdioLaunch {
                command,
                args: config.args.clone().unwrap_or_default(),
                env: config.env.clone(),
                cwd: config.cwd.clone(),
            },
            timeout: config.request_timeout(),
            pending: PendingRequests::new(),
            stderr_tail: Arc::new(StderrTail::default()),
            process: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn spawn_child(&self) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr), McpError> {
        let launch = &self.launch;
        debug!(
            server_id = %self.server_id,
            command = %launch.command,
            args = ?launch.args,
            "Starting MCP stdio server"
        );
        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &launch.env {
            command.envs(env);
        }
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        let spawn_error = |reason: String| McpError::Spawn {
            command: launch.command.clone(),
            reason,
        };
        let mut child = command
            .spawn()
            .map_err(|err| spawn_error(err.to_string()))?;
        let pipes = (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        );
        match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => Ok((child, stdin, stdout, stderr)),
            _ => {
                let _ = child.start_kill();
                Err(spawn_error("Unable to retrieve child stdio pipes.".to_string()))
            }
        }
    }

    fn spawn_stdout_reader(
        mut stdout: ChildStdout,
        connection: Arc<StdioConnection>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::default();
            let mut chunk = vec![0u8; STDOUT_READ_CHUNK];
            loop {
                let read = match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(err) => {
                        debug!(server_id = %connection.server_id, error = %err, "MCP stdout read failed");
                        break;
                    }
                };
                for frame in decoder.push(&chunk[..read]) {
                    connection.dispatch(&frame).await;
                }
            }
            if decoder.buffered() > 0 {
                debug!(
                    server_id = %connection.server_id,
                    bytes = decoder.buffered(),
                    "MCP stdout closed with a partial frame"
                );
            }
        })
    }

    fn spawn_stderr_drain(
        stderr: ChildStderr,
        server_id: String,
        tail: Arc<StderrTail>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server_id = %server_id, line = %line, "MCP server stderr");
                tail.push(line);
            }
        })
    }

    /// Waits for the child to exit, or kills it when the kill channel fires or
    /// is dropped. Only the watcher of the current generation touches shared state.
    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let server_id = self.server_id.clone();
        let pending = Arc::clone(&self.pending);
        let tail = Arc::clone(&self.stderr_tail);
        let slot = Arc::clone(&self.process);
        let current_generation = Arc::clone(&self.generation);
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            if current_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            connected.store(false, Ordering::SeqCst);

            let (code, signal) = exit_details(&status);
            let stderr = tail.joined();
            let rejected = pending.reject_all(|| McpError::ProcessExited {
                code,
                signal,
                stderr: stderr.clone(),
            });
            warn!(
                server_id = %server_id,
                code = ?code,
                signal = ?signal,
                rejected,
                "MCP stdio server exited"
            );

            let mut slot = slot.lock().await;
            if slot
                .as_ref()
                .is_some_and(|process| process.generation == generation)
            {
                if let Some(process) = slot.take() {
                    process.shutdown();
                }
            }
        });
    }

    /// Attaches captured stderr to a handshake failure without changing how
    /// the failure is classified.
    fn with_stderr(&self, err: McpError) -> McpError {
        let stderr = self.stderr_tail.joined();
        if stderr.trim().is_empty() {
            return err;
        }
        let suffix = stderr_suffix(&stderr);
        match err {
            McpError::Timeout {
                method, timeout_ms, ..
            } => McpError::Timeout {
                method,
                timeout_ms,
                stderr,
            },
            McpError::Handshake(message) => McpError::Handshake(format!("{message}{suffix}")),
            McpError::Transport(message) => McpError::Transport(format!("{message}{suffix}")),
            McpError::MalformedResponse(message) => {
                McpError::MalformedResponse(format!("{message}{suffix}"))
            }
            other => other,
        }
    }
}

fn exit_details(status: &std::io::Result<ExitStatus>) -> (Option<i32>, Option<i32>) {
    match status {
        Ok(status) => (status.code(), exit_signal(status)),
        Err(_) => (None, None),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Stdio
    }

    async fn start(&self) -> Result<(), McpError> {
        let mut slot = self.process.lock().await;
        if slot.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.shutdown();
        }

        self.stderr_tail.clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (child, stdin, stdout, stderr) = self.spawn_child()?;

        let connection = Arc::new(StdioConnection {
            server_id: self.server_id.clone(),
            stdin: Mutex::new(stdin),
            pending: Arc::clone(&self.pending),
            timeout: self.timeout,
        });
        let (kill_tx, kill_rx) = oneshot::channel();
        let tasks = vec![
            Self::spawn_stdout_reader(stdout, Arc::clone(&connection)),
            Self::spawn_stderr_drain(
                stderr,
                self.server_id.clone(),
                Arc::clone(&self.stderr_tail),
            ),
        ];
        self.spawn_exit_watcher(child, kill_rx, generation);
        let process = StdioProcess {
            connection: Arc::clone(&connection),
            generation,
            kill_tx: Some(kill_tx),
            tasks,
        };

        match handshake::initialize(connection.as_ref(), &self.server_id).await {
            Ok(_) => {
                *slot = Some(process);
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                let err = self.with_stderr(err);
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.pending.reject_all(|| McpError::Stopped);
                process.shutdown();
                Err(err)
            }
        }
    }

    async fn stop(&self) {
        let mut slot = self.process.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let rejected = self.pending.reject_all(|| McpError::Stopped);
        if let Some(process) = slot.take() {
            debug!(server_id = %self.server_id, rejected, "Stopping MCP stdio server");
            process.shutdown();
        }
        self.stderr_tail.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let connection = self
            .process
            .lock()
            .await
            .as_ref()
            .map(|process| Arc::clone(&process.connection))
            .ok_or(McpError::NotConnected)?;
        connection.call(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let connection = self
            .process
            .lock()
            .await
            .as_ref()
            .map(|process| Arc::clone(&process.connection))
            .ok_or(McpError::NotConnected)?;
        RpcChannel::notify(connection.as_ref(), method, params).await
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> Vec<u8> {
        encode_frame(body.as_bytes())
    }

    #[test]
    fn decodes_frames_split_across_chunks() {
        let bytes = frame(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        let mut decoder = FrameDecoder::default();
        let (head, tail) = bytes.split_at(7);
        assert!(decoder.push(head).is_empty());
        let (middle, rest) = tail.split_at(20);
        assert!(decoder.push(middle).is_empty());
        let frames = decoder.push(rest);
        assert_eq!(frames, vec![br#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_vec()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn every_split_point_yields_each_frame_once() {
        let first = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let second = r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#;
        let mut bytes = frame(first);
        bytes.extend(frame(second));
        let expected = vec![first.as_bytes().to_vec(), second.as_bytes().to_vec()];

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::default();
            let (head, tail) = bytes.split_at(split);
            let mut frames = decoder.push(head);
            frames.extend(decoder.push(tail));
            assert_eq!(frames, expected, "split at {split}");
            assert_eq!(decoder.buffered(), 0, "split at {split}");
        }

        let mut decoder = FrameDecoder::default();
        let frames: Vec<Vec<u8>> = bytes
            .iter()
            .flat_map(|byte| decoder.push(std::slice::from_ref(byte)))
            .collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn decodes_back_to_back_frames_in_one_chunk() {
        let mut bytes = frame("{\"a\":1}");
        bytes.extend(frame("{\"b\":2}"));
        bytes.extend(b"Content-Length: 10\r\n\r\n{\"c\"");
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(&bytes);
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert_eq!(decoder.buffered(), "Content-Length: 10\r\n\r\n{\"c\"".len());
    }

    #[test]
    fn header_name_is_case_insensitive_and_extra_headers_ignored() {
        let bytes = b"content-type: application/json\r\nCONTENT-LENGTH: 2\r\n\r\n{}";
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.push(bytes), vec![b"{}".to_vec()]);
    }

    #[test]
    fn header_without_length_is_discarded() {
        let mut bytes = b"X-Noise: 1\r\n\r\n".to_vec();
        bytes.extend(frame("{}"));
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.push(&bytes), vec![b"{}".to_vec()]);
    }

    #[test]
    fn length_counts_bytes_not_characters() {
        let body = "{\"text\":\"héllo\"}";
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.push(&frame(body)), vec![body.as_bytes().to_vec()]);
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        for index in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {index}"));
        }
        let lines = tail.snapshot();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.first().map(String::as_str), Some("line 5"));
        tail.clear();
        assert!(tail.joined().is_empty());
    }

    #[tokio::test]
    async fn request_before_start_is_not_connected() {
        let transport =
            StdioTransport::from_config(&McpServerConfig::stdio("idle", "definitely-not-here"))
                .expect("transport");
        let err = transport
            .request("tools/list", None)
            .await
            .expect_err("not started");
        assert!(matches!(err, McpError::NotConnected));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_transport_stopped() {
        let transport = StdioTransport::from_config(&McpServerConfig::stdio(
            "missing",
            "/nonexistent/mcp-server-binary",
        ))
        .expect("transport");
        let err = transport.start().await.expect_err("spawn should fail");
        assert!(matches!(err, McpError::Spawn { .. }));
        assert!(!transport.is_connected());
        assert!(transport.process.lock().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_handshake_times_out_with_stderr_attached() {
        let mut config = McpServerConfig::stdio("sleepy", "sh");
        config.args = Some(vec![
            "-c".to_string(),
            "echo 'warming cache' >&2; sleep 30".to_string(),
        ]);
        config.timeout_ms = Some(1000);
        let transport = StdioTransport::from_config(&config).expect("transport");

        let err = transport.start().await.expect_err("handshake should time out");
        match &err {
            McpError::Timeout { method, stderr, .. } => {
                assert_eq!(method, "initialize");
                assert!(stderr.contains("warming cache"), "stderr was {stderr:?}");
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(err.is_timeout());
        assert!(!transport.is_connected());
    }
}
