//! Incremental Server-Sent-Events parsing shared by the SSE and streamable HTTP
//! transports.

use futures_util::StreamExt;

use crate::mcp::error::McpError;

const DEFAULT_EVENT: &str = "message";

/// One dispatched SSE block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn is_endpoint(&self) -> bool {
        self.event == "endpoint"
    }
}

/// Byte-oriented SSE parser. Lines are only decoded once complete, so a UTF-8
/// sequence split across chunks is reassembled before decoding.
#[derive(Default)]
pub struct SseEventParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        self.drain(false)
    }

    /// Flushes a trailing line and any block left unterminated at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = self.drain(true);
        if let Some(event) = self.take_block() {
            events.push(event);
        }
        events
    }

    fn drain(&mut self, flush: bool) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(relative) = memchr::memchr2(b'\n', b'\r', &self.buffer[start..]) {
            let end = start + relative;
            let next = match self.buffer[end] {
                b'\r' => match self.buffer.get(end + 1) {
                    Some(b'\n') => end + 2,
                    Some(_) => end + 1,
                    // A trailing CR may be the first half of CRLF.
                    None if !flush => break,
                    None => end + 1,
                },
                _ => end + 1,
            };

            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
            start = next;
        }

        if flush && start < self.buffer.len() {
            let line = String::from_utf8_lossy(&self.buffer[start..]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
            start = self.buffer.len();
        }

        self.buffer.drain(..start);
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_block();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.trim().to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_block(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        })
    }
}

/// Parses a complete event-stream body.
pub fn parse_event_stream(body: &[u8]) -> Vec<SseEvent> {
    let mut parser = SseEventParser::default();
    let mut events = parser.push(body);
    events.extend(parser.finish());
    events
}

/// Reads an event-stream response until `accept` returns a value for one of its
/// events, or the body ends.
pub async fn scan_event_stream<T>(
    response: reqwest::Response,
    mut accept: impl FnMut(&SseEvent) -> Option<T>,
) -> Result<Option<T>, McpError> {
    let mut stream = response.bytes_stream();
    let mut parser = SseEventParser::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for event in parser.push(&chunk) {
            if let Some(found) = accept(&event) {
                return Ok(Some(found));
            }
        }
    }

    Ok(parser.finish().iter().find_map(accept))
}
