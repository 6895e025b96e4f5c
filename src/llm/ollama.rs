//! Ollama chat backend (`POST /api/chat`, newline-delimited JSON streaming).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ChatDelta, ChatStream, LlmBackend, Message, Role, ToolCall, ToolDefinition};
use crate::config::LlmConfig;
use crate::error::{Result, SpeechError};

/// Streaming chat client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    endpoint: url::Url,
    client: reqwest::Client,
}

impl OllamaClient {
    /// Build a client for `config.host`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the host is not a valid http(s) URL.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let base = url::Url::parse(&config.host)
            .map_err(|e| SpeechError::Config(format!("invalid llm.host '{}': {e}", config.host)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SpeechError::Config(format!(
                "llm.host must be http or https, got '{}'",
                base.scheme()
            )));
        }
        let endpoint = base
            .join("/api/chat")
            .map_err(|e| SpeechError::Config(format!("invalid llm.host: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SpeechError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl LlmBackend for OllamaClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream> {
        let body = build_chat_request(model, messages, tools);
        debug!(model, messages = messages.len(), tools = tools.len(), "sending chat request");

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Llm(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Llm(format!(
                "chat backend HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&text)
            )));
        }

        Ok(Box::pin(delta_stream(response.bytes_stream())))
    }
}

/// Build the `/api/chat` request body.
pub fn build_chat_request(model: &str, messages: &[Message], tools: &[ToolDefinition]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        "stream": true,
    });
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn wire_message(msg: &Message) -> Value {
    let mut out = json!({
        "role": msg.role.to_string(),
        "content": msg.content,
    });
    if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
        out["tool_calls"] = msg
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": Value::Object(call.argument_map()),
                    }
                })
            })
            .collect();
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if let Some(name) = &msg.name {
        out["name"] = json!(name);
    }
    out
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| body.trim().to_owned())
}

/// Outcome of parsing one NDJSON line.
#[derive(Debug, PartialEq)]
pub enum ChunkLine {
    /// A delta worth forwarding.
    Delta(ChatDelta),
    /// The final `done: true` chunk.
    Done,
    /// The backend reported an error mid-stream.
    Error(String),
    /// Nothing to forward (empty content, keep-alive).
    Skip,
}

/// Parse one line of the chat stream.
///
/// Malformed lines are skipped with a warning.
pub fn parse_chunk_line(line: &str) -> ChunkLine {
    let line = line.trim();
    if line.is_empty() {
        return ChunkLine::Skip;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping malformed chat chunk");
            return ChunkLine::Skip;
        }
    };
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return ChunkLine::Error(err.to_owned());
    }

    let message = value.get("message");
    let content = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(String::from);
    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect::<Vec<_>>())
        .unwrap_or_default();

    if content.is_some() || !tool_calls.is_empty() {
        return ChunkLine::Delta(ChatDelta {
            content,
            tool_calls,
        });
    }
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        return ChunkLine::Done;
    }
    ChunkLine::Skip
}

fn parse_tool_call(raw: &Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let name = function.get("name")?.as_str()?.to_owned();
    let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
    Some(ToolCall::new(id, name, arguments))
}

struct StreamState<S> {
    bytes: std::pin::Pin<Box<S>>,
    line_buf: Vec<u8>,
    pending: VecDeque<Result<ChatDelta>>,
    finished: bool,
}

impl<S> StreamState<S> {
    fn take_lines(&mut self) {
        while let Some(pos) = self.line_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            self.push_line(&String::from_utf8_lossy(&line));
            if self.finished {
                return;
            }
        }
    }

    fn push_line(&mut self, line: &str) {
        match parse_chunk_line(line) {
            ChunkLine::Delta(delta) => self.pending.push_back(Ok(delta)),
            ChunkLine::Done => self.finished = true,
            ChunkLine::Error(msg) => {
                self.pending.push_back(Err(SpeechError::Llm(msg)));
                self.finished = true;
            }
            ChunkLine::Skip => {}
        }
    }
}

fn delta_stream<S>(bytes: S) -> impl Stream<Item = Result<ChatDelta>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    futures_util::stream::unfold(
        StreamState {
            bytes: Box::pin(bytes),
            line_buf: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.line_buf.extend_from_slice(&chunk);
                        state.take_lines();
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state
                            .pending
                            .push_back(Err(SpeechError::Llm(format!("stream read error: {e}"))));
                    }
                    None => {
                        state.finished = true;
                        let rest = std::mem::take(&mut state.line_buf);
                        state.push_line(&String::from_utf8_lossy(&rest));
                    }
                }
            }
        },
    )
}
