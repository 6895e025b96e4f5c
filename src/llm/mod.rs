//! Language model backend capability, model routing and persona loading.
//!
//! The turn controller only sees [`LlmBackend`]: a streaming chat call that
//! yields [`ChatDelta`]s. [`ollama::OllamaClient`] is the bundled HTTP
//! implementation; tests substitute scripted fakes.

pub mod message;
pub mod ollama;
pub mod router;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpeechError};

pub use message::{Message, Role, ToolCall};
pub use ollama::OllamaClient;
pub use router::{MemoryRouter, ModelRoute, RoutingPolicy};

/// A tool descriptor advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as the model will call it.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// One increment of a streamed chat completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDelta {
    /// Newly generated text, if any.
    pub content: Option<String>,
    /// Tool calls completed in this chunk.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatDelta {
    /// A text-only delta.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// A delta carrying tool calls only.
    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }
}

/// A boxed stream of chat deltas. An `Err` item ends the stream.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta>> + Send>>;

/// Streaming chat capability.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Start a streaming completion over `messages` with `tools` available.
    ///
    /// Errors returned here mean the request could not be started; errors
    /// yielded by the stream mean it failed part-way.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream>;
}

/// Load the persona (system prompt) text.
///
/// # Errors
///
/// Returns a config error if the file is missing or unreadable.
pub fn load_persona(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|text| text.trim().to_owned())
        .map_err(|e| {
            SpeechError::Config(format!("cannot read persona {}: {e}", path.display()))
        })
}
