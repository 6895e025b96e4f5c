//! Model-invocable tools.
//!
//! Tools implement [`Tool`] and are held by a [`ToolRegistry`]. The registry
//! is the only caller of [`Tool::execute`] and converts every outcome,
//! including [`ToolError`]s, into the string the model sees.

pub mod fetch_url;
pub mod memory;
pub mod registry;
pub mod web_search;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub use fetch_url::FetchUrlTool;
pub use memory::{ForgetTool, Mode, RegistryState, RememberTool, SetModeTool};
pub use registry::ToolRegistry;
pub use web_search::WebSearchTool;

/// Arguments passed to a tool: a JSON object of named values.
pub type ToolArgs = Map<String, Value>;

/// Tool execution failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// Arguments did not match the tool's parameters.
    #[error("{0}")]
    InvalidArguments(String),
    /// The tool ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// A capability the model can call by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses to call this tool.
    fn name(&self) -> &str;

    /// What the tool does, shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn schema(&self) -> Value;

    /// Run the tool.
    ///
    /// # Errors
    ///
    /// [`ToolError::InvalidArguments`] for argument mismatches,
    /// [`ToolError::Failed`] for execution failures.
    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError>;
}

/// Deserialize tool arguments into a typed parameter struct.
///
/// # Errors
///
/// Returns [`ToolError::InvalidArguments`] describing the mismatch.
pub fn parse_args<T: DeserializeOwned>(args: ToolArgs) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args)).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Truncate to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_owned(),
    }
}
