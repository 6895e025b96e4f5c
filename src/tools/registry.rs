//! Tool registry.
//!
//! [`ToolRegistry::invoke`] never fails: unknown names, argument mismatches,
//! tool errors and panics are all rendered as result text so the
//! conversation can continue.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use super::memory::{ForgetTool, Mode, RegistryState, RememberTool, SetModeTool};
use super::{FetchUrlTool, Tool, ToolArgs, ToolError, WebSearchTool};
use crate::llm::ToolDefinition;

type ToolFn = dyn Fn(ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync;

/// A tool built from a name, description, schema and async function.
struct FnTool {
    name: String,
    description: String,
    schema: Value,
    function: Box<ToolFn>,
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError> {
        (self.function)(args).await
    }
}

/// Name-to-tool mapping plus the registry-local fact store.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    state: Arc<RegistryState>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("state", &self.state)
            .finish()
    }
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `web_search`, `fetch_url`, `remember`, `forget` and `set_mode`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebSearchTool::from_env()));
        registry.register(Arc::new(FetchUrlTool::new()));
        registry.register_state_tools();
        registry
    }

    /// Register the tools that operate on this registry's fact store.
    pub fn register_state_tools(&mut self) {
        let state = Arc::clone(&self.state);
        self.register(Arc::new(RememberTool::new(Arc::clone(&state))));
        self.register(Arc::new(ForgetTool::new(Arc::clone(&state))));
        self.register(Arc::new(SetModeTool::new(state)));
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Register an async function as a tool.
    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        function: F,
    ) where
        F: Fn(ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnTool {
            name: name.into(),
            description: description.into(),
            schema,
            function: Box::new(function),
        }));
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Tool descriptors for the model, sorted by name.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.schema()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Invoke a tool by name and render the outcome as text.
    pub async fn invoke(&self, name: &str, args: ToolArgs) -> String {
        let Some(tool) = self.tools.get(name).cloned() else {
            warn!(tool = name, "model called unknown tool");
            return format!("Unknown tool: {name}");
        };

        info!(tool = name, "invoking tool");
        match AssertUnwindSafe(tool.execute(args)).catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(ToolError::InvalidArguments(e))) => {
                warn!(tool = name, error = %e, "invalid tool arguments");
                format!("Invalid arguments for {name}: {e}")
            }
            Ok(Err(ToolError::Failed(e))) => {
                warn!(tool = name, error = %e, "tool failed");
                format!("Tool {name} failed: {e}")
            }
            Err(_) => {
                warn!(tool = name, "tool panicked");
                format!("Tool {name} failed: panicked")
            }
        }
    }

    /// Copy of the facts stored by `remember`.
    pub fn memory_snapshot(&self) -> HashMap<String, String> {
        self.state.snapshot()
    }

    /// Mode last selected by `set_mode`.
    pub fn mode(&self) -> Mode {
        self.state.mode()
    }
}
