//! Registry-local state and the tools that mutate it.
//!
//! Facts and the operating mode live in a [`RegistryState`] owned by one
//! [`ToolRegistry`](super::ToolRegistry). Nothing is persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolArgs, ToolError, parse_args};

/// Operating mode selectable at runtime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Development profile.
    #[default]
    Dev,
    /// Production profile.
    Prod,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Key/value facts and mode shared by the built-in tools of one registry.
#[derive(Debug, Default)]
pub struct RegistryState {
    facts: Mutex<HashMap<String, String>>,
    mode: Mutex<Mode>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RegistryState {
    /// Copy of all remembered facts.
    pub fn snapshot(&self) -> HashMap<String, String> {
        lock(&self.facts).clone()
    }

    /// Current operating mode.
    pub fn mode(&self) -> Mode {
        *lock(&self.mode)
    }

    fn remember(&self, key: String, value: String) {
        lock(&self.facts).insert(key, value);
    }

    fn forget(&self, key: &str) -> bool {
        lock(&self.facts).remove(key).is_some()
    }

    fn set_mode(&self, mode: Mode) {
        *lock(&self.mode) = mode;
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RememberArgs {
    key: String,
    value: String,
}

/// `remember(key, value)`: store a fact about the user.
#[derive(Debug)]
pub struct RememberTool {
    state: Arc<RegistryState>,
}

impl RememberTool {
    /// Tool writing into `state`.
    pub fn new(state: Arc<RegistryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store a fact about the user for later recall."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Key for the memory"},
                "value": {"type": "string", "description": "Value to remember"}
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError> {
        let RememberArgs { key, value } = parse_args(args)?;
        let reply = format!("Remembered {key}.");
        self.state.remember(key, value);
        Ok(reply)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ForgetArgs {
    key: String,
}

/// `forget(key)`: drop a stored fact.
#[derive(Debug)]
pub struct ForgetTool {
    state: Arc<RegistryState>,
}

impl ForgetTool {
    /// Tool removing from `state`.
    pub fn new(state: Arc<RegistryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for ForgetTool {
    fn name(&self) -> &str {
        "forget"
    }

    fn description(&self) -> &str {
        "Forget a stored fact."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Key for the memory"}
            },
            "required": ["key"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError> {
        let ForgetArgs { key } = parse_args(args)?;
        if self.state.forget(&key) {
            Ok(format!("Forgot {key}."))
        } else {
            Ok(format!("No entry for {key}."))
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetModeArgs {
    mode: Mode,
}

/// `set_mode(mode)`: switch between dev and prod at runtime.
#[derive(Debug)]
pub struct SetModeTool {
    state: Arc<RegistryState>,
}

impl SetModeTool {
    /// Tool switching the mode in `state`.
    pub fn new(state: Arc<RegistryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for SetModeTool {
    fn name(&self) -> &str {
        "set_mode"
    }

    fn description(&self) -> &str {
        "Switch between dev and prod profiles at runtime."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "enum": ["dev", "prod"],
                    "description": "Target mode"
                }
            },
            "required": ["mode"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError> {
        let SetModeArgs { mode } = parse_args(args)?;
        self.state.set_mode(mode);
        Ok(format!("Switched to {mode} mode."))
    }
}
