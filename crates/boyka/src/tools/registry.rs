use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{ToolCallResult, ToolError};
use crate::models::content::ToolResult;
use crate::models::tool::Tool;

/// A group of related tools that share state, such as a workspace root.
#[async_trait]
pub trait Toolset: Send + Sync {
    /// Get the name of the toolset
    fn name(&self) -> &str;

    /// Get the toolset description
    fn description(&self) -> &str;

    /// Instructions rendered into the system prompt
    fn instructions(&self) -> &str;

    /// Get available tools
    fn tools(&self) -> &[Tool];

    /// Call one of this toolset's tools with already-parsed arguments
    async fn call(&self, name: &str, arguments: Value) -> ToolCallResult<String>;
}

/// The text fed back to the model for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub output: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success<S: Into<String>>(output: S) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error<S: Into<String>>(output: S) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }

    pub fn into_result<S: Into<String>>(self, tool_use_id: S) -> ToolResult {
        ToolResult {
            tool_use_id: tool_use_id.into(),
            output: self.output,
            is_error: self.is_error,
        }
    }
}

/// Maps tool names to the toolset that serves them.
///
/// Registration happens before the registry is shared; afterwards it is only
/// read, so it can sit behind an `Arc` across conversations.
#[derive(Default)]
pub struct ToolRegistry {
    toolsets: Vec<Arc<dyn Toolset>>,
    index: HashMap<String, usize>,
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a toolset. Fails without changing the registry if any of its tool
    /// names is already taken.
    pub fn register<T: Toolset + 'static>(&mut self, toolset: T) -> ToolCallResult<()> {
        self.register_arc(Arc::new(toolset))
    }

    pub fn register_arc(&mut self, toolset: Arc<dyn Toolset>) -> ToolCallResult<()> {
        let mut seen = std::collections::HashSet::new();
        for tool in toolset.tools() {
            if self.index.contains_key(&tool.name) || !seen.insert(tool.name.as_str()) {
                return Err(ToolError::DuplicateTool(tool.name.clone()));
            }
        }

        let position = self.toolsets.len();
        for tool in toolset.tools() {
            self.index.insert(tool.name.clone(), position);
            self.tools.push(tool.clone());
        }
        debug!(toolset = toolset.name(), tools = toolset.tools().len(), "registered toolset");
        self.toolsets.push(toolset);
        Ok(())
    }

    /// Every tool definition, in registration order
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn toolsets(&self) -> impl Iterator<Item = &Arc<dyn Toolset>> {
        self.toolsets.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Run one tool call. Never fails: unknown tools, handler errors and
    /// handler panics all come back as error output.
    pub async fn execute(&self, name: &str, arguments: Value) -> ToolOutput {
        let Some(toolset) = self.index.get(name).map(|&i| &self.toolsets[i]) else {
            warn!(tool = name, "model requested an unknown tool");
            return ToolOutput::error(ToolError::ToolNotFound(name.to_string()).to_string());
        };

        match AssertUnwindSafe(toolset.call(name, arguments))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => ToolOutput::success(output),
            Ok(Err(err)) => {
                debug!(tool = name, error = %err, "tool call failed");
                ToolOutput::error(err.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(tool = name, reason, "tool handler panicked");
                ToolOutput::error(format!("Tool '{}' panicked: {}", name, reason))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
