//! Tool registry — thread-safe name→tool mapping.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::llm::ToolDefinition;
use crate::tools::tool::{error_envelope, success_envelope, Tool, ToolContext};

/// Registry of available tools.
///
/// Execution normalizes every outcome into the uniform
/// `{success, data?, error?}` envelope, so the LLM sees one shape whether a
/// call succeeded, failed, or named a tool that does not exist.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. The latest registration for a name wins.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name.clone(), tool);
        debug!(tool = %name, "Registered tool");
    }

    /// Unregister a tool by name.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().await.remove(name)
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// All registered tool names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool declarations for the model. An empty `allowed` list means all
    /// tools; otherwise only the named tools, in the given order.
    pub async fn definitions(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let to_def = |tool: &Arc<dyn Tool>| ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description(),
            parameters: tool.parameters(),
        };

        if allowed.is_empty() {
            let mut defs: Vec<ToolDefinition> = tools.values().map(to_def).collect();
            defs.sort_by(|a, b| a.name.cmp(&b.name));
            defs
        } else {
            allowed
                .iter()
                .filter_map(|name| tools.get(name))
                .map(to_def)
                .collect()
        }
    }

    /// Execute a tool by name, returning the result envelope.
    pub async fn execute(&self, ctx: &ToolContext, name: &str, args: Value) -> Value {
        let tool = match self.get(name).await {
            Some(tool) => tool,
            None => return error_envelope(format!("unknown tool: {name}")),
        };

        debug!(tool = %name, args = %args, "Executing tool");
        match tool.execute(ctx, args).await {
            Ok(data) => success_envelope(data),
            Err(e) => {
                error!(tool = %name, error = %e, "Tool execution failed");
                error_envelope(e)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
