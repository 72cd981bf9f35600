use std::collections::BTreeMap;
use std::sync::Arc;

use inkflow_core::error::{InkflowError, Result};
use inkflow_core::traits::Tool;
use inkflow_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of tools available to an agent loop.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    max_timeout_secs: Option<u64>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every tool's own timeout at `secs`.
    pub fn with_max_timeout(mut self, secs: u64) -> Self {
        self.max_timeout_secs = Some(secs);
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for sending to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    fn timeout_for(&self, tool: &dyn Tool) -> u64 {
        match self.max_timeout_secs {
            Some(max) => tool.timeout_secs().min(max),
            None => tool.timeout_secs(),
        }
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| InkflowError::ToolNotFound(name.to_string()))?;

        let timeout_secs = self.timeout_for(tool.as_ref());
        let timeout = std::time::Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(InkflowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs,
            }),
        }
    }
}
