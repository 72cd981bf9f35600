//! Iterative tool-using agent loop.
//!
//! ```text
//! START -> agent --(tool calls)--> tools -> agent
//!            \--(no tool calls)--> structured_response -> END   (with a response format)
//!             \-------------------------------------------> END (without)
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info};

use inkflow_core::config::AgentConfig;
use inkflow_core::error::{InkflowError, Result};
use inkflow_core::event::EventKind;
use inkflow_core::traits::{ModelClient, ModelMiddleware};
use inkflow_core::types::{
    ChatMessage, ResponseFormat, Role, ToolContext, ToolDefinition, ToolResult, Usage,
};
use inkflow_graph::state::{Append, Replace};
use inkflow_graph::{
    graph_state, route_label, CompiledGraph, GraphBuilder, Node, NodeContext, RunOptions,
    RunOutcome, RunStatus, END, START,
};

use crate::middleware::MiddlewareChain;
use crate::output_validator::OutputCleaner;
use crate::registry::ToolRegistry;

pub const AGENT_NODE: &str = "agent";
pub const TOOLS_NODE: &str = "tools";
pub const STRUCTURED_RESPONSE_NODE: &str = "structured_response";

graph_state! {
    /// Conversation state of one agent run.
    pub struct AgentState / AgentUpdate {
        pub messages: Append<ChatMessage> = Vec::new(),
        pub structured_response: Replace<Option<Value>> = None,
        /// Model invocations made by the agent node so far.
        pub model_calls: Replace<usize> = 0,
        pub usage: Replace<Usage> = Usage::default(),
    }
}

impl AgentState {
    /// Text of the last assistant message.
    pub fn final_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
    }
}

route_label! {
    /// Whether the latest model reply asked for tools.
    pub enum ShouldContinue {
        Actions => "actions",
        Next => "next",
    }
}

/// Route on the latest message: pending tool calls go to the tool node.
pub fn should_continue(state: &AgentState) -> ShouldContinue {
    match state.messages.last() {
        Some(m) if m.role == Role::Assistant && m.has_tool_calls() => ShouldContinue::Actions,
        _ => ShouldContinue::Next,
    }
}

/// Recursion limit for an agent subgraph offering `tool_count` tools.
///
/// Each tool round costs two steps (agent + tools); the budget allows every
/// tool three rounds, clamped to `[64, 128]`.
pub fn recursion_limit_for_tools(tool_count: usize) -> usize {
    (tool_count * 2 * 3 + 1).clamp(64, 128)
}

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_model_calls: usize,
    pub parallel_tools: bool,
    pub tool_timeout_secs: Option<u64>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

impl AgentLoopConfig {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_model_calls: config.max_model_calls,
            parallel_tools: config.parallel_tools,
            tool_timeout_secs: Some(config.tool_timeout_secs),
        }
    }
}

/// Builder for the agent loop graph.
pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    middleware: MiddlewareChain,
    response_format: Option<ResponseFormat>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            tools: ToolRegistry::new(),
            middleware: MiddlewareChain::new(),
            response_format: None,
            config: AgentLoopConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_middleware(mut self, middleware: impl ModelMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Finish with a structured answer in this format.
    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_config(mut self, config: AgentLoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Recursion limit suited to this loop's tool count.
    pub fn recursion_limit(&self) -> usize {
        recursion_limit_for_tools(self.tools.len())
    }

    pub fn build(&self) -> Result<CompiledGraph<AgentState>> {
        let mut tools = self.tools.clone();
        if let Some(secs) = self.config.tool_timeout_secs {
            tools = tools.with_max_timeout(secs);
        }
        let tools = Arc::new(tools);

        let model_node = ModelNode {
            model: Arc::clone(&self.model),
            definitions: tools.definitions(),
            middleware: self.middleware.clone(),
            max_model_calls: self.config.max_model_calls,
        };
        let tool_node = ToolNode {
            tools,
            parallel: self.config.parallel_tools,
        };

        let builder = GraphBuilder::new("agent_loop")
            .add_node(AGENT_NODE, model_node)?
            .add_node(TOOLS_NODE, tool_node)?
            .add_edge(START, AGENT_NODE)?
            .add_edge(TOOLS_NODE, AGENT_NODE)?;

        let builder = match &self.response_format {
            Some(format) => builder
                .add_node(
                    STRUCTURED_RESPONSE_NODE,
                    StructuredResponseNode {
                        model: Arc::clone(&self.model),
                        format: format.clone(),
                        middleware: self.middleware.clone(),
                    },
                )?
                .add_conditional_edge(
                    AGENT_NODE,
                    should_continue,
                    [
                        (ShouldContinue::Actions, TOOLS_NODE),
                        (ShouldContinue::Next, STRUCTURED_RESPONSE_NODE),
                    ],
                )?
                .add_edge(STRUCTURED_RESPONSE_NODE, END)?,
            None => builder.add_conditional_edge(
                AGENT_NODE,
                should_continue,
                [
                    (ShouldContinue::Actions, TOOLS_NODE),
                    (ShouldContinue::Next, END),
                ],
            )?,
        };

        builder.compile()
    }

    /// Build the graph and run it over `messages`.
    ///
    /// The recursion limit is raised to [`Self::recursion_limit`] when the
    /// caller's is lower. Running out of model calls surfaces as a top-level
    /// `RecursionLimitExceeded`.
    pub async fn run(
        &self,
        messages: Vec<ChatMessage>,
        options: RunOptions,
    ) -> Result<RunOutcome<AgentState>> {
        let graph = self.build()?;
        let needed = self.recursion_limit();
        let options = if options.recursion_limit < needed {
            options.with_recursion_limit(needed)
        } else {
            options
        };
        let mut outcome = graph
            .invoke(AgentUpdate::default().messages(messages), options)
            .await;
        outcome.status = match outcome.status {
            RunStatus::Failed(InkflowError::NodeFailed { node, source })
                if node.as_str() == AGENT_NODE
                    && matches!(*source, InkflowError::RecursionLimitExceeded(_)) =>
            {
                RunStatus::Failed(*source)
            }
            other => other,
        };
        Ok(outcome)
    }
}

/// Calls the model with the conversation and the available tools.
struct ModelNode {
    model: Arc<dyn ModelClient>,
    definitions: Vec<ToolDefinition>,
    middleware: MiddlewareChain,
    max_model_calls: usize,
}

impl Node<AgentState> for ModelNode {
    fn run<'a>(
        &'a self,
        state: &'a AgentState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<AgentUpdate>> {
        Box::pin(async move {
            if state.model_calls >= self.max_model_calls {
                return Err(InkflowError::RecursionLimitExceeded(self.max_model_calls));
            }

            let messages = self.middleware.apply(state.messages.clone()).await?;
            debug!(messages = messages.len(), tools = self.definitions.len(), "Invoking model");
            let response = self.model.invoke(messages, &self.definitions).await?;

            let text = response.message.text();
            if !text.is_empty() {
                ctx.emit(EventKind::Thinking { text });
            }
            let calls = response.message.tool_calls();
            for call in &calls {
                ctx.emit(EventKind::Action {
                    tool: call.name.clone(),
                    input: call.input.clone(),
                });
            }

            info!(
                call = state.model_calls + 1,
                tool_calls = calls.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "Model replied"
            );

            Ok(AgentUpdate::default()
                .messages(vec![response.message])
                .model_calls(state.model_calls + 1)
                .usage(state.usage.combined(response.usage)))
        })
    }
}

/// Executes every tool call of the latest assistant message.
struct ToolNode {
    tools: Arc<ToolRegistry>,
    parallel: bool,
}

impl ToolNode {
    async fn call(
        tools: &ToolRegistry,
        run_id: String,
        id: String,
        name: String,
        input: Value,
    ) -> (String, String, ToolResult) {
        let ctx = ToolContext {
            run_id,
            call_id: id.clone(),
        };
        let result = match tools.execute(&name, input, ctx).await {
            Ok(r) => r,
            Err(e) => {
                error!(tool = %name, error = %e, "Tool execution failed");
                ToolResult::error(e.to_string())
            }
        };
        (name, id, result)
    }
}

impl Node<AgentState> for ToolNode {
    fn run<'a>(
        &'a self,
        state: &'a AgentState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<AgentUpdate>> {
        Box::pin(async move {
            let calls = match state.messages.last() {
                Some(m) if m.role == Role::Assistant => m.tool_calls(),
                _ => Vec::new(),
            };
            let run_id = ctx.run_id().to_string();

            // Results are collected in request order either way.
            let results: Vec<(String, String, ToolResult)> = if self.parallel && calls.len() > 1 {
                let futs = calls.into_iter().map(|tc| {
                    Self::call(&self.tools, run_id.clone(), tc.id, tc.name, tc.input)
                });
                futures::future::join_all(futs).await
            } else {
                let mut results = Vec::with_capacity(calls.len());
                for tc in calls {
                    results.push(Self::call(&self.tools, run_id.clone(), tc.id, tc.name, tc.input).await);
                }
                results
            };

            let mut messages = Vec::with_capacity(results.len());
            for (name, id, result) in results {
                ctx.emit(EventKind::ToolResult {
                    tool: name,
                    content: result.content.clone(),
                    is_error: result.is_error,
                });
                messages.push(ChatMessage::tool_result(id, result.content, result.is_error));
            }

            Ok(AgentUpdate::default().messages(messages))
        })
    }
}

/// Asks the model for a final answer in the configured format.
struct StructuredResponseNode {
    model: Arc<dyn ModelClient>,
    format: ResponseFormat,
    middleware: MiddlewareChain,
}

impl Node<AgentState> for StructuredResponseNode {
    fn run<'a>(
        &'a self,
        state: &'a AgentState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<AgentUpdate>> {
        Box::pin(async move {
            let messages = self.middleware.apply(state.messages.clone()).await?;
            let response = self.model.invoke_structured(messages, &self.format).await?;
            let text = response.message.text();

            let value = OutputCleaner::parse_json(&text).map_err(|e| {
                InkflowError::Validation(format!(
                    "structured response '{}' is not valid JSON: {}",
                    self.format.name, e
                ))
            })?;
            let missing: Vec<String> = self
                .format
                .required_keys()
                .into_iter()
                .filter(|k| value.get(k).is_none())
                .collect();
            if !missing.is_empty() {
                return Err(InkflowError::Validation(format!(
                    "structured response '{}' is missing keys: {}",
                    self.format.name,
                    missing.join(", ")
                )));
            }

            ctx.emit(EventKind::Thinking { text });
            Ok(AgentUpdate::default()
                .structured_response(Some(value))
                .usage(state.usage.combined(response.usage)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkflow_test_utils::{text_reply, tool_call_reply, ScriptedModel, StaticTool};
    use serde_json::json;

    #[test]
    fn test_recursion_limit_for_tools() {
        assert_eq!(recursion_limit_for_tools(0), 64);
        assert_eq!(recursion_limit_for_tools(12), 73);
        assert_eq!(recursion_limit_for_tools(40), 128);
    }

    #[test]
    fn test_should_continue() {
        let mut state = AgentState::default();
        assert_eq!(should_continue(&state), ShouldContinue::Next);

        state.messages.push(tool_call_reply("c1", "search", json!({})).message);
        assert_eq!(should_continue(&state), ShouldContinue::Actions);

        state.messages.push(ChatMessage::tool_result("c1", "ok", false));
        assert_eq!(should_continue(&state), ShouldContinue::Next);
    }

    #[tokio::test]
    async fn test_model_call_budget() {
        let model = ScriptedModel::new(vec![
            tool_call_reply("c1", "search", json!({})),
            tool_call_reply("c2", "search", json!({})),
            tool_call_reply("c3", "search", json!({})),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(StaticTool::new("search", "nothing"));
        let agent = AgentLoop::new(Arc::new(model.clone()))
            .with_tools(tools)
            .with_config(AgentLoopConfig {
                max_model_calls: 2,
                parallel_tools: true,
                tool_timeout_secs: None,
            });

        let outcome = agent
            .run(vec![ChatMessage::user("find it")], RunOptions::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome.error(),
            Some(InkflowError::RecursionLimitExceeded(2))
        ));
        assert_eq!(model.call_count(), 2);
        assert_eq!(outcome.state.model_calls, 2);
    }

    #[tokio::test]
    async fn test_run_raises_low_recursion_limit() {
        let model = ScriptedModel::new(vec![
            tool_call_reply("c1", "search", json!({})),
            tool_call_reply("c2", "search", json!({})),
            text_reply("found it"),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(StaticTool::new("search", "nothing"));
        let agent = AgentLoop::new(Arc::new(model)).with_tools(tools);
        assert_eq!(agent.recursion_limit(), 64);

        let outcome = agent
            .run(
                vec![ChatMessage::user("find it")],
                RunOptions::new().with_recursion_limit(2),
            )
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.steps, 5);
    }

    #[tokio::test]
    async fn test_graph_without_format_has_no_structured_node() {
        let agent = AgentLoop::new(Arc::new(ScriptedModel::new(vec![text_reply("hi")])));
        let graph = agent.build().unwrap();
        assert_eq!(graph.node_names(), vec![AGENT_NODE, TOOLS_NODE]);
    }
}
