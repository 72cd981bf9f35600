//! Deterministic stand-ins for models, tools, and validators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use inkflow_core::error::{InkflowError, Result};
use inkflow_core::traits::{ModelClient, Tool, Validation, Validator};
use inkflow_core::types::{
    ChatMessage, ModelResponse, ToolCall, ToolContext, ToolDefinition, ToolResult, Usage,
};

/// A plain text reply.
pub fn text_reply(text: &str) -> ModelResponse {
    ModelResponse::new(ChatMessage::assistant_text(text)).with_usage(Usage::new(10, 5))
}

/// A reply requesting one tool call.
pub fn tool_call_reply(id: &str, tool: &str, input: serde_json::Value) -> ModelResponse {
    tool_calls_reply(&[(id, tool, input)])
}

/// A reply requesting several tool calls, in order.
pub fn tool_calls_reply(calls: &[(&str, &str, serde_json::Value)]) -> ModelResponse {
    let calls = calls
        .iter()
        .map(|(id, name, input)| ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        })
        .collect();
    ModelResponse::new(ChatMessage::assistant_tool_calls("", calls)).with_usage(Usage::new(10, 5))
}

/// Model that replays a fixed script and records what it was sent.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    replies: Arc<Mutex<VecDeque<ModelResponse>>>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    tools_seen: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelResponse>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Messages sent on each invocation.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Tool names offered on each invocation.
    pub fn tools_seen(&self) -> Vec<Vec<String>> {
        self.tools_seen.lock().unwrap().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ModelResponse>> {
        self.calls.lock().unwrap().push(messages);
        self.tools_seen
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        let next = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
            next.ok_or_else(|| InkflowError::Model("scripted model ran out of replies".into()))
        })
    }
}

/// Tool that always returns the same output.
pub struct StaticTool {
    name: String,
    output: String,
    calls: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the tool moved into a registry.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed answer"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = self.output.clone();
        Box::pin(async move { Ok(ToolResult::success(output)) })
    }
}

/// Tool whose execution always errors.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let err = InkflowError::ToolExecution {
            tool: self.name.clone(),
            message: self.message.clone(),
        };
        Box::pin(async move { Err(err) })
    }
}

/// Tool that sleeps before answering.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Answers after a delay"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(ToolResult::success("done"))
        })
    }
}

/// Validator that rejects the first `rejections` candidates, then accepts.
#[derive(Clone)]
pub struct ScriptedValidator {
    rejections: usize,
    seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedValidator {
    pub fn rejecting(rejections: usize) -> Self {
        Self {
            rejections,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always_rejecting() -> Self {
        Self::rejecting(usize::MAX)
    }

    /// Candidates validated so far.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, candidate: String) -> BoxFuture<'_, Result<Validation>> {
        let mut seen = self.seen.lock().unwrap();
        seen.push(candidate.clone());
        let attempt = seen.len();
        let verdict = if attempt <= self.rejections {
            Validation::invalid(format!("attempt {} rejected", attempt))
        } else {
            Validation::Valid(serde_json::Value::String(candidate))
        };
        Box::pin(async move { Ok(verdict) })
    }
}
