use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Model client: one request, one complete reply.
pub trait ModelClient: Send + Sync + 'static {
    /// Send the conversation with the tools the model may call.
    fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ModelResponse>>;

    /// Ask for an answer shaped like `format`.
    ///
    /// Providers with native structured output override this. The default
    /// appends a JSON instruction and calls `invoke` without tools.
    fn invoke_structured(
        &self,
        mut messages: Vec<ChatMessage>,
        format: &ResponseFormat,
    ) -> BoxFuture<'_, Result<ModelResponse>> {
        messages.push(ChatMessage::user(format.instruction()));
        self.invoke(messages, &[])
    }
}

/// Tool: extensible tool execution.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Outcome of checking a candidate output.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Accepted, with the normalized artifact.
    Valid(serde_json::Value),
    /// Rejected; `reason` is fed back to the generator.
    Invalid { reason: String },
}

impl Validation {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Validator: deterministic or model-judged check of a candidate.
///
/// An `Err` is a fatal failure of the validator itself, not a rejection.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, candidate: String) -> BoxFuture<'_, Result<Validation>>;
}

/// Transformation applied to the conversation before every model call.
pub trait ModelMiddleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Return the (possibly rewritten) messages, or an error to block the call.
    fn before_invoke(&self, messages: Vec<ChatMessage>) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;
}
