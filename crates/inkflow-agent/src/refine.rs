//! Generate-validate-refine loop.
//!
//! A generator proposes a candidate, a validator checks it, and a rejection
//! is fed back to the generator until the candidate passes or the retry
//! ceiling is reached. Running out of retries is a normal completion; the
//! final `status` says which way the loop ended.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use inkflow_core::config::RefineConfig;
use inkflow_core::error::Result;
use inkflow_core::traits::{ModelClient, Validation, Validator};
use inkflow_core::types::{ChatMessage, Role};
use inkflow_graph::state::{Append, Replace};
use inkflow_graph::{
    graph_state, route_label, CompiledGraph, GraphBuilder, Node, NodeContext, RunOptions,
    RunOutcome, END, START,
};

pub const GENERATE_NODE: &str = "generate";
pub const VALIDATE_NODE: &str = "validate";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineStatus {
    #[default]
    Pending,
    /// Last candidate was rejected; another attempt follows.
    Retrying,
    Validated,
    /// Retry ceiling reached without a valid candidate.
    Exhausted,
}

graph_state! {
    /// State of one refinement run.
    pub struct RefineState / RefineUpdate {
        /// Caller-supplied input, e.g. the story and research notes.
        pub context: Replace<Value> = Value::Null,
        pub messages: Append<ChatMessage> = Vec::new(),
        pub candidate: Replace<Option<String>> = None,
        pub artifact: Replace<Option<Value>> = None,
        /// Reason the last candidate was rejected.
        pub last_error: Replace<Option<String>> = None,
        /// Failed validations so far.
        pub retries: Replace<u32> = 0,
        /// Generator invocations so far.
        pub attempts: Replace<u32> = 0,
        pub status: Replace<RefineStatus> = RefineStatus::Pending,
    }
}

/// One generator answer.
#[derive(Debug, Clone)]
pub struct Generation {
    pub candidate: String,
    /// Conversation turns to append (request and reply).
    pub messages: Vec<ChatMessage>,
}

impl Generation {
    /// A bare candidate. Nothing is appended to `messages`, so generators
    /// that want the conversation recorded use [`Generation::with_messages`].
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// Produces a candidate from the current state, including prior feedback.
pub trait Generator: Send + Sync + 'static {
    fn generate<'a>(&'a self, state: &'a RefineState) -> BoxFuture<'a, Result<Generation>>;
}

/// Generator backed by an async closure over an owned state clone.
pub struct FnGenerator<F> {
    f: F,
}

pub fn generator_fn<F, Fut>(f: F) -> FnGenerator<F>
where
    F: Fn(RefineState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Generation>> + Send + 'static,
{
    FnGenerator { f }
}

impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(RefineState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Generation>> + Send + 'static,
{
    fn generate<'a>(&'a self, state: &'a RefineState) -> BoxFuture<'a, Result<Generation>> {
        Box::pin((self.f)(state.clone()))
    }
}

/// Generator that keeps a conversation with a model.
///
/// The first attempt sends the instructions and the context. Each retry
/// continues the same conversation with the validator's feedback.
pub struct ModelGenerator {
    model: Arc<dyn ModelClient>,
    instructions: String,
}

impl ModelGenerator {
    pub fn new(model: Arc<dyn ModelClient>, instructions: impl Into<String>) -> Self {
        Self {
            model,
            instructions: instructions.into(),
        }
    }

    fn request(&self, state: &RefineState) -> Vec<ChatMessage> {
        match &state.last_error {
            Some(reason) if !state.messages.is_empty() => vec![ChatMessage::user(format!(
                "The previous answer was rejected: {}\nRevise it and answer again.",
                reason
            ))],
            _ => {
                let context = match &state.context {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
                };
                let mut request = vec![ChatMessage::system(self.instructions.clone())];
                if !context.is_empty() {
                    request.push(ChatMessage::user(context));
                }
                request
            }
        }
    }
}

impl Generator for ModelGenerator {
    fn generate<'a>(&'a self, state: &'a RefineState) -> BoxFuture<'a, Result<Generation>> {
        Box::pin(async move {
            let request = self.request(state);
            let mut conversation = state.messages.clone();
            conversation.extend(request.iter().cloned());

            let response = self.model.invoke(conversation, &[]).await?;
            let candidate = response.message.text();

            let mut messages = request;
            messages.push(response.message);
            Ok(Generation::new(candidate).with_messages(messages))
        })
    }
}

route_label! {
    pub enum RefineRoute {
        Retry => "retry",
        Done => "done",
    }
}

/// Retry while the last candidate was rejected and the ceiling allows it.
pub fn refine_route(state: &RefineState, max_retries: u32) -> RefineRoute {
    if state.last_error.is_some() && state.retries < max_retries {
        RefineRoute::Retry
    } else {
        RefineRoute::Done
    }
}

struct GenerateNode {
    generator: Arc<dyn Generator>,
}

impl Node<RefineState> for GenerateNode {
    fn run<'a>(
        &'a self,
        state: &'a RefineState,
        _ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<RefineUpdate>> {
        Box::pin(async move {
            let generation = self.generator.generate(state).await?;
            info!(attempt = state.attempts + 1, chars = generation.candidate.len(), "Candidate generated");
            Ok(RefineUpdate::default()
                .messages(generation.messages)
                .candidate(Some(generation.candidate))
                .attempts(state.attempts + 1))
        })
    }
}

struct ValidateNode {
    validator: Arc<dyn Validator>,
    max_retries: u32,
}

impl Node<RefineState> for ValidateNode {
    fn run<'a>(
        &'a self,
        state: &'a RefineState,
        _ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<RefineUpdate>> {
        Box::pin(async move {
            let verdict = match &state.candidate {
                Some(candidate) => self.validator.validate(candidate.clone()).await?,
                None => Validation::invalid("no candidate was produced"),
            };

            Ok(match verdict {
                Validation::Valid(artifact) => {
                    info!(attempt = state.attempts, "Candidate accepted");
                    RefineUpdate::default()
                        .artifact(Some(artifact))
                        .last_error(None)
                        .status(RefineStatus::Validated)
                }
                Validation::Invalid { reason } => {
                    let retries = state.retries + 1;
                    let status = if retries >= self.max_retries {
                        RefineStatus::Exhausted
                    } else {
                        RefineStatus::Retrying
                    };
                    warn!(retries, max = self.max_retries, reason = %reason, "Candidate rejected");
                    RefineUpdate::default()
                        .retries(retries)
                        .last_error(Some(reason))
                        .status(status)
                }
            })
        })
    }
}

/// Builder for the refinement graph.
pub struct RefineLoop {
    generator: Arc<dyn Generator>,
    validator: Arc<dyn Validator>,
    max_retries: u32,
}

impl RefineLoop {
    pub fn new(generator: impl Generator, validator: impl Validator) -> Self {
        Self {
            generator: Arc::new(generator),
            validator: Arc::new(validator),
            max_retries: RefineConfig::default().max_retries,
        }
    }

    /// Failed validations tolerated; with a ceiling of K at most K candidates are generated.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_config(self, config: &RefineConfig) -> Self {
        self.with_max_retries(config.max_retries)
    }

    pub fn build(&self) -> Result<CompiledGraph<RefineState>> {
        let max_retries = self.max_retries;
        GraphBuilder::new("refine_loop")
            .add_node(
                GENERATE_NODE,
                GenerateNode {
                    generator: Arc::clone(&self.generator),
                },
            )?
            .add_node(
                VALIDATE_NODE,
                ValidateNode {
                    validator: Arc::clone(&self.validator),
                    max_retries,
                },
            )?
            .add_edge(START, GENERATE_NODE)?
            .add_edge(GENERATE_NODE, VALIDATE_NODE)?
            .add_conditional_edge(
                VALIDATE_NODE,
                move |state: &RefineState| refine_route(state, max_retries),
                [(RefineRoute::Retry, GENERATE_NODE), (RefineRoute::Done, END)],
            )?
            .compile()
    }

    /// Build the graph and refine a candidate for `context`.
    ///
    /// Each round costs two steps, so the recursion limit is raised to fit
    /// the retry ceiling when needed.
    pub async fn run(&self, context: Value, options: RunOptions) -> Result<RunOutcome<RefineState>> {
        let graph = self.build()?;
        let needed = 2 * self.max_retries.max(1) as usize;
        let options = if options.recursion_limit < needed {
            options.with_recursion_limit(needed)
        } else {
            options
        };
        Ok(graph
            .invoke(RefineUpdate::default().context(context), options)
            .await)
    }
}

impl RefineState {
    /// Assistant replies in order, one per attempt with a model generator.
    pub fn replies(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role == Role::Assistant)
    }
}
