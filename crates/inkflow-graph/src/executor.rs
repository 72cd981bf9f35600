use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use inkflow_core::error::{InkflowError, Result};
use inkflow_core::event::{EventKind, EventSink, RunEvent};
use inkflow_core::types::RunId;

use crate::builder::{END, START};
use crate::checkpoint::CheckpointRecord;
use crate::context::{NodeContext, RunContext, RunOptions};
use crate::graph::CompiledGraph;
use crate::state::GraphState;

/// Why a run stopped early without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled the token.
    Requested,
    /// The run's deadline elapsed.
    DeadlineExceeded,
}

/// Terminal status of a run.
#[derive(Debug)]
pub enum RunStatus {
    Completed,
    Cancelled { reason: CancelReason },
    Failed(InkflowError),
}

/// Result of a run: the last consistent state and how the run ended.
#[derive(Debug)]
pub struct RunOutcome<S> {
    pub run_id: RunId,
    /// State after the last node that completed.
    pub state: S,
    pub status: RunStatus,
    /// Nodes executed, in order.
    pub path: Vec<String>,
    pub steps: usize,
    pub elapsed_ms: u64,
}

impl<S> RunOutcome<S> {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, RunStatus::Cancelled { .. })
    }

    pub fn error(&self) -> Option<&InkflowError> {
        match &self.status {
            RunStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// The final state if the run completed, the failure otherwise.
    pub fn into_result(self) -> Result<S> {
        match self.status {
            RunStatus::Completed => Ok(self.state),
            RunStatus::Cancelled { .. } => Err(InkflowError::Cancelled),
            RunStatus::Failed(e) => Err(e),
        }
    }
}

/// A run executing on a background task.
pub struct RunHandle<S> {
    run_id: RunId,
    events: mpsc::UnboundedReceiver<RunEvent>,
    cancel: CancellationToken,
    task: JoinHandle<RunOutcome<S>>,
}

impl<S> RunHandle<S> {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event, or `None` once the run has finished and all events were read.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the outcome. Unread events are discarded.
    pub async fn finish(self) -> Result<RunOutcome<S>> {
        self.task
            .await
            .map_err(|e| InkflowError::Panic(format!("run task failed: {}", e)))
    }
}

/// Run a compiled graph to completion.
///
/// The state starts at its defaults merged with `initial`. The run never
/// returns early with `Err`; every outcome, including failures, carries the
/// state as it was after the last completed node.
pub async fn execute<S: GraphState>(
    graph: &CompiledGraph<S>,
    initial: S::Update,
    options: RunOptions,
) -> RunOutcome<S> {
    let mut state = S::default();
    state.merge(initial);
    let run_id = options.run_id.clone().unwrap_or_default();
    let span = info_span!("run", graph = %graph.name(), run_id = %run_id);

    Run::new(graph, run_id, &options)
        .drive(state, START.to_string(), 0, Vec::new())
        .instrument(span)
        .await
}

/// Spawn a run and stream its events.
///
/// Any event sink in `options` is replaced by the handle's channel.
pub fn execute_streaming<S: GraphState>(
    graph: &CompiledGraph<S>,
    initial: S::Update,
    options: RunOptions,
) -> RunHandle<S> {
    let (sink, events) = EventSink::channel();
    let run_id = options.run_id.clone().unwrap_or_default();
    let cancel = options.cancel.clone();
    let options = options.with_run_id(run_id.clone()).with_events(sink);
    let graph = graph.clone();

    let task = tokio::spawn(async move { execute(&graph, initial, options).await });

    RunHandle {
        run_id,
        events,
        cancel,
        task,
    }
}

/// Continue a run from its latest checkpoint.
///
/// Routing is recomputed from the checkpointed node over the restored state,
/// so a run that had already finished completes immediately.
pub async fn resume<S: GraphState>(
    graph: &CompiledGraph<S>,
    run_id: impl Into<RunId>,
    options: RunOptions,
) -> Result<RunOutcome<S>> {
    let run_id = run_id.into();
    let records = options.checkpoints.list(run_id.as_str())?;
    let latest = records
        .last()
        .ok_or_else(|| InkflowError::Checkpoint(format!("no checkpoints for run {}", run_id)))?;
    let state: S = serde_json::from_value(latest.state.clone())?;
    let steps = latest.step;
    let node = latest.node.clone();
    let path = records.iter().map(|r| r.node.clone()).collect();

    info!(run_id = %run_id, node = %node, steps, "Resuming run from checkpoint");

    let span = info_span!("run", graph = %graph.name(), run_id = %run_id);
    let outcome = async {
        let run = Run::new(graph, run_id.clone(), &options);
        let start = Instant::now();
        match graph.next(&node, &state) {
            Ok(next) => run.drive(state, next, steps, path).await,
            Err(e) => run.fail_run(state, &node, e, path, steps, start),
        }
    }
    .instrument(span)
    .await;
    Ok(outcome)
}

/// One invocation's driver: context, deadline and checkpoint target.
struct Run<'g, S: GraphState> {
    graph: &'g CompiledGraph<S>,
    ctx: RunContext,
    options: &'g RunOptions,
    deadline_hit: Arc<AtomicBool>,
}

impl<'g, S: GraphState> Run<'g, S> {
    fn new(graph: &'g CompiledGraph<S>, run_id: RunId, options: &'g RunOptions) -> Self {
        let ctx = RunContext::new(
            run_id,
            options.cancel.child_token(),
            options.events.clone(),
            options.metadata.clone(),
        );
        Self {
            graph,
            ctx,
            options,
            deadline_hit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the run token when the deadline passes. The timer stops when
    /// the returned guard is dropped.
    fn arm_deadline(&self) -> Option<tokio_util::sync::DropGuard> {
        let timeout = self.options.timeout?;
        let done = CancellationToken::new();
        let run_token = self.ctx.cancel_token().clone();
        let hit = Arc::clone(&self.deadline_hit);
        let stop = done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    hit.store(true, Ordering::SeqCst);
                    run_token.cancel();
                }
                _ = stop.cancelled() => {}
            }
        });
        Some(done.drop_guard())
    }

    async fn drive(
        &self,
        mut state: S,
        cursor: String,
        mut steps: usize,
        mut path: Vec<String>,
    ) -> RunOutcome<S> {
        let start = Instant::now();
        let _deadline = self.arm_deadline();
        let limit = self.options.recursion_limit;

        let mut current = if cursor == START {
            match self.graph.next(START, &state) {
                Ok(next) => next,
                Err(e) => return self.fail_run(state, START, e, path, steps, start),
            }
        } else {
            cursor
        };

        info!(entry = %current, "Run started");

        loop {
            if current == END {
                return self.finish(state, RunStatus::Completed, path, steps, start);
            }

            if self.ctx.is_cancelled() {
                let reason = self.cancel_reason();
                warn!(next = %current, ?reason, "Run cancelled before node");
                return self.finish(state, RunStatus::Cancelled { reason }, path, steps, start);
            }

            if steps >= limit {
                warn!(limit, next = %current, "Recursion limit reached");
                let err = InkflowError::RecursionLimitExceeded(limit);
                return self.fail_run(state, &current, err, path, steps, start);
            }

            let node = match self.graph.node(&current) {
                Ok(node) => node,
                Err(e) => return self.fail_run(state, &current, e, path, steps, start),
            };

            let step = steps + 1;
            let node_ctx = NodeContext::new(self.ctx.clone(), current.as_str(), step);
            let node_start = Instant::now();
            debug!(node = %current, step, "Executing node");

            let result = AssertUnwindSafe(node.run(&state, &node_ctx))
                .catch_unwind()
                .await;
            let update = match result {
                Ok(Ok(update)) => update,
                // A nested run stopped by this run's token.
                Ok(Err(e))
                    if matches!(e.root_cause(), InkflowError::Cancelled) && self.ctx.is_cancelled() =>
                {
                    let reason = self.cancel_reason();
                    warn!(node = %current, ?reason, "Run cancelled inside node");
                    return self.finish(state, RunStatus::Cancelled { reason }, path, steps, start);
                }
                Ok(Err(e)) => {
                    error!(node = %current, error = %e, "Node failed");
                    return self.fail_node(state, &current, e, path, steps, start);
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(node = %current, panic = %message, "Node panicked");
                    return self.fail_node(
                        state,
                        &current,
                        InkflowError::Panic(message),
                        path,
                        steps,
                        start,
                    );
                }
            };

            let changed = state.merge(update);
            steps = step;
            path.push(current.clone());

            if let Err(e) = self.checkpoint(&state, &current, step) {
                error!(node = %current, error = %e, "Checkpoint save failed");
                return self.fail_run(state, &current, e, path, steps, start);
            }

            debug!(
                node = %current,
                step,
                elapsed_ms = node_start.elapsed().as_millis() as u64,
                changed = ?changed,
                "Node complete"
            );
            self.ctx.emit(&current, EventKind::StepCompleted {
                step,
                changed: changed.iter().map(|f| f.to_string()).collect(),
            });

            current = match self.graph.next(&current, &state) {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Routing failed");
                    return self.fail_run(state, &current, e, path, steps, start);
                }
            };
        }
    }

    fn cancel_reason(&self) -> CancelReason {
        if self.deadline_hit.load(Ordering::SeqCst) {
            CancelReason::DeadlineExceeded
        } else {
            CancelReason::Requested
        }
    }

    fn checkpoint(&self, state: &S, node: &str, step: usize) -> Result<()> {
        let record = CheckpointRecord {
            run_id: self.ctx.run_id().to_string(),
            step,
            node: node.to_string(),
            state: serde_json::to_value(state)
                .map_err(|e| InkflowError::Checkpoint(format!("state not serializable: {}", e)))?,
            timestamp: Utc::now(),
        };
        self.options.checkpoints.save(&record)
    }

    /// Report `err` on the event stream and end the run with it.
    fn fail_run(
        &self,
        state: S,
        node: &str,
        err: InkflowError,
        path: Vec<String>,
        steps: usize,
        start: Instant,
    ) -> RunOutcome<S> {
        self.ctx.emit(node, EventKind::Error {
            message: err.to_string(),
        });
        self.finish(state, RunStatus::Failed(err), path, steps, start)
    }

    fn fail_node(
        &self,
        state: S,
        node: &str,
        source: InkflowError,
        path: Vec<String>,
        steps: usize,
        start: Instant,
    ) -> RunOutcome<S> {
        self.ctx.emit(node, EventKind::Error {
            message: source.to_string(),
        });
        let err = InkflowError::node_failed(node, source);
        self.finish(state, RunStatus::Failed(err), path, steps, start)
    }

    fn finish(
        &self,
        state: S,
        status: RunStatus,
        path: Vec<String>,
        steps: usize,
        start: Instant,
    ) -> RunOutcome<S> {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &status {
            RunStatus::Completed => info!(steps, elapsed_ms, "Run completed"),
            RunStatus::Cancelled { reason } => info!(steps, elapsed_ms, ?reason, "Run cancelled"),
            RunStatus::Failed(e) => error!(steps, elapsed_ms, error = %e, "Run failed"),
        }
        RunOutcome {
            run_id: self.ctx.run_id().clone(),
            state,
            status,
            path,
            steps,
            elapsed_ms,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
