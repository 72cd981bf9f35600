use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use inkflow_core::config::{AppConfig, CheckpointBackend};
use inkflow_core::error::Result;
use inkflow_core::event::{EventKind, EventSink, RunEvent};
use inkflow_core::types::RunId;

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};

/// Immutable per-run context shared by every node of one run.
#[derive(Clone)]
pub struct RunContext {
    run_id: RunId,
    cancel: CancellationToken,
    events: EventSink,
    metadata: Arc<HashMap<String, serde_json::Value>>,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        cancel: CancellationToken,
        events: EventSink,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            run_id,
            cancel,
            events,
            metadata: Arc::new(metadata),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub(crate) fn emit(&self, node: &str, kind: EventKind) {
        self.events.publish(RunEvent {
            run_id: self.run_id.to_string(),
            node: node.to_string(),
            kind,
            timestamp: Utc::now(),
        });
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("events", &self.events.is_enabled())
            .field("metadata", &self.metadata.len())
            .finish()
    }
}

/// What a node sees of its run: the run context plus its own name and step.
#[derive(Debug, Clone)]
pub struct NodeContext {
    run: RunContext,
    node: String,
    step: usize,
}

impl NodeContext {
    pub fn new(run: RunContext, node: impl Into<String>, step: usize) -> Self {
        Self {
            run,
            node: node.into(),
            step,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// 1-based index of this node execution within the run.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    pub fn run_id(&self) -> &RunId {
        self.run.run_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    /// Publish an event attributed to this node.
    pub fn emit(&self, kind: EventKind) {
        self.run.emit(&self.node, kind);
    }
}

/// Options for a single graph invocation.
#[derive(Clone)]
pub struct RunOptions {
    pub run_id: Option<RunId>,
    /// Node executions allowed before the run fails.
    pub recursion_limit: usize,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: EventSink,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            recursion_limit: 25,
            timeout: None,
            cancel: CancellationToken::new(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            events: EventSink::disabled(),
            metadata: HashMap::new(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from the `[engine]` and `[checkpoint]` sections. The sqlite
    /// backend opens (or creates) the database at `checkpoint.path`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let checkpoints: Arc<dyn CheckpointStore> = match config.checkpoint.backend {
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
            CheckpointBackend::Sqlite => Arc::new(SqliteCheckpointStore::open(Path::new(
                &config.checkpoint.path,
            ))?),
        };
        Ok(Self {
            recursion_limit: config.engine.recursion_limit,
            timeout: config.run_timeout(),
            checkpoints,
            ..Self::default()
        })
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
