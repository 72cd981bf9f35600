use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// What happened inside a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Model produced reasoning or answer text.
    Thinking { text: String },
    /// Model requested a tool call.
    Action {
        tool: String,
        input: serde_json::Value,
    },
    /// A tool call finished.
    ToolResult {
        tool: String,
        content: String,
        is_error: bool,
    },
    /// A node finished and its update was merged.
    StepCompleted { step: usize, changed: Vec<String> },
    /// A node or the run failed.
    Error { message: String },
}

/// Event emitted by a run, tagged with its origin.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub node: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// Per-run event channel.
///
/// Unbounded; emitters never wait and no event is dropped. A disabled sink
/// discards everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn publish(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            // Ignore error if the receiver is gone
            let _ = tx.send(event);
        }
    }
}
