//! Graph execution engine.
//!
//! A workflow is a directed graph of async [`Node`]s over a typed state.
//! Each node returns a partial update which the executor folds into the
//! state through per-field reducers, then follows the node's outgoing edge:
//! either a fixed target or a router over the post-merge state. Cycles are
//! allowed; termination is bounded by the run's recursion limit.
//!
//! Graphs are validated once by [`GraphBuilder::compile`] and are immutable
//! afterwards, so one [`CompiledGraph`] can serve many concurrent runs.

pub mod builder;
pub mod checkpoint;
pub mod context;
pub mod executor;
pub mod graph;
pub mod node;
pub mod state;
pub mod subgraph;

pub use builder::{GraphBuilder, RouteLabel, END, START};
pub use checkpoint::{
    CheckpointRecord, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore,
};
pub use context::{NodeContext, RunContext, RunOptions};
pub use executor::{
    execute, execute_streaming, resume, CancelReason, RunHandle, RunOutcome, RunStatus,
};
pub use graph::CompiledGraph;
pub use node::{node_fn, FnNode, Node};
pub use state::{Append, GraphState, Reducer, Replace};
pub use subgraph::SubgraphNode;
