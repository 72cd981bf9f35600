use std::collections::HashMap;
use std::sync::Arc;

use inkflow_core::error::{InkflowError, Result};

use crate::builder::END;
use crate::context::RunOptions;
use crate::executor::{self, RunHandle, RunOutcome};
use crate::node::Node;
use crate::state::GraphState;

pub(crate) type Router<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

pub(crate) enum Edge<S> {
    Direct(String),
    Conditional {
        router: Router<S>,
        targets: HashMap<String, String>,
        /// Every label the router can return, when known statically.
        domain: Option<Vec<String>>,
    },
}

pub(crate) struct GraphInner<S: GraphState> {
    pub(crate) name: String,
    pub(crate) nodes: HashMap<String, Arc<dyn Node<S>>>,
    pub(crate) order: Vec<String>,
    pub(crate) edges: HashMap<String, Edge<S>>,
}

/// Validated, immutable graph. Cheap to clone and share between runs.
pub struct CompiledGraph<S: GraphState> {
    inner: Arc<GraphInner<S>>,
}

impl<S: GraphState> Clone for CompiledGraph<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: GraphState> CompiledGraph<S> {
    pub(crate) fn new(inner: GraphInner<S>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Node names in registration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.inner.order.iter().map(|s| s.as_str()).collect()
    }

    pub(crate) fn node(&self, name: &str) -> Result<Arc<dyn Node<S>>> {
        self.inner
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| InkflowError::UnknownNode(name.to_string()))
    }

    /// Where control goes after `from`, given the post-merge state.
    ///
    /// A node with no outgoing edge is terminal.
    pub(crate) fn next(&self, from: &str, state: &S) -> Result<String> {
        match self.inner.edges.get(from) {
            None => Ok(END.to_string()),
            Some(Edge::Direct(to)) => Ok(to.clone()),
            Some(Edge::Conditional {
                router, targets, ..
            }) => {
                let label = router(state);
                targets
                    .get(&label)
                    .cloned()
                    .ok_or_else(|| InkflowError::Routing {
                        node: from.to_string(),
                        label,
                    })
            }
        }
    }

    /// Run to completion. See [`executor::execute`].
    pub async fn invoke(&self, initial: S::Update, options: RunOptions) -> RunOutcome<S> {
        executor::execute(self, initial, options).await
    }

    /// Run on a background task, streaming events. See [`executor::execute_streaming`].
    pub fn stream(&self, initial: S::Update, options: RunOptions) -> RunHandle<S> {
        executor::execute_streaming(self, initial, options)
    }
}

impl<S: GraphState> std::fmt::Debug for CompiledGraph<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.inner.name)
            .field("nodes", &self.inner.order)
            .finish()
    }
}
