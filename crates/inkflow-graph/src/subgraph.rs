use futures::future::BoxFuture;
use tracing::debug;

use inkflow_core::error::{InkflowError, Result};

use crate::context::{NodeContext, RunOptions};
use crate::executor::{self, RunStatus};
use crate::graph::CompiledGraph;
use crate::node::Node;
use crate::state::GraphState;

type InputMap<P, C> = Box<dyn Fn(&P) -> <C as GraphState>::Update + Send + Sync>;
type OutputMap<P, C> = Box<dyn Fn(C) -> <P as GraphState>::Update + Send + Sync>;

/// A node that runs another compiled graph to completion.
///
/// The child gets its own run id (`<parent>/<node>`), a child cancellation
/// token and the parent's event sink. Its checkpoints stay in memory. A
/// failed child fails this node. A child stopped by the parent's token ends
/// the parent as cancelled, with the state from before this node.
pub struct SubgraphNode<P: GraphState, C: GraphState> {
    graph: CompiledGraph<C>,
    input: InputMap<P, C>,
    output: OutputMap<P, C>,
    recursion_limit: usize,
}

impl<P: GraphState, C: GraphState> SubgraphNode<P, C> {
    pub fn new(
        graph: CompiledGraph<C>,
        input: impl Fn(&P) -> C::Update + Send + Sync + 'static,
        output: impl Fn(C) -> P::Update + Send + Sync + 'static,
    ) -> Self {
        Self {
            graph,
            input: Box::new(input),
            output: Box::new(output),
            recursion_limit: RunOptions::default().recursion_limit,
        }
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }
}

impl<P: GraphState, C: GraphState> Node<P> for SubgraphNode<P, C> {
    fn run<'a>(&'a self, state: &'a P, ctx: &'a NodeContext) -> BoxFuture<'a, Result<P::Update>> {
        Box::pin(async move {
            let run_id = format!("{}/{}", ctx.run_id(), ctx.node());
            let options = RunOptions::new()
                .with_run_id(run_id.clone())
                .with_recursion_limit(self.recursion_limit)
                .with_cancel(ctx.run().cancel_token().child_token())
                .with_events(ctx.run().events().clone());

            debug!(subgraph = %self.graph.name(), run_id = %run_id, "Entering subgraph");
            let outcome = executor::execute(&self.graph, (self.input)(state), options).await;

            match outcome.status {
                RunStatus::Completed => Ok((self.output)(outcome.state)),
                RunStatus::Cancelled { .. } => Err(InkflowError::Cancelled),
                RunStatus::Failed(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::builder::{GraphBuilder, END, START};
    use crate::executor::CancelReason;
    use crate::graph_state;
    use crate::node::node_fn;
    use crate::state::{Append, Replace};

    graph_state! {
        struct Outer / OuterUpdate {
            topic: Replace<String> = String::new(),
            findings: Append<String> = Vec::new(),
        }
    }

    graph_state! {
        struct Inner / InnerUpdate {
            query: Replace<String> = String::new(),
            notes: Append<String> = Vec::new(),
        }
    }

    fn research_graph(fail: bool) -> CompiledGraph<Inner> {
        GraphBuilder::new("research")
            .add_node(
                "search",
                node_fn(move |s: Inner, _ctx| async move {
                    if fail {
                        return Err(InkflowError::ToolNotFound("search".into()));
                    }
                    Ok(InnerUpdate::default().notes(vec![format!("about {}", s.query)]))
                }),
            )
            .unwrap()
            .add_edge(START, "search")
            .unwrap()
            .add_edge("search", END)
            .unwrap()
            .compile()
            .unwrap()
    }

    fn outer_graph(fail: bool) -> CompiledGraph<Outer> {
        let research = SubgraphNode::new(
            research_graph(fail),
            |s: &Outer| InnerUpdate::default().query(s.topic.clone()),
            |inner: Inner| OuterUpdate::default().findings(inner.notes),
        );
        GraphBuilder::new("outer")
            .add_node("research", research)
            .unwrap()
            .add_edge(START, "research")
            .unwrap()
            .add_edge("research", END)
            .unwrap()
            .compile()
            .unwrap()
    }

    #[tokio::test]
    async fn test_subgraph_maps_state_both_ways() {
        let outcome = outer_graph(false)
            .invoke(OuterUpdate::default().topic("checkout".into()), RunOptions::new())
            .await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.state.findings, vec!["about checkout"]);
    }

    #[tokio::test]
    async fn test_subgraph_failure_fails_parent_node() {
        let outcome = outer_graph(true)
            .invoke(OuterUpdate::default(), RunOptions::new())
            .await;
        let err = outcome.error().unwrap();
        assert!(matches!(err, InkflowError::NodeFailed { node, .. } if node == "research"));
        assert!(matches!(err.root_cause(), InkflowError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_parent_cancel_inside_subgraph_cancels_parent() {
        let cancel = CancellationToken::new();
        let second_ran = Arc::new(AtomicUsize::new(0));

        let trigger = cancel.clone();
        let counter = Arc::clone(&second_ran);
        let child = GraphBuilder::new("research")
            .add_node(
                "c1",
                node_fn(move |_s: Inner, _ctx| {
                    let trigger = trigger.clone();
                    async move {
                        trigger.cancel();
                        Ok(InnerUpdate::default().notes(vec!["first".into()]))
                    }
                }),
            )
            .unwrap()
            .add_node(
                "c2",
                node_fn(move |_s: Inner, _ctx| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(InnerUpdate::default().notes(vec!["second".into()]))
                    }
                }),
            )
            .unwrap()
            .add_edge(START, "c1")
            .unwrap()
            .add_edge("c1", "c2")
            .unwrap()
            .add_edge("c2", END)
            .unwrap()
            .compile()
            .unwrap();

        let parent = GraphBuilder::new("outer")
            .add_node(
                "sub",
                SubgraphNode::new(
                    child,
                    |s: &Outer| InnerUpdate::default().query(s.topic.clone()),
                    |inner: Inner| OuterUpdate::default().findings(inner.notes),
                ),
            )
            .unwrap()
            .add_edge(START, "sub")
            .unwrap()
            .add_edge("sub", END)
            .unwrap()
            .compile()
            .unwrap();

        let outcome = parent
            .invoke(
                OuterUpdate::default().topic("checkout".into()),
                RunOptions::new().with_cancel(cancel),
            )
            .await;

        assert!(matches!(
            outcome.status,
            RunStatus::Cancelled {
                reason: CancelReason::Requested
            }
        ));
        assert!(outcome.path.is_empty());
        assert_eq!(outcome.state.topic, "checkout");
        assert!(outcome.state.findings.is_empty());
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_child_cancelled_error_without_parent_cancel_still_fails() {
        let graph = GraphBuilder::new("outer")
            .add_node(
                "bogus",
                node_fn(|_s: Outer, _ctx| async { Err::<OuterUpdate, _>(InkflowError::Cancelled) }),
            )
            .unwrap()
            .add_edge(START, "bogus")
            .unwrap()
            .compile()
            .unwrap();
        let outcome = graph.invoke(OuterUpdate::default(), RunOptions::new()).await;
        assert!(matches!(outcome.error(), Some(InkflowError::NodeFailed { node, .. }) if node == "bogus"));
    }
}
