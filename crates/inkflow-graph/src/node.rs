use std::future::Future;
use std::marker::PhantomData;

use futures::future::BoxFuture;

use inkflow_core::error::Result;

use crate::context::NodeContext;
use crate::state::GraphState;

/// One step of a workflow.
///
/// A node reads a snapshot of the state and returns a partial update. It
/// never mutates the state directly; the executor merges the update.
pub trait Node<S: GraphState>: Send + Sync + 'static {
    fn run<'a>(&'a self, state: &'a S, ctx: &'a NodeContext) -> BoxFuture<'a, Result<S::Update>>;
}

/// Node backed by an async closure. See [`node_fn`].
pub struct FnNode<S, F> {
    f: F,
    _state: PhantomData<fn() -> S>,
}

/// Wrap an async closure as a node.
///
/// The closure receives an owned clone of the state and of the node
/// context, so the returned future does not borrow from the executor.
pub fn node_fn<S, F, Fut>(f: F) -> FnNode<S, F>
where
    S: GraphState,
    F: Fn(S, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S::Update>> + Send + 'static,
{
    FnNode {
        f,
        _state: PhantomData,
    }
}

impl<S, F, Fut> Node<S> for FnNode<S, F>
where
    S: GraphState,
    F: Fn(S, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S::Update>> + Send + 'static,
{
    fn run<'a>(&'a self, state: &'a S, ctx: &'a NodeContext) -> BoxFuture<'a, Result<S::Update>> {
        Box::pin((self.f)(state.clone(), ctx.clone()))
    }
}
