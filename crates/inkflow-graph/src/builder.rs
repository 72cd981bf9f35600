use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use inkflow_core::error::{InkflowError, Result};

use crate::graph::{CompiledGraph, Edge, GraphInner, Router};
use crate::node::Node;
use crate::state::GraphState;

/// Entry sentinel. Its single outgoing edge selects the first node.
pub const START: &str = "__start__";
/// Terminal sentinel.
pub const END: &str = "__end__";

/// Closed set of labels a router can return.
///
/// Because the domain is known without running the router, `compile()` can
/// check that every label has a target.
pub trait RouteLabel: Copy + Eq + Hash + Send + Sync + 'static {
    fn variants() -> &'static [Self];
    fn as_str(&self) -> &'static str;
}

impl RouteLabel for bool {
    fn variants() -> &'static [Self] {
        &[true, false]
    }

    fn as_str(&self) -> &'static str {
        if *self {
            "true"
        } else {
            "false"
        }
    }
}

/// Declare an enum usable as a router result.
///
/// ```ignore
/// route_label! {
///     pub enum Review { Approve => "approve", Revise => "revise" }
/// }
/// ```
#[macro_export]
macro_rules! route_label {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $variant ),+
        }

        impl $crate::builder::RouteLabel for $name {
            fn variants() -> &'static [Self] {
                &[$( Self::$variant ),+]
            }

            fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }
    };
}

/// Incrementally assembles a graph. Consumed by [`compile`](Self::compile).
pub struct GraphBuilder<S: GraphState> {
    name: String,
    nodes: HashMap<String, Arc<dyn Node<S>>>,
    order: Vec<String>,
    edges: Vec<(String, Edge<S>)>,
}

impl<S: GraphState> GraphBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Register a node under a unique name.
    pub fn add_node(mut self, name: impl Into<String>, node: impl Node<S>) -> Result<Self> {
        let name = name.into();
        if name == START || name == END {
            return Err(InkflowError::GraphConfiguration(format!(
                "'{}' is a reserved node name",
                name
            )));
        }
        if name.is_empty() {
            return Err(InkflowError::GraphConfiguration(
                "node name must not be empty".to_string(),
            ));
        }
        if self.nodes.contains_key(&name) {
            return Err(InkflowError::DuplicateNode(name));
        }
        self.order.push(name.clone());
        self.nodes.insert(name, Arc::new(node));
        Ok(self)
    }

    /// Unconditional transition.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Result<Self> {
        let (from, to) = (from.into(), to.into());
        self.check_source(&from)?;
        self.check_target(&to)?;
        self.edges.push((from, Edge::Direct(to)));
        Ok(self)
    }

    /// Transition chosen by `router` over the post-merge state.
    ///
    /// `targets` maps each label to a registered node or [`END`]. Label
    /// completeness is checked by `compile()`.
    pub fn add_conditional_edge<L, F>(
        mut self,
        from: impl Into<String>,
        router: F,
        targets: impl IntoIterator<Item = (L, &'static str)>,
    ) -> Result<Self>
    where
        L: RouteLabel,
        F: Fn(&S) -> L + Send + Sync + 'static,
    {
        let from = from.into();
        self.check_source(&from)?;
        let targets = self.collect_targets(
            targets
                .into_iter()
                .map(|(label, to)| (label.as_str().to_string(), to.to_string())),
        )?;
        let router: Router<S> = Arc::new(move |state: &S| router(state).as_str().to_string());
        let domain = L::variants().iter().map(|l| l.as_str().to_string()).collect();
        self.edges.push((
            from,
            Edge::Conditional {
                router,
                targets,
                domain: Some(domain),
            },
        ));
        Ok(self)
    }

    /// Conditional transition keyed by free-form strings.
    ///
    /// The label set cannot be enumerated ahead of time, so an undeclared
    /// label fails the run with a routing error instead of failing `compile()`.
    pub fn add_dynamic_edge<F>(
        mut self,
        from: impl Into<String>,
        router: F,
        targets: impl IntoIterator<Item = (&'static str, &'static str)>,
    ) -> Result<Self>
    where
        F: Fn(&S) -> String + Send + Sync + 'static,
    {
        let from = from.into();
        self.check_source(&from)?;
        let targets = self.collect_targets(
            targets
                .into_iter()
                .map(|(label, to)| (label.to_string(), to.to_string())),
        )?;
        self.edges.push((
            from,
            Edge::Conditional {
                router: Arc::new(router),
                targets,
                domain: None,
            },
        ));
        Ok(self)
    }

    fn check_source(&self, from: &str) -> Result<()> {
        if from == END {
            return Err(InkflowError::GraphConfiguration(
                "END cannot have outgoing edges".to_string(),
            ));
        }
        if from != START && !self.nodes.contains_key(from) {
            return Err(InkflowError::UnknownNode(from.to_string()));
        }
        Ok(())
    }

    fn check_target(&self, to: &str) -> Result<()> {
        if to == START {
            return Err(InkflowError::GraphConfiguration(
                "START cannot be an edge target".to_string(),
            ));
        }
        if to != END && !self.nodes.contains_key(to) {
            return Err(InkflowError::UnknownNode(to.to_string()));
        }
        Ok(())
    }

    fn collect_targets(
        &self,
        targets: impl Iterator<Item = (String, String)>,
    ) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        for (label, to) in targets {
            self.check_target(&to)?;
            if map.insert(label.clone(), to).is_some() {
                return Err(InkflowError::GraphConfiguration(format!(
                    "label '{}' mapped more than once",
                    label
                )));
            }
        }
        Ok(map)
    }

    /// Validate the graph and freeze it.
    pub fn compile(self) -> Result<CompiledGraph<S>> {
        let mut edges: HashMap<String, Edge<S>> = HashMap::new();
        for (from, edge) in self.edges {
            if edges.contains_key(&from) {
                return Err(InkflowError::GraphConfiguration(format!(
                    "'{}' declares more than one outgoing edge",
                    from
                )));
            }
            if let Edge::Conditional {
                targets,
                domain: Some(domain),
                ..
            } = &edge
            {
                for label in domain {
                    if !targets.contains_key(label) {
                        return Err(InkflowError::GraphConfiguration(format!(
                            "router on '{}' can return '{}' but it has no target",
                            from, label
                        )));
                    }
                }
                for label in targets.keys() {
                    if !domain.contains(label) {
                        return Err(InkflowError::GraphConfiguration(format!(
                            "router on '{}' maps '{}' which it can never return",
                            from, label
                        )));
                    }
                }
            }
            edges.insert(from, edge);
        }

        if !edges.contains_key(START) {
            return Err(InkflowError::GraphConfiguration(
                "no entry edge from START".to_string(),
            ));
        }

        // Forward reachability from START.
        let reachable = bfs(START, |n| successors(&edges, n));
        if let Some(orphan) = self.order.iter().find(|n| !reachable.contains(n.as_str())) {
            return Err(InkflowError::GraphConfiguration(format!(
                "node '{}' is unreachable from START",
                orphan
            )));
        }

        // Backward reachability from END. Nodes without an outgoing edge are
        // terminal and count as reaching END.
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for name in std::iter::once(START.to_string()).chain(self.order.iter().cloned()) {
            for next in successors(&edges, &name) {
                predecessors.entry(next).or_default().push(name.clone());
            }
        }
        for name in &self.order {
            if !edges.contains_key(name) {
                predecessors
                    .entry(END.to_string())
                    .or_default()
                    .push(name.clone());
            }
        }
        let finishing = bfs(END, |n| predecessors.get(n).cloned().unwrap_or_default());
        if let Some(stuck) = self.order.iter().find(|n| !finishing.contains(n.as_str())) {
            return Err(InkflowError::GraphConfiguration(format!(
                "node '{}' can never reach END",
                stuck
            )));
        }

        debug!(graph = %self.name, nodes = self.order.len(), "Graph compiled");

        Ok(CompiledGraph::new(GraphInner {
            name: self.name,
            nodes: self.nodes,
            order: self.order,
            edges,
        }))
    }
}

fn successors<S: GraphState>(edges: &HashMap<String, Edge<S>>, node: &str) -> Vec<String> {
    match edges.get(node) {
        Some(Edge::Direct(to)) => vec![to.clone()],
        Some(Edge::Conditional { targets, .. }) => targets.values().cloned().collect(),
        None => Vec::new(),
    }
}

fn bfs(start: &str, mut next: impl FnMut(&str) -> Vec<String>) -> HashSet<String> {
    let mut seen = HashSet::from([start.to_string()]);
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(node) = queue.pop_front() {
        for n in next(&node) {
            if seen.insert(n.clone()) {
                queue.push_back(n);
            }
        }
    }
    seen
}
