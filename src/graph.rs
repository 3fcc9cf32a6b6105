//! The graph: a flat, name-keyed node registry plus a start node (spec §3
//! "Graph", §9 "Cyclic successor graphs"). [`Graph::run`] drives the
//! engine (C4) across successor edges until a node has no successor for
//! the chosen action.

use crate::action::DEFAULT_ACTION;
use crate::context::Ctx;
use crate::engine;
use crate::error::{Phase, PocketError, PocketResult};
use crate::node::Node;
use crate::store::Store;
use crate::validator;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Observability hooks a caller can attach to a [`Graph`] (spec §6,
/// "logger adapter, tracer adapter, metrics sink"). Every method is a
/// no-op by default; implement only what you need.
pub trait GraphHooks: Send + Sync {
    fn on_node_enter(&self, _node: &str) {}
    fn on_node_exit(&self, _node: &str, _action: &str) {}
    fn on_error(&self, _node: &str, _err: &PocketError) {}
}

/// Construction-time options (spec §6, "Graph API").
#[derive(Clone)]
pub struct GraphOptions {
    pub max_depth: usize,
    pub hooks: Option<Arc<dyn GraphHooks>>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            // No magic number in the spec; 1_000 comfortably covers any
            // legitimate non-cyclic workflow while still catching runaway
            // routing loops quickly (spec §4.3, "max-depth guard").
            max_depth: 1_000,
            hooks: None,
        }
    }
}

impl GraphOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_depth(mut self, n: usize) -> Self {
        self.max_depth = n;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn GraphHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

/// A start node plus the reachable closure of successor nodes it was
/// built with, and the store they share for one `Run` (spec §3 "Graph").
pub struct Graph {
    start: String,
    nodes: HashMap<String, Arc<Node>>,
    store: Store,
    options: GraphOptions,
}

impl Graph {
    /// Builds a graph from its full node set, validating it statically
    /// before returning (spec §4.4). Rust's ownership model has no
    /// equivalent of discovering a reachable closure purely from a single
    /// `start_node` handle when edges are name-keyed (spec §9), so the
    /// caller supplies every node it built; unreachable nodes are simply
    /// never visited (harmless, not rejected).
    pub fn new(
        nodes: Vec<Arc<Node>>,
        start: impl Into<String>,
        store: Store,
        options: GraphOptions,
    ) -> PocketResult<Self> {
        let start = start.into();
        let registry: HashMap<String, Arc<Node>> =
            nodes.into_iter().map(|n| (n.name().to_string(), n)).collect();

        let issues = validator::validate(&registry, &start);
        if !issues.is_empty() {
            return Err(PocketError::ValidatorFailure { issues });
        }

        Ok(Self {
            start,
            nodes: registry,
            store,
            options,
        })
    }

    /// Re-runs the static validator on demand (spec §4.4: "optionally on
    /// demand"). `Graph::new` already validates at construction; this is
    /// for callers who mutate the underlying node set out of band (e.g.
    /// hot-reloading a declarative workflow) and want to re-check it.
    pub fn validate(&self) -> PocketResult<()> {
        let issues = validator::validate(&self.nodes, &self.start);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(PocketError::ValidatorFailure { issues })
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    /// Drives the engine from the start node to a terminal output (spec
    /// §4.3). Iterative, not recursive: edge traversal is tail-recursive
    /// by construction (spec §5, "Edge traversal is strictly sequential"),
    /// so a loop avoids needing boxed futures for unbounded recursion
    /// depth.
    #[instrument(level = "debug", skip_all, fields(start = %self.start))]
    pub async fn run(&self, ctx: &Ctx, input: Value) -> PocketResult<Value> {
        let mut current_name = self.start.clone();
        let mut current_input = input;
        let mut visits: usize = 0;

        loop {
            visits += 1;
            if visits > self.options.max_depth {
                return Err(PocketError::DepthExceeded {
                    node: current_name,
                    max_depth: self.options.max_depth,
                });
            }

            let node = self
                .nodes
                .get(&current_name)
                .expect("a validated graph only references known node names");

            if let Some(hooks) = &self.options.hooks {
                hooks.on_node_enter(&current_name);
            }

            let outcome = match engine::run_node(node, &self.store, ctx, current_input).await {
                Ok(o) => o,
                Err(err) => {
                    if let Some(hooks) = &self.options.hooks {
                        hooks.on_error(&current_name, &err);
                    }
                    return Err(err);
                }
            };

            if let Some(hooks) = &self.options.hooks {
                hooks.on_node_exit(&current_name, outcome.action.as_str());
            }

            if node.successors().is_empty() {
                debug!(node = %current_name, "terminal node, run complete");
                return Ok(outcome.output);
            }

            let next = node
                .successors()
                .get(outcome.action.as_str())
                .or_else(|| node.successors().get(DEFAULT_ACTION));

            match next {
                Some(next_name) => {
                    debug!(from = %current_name, action = %outcome.action, to = %next_name, "routing");
                    current_name = next_name.clone();
                    current_input = outcome.output;
                }
                None => {
                    return Err(PocketError::Routing {
                        node: current_name,
                        phase: Phase::Routing,
                        action: outcome.action.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeBackend, NodeBuilder};
    use serde_json::json;

    struct Upper;
    #[async_trait::async_trait]
    impl NodeBackend for Upper {
        async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> crate::node::NodeResult<Value> {
            Ok(json!(prep_result.as_str().unwrap_or_default().to_uppercase()))
        }
    }

    struct Exclaim;
    #[async_trait::async_trait]
    impl NodeBackend for Exclaim {
        async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> crate::node::NodeResult<Value> {
            Ok(json!(format!("{}!", prep_result.as_str().unwrap_or_default())))
        }
    }

    /// S1 — linear pipeline: up("hi") -> excl -> "HI!".
    #[tokio::test]
    async fn linear_pipeline_runs_both_nodes_once() {
        let excl = NodeBuilder::new("excl", Exclaim).build();
        let up = NodeBuilder::new("up", Upper).on("default", "excl").build();

        let graph = Graph::new(vec![up, excl], "up", Store::new(), GraphOptions::default()).unwrap();
        let out = graph.run(&Ctx::new(), json!("hi")).await.unwrap();
        assert_eq!(out, json!("HI!"));
    }

    struct Classify;
    #[async_trait::async_trait]
    impl NodeBackend for Classify {
        async fn post(
            &self,
            _ctx: &Ctx,
            _writer: &crate::store::StoreWriter,
            _input: Value,
            _prep_result: Value,
            exec_result: Value,
        ) -> crate::node::NodeResult<(Value, crate::action::Action)> {
            let n = exec_result.as_i64().unwrap_or(0);
            let action = if n >= 10 { "big" } else { "small" };
            Ok((exec_result, action.into()))
        }
    }

    /// S2 — routing by value: the untaken branch is never entered.
    #[tokio::test]
    async fn routes_by_returned_action() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Flag(Arc<AtomicBool>);
        #[async_trait::async_trait]
        impl NodeBackend for Flag {
            async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> crate::node::NodeResult<Value> {
                self.0.store(true, Ordering::SeqCst);
                Ok(prep_result)
            }
        }

        let big_hit = Arc::new(AtomicBool::new(false));
        let small_hit = Arc::new(AtomicBool::new(false));

        let b = NodeBuilder::new("B", Flag(big_hit.clone())).build();
        let s = NodeBuilder::new("S", Flag(small_hit.clone())).build();
        let classify = NodeBuilder::new("classify", Classify)
            .on("big", "B")
            .on("small", "S")
            .build();

        let graph = Graph::new(
            vec![classify, b, s],
            "classify",
            Store::new(),
            GraphOptions::default(),
        )
        .unwrap();

        graph.run(&Ctx::new(), json!(7)).await.unwrap();
        assert!(small_hit.load(Ordering::SeqCst));
        assert!(!big_hit.load(Ordering::SeqCst));

        small_hit.store(false, Ordering::SeqCst);
        graph.run(&Ctx::new(), json!(42)).await.unwrap();
        assert!(big_hit.load(Ordering::SeqCst));
        assert!(!small_hit.load(Ordering::SeqCst));
    }

    /// P8 — max-depth: a self-loop terminates with DepthExceeded rather
    /// than running forever.
    #[tokio::test]
    async fn self_loop_hits_depth_guard() {
        let looper = NodeBuilder::new("looper", crate::node::IdentityBackend)
            .on("default", "looper")
            .build();
        let graph = Graph::new(
            vec![looper],
            "looper",
            Store::new(),
            GraphOptions::default().max_depth(5),
        )
        .unwrap();
        let err = graph.run(&Ctx::new(), json!(1)).await.unwrap_err();
        assert!(matches!(err, PocketError::DepthExceeded { max_depth: 5, .. }));
    }

    #[test]
    fn construction_rejects_invalid_graph() {
        let a = NodeBuilder::new("a", crate::node::IdentityBackend)
            .on("default", "ghost")
            .build();
        let err = Graph::new(vec![a], "a", Store::new(), GraphOptions::default()).unwrap_err();
        assert!(matches!(err, PocketError::ValidatorFailure { .. }));
    }

    /// An action with no matching successor on a node that *does* have
    /// successors is a Routing error, not a silent terminal.
    #[tokio::test]
    async fn unmatched_action_on_non_terminal_node_is_a_routing_error() {
        struct WeirdAction;
        #[async_trait::async_trait]
        impl NodeBackend for WeirdAction {
            async fn post(
                &self,
                _ctx: &Ctx,
                _writer: &crate::store::StoreWriter,
                _input: Value,
                _prep_result: Value,
                exec_result: Value,
            ) -> crate::node::NodeResult<(Value, crate::action::Action)> {
                Ok((exec_result, "nowhere".into()))
            }
        }
        let b = NodeBuilder::new("b", crate::node::IdentityBackend).build();
        let a = NodeBuilder::new("a", WeirdAction).on("elsewhere", "b").build();
        let graph = Graph::new(vec![a, b], "a", Store::new(), GraphOptions::default()).unwrap();
        let err = graph.run(&Ctx::new(), json!(1)).await.unwrap_err();
        assert!(matches!(err, PocketError::Routing { .. }));
    }
}
