//! Graph-as-node adapter (C6, spec §4.6): lets an entire [`Graph`]
//! participate as a single [`crate::node::NodeBackend`], so any builder
//! that accepts a node accepts a graph too.

use crate::action::Action;
use crate::context::Ctx;
use crate::graph::Graph;
use crate::node::{BoxError, NodeBackend, NodeResult};
use crate::store::{StoreReader, StoreWriter};
use crate::value::Value;
use async_trait::async_trait;
use std::sync::Arc;

/// Wraps a [`Graph`] so it can be registered as a successor (or start
/// node) of another graph. Prep forwards input unchanged; Exec runs the
/// inner graph to completion; Post returns the inner run's result under
/// the default action (spec §4.6).
pub struct GraphNode {
    graph: Arc<Graph>,
}

impl GraphNode {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl NodeBackend for GraphNode {
    async fn prep(&self, _ctx: &Ctx, _reader: &StoreReader, input: Value) -> NodeResult<Value> {
        Ok(input)
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        self.graph
            .run(ctx, prep_result)
            .await
            .map_err(|e| Box::new(e) as BoxError)
    }

    async fn post(
        &self,
        _ctx: &Ctx,
        _writer: &StoreWriter,
        _input: Value,
        _prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        Ok((exec_result, Action::default_action()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Ctx;
    use crate::graph::GraphOptions;
    use crate::node::NodeBuilder;
    use crate::store::Store;
    use serde_json::json;

    #[tokio::test]
    async fn inner_graph_runs_to_completion_as_a_single_node() {
        struct Double;
        #[async_trait]
        impl NodeBackend for Double {
            async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
                Ok(json!(prep_result.as_i64().unwrap_or(0) * 2))
            }
        }
        let doubler = NodeBuilder::new("double", Double).build();
        let inner = Arc::new(
            Graph::new(vec![doubler], "double", Store::new(), GraphOptions::default()).unwrap(),
        );

        let adapter_node = NodeBuilder::new("inner-graph", GraphNode::new(inner)).build();
        let outer_store = Store::new();
        let ctx = Ctx::new();
        let outcome = crate::engine::run_node(&adapter_node, &outer_store, &ctx, json!(21))
            .await
            .unwrap();
        assert_eq!(outcome.output, json!(42));
        assert!(outcome.action.is_default());
    }
}
