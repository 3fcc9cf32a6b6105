//! # Pocket
//!
//! A workflow engine that executes directed graphs of computational
//! nodes.
//!
//! Pocket models a workflow as a **Graph + Store**:
//! - **Node**: a three-phase unit of work (Prep, read-only and
//!   I/O-capable; Exec, pure and retryable; Post, writes and routes)
//! - **Graph**: connects nodes through **Actions** (labeled edges),
//!   validated statically before it ever runs
//! - **Store**: the scoped, TTL-and-LRU-bounded key/value space nodes
//!   read and write through during Prep and Post
//!
//! ## Module map
//!
//! - [`value`] / [`action`]: the `Value` and `Action` vocabulary every
//!   other module speaks
//! - [`error`]: the `PocketError` taxonomy, tagged with the node and
//!   phase that raised it
//! - [`context`]: `Ctx`, the cancellation-and-deadline handle threaded
//!   through every async call
//! - [`store`]: the LRU+TTL key/value store and its scoped reader/writer
//!   views
//! - [`node`]: the `NodeBackend` contract, retry/fallback/hook policies,
//!   and the `Node`/`NodeBuilder` pair
//! - [`engine`]: drives a single node through its full policy-wrapped
//!   lifecycle
//! - [`validator`]: static graph validation (dangling edges, type
//!   mismatches, duplicate names) with no node execution
//! - [`graph`]: the `Graph` that owns a node set and runs them to
//!   completion
//! - [`adapter`]: wraps a `Graph` so it can act as a single node
//! - [`concurrency`]: fan-out, pipelines, and parallel subgraphs built on
//!   top of the engine
//! - [`middleware`]: cross-cutting node decorators (logging, metrics,
//!   timeouts, retries, rate limiting, circuit breaking, ...)
//! - [`plugin`]: manifest-described, sandboxed WebAssembly node plugins
//!
//! ## Example
//!
//! ```rust
//! use pocket_engine::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> PocketResult<()> {
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl NodeBackend for Greet {
//!     async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
//!         Ok(json!(format!("hello, {}", prep_result.as_str().unwrap_or("world"))))
//!     }
//! }
//!
//! let greet = NodeBuilder::new("greet", Greet).build();
//! let graph = Graph::new(vec![greet], "greet", Store::new(), GraphOptions::default())?;
//! let ctx = Ctx::new();
//! let output = graph.run(&ctx, json!("pocket")).await?;
//! assert_eq!(output, json!("hello, pocket"));
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod adapter;
pub mod concurrency;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod middleware;
pub mod node;
pub mod plugin;
pub mod store;
pub mod validator;
pub mod value;

pub use action::{Action, DEFAULT_ACTION};
pub use context::{Ctx, SharedCtx};
pub use error::{ErrorKind, Phase, PocketError, PocketResult, ValidationIssue};
pub use value::{TypeDescriptor, Value};

pub use store::{Store, StoreConfig, StoreReader, StoreWriter};

pub use node::{
    BoxError, DynBackend, FallbackFn, IdentityBackend, Node, NodeBackend, NodeBuilder, NodeResult,
    Policies, RetrySpec, SuccessHook,
};

pub use engine::{run_node, NodeOutcome};
pub use graph::{Graph, GraphHooks, GraphOptions};
pub use validator::validate;

pub use adapter::GraphNode;
pub use concurrency::{
    fan_out, fan_out_report, map_reduce, parallel_subgraphs, pipeline, ErrorStrategy,
    FanOutError, FanOutOptions, FanOutReport,
};

pub use middleware::{
    chain, circuit_breaker, error_handler, logging, metrics, rate_limit, retry, timeout,
    transform, validation, CircuitBreaker, CircuitState, Middleware, NodeMetrics,
};

/// Commonly used external types
pub use serde_json::Value as JsonValue;

/// Everything a node implementation typically needs, in one `use`.
pub mod prelude {
    pub use crate::{
        Action, BoxError, Ctx, DynBackend, ErrorKind, FanOutError, FanOutOptions, FanOutReport,
        Graph, GraphHooks, GraphNode, GraphOptions, IdentityBackend, Node, NodeBackend,
        NodeBuilder, NodeOutcome, NodeResult, Phase, Policies, PocketError, PocketResult,
        RetrySpec, SharedCtx, Store, StoreConfig, StoreReader, StoreWriter, TypeDescriptor, Value,
        ValidationIssue,
    };
    pub use async_trait::async_trait;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn smoke_test_runs_a_two_node_graph_end_to_end() {
        struct Upper;
        #[async_trait]
        impl NodeBackend for Upper {
            async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
                Ok(json!(prep_result.as_str().unwrap_or("").to_uppercase()))
            }
        }
        struct Exclaim;
        #[async_trait]
        impl NodeBackend for Exclaim {
            async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
                Ok(json!(format!("{}!", prep_result.as_str().unwrap_or(""))))
            }
        }

        let exclaim = NodeBuilder::new("exclaim", Exclaim).build();
        let upper = NodeBuilder::new("upper", Upper).on("default", "exclaim").build();

        let graph = Graph::new(
            vec![upper, exclaim],
            "upper",
            Store::new(),
            GraphOptions::default(),
        )
        .unwrap();

        let ctx = Ctx::new();
        let output = graph.run(&ctx, json!("pocket")).await.unwrap();
        assert_eq!(output, json!("POCKET!"));
    }
}
