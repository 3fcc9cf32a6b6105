//! Concurrency kernel (C5, spec §4.5): fan-out, pipeline, and
//! parallel-subgraphs, all cooperative with ctx-based cancellation and
//! built on `futures` + a `tokio::sync::Semaphore` for the bounded-worker
//! cap.

use crate::context::Ctx;
use crate::engine;
use crate::error::PocketError;
use crate::graph::Graph;
use crate::node::Node;
use crate::store::Store;
use crate::value::Value;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// How a fan-out reacts to a per-item failure (spec §4.5, "error-strategy").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// First error cancels siblings and returns the error.
    FailFast,
    /// Complete all items; surface a composite error listing per-index
    /// failures alongside available successes.
    Continue,
    /// Same as `Continue` but never returns a top-level error; the caller
    /// inspects per-item status.
    BestEffort,
}

/// Fan-out options (spec §4.5, §6).
#[derive(Clone, Debug)]
pub struct FanOutOptions {
    pub concurrency: usize,
    pub ordered: bool,
    pub error_strategy: ErrorStrategy,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(10),
            ordered: true,
            error_strategy: ErrorStrategy::FailFast,
        }
    }
}

impl FanOutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn error_strategy(mut self, s: ErrorStrategy) -> Self {
        self.error_strategy = s;
        self
    }
}

/// A composite error for the `Continue` strategy: every failure alongside
/// the indices that did succeed (spec §4.5).
#[derive(Debug)]
pub struct FanOutError {
    pub failures: Vec<(usize, PocketError)>,
    pub successes: Vec<(usize, Value)>,
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fan-out failed on {} of {} item(s): ",
            self.failures.len(),
            self.failures.len() + self.successes.len()
        )?;
        for (i, (idx, err)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{idx}] {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FanOutError {}

/// Per-item outcome of a fan-out, always in input order regardless of
/// completion order when `ordered = true` (spec §4.5, P3).
pub struct FanOutReport {
    pub items: Vec<PocketResult_<Value>>,
}

// Local alias to avoid importing crate::error::PocketResult's name clash
// with this module's own Result-shaped helpers below.
type PocketResult_<T> = Result<T, PocketError>;

impl FanOutReport {
    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|r| r.is_ok())
    }

    /// Aggregates into the `Continue`-strategy shape: `Ok` only if every
    /// item succeeded, else a [`FanOutError`] listing failures and
    /// successes by index.
    pub fn into_result(self) -> Result<Vec<Value>, FanOutError> {
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (idx, item) in self.items.into_iter().enumerate() {
            match item {
                Ok(v) => successes.push((idx, v)),
                Err(e) => failures.push((idx, e)),
            }
        }
        if failures.is_empty() {
            Ok(successes.into_iter().map(|(_, v)| v).collect())
        } else {
            Err(FanOutError { failures, successes })
        }
    }
}

/// Applies `node` to every input with bounded parallelism `W` (spec
/// §4.5, "Fan-out").
pub async fn fan_out(
    node: Arc<Node>,
    store: Store,
    ctx: Ctx,
    inputs: Vec<Value>,
    options: FanOutOptions,
) -> Result<Vec<Value>, FanOutError> {
    let report = fan_out_report(node, store, ctx, inputs, options).await;
    report.into_result()
}

/// Same as [`fan_out`] but never collapses into a single top-level error —
/// callers using `ErrorStrategy::BestEffort` inspect `report.items`
/// directly.
pub async fn fan_out_report(
    node: Arc<Node>,
    store: Store,
    ctx: Ctx,
    inputs: Vec<Value>,
    options: FanOutOptions,
) -> FanOutReport {
    let n = inputs.len();
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let group_ctx = ctx.child();
    let cancelled = Arc::new(AtomicBool::new(false));
    let fail_fast = options.error_strategy == ErrorStrategy::FailFast;

    let results: Vec<(usize, PocketResult_<Value>)> = stream::iter(inputs.into_iter().enumerate())
        .map(|(idx, input)| {
            let node = node.clone();
            let store = store.clone();
            let semaphore = semaphore.clone();
            let group_ctx = group_ctx.clone();
            let cancelled = cancelled.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if fail_fast && cancelled.load(Ordering::SeqCst) {
                    return (
                        idx,
                        Err(PocketError::Cancelled {
                            node: node.name().to_string(),
                            phase: crate::error::Phase::Engine,
                        }),
                    );
                }
                let worker_ctx = group_ctx.child();
                let outcome = engine::run_node(&node, &store, &worker_ctx, input).await;
                if fail_fast && outcome.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                    group_ctx.cancel();
                }
                (idx, outcome.map(|o| o.output))
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut items: Vec<Option<PocketResult_<Value>>> = (0..n).map(|_| None).collect();
    for (idx, result) in results {
        items[idx] = Some(result);
    }
    let items = items
        .into_iter()
        .enumerate()
        .map(|(idx, r)| {
            r.unwrap_or_else(|| {
                Err(PocketError::Cancelled {
                    node: format!("fan-out-item-{idx}"),
                    phase: crate::error::Phase::Engine,
                })
            })
        })
        .collect();

    let _ = options.ordered; // ordering is always by index above; `ordered=false`
                             // only relaxes *completion*-order timing guarantees, not
                             // the returned sequence, which is always input-order here.
    FanOutReport { items }
}

/// Runs `nodes` sequentially over one input, each node's output feeding
/// the next node's input (spec §4.5, "Pipeline"). Cancellation is checked
/// at each stage boundary.
pub async fn pipeline(nodes: &[Arc<Node>], store: &Store, ctx: &Ctx, input: Value) -> PocketResult_<Value> {
    let mut current = input;
    for node in nodes {
        if ctx.is_cancelled() {
            return Err(PocketError::Cancelled {
                node: node.name().to_string(),
                phase: crate::error::Phase::Engine,
            });
        }
        let outcome = engine::run_node(node, store, ctx, current).await?;
        current = outcome.output;
    }
    Ok(current)
}

/// Runs `k` independent graphs on the same input with bounded
/// parallelism, returning a length-`k` vector in the input order of the
/// graphs (spec §4.5, "Parallel-subgraphs"). The store is shared across
/// them; callers scope keys to avoid collisions.
pub async fn parallel_subgraphs(
    graphs: Vec<Arc<Graph>>,
    ctx: Ctx,
    input: Value,
    concurrency: usize,
) -> Vec<PocketResult_<Value>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let n = graphs.len();

    let results: Vec<(usize, PocketResult_<Value>)> = stream::iter(graphs.into_iter().enumerate())
        .map(|(idx, graph)| {
            let semaphore = semaphore.clone();
            let ctx = ctx.child();
            let input = input.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, graph.run(&ctx, input).await)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut out: Vec<Option<PocketResult_<Value>>> = (0..n).map(|_| None).collect();
    for (idx, result) in results {
        out[idx] = Some(result);
    }
    out.into_iter()
        .map(|r| r.expect("every graph index was dispatched exactly once"))
        .collect()
}

/// Extract -> Transform -> Reduce wrapper: `transform` runs via fan-out
/// over the extracted items, `reduce` aggregates the ordered results
/// sequentially (spec §4.5, "Batch/map-reduce wrapper").
pub async fn map_reduce<R>(
    transform: Arc<Node>,
    store: Store,
    ctx: Ctx,
    items: Vec<Value>,
    options: FanOutOptions,
    reduce: impl FnOnce(Vec<Value>) -> R,
) -> Result<R, FanOutError> {
    let transformed = fan_out(transform, store, ctx, items, options).await?;
    Ok(reduce(transformed))
}
