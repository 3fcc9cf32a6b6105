//! Middleware (C7, spec §4.7): functions that wrap a node with the same
//! identity but augmented phase behaviour. The engine treats a
//! middleware-wrapped node identically to a plain one — middleware only
//! ever produces another `Arc<dyn NodeBackend>`.

use crate::action::Action;
use crate::context::Ctx;
use crate::node::{BoxError, NodeBackend, NodeResult, RetrySpec};
use crate::store::{StoreReader, StoreWriter};
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A middleware takes a backend and returns a wrapped backend with the
/// same three-phase contract (spec §4.7).
pub type Middleware = Arc<dyn Fn(Arc<dyn NodeBackend>) -> Arc<dyn NodeBackend> + Send + Sync>;

/// Composes middlewares so that `chain(m1, m2, m3)(node) == m1(m2(m3(node)))`
/// (spec §4.7, "Composition").
pub fn chain(middlewares: Vec<Middleware>) -> Middleware {
    Arc::new(move |node| {
        middlewares
            .iter()
            .rev()
            .fold(node, |acc, m| m(acc))
    })
}

// ---------------------------------------------------------------------
// logging
// ---------------------------------------------------------------------

struct LoggingBackend {
    inner: Arc<dyn NodeBackend>,
    name: String,
}

#[async_trait]
impl NodeBackend for LoggingBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        let start = Instant::now();
        debug!(node = %self.name, phase = "prep", "enter");
        let result = self.inner.prep(ctx, reader, input).await;
        match &result {
            Ok(_) => info!(node = %self.name, phase = "prep", duration_ms = start.elapsed().as_millis() as u64, "exit"),
            Err(e) => warn!(node = %self.name, phase = "prep", error = %e, "exit with error"),
        }
        result
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let start = Instant::now();
        debug!(node = %self.name, phase = "exec", "enter");
        let result = self.inner.exec(ctx, prep_result).await;
        match &result {
            Ok(_) => info!(node = %self.name, phase = "exec", duration_ms = start.elapsed().as_millis() as u64, "exit"),
            Err(e) => warn!(node = %self.name, phase = "exec", error = %e, "exit with error"),
        }
        result
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        let start = Instant::now();
        debug!(node = %self.name, phase = "post", "enter");
        let result = self
            .inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await;
        match &result {
            Ok((_, action)) => info!(
                node = %self.name, phase = "post", action = %action,
                duration_ms = start.elapsed().as_millis() as u64, "exit"
            ),
            Err(e) => warn!(node = %self.name, phase = "post", error = %e, "exit with error"),
        }
        result
    }
}

/// Emits structured `tracing` events at entry/exit of each phase, with
/// duration and error (spec §4.7, "logging").
pub fn logging(node_name: impl Into<String>) -> Middleware {
    let name = node_name.into();
    Arc::new(move |inner| {
        Arc::new(LoggingBackend {
            inner,
            name: name.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// metrics
// ---------------------------------------------------------------------

/// Minimal per-node counters (spec §4.7, "metrics"): a richer sink would
/// forward these into Prometheus/OTel, which is explicitly an external
/// collaborator (spec §1).
pub struct NodeMetrics {
    pub node_name: String,
    pub prep_count: AtomicU64,
    pub exec_count: AtomicU64,
    pub post_count: AtomicU64,
    pub error_count: AtomicU64,
    pub exec_duration_ms_total: AtomicU64,
}

struct MetricsBackend {
    inner: Arc<dyn NodeBackend>,
    metrics: Arc<NodeMetrics>,
}

#[async_trait]
impl NodeBackend for MetricsBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.metrics.prep_count.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.prep(ctx, reader, input).await;
        if result.is_err() {
            self.metrics.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        self.metrics.exec_count.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = self.inner.exec(ctx, prep_result).await;
        self.metrics
            .exec_duration_ms_total
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.metrics.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.metrics.post_count.fetch_add(1, Ordering::Relaxed);
        let result = self
            .inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await;
        if result.is_err() {
            self.metrics.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Increments counters/histograms per phase per node name (spec §4.7,
/// "metrics"). Returns the middleware plus a shared handle the caller
/// reads from.
pub fn metrics(node_name: impl Into<String>) -> (Middleware, Arc<NodeMetrics>) {
    let metrics = Arc::new(NodeMetrics {
        node_name: node_name.into(),
        prep_count: AtomicU64::new(0),
        exec_count: AtomicU64::new(0),
        post_count: AtomicU64::new(0),
        error_count: AtomicU64::new(0),
        exec_duration_ms_total: AtomicU64::new(0),
    });
    let metrics_for_closure = metrics.clone();
    let mw: Middleware = Arc::new(move |inner| {
        Arc::new(MetricsBackend {
            inner,
            metrics: metrics_for_closure.clone(),
        }) as Arc<dyn NodeBackend>
    });
    (mw, metrics)
}

// ---------------------------------------------------------------------
// timing
// ---------------------------------------------------------------------

struct TimingBackend {
    inner: Arc<dyn NodeBackend>,
    store_key_prefix: String,
}

#[async_trait]
impl NodeBackend for TimingBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let start = Instant::now();
        let result = self.inner.exec(ctx, prep_result).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        // Recorded via the writer inside `post`, since `exec` has no
        // store access (spec §4.2); stash it on a side channel the
        // wrapped `post` reads back out.
        LAST_EXEC_MS.with(|cell| cell.set(elapsed_ms));
        result
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        let elapsed_ms = LAST_EXEC_MS.with(|cell| cell.get());
        let total_key = format!("{}:total_ms", self.store_key_prefix);
        let count_key = format!("{}:count", self.store_key_prefix);
        let (total, _) = writer.get(&total_key);
        let (count, _) = writer.get(&count_key);
        let new_total = total.and_then(|v| v.as_u64()).unwrap_or(0) + elapsed_ms;
        let new_count = count.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        writer.set(total_key, serde_json::json!(new_total));
        writer.set(count_key, serde_json::json!(new_count));
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

thread_local! {
    static LAST_EXEC_MS: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Accumulates per-node total/average phase durations into the store
/// under well-known keys (spec §4.7, "timing").
pub fn timing(node_name: impl Into<String>) -> Middleware {
    let prefix = format!("__pocket_timing:{}", node_name.into());
    Arc::new(move |inner| {
        Arc::new(TimingBackend {
            inner,
            store_key_prefix: prefix.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// retry (middleware form — overrides node-level retry when applied; spec
// §9 open question: "middleware is optional and overrides the node spec
// when applied; never both silently" — this middleware always wins
// because it re-implements the retry loop around exec directly rather
// than deferring to `Policies::retry`.)
// ---------------------------------------------------------------------

struct RetryBackend {
    inner: Arc<dyn NodeBackend>,
    spec: RetrySpec,
}

#[async_trait]
impl NodeBackend for RetryBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let mut last_err: Option<BoxError> = None;
        for attempt in 1..=self.spec.max_attempts {
            match self.inner.exec(ctx, prep_result.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(e),
            }
            if attempt < self.spec.max_attempts {
                let delay = self.spec.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| "retry middleware exhausted with no recorded error".into()))
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// Overrides a node's retry policy with `spec` (spec §4.7, "retry"; §9
/// open question resolution: middleware wins over a node-level spec).
pub fn retry(spec: RetrySpec) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(RetryBackend {
            inner,
            spec: spec.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// timeout
// ---------------------------------------------------------------------

struct TimeoutBackend {
    inner: Arc<dyn NodeBackend>,
    duration: Duration,
}

#[async_trait]
impl NodeBackend for TimeoutBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let bounded = ctx.child_with_timeout(self.duration);
        match bounded.race(self.inner.exec(&bounded, prep_result)).await {
            Some(result) => result,
            None => Err(format!("exec exceeded middleware timeout of {:?}", self.duration).into()),
        }
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// Imposes an additional ctx-bounded timeout on Exec, independent of any
/// node-level timeout policy (spec §4.7, "timeout").
pub fn timeout(duration: Duration) -> Middleware {
    Arc::new(move |inner| Arc::new(TimeoutBackend { inner, duration }))
}

// ---------------------------------------------------------------------
// rate-limit (token bucket)
// ---------------------------------------------------------------------

struct TokenBucket {
    capacity: u32,
    tokens: Mutex<u32>,
    refill_interval: Duration,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            tokens: Mutex::new(capacity),
            refill_interval,
            last_refill: Mutex::new(Instant::now()),
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed();
        if elapsed >= self.refill_interval {
            let periods = (elapsed.as_nanos() / self.refill_interval.as_nanos().max(1)) as u32;
            if periods > 0 {
                let mut tokens = self.tokens.lock();
                *tokens = (*tokens + periods).min(self.capacity);
                *last = Instant::now();
            }
        }
    }

    async fn acquire(&self, ctx: &Ctx) -> Result<(), ()> {
        loop {
            self.refill();
            {
                let mut tokens = self.tokens.lock();
                if *tokens > 0 {
                    *tokens -= 1;
                    return Ok(());
                }
            }
            if ctx.race(tokio::time::sleep(Duration::from_millis(5))).await.is_none() {
                return Err(());
            }
        }
    }
}

struct RateLimitBackend {
    inner: Arc<dyn NodeBackend>,
    bucket: Arc<TokenBucket>,
}

#[async_trait]
impl NodeBackend for RateLimitBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        if self.bucket.acquire(ctx).await.is_err() {
            return Err("rate-limited invocation cancelled while waiting for a token".into());
        }
        self.inner.exec(ctx, prep_result).await
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// Token-bucket rate limiting shared across all invocations of the
/// wrapped node; suspended callers wait for a token or observe
/// cancellation (spec §4.7, "rate-limit").
pub fn rate_limit(capacity: u32, refill_interval: Duration) -> Middleware {
    let bucket = Arc::new(TokenBucket::new(capacity, refill_interval));
    Arc::new(move |inner| {
        Arc::new(RateLimitBackend {
            inner,
            bucket: bucket.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// circuit-breaker
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable transition callback (spec §4.7, "Observable callbacks may
/// fire on every transition").
pub type CircuitTransitionHook = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

struct CircuitBreakerState {
    state: Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

pub struct CircuitBreaker {
    inner: Arc<CircuitBreakerState>,
    threshold: u32,
    cooldown: Duration,
    on_transition: Option<CircuitTransitionHook>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(CircuitBreakerState {
                state: Mutex::new(CircuitState::Closed),
                consecutive_failures: AtomicU32::new(0),
                opened_at: Mutex::new(None),
            }),
            threshold,
            cooldown,
            on_transition: None,
        }
    }

    pub fn on_transition(mut self, hook: CircuitTransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    fn transition(&self, to: CircuitState) {
        let mut state = self.inner.state.lock();
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        if to == CircuitState::Open {
            *self.inner.opened_at.lock() = Some(Instant::now());
        }
        drop(state);
        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }

    fn state(&self) -> CircuitState {
        *self.inner.state.lock()
    }

    /// closed -(cooldown elapsed)-> half-open is evaluated lazily, on the
    /// next call attempt (spec §4.7, "Circuit-breaker state machine").
    fn admit(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .inner
                    .opened_at
                    .lock()
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.transition(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state() == CircuitState::HalfOpen {
            self.transition(CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        if self.state() == CircuitState::HalfOpen {
            self.transition(CircuitState::Open);
            return;
        }
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            self.transition(CircuitState::Open);
        }
    }
}

struct CircuitBreakerBackend {
    inner: Arc<dyn NodeBackend>,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait]
impl NodeBackend for CircuitBreakerBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        if !self.breaker.admit() {
            return Err("circuit open: exec skipped".into());
        }
        match self.inner.exec(ctx, prep_result).await {
            Ok(v) => {
                self.breaker.record_success();
                Ok(v)
            }
            Err(e) => {
                self.breaker.record_failure();
                error!("circuit breaker recorded a failure");
                Err(e)
            }
        }
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// closed -> (N consecutive failures) -> open -> (cool-down elapsed) ->
/// half-open -> (probe success) -> closed; (probe failure) -> open, timer
/// reset (spec §4.7, P10).
pub fn circuit_breaker(breaker: Arc<CircuitBreaker>) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(CircuitBreakerBackend {
            inner,
            breaker: breaker.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// validation
// ---------------------------------------------------------------------

struct ValidationBackend {
    inner: Arc<dyn NodeBackend>,
    input_predicate: Option<Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>>,
    output_predicate: Option<Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>>,
}

#[async_trait]
impl NodeBackend for ValidationBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        if let Some(p) = &self.input_predicate {
            p(&input).map_err(|m| -> BoxError { m.into() })?;
        }
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let result = self.inner.exec(ctx, prep_result).await?;
        if let Some(p) = &self.output_predicate {
            p(&result).map_err(|m| -> BoxError { m.into() })?;
        }
        Ok(result)
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// Applies input/output predicates; failures surface as validation errors
/// (spec §4.7, "validation").
pub fn validation(
    input_predicate: Option<Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>>,
    output_predicate: Option<Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>>,
) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(ValidationBackend {
            inner,
            input_predicate: input_predicate.clone(),
            output_predicate: output_predicate.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// transform
// ---------------------------------------------------------------------

struct TransformBackend {
    inner: Arc<dyn NodeBackend>,
    pre: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
    post_map: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
}

#[async_trait]
impl NodeBackend for TransformBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        let input = match &self.pre {
            Some(f) => f(input),
            None => input,
        };
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let result = self.inner.exec(ctx, prep_result).await?;
        Ok(match &self.post_map {
            Some(f) => f(result),
            None => result,
        })
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// Applies pre/post value mappers, e.g. shape coercion (spec §4.7,
/// "transform").
pub fn transform(
    pre: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
    post_map: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(TransformBackend {
            inner,
            pre: pre.clone(),
            post_map: post_map.clone(),
        })
    })
}

// ---------------------------------------------------------------------
// error-handler
// ---------------------------------------------------------------------

struct ErrorHandlerBackend {
    inner: Arc<dyn NodeBackend>,
    rescue: Arc<dyn Fn(&BoxError) -> Option<Value> + Send + Sync>,
}

#[async_trait]
impl NodeBackend for ErrorHandlerBackend {
    async fn prep(&self, ctx: &Ctx, reader: &StoreReader, input: Value) -> NodeResult<Value> {
        self.inner.prep(ctx, reader, input).await
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        match self.inner.exec(ctx, prep_result).await {
            Ok(v) => Ok(v),
            Err(e) => match (self.rescue)(&e) {
                Some(rescued) => Ok(rescued),
                None => Err(e),
            },
        }
    }

    async fn post(
        &self,
        ctx: &Ctx,
        writer: &StoreWriter,
        input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        self.inner
            .post(ctx, writer, input, prep_result, exec_result)
            .await
    }
}

/// Intercepts Exec errors and may rescue them into a result (spec §4.7,
/// "error-handler").
pub fn error_handler(rescue: Arc<dyn Fn(&BoxError) -> Option<Value> + Send + Sync>) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(ErrorHandlerBackend {
            inner,
            rescue: rescue.clone(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{IdentityBackend, NodeBuilder};
    use crate::store::Store;
    use serde_json::json;

    struct AlwaysFails;
    #[async_trait]
    impl NodeBackend for AlwaysFails {
        async fn exec(&self, _ctx: &Ctx, _prep_result: Value) -> NodeResult<Value> {
            Err("boom".into())
        }
    }

    /// P10 — after `threshold` consecutive failures the breaker opens and
    /// the next call is rejected without invoking Exec.
    #[tokio::test]
    async fn circuit_opens_after_threshold_and_rejects_without_calling_exec() {
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
        let mw = circuit_breaker(breaker);
        let backend = mw(Arc::new(AlwaysFails));
        let ctx = Ctx::new();

        assert!(backend.exec(&ctx, json!(1)).await.is_err());
        assert!(backend.exec(&ctx, json!(1)).await.is_err());
        // circuit now open; this third call must be rejected by the
        // breaker itself rather than delegating into AlwaysFails (we
        // can't observe that directly here, but the error message differs).
        let err = backend.exec(&ctx, json!(1)).await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
    }

    struct FailsOnce {
        failed: std::sync::atomic::AtomicBool,
    }
    #[async_trait]
    impl NodeBackend for FailsOnce {
        async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Err("boom".into())
            } else {
                Ok(prep_result)
            }
        }
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_the_circuit() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(10)));
        let mw = circuit_breaker(breaker.clone());
        let backend = mw(Arc::new(FailsOnce {
            failed: std::sync::atomic::AtomicBool::new(false),
        }));
        let ctx = Ctx::new();

        // one failure opens the circuit (threshold 1).
        assert!(backend.exec(&ctx, json!(1)).await.is_err());
        assert!(matches!(breaker.state(), CircuitState::Open));

        // rejected immediately while open, before the cooldown elapses.
        let err = backend.exec(&ctx, json!(1)).await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));

        // after the cooldown the breaker admits one half-open probe; the
        // backend now succeeds (it only fails its very first call), and
        // that success closes the circuit again.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let out = backend.exec(&ctx, json!(42)).await.unwrap();
        assert_eq!(out, json!(42));
        assert!(matches!(breaker.state(), CircuitState::Closed));
    }

    #[tokio::test]
    async fn logging_middleware_preserves_node_contract() {
        let node = NodeBuilder::new("n", IdentityBackend).build();
        let wrapped = logging("n")(node.backend().clone());
        let ctx = Ctx::new();
        let reader = Store::new().reader();
        let out = wrapped.prep(&ctx, &reader, json!(1)).await.unwrap();
        assert_eq!(out, json!(1));
    }

    #[tokio::test]
    async fn rate_limit_throttles_to_capacity() {
        let mw = rate_limit(2, Duration::from_millis(50));
        let backend = mw(Arc::new(IdentityBackend));
        let ctx = Ctx::new();
        assert!(backend.exec(&ctx, json!(1)).await.is_ok());
        assert!(backend.exec(&ctx, json!(1)).await.is_ok());
        // third call must wait for a refill; bound the wait so the test
        // doesn't hang if rate limiting is broken.
        let bounded = ctx.child_with_timeout(Duration::from_millis(200));
        let result = bounded.race(backend.exec(&bounded, json!(1))).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn error_handler_rescues_into_a_value() {
        let mw = error_handler(Arc::new(|_e: &BoxError| Some(json!("rescued"))));
        let backend = mw(Arc::new(AlwaysFails));
        let ctx = Ctx::new();
        let out = backend.exec(&ctx, json!(1)).await.unwrap();
        assert_eq!(out, json!("rescued"));
    }
}
