//! The node contract (C2, spec §4.2) and the pieces a concrete node is
//! built from: the three-phase backend trait, retry/fallback/hook
//! policies, and the `Node` wrapper the engine actually drives.

use crate::action::Action;
use crate::context::Ctx;
use crate::store::{StoreReader, StoreWriter};
use crate::value::{TypeDescriptor, Value};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// The error type node bodies and policy closures report. The engine
/// attaches the originating node's name and phase when it turns this into
/// a [`crate::error::PocketError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type NodeResult<T> = Result<T, BoxError>;

/// A node's three-phase lifecycle (spec §4.2). Any subset may be left at
/// its default (identity) implementation.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Validation and read-only preparation. May suspend on I/O; honours
    /// `ctx` cancellation.
    async fn prep(&self, _ctx: &Ctx, _reader: &StoreReader, input: Value) -> NodeResult<Value> {
        Ok(input)
    }

    /// Pure computation; no store access. The sole unit policy wrappers
    /// (timeout, retry, fallback) apply to.
    async fn exec(&self, _ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        Ok(prep_result)
    }

    /// Persists results, updates state, and chooses the successor action.
    /// An empty action is treated by the engine as `default`.
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

/// A boxed, erased node body — any `dyn NodeBackend` is passed around
/// behind one of these.
pub type DynBackend = Arc<dyn NodeBackend>;

/// An identity backend: Prep/Exec pass their input through unchanged,
/// Post returns it under the default action. Used both as a harmless
/// placeholder and as the process-wide fallback below.
pub struct IdentityBackend;

#[async_trait]
impl NodeBackend for IdentityBackend {}

/// Process-scoped registry of default phase handlers (spec §9, "Global
/// defaults for phase handlers"). A node consults this only once, at
/// construction time, via [`NodeBuilder::new_with_process_defaults`] —
/// later calls to [`set_default_backend`] never retroactively change
/// nodes built before the mutation.
static DEFAULT_BACKEND: OnceLock<RwLock<DynBackend>> = OnceLock::new();

fn default_backend_cell() -> &'static RwLock<DynBackend> {
    DEFAULT_BACKEND.get_or_init(|| RwLock::new(Arc::new(IdentityBackend)))
}

/// Installs the process-wide default backend consulted by
/// [`NodeBuilder::new_with_process_defaults`].
pub fn set_default_backend(backend: DynBackend) {
    *default_backend_cell().write().unwrap() = backend;
}

/// Restores the process-wide default backend to the built-in identity
/// body.
pub fn reset_default_backend() {
    *default_backend_cell().write().unwrap() = Arc::new(IdentityBackend);
}

fn snapshot_default_backend() -> DynBackend {
    default_backend_cell().read().unwrap().clone()
}

/// Rejects a value before Prep runs (input validator) or before Post
/// returns (output validator). `Err` carries a human-readable reason.
pub type ValidatorFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Called once per Exec failure, before a retry attempt consumes its
/// budget (spec §4.2, policy application order).
pub type FallbackFn =
    Arc<dyn Fn(Ctx, Value, BoxError) -> BoxFuture<'static, NodeResult<Value>> + Send + Sync>;

pub type SuccessHook = Arc<dyn Fn(StoreWriter, Value) -> BoxFuture<'static, ()> + Send + Sync>;
pub type FailureHook = Arc<dyn Fn(StoreWriter, BoxError) -> BoxFuture<'static, ()> + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(StoreWriter) -> BoxFuture<'static, ()> + Send + Sync>;

/// `{max-attempts, initial-delay, max-delay, multiplier, jitter?}`
/// (spec §3, "Retry spec").
#[derive(Clone, Debug)]
pub struct RetrySpec {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetrySpec {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.initial_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn multiplier(mut self, m: f64) -> Self {
        self.multiplier = m;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// `delay_n = min(max-delay, initial-delay * multiplier^(n-1))`,
    /// optionally perturbed by uniform jitter in `[0, delay_n)`. `attempt`
    /// is 1-based (the delay that follows the n-th failed attempt).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled_ms = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent) * 1000.0;
        let capped_ms = scaled_ms.min(self.max_delay.as_secs_f64() * 1000.0).max(0.0);
        let base = Duration::from_millis(capped_ms as u64);
        if self.jitter && !base.is_zero() {
            let fraction: f64 = rand::random();
            Duration::from_millis((fraction * base.as_millis() as f64) as u64)
        } else {
            base
        }
    }
}

/// Optional behaviours attached to a node, applied around Exec or
/// wrapping phase boundaries (spec §3, "Node"; GLOSSARY, "Policy").
#[derive(Clone, Default)]
pub struct Policies {
    pub timeout: Option<Duration>,
    pub retry: Option<RetrySpec>,
    pub fallback: Option<FallbackFn>,
    pub on_success: Option<SuccessHook>,
    pub on_failure: Option<FailureHook>,
    pub on_complete: Option<CompleteHook>,
    pub input_validator: Option<ValidatorFn>,
    pub output_validator: Option<ValidatorFn>,
}

/// A node as it participates in a graph: identity, declared edge types,
/// a backend body, policies, and action-keyed successor *names*.
///
/// Successors are stored as names, not direct references — ownership of
/// every node lives in the graph's flat registry (spec §9, "Cyclic
/// successor graphs"), so cycles don't leak and the validator can walk
/// the whole reachable set without touching user logic.
pub struct Node {
    pub(crate) name: String,
    pub(crate) input_type: TypeDescriptor,
    pub(crate) output_type: TypeDescriptor,
    pub(crate) backend: DynBackend,
    pub(crate) policies: Policies,
    pub(crate) successors: HashMap<String, String>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_type(&self) -> &TypeDescriptor {
        &self.input_type
    }

    pub fn output_type(&self) -> &TypeDescriptor {
        &self.output_type
    }

    pub fn successors(&self) -> &HashMap<String, String> {
        &self.successors
    }

    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    pub fn backend(&self) -> &DynBackend {
        &self.backend
    }
}

/// Builds a [`Node`]. `Connect` edits (`.on(action, successor_name)`)
/// register successors; re-registering the same action replaces the
/// previous target (spec §4.2).
pub struct NodeBuilder {
    name: String,
    input_type: TypeDescriptor,
    output_type: TypeDescriptor,
    backend: DynBackend,
    policies: Policies,
    successors: HashMap<String, String>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>, backend: impl NodeBackend + 'static) -> Self {
        Self {
            name: name.into(),
            input_type: TypeDescriptor::Any,
            output_type: TypeDescriptor::Any,
            backend: Arc::new(backend),
            policies: Policies::default(),
            successors: HashMap::new(),
        }
    }

    /// Builds a node whose backend is a snapshot of the process-wide
    /// default handler registry at this exact moment (spec §9).
    /// Equivalent to `from_arc(name, snapshot_of(DEFAULT_BACKEND))`.
    pub fn new_with_process_defaults(name: impl Into<String>) -> Self {
        Self::from_arc(name, snapshot_default_backend())
    }

    pub fn from_arc(name: impl Into<String>, backend: DynBackend) -> Self {
        Self {
            name: name.into(),
            input_type: TypeDescriptor::Any,
            output_type: TypeDescriptor::Any,
            backend,
            policies: Policies::default(),
            successors: HashMap::new(),
        }
    }

    pub fn input_type(mut self, ty: impl Into<TypeDescriptor>) -> Self {
        self.input_type = ty.into();
        self
    }

    pub fn output_type(mut self, ty: impl Into<TypeDescriptor>) -> Self {
        self.output_type = ty.into();
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.policies.timeout = Some(d);
        self
    }

    pub fn retry(mut self, spec: RetrySpec) -> Self {
        self.policies.retry = Some(spec);
        self
    }

    pub fn fallback(mut self, f: FallbackFn) -> Self {
        self.policies.fallback = Some(f);
        self
    }

    pub fn on_success(mut self, f: SuccessHook) -> Self {
        self.policies.on_success = Some(f);
        self
    }

    pub fn on_failure(mut self, f: FailureHook) -> Self {
        self.policies.on_failure = Some(f);
        self
    }

    pub fn on_complete(mut self, f: CompleteHook) -> Self {
        self.policies.on_complete = Some(f);
        self
    }

    pub fn input_validator(mut self, f: ValidatorFn) -> Self {
        self.policies.input_validator = Some(f);
        self
    }

    pub fn output_validator(mut self, f: ValidatorFn) -> Self {
        self.policies.output_validator = Some(f);
        self
    }

    /// Registers `successor` as the target of `action`. Connecting the
    /// same action again replaces the previous target.
    pub fn on(mut self, action: impl Into<String>, successor: impl Into<String>) -> Self {
        self.successors.insert(action.into(), successor.into());
        self
    }

    pub fn build(self) -> Arc<Node> {
        Arc::new(Node {
            name: self.name,
            input_type: self.input_type,
            output_type: self.output_type,
            backend: self.backend,
            policies: self.policies,
            successors: self.successors,
        })
    }
}
