//! The WebAssembly plugin host (C8, spec §4.8): loads guest modules
//! under a resource sandbox and exposes each manifest-declared node as a
//! first-class [`crate::node::NodeBackend`] that JSON-RPCs into the guest
//! over linear memory.

use super::manifest::{DiscoveredManifest, Manifest, NodeDefinition, Permissions};
use crate::action::Action;
use crate::context::Ctx;
use crate::error::{Phase, PocketError};
use crate::node::{BoxError, NodeBackend, NodeResult};
use crate::store::{StoreReader, StoreWriter};
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store as WasmStore, TypedFunc};

/// Request payload sent to the guest on every call (spec §4.8, "Call
/// convention").
#[derive(Serialize)]
struct PluginRequest<'a> {
    node: &'a str,
    function: &'a str,
    config: &'a Value,
    input: &'a Value,
    #[serde(rename = "prepResult", skip_serializing_if = "Option::is_none")]
    prep_result: Option<&'a Value>,
    #[serde(rename = "execResult", skip_serializing_if = "Option::is_none")]
    exec_result: Option<&'a Value>,
}

/// Response schema a guest must answer with (spec §4.8, "Response
/// schema"). A missing `next` in a post response defaults to `"done"`.
#[derive(Deserialize, Default)]
struct PluginResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    next: Option<String>,
}

/// Resource limits enforced over the guest instance, derived from the
/// manifest's `permissions.memory` (spec §4.8, "Instantiation").
struct SandboxLimits {
    max_memory_bytes: usize,
}

impl wasmtime::ResourceLimiter for SandboxLimits {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= 10_000)
    }
}

/// Default memory cap when a manifest doesn't specify `permissions.memory`
/// (64 MiB — generous for a JSON-in/JSON-out guest, small enough that a
/// runaway module can't starve the host).
const DEFAULT_MAX_MEMORY_BYTES: usize = 64 * 1024 * 1024;
/// Default per-call timeout when a manifest doesn't specify
/// `permissions.timeout`.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct GuestAbi {
    alloc: TypedFunc<u32, u32>,
    call: TypedFunc<(u32, u32), u64>,
    free: Option<TypedFunc<(u32, u32), ()>>,
    memory: Memory,
}

/// One loaded, instantiated guest module. Calls are serialized through
/// `store` by a single mutex, honouring the ABI's "not re-entrant, one
/// caller at a time" invariant (spec §4.8, "Call convention"; §5, "A
/// plugin module instance is not re-entrant").
pub struct PluginModule {
    manifest: Manifest,
    timeout: Duration,
    store: AsyncMutex<WasmStore<SandboxLimits>>,
    abi: GuestAbi,
    engine: Engine,
}

impl PluginModule {
    /// Reads `<dir>/<manifest.binary>`, instantiates it under the
    /// sandbox described by `manifest.permissions`, and resolves the
    /// required ABI exports (spec §4.8, "Instantiation").
    pub fn load(dir: &std::path::Path, manifest: Manifest) -> Result<Self, PluginHostError> {
        let binary_path = dir.join(&manifest.binary);
        let bytes = std::fs::read(&binary_path).map_err(|e| PluginHostError::Io {
            path: binary_path.clone(),
            source: e,
        })?;

        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| PluginHostError::Wasmtime(e.to_string()))?;

        let module = Module::new(&engine, &bytes).map_err(|e| PluginHostError::Wasmtime(e.to_string()))?;

        let max_memory_bytes = manifest
            .permissions
            .memory_bytes()
            .map(|b| b as usize)
            .unwrap_or(DEFAULT_MAX_MEMORY_BYTES);
        let timeout = manifest
            .permissions
            .timeout_duration()
            .unwrap_or(DEFAULT_CALL_TIMEOUT);

        let mut store = WasmStore::new(
            &engine,
            SandboxLimits {
                max_memory_bytes,
            },
        );
        store.limiter(|s| s);

        // No host imports are linked: the guest gets no ambient
        // capability beyond the three exported ABI functions it must
        // itself provide. `permissions.env/filesystem/network` are
        // therefore enforced structurally — there is nothing in the
        // import table for a guest to use even if it wanted to reach
        // host env vars, the filesystem, or the network.
        let linker: Linker<SandboxLimits> = Linker::new(&engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginHostError::Wasmtime(e.to_string()))?;

        let abi = resolve_abi(&mut store, &instance)?;

        Ok(Self {
            manifest,
            timeout,
            store: AsyncMutex::new(store),
            abi,
            engine,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn permissions(&self) -> &Permissions {
        &self.manifest.permissions
    }

    /// Serializes `request` to JSON, writes it into guest memory, invokes
    /// `__pocket_call`, and parses the JSON response (spec §4.8, "Call
    /// convention"). Bounded by `permissions.timeout` via epoch
    /// interruption, racing the caller's own `ctx` (spec §5, "whichever
    /// fires first cancels") via a second epoch-incrementing watcher.
    async fn call(&self, ctx: &Ctx, request: &PluginRequest<'_>) -> Result<PluginResponse, PluginHostError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| PluginHostError::Serialization(e.to_string()))?;

        let mut store = self.store.lock().await;
        let engine = self.engine.clone();
        store.set_epoch_deadline(1);

        let timeout = self.timeout;
        let timer_engine = engine.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_engine.increment_epoch();
        });

        let cancel_engine = engine.clone();
        let watched_ctx = ctx.clone();
        let canceller = tokio::spawn(async move {
            watched_ctx.race(std::future::pending::<()>()).await;
            cancel_engine.increment_epoch();
        });

        let result = call_guest(&mut store, &self.abi, &payload);
        timer.abort();
        canceller.abort();

        match result {
            Err(PluginHostError::Timeout) if ctx.is_cancelled() => Err(PluginHostError::Cancelled),
            other => other,
        }
    }
}

fn resolve_abi(
    store: &mut WasmStore<SandboxLimits>,
    instance: &Instance,
) -> Result<GuestAbi, PluginHostError> {
    let alloc = instance
        .get_typed_func::<u32, u32>(&mut *store, "__pocket_alloc")
        .map_err(|_| PluginHostError::MissingExport("__pocket_alloc"))?;
    let call = instance
        .get_typed_func::<(u32, u32), u64>(&mut *store, "__pocket_call")
        .map_err(|_| PluginHostError::MissingExport("__pocket_call"))?;
    let free = instance
        .get_typed_func::<(u32, u32), ()>(&mut *store, "__pocket_free")
        .ok();
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or(PluginHostError::MissingExport("memory"))?;

    Ok(GuestAbi {
        alloc,
        call,
        free,
        memory,
    })
}

/// The synchronous half of a call: alloc, write, call, read, free. Kept
/// separate from `PluginModule::call` so the timeout timer only wraps
/// the part that can actually run long.
fn call_guest(
    store: &mut WasmStore<SandboxLimits>,
    abi: &GuestAbi,
    payload: &[u8],
) -> Result<PluginResponse, PluginHostError> {
    let request_ptr = abi
        .alloc
        .call(&mut *store, payload.len() as u32)
        .map_err(interrupted_to_timeout)?;

    abi.memory
        .write(&mut *store, request_ptr as usize, payload)
        .map_err(|e| PluginHostError::Wasmtime(e.to_string()))?;

    let packed = abi
        .call
        .call(&mut *store, (request_ptr, payload.len() as u32))
        .map_err(interrupted_to_timeout)?;

    // `(ptr, len)` is packed into a single i64 return value: high 32 bits
    // are the pointer, low 32 bits the length (spec §4.8 doesn't fix a
    // packing; this is the convention this host and its guests share).
    let response_ptr = (packed >> 32) as u32;
    let response_len = (packed & 0xFFFF_FFFF) as u32;

    let mut response_bytes = vec![0u8; response_len as usize];
    abi.memory
        .read(&mut *store, response_ptr as usize, &mut response_bytes)
        .map_err(|e| PluginHostError::Wasmtime(e.to_string()))?;

    if let Some(free) = &abi.free {
        let _ = free.call(&mut *store, (request_ptr, payload.len() as u32));
        let _ = free.call(&mut *store, (response_ptr, response_len));
    }

    serde_json::from_slice(&response_bytes).map_err(|e| PluginHostError::Serialization(e.to_string()))
}

fn interrupted_to_timeout(e: anyhow::Error) -> PluginHostError {
    if e.to_string().contains("epoch") || e.to_string().contains("interrupt") {
        PluginHostError::Timeout
    } else {
        PluginHostError::Wasmtime(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginHostError {
    #[error("failed to read plugin binary at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wasmtime error: {0}")]
    Wasmtime(String),
    #[error("guest module is missing required export '{0}'")]
    MissingExport(&'static str),
    #[error("plugin call exceeded its permitted timeout")]
    Timeout,
    #[error("plugin call cancelled")]
    Cancelled,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] super::manifest::ManifestError),
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),
    #[error("plugin '{plugin}' does not declare a node of type '{node_type}'")]
    UnknownNodeType { plugin: String, node_type: String },
}

/// Owns every loaded plugin module and the manifests discovered but not
/// yet instantiated. Plugins are loaded lazily at first use (spec §4.8,
/// "Lifecycle").
#[derive(Default)]
pub struct PluginHost {
    discovered: SyncMutex<HashMap<String, DiscoveredManifest>>,
    loaded: SyncMutex<HashMap<String, Arc<PluginModule>>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the default search directories (plus `POCKET_PLUGIN_PATH`)
    /// and caches every valid manifest's metadata without instantiating
    /// any guest module yet (spec §4.8, "Manifest loading").
    pub fn scan_default_dirs(&self) {
        self.scan_dirs(&super::manifest::default_search_dirs());
    }

    pub fn scan_dirs(&self, dirs: &[PathBuf]) {
        let found = super::manifest::discover_manifests(dirs);
        let mut discovered = self.discovered.lock();
        for entry in found {
            discovered.insert(entry.manifest.name.clone(), entry);
        }
    }

    pub fn manifests(&self) -> Vec<Manifest> {
        self.discovered
            .lock()
            .values()
            .map(|d| d.manifest.clone())
            .collect()
    }

    /// Instantiates `name`'s module on first use, returning a cached
    /// handle on subsequent calls.
    fn ensure_loaded(&self, name: &str) -> Result<Arc<PluginModule>, PluginHostError> {
        if let Some(existing) = self.loaded.lock().get(name) {
            return Ok(existing.clone());
        }
        let discovered = self
            .discovered
            .lock()
            .get(name)
            .map(|d| (d.dir.clone(), d.manifest.clone()))
            .ok_or_else(|| PluginHostError::UnknownPlugin(name.to_string()))?;
        let module = Arc::new(PluginModule::load(&discovered.0, discovered.1)?);
        self.loaded.lock().insert(name.to_string(), module.clone());
        Ok(module)
    }

    /// Materializes manifest node definition `node_type` from plugin
    /// `plugin_name` as a host node (spec §4.8, "Node materialization").
    pub fn node(
        &self,
        plugin_name: &str,
        node_type: &str,
        config: Value,
    ) -> Result<PluginNode, PluginHostError> {
        let module = self.ensure_loaded(plugin_name)?;
        let def = module
            .manifest()
            .nodes
            .iter()
            .find(|n| n.node_type == node_type)
            .cloned()
            .ok_or_else(|| PluginHostError::UnknownNodeType {
                plugin: plugin_name.to_string(),
                node_type: node_type.to_string(),
            })?;
        Ok(PluginNode {
            module,
            definition: def,
            config,
        })
    }

    /// Loads a manifest and exercises a no-op call to confirm the module
    /// answers, before accepting installation (spec §4.8, "Validation
    /// tool").
    pub async fn validate_plugin(dir: &std::path::Path, manifest: Manifest) -> Result<(), PluginHostError> {
        let first_node = manifest
            .nodes
            .first()
            .map(|n| n.node_type.clone())
            .ok_or(PluginHostError::UnknownPlugin("<no nodes>".to_string()))?;
        let module = PluginModule::load(dir, manifest)?;
        let request = PluginRequest {
            node: &first_node,
            function: "prep",
            config: &Value::Null,
            input: &Value::Null,
            prep_result: None,
            exec_result: None,
        };
        module.call(&Ctx::new(), &request).await?;
        Ok(())
    }

    pub fn close(&self, name: &str) {
        self.loaded.lock().remove(name);
    }

    pub fn close_all(&self) {
        self.loaded.lock().clear();
    }
}

/// A single manifest-declared node, materialized as a [`NodeBackend`]
/// whose three phases each JSON-RPC into the guest (spec §4.8, "Node
/// materialization").
pub struct PluginNode {
    module: Arc<PluginModule>,
    definition: NodeDefinition,
    config: Value,
}

impl PluginNode {
    pub fn definition(&self) -> &NodeDefinition {
        &self.definition
    }

    async fn rpc(
        &self,
        ctx: &Ctx,
        phase: Phase,
        function: &str,
        input: &Value,
        prep_result: Option<&Value>,
        exec_result: Option<&Value>,
    ) -> NodeResult<PluginResponse> {
        let request = PluginRequest {
            node: &self.definition.node_type,
            function,
            config: &self.config,
            input,
            prep_result,
            exec_result,
        };
        let response = self.module.call(ctx, &request).await.map_err(|e| -> BoxError {
            match e {
                PluginHostError::Cancelled => Box::new(PocketError::Cancelled {
                    node: self.definition.node_type.clone(),
                    phase,
                }),
                other => Box::new(PocketError::PluginCall {
                    node: self.definition.node_type.clone(),
                    phase,
                    message: other.to_string(),
                }),
            }
        })?;
        if !response.success {
            let message = response
                .error
                .clone()
                .unwrap_or_else(|| "plugin call failed with no error message".to_string());
            return Err(message.into());
        }
        Ok(response)
    }
}

#[async_trait]
impl NodeBackend for PluginNode {
    async fn prep(&self, ctx: &Ctx, _reader: &StoreReader, input: Value) -> NodeResult<Value> {
        let response = self.rpc(ctx, Phase::Prep, "prep", &input, None, None).await?;
        Ok(response.output.unwrap_or(input))
    }

    async fn exec(&self, ctx: &Ctx, prep_result: Value) -> NodeResult<Value> {
        let response = self
            .rpc(ctx, Phase::Exec, "exec", &Value::Null, Some(&prep_result), None)
            .await?;
        Ok(response.output.unwrap_or(prep_result))
    }

    async fn post(
        &self,
        ctx: &Ctx,
        _writer: &StoreWriter,
        _input: Value,
        prep_result: Value,
        exec_result: Value,
    ) -> NodeResult<(Value, Action)> {
        let response = self
            .rpc(ctx, Phase::Post, "post", &Value::Null, Some(&prep_result), Some(&exec_result))
            .await?;
        let output = response.output.unwrap_or(exec_result);
        // A missing `next` in a post response defaults to "done" (spec
        // §4.8), distinct from the engine-wide "default" action name —
        // plugin authors see their own terminal convention.
        let action = response.next.unwrap_or_else(|| "done".to_string());
        Ok((output, action.into()))
    }
}
