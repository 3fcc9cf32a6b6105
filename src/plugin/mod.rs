//! WebAssembly plugin host (C8, spec §4.8): lets third-party node
//! implementations ship as sandboxed `.wasm` modules, discovered and
//! loaded from on-disk manifests.

pub mod manifest;

#[cfg(feature = "wasm")]
pub mod host;

pub use manifest::{
    default_search_dirs, discover_manifests, load_manifest, validate_manifest, DiscoveredManifest,
    Example, Manifest, ManifestError, NodeDefinition, Permissions, Requirements,
    PLUGIN_PATH_ENV_VAR,
};

#[cfg(feature = "wasm")]
pub use host::{PluginHost, PluginHostError, PluginModule, PluginNode};
