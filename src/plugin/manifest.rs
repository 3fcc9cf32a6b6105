//! Plugin manifest loading and validation (C8, spec §4.8, §6).
//!
//! A manifest describes a WebAssembly module's metadata, the nodes it
//! contributes, and the permissions it's sandboxed under. Manifests are
//! YAML with a JSON fallback, matching the dual `manifest.yaml|json`
//! requirement.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `POCKET_PLUGIN_PATH` augments the default plugin search directories
/// (spec §6, "Environment variables used by the host process").
pub const PLUGIN_PATH_ENV_VAR: &str = "POCKET_PLUGIN_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(rename = "type")]
    pub node_type: String,
    pub category: String,
    pub description: String,
    #[serde(rename = "configSchema", default)]
    pub config_schema: Option<serde_json::Value>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(rename = "outputSchema", default)]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub examples: Vec<Example>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Permissions {
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub timeout: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub filesystem: Vec<String>,
    #[serde(default)]
    pub network: Vec<String>,
}

impl Permissions {
    /// Parses `memory` (`"50MB"`, `"2GB"`, `"64MiB"`, ...) into a byte
    /// count. SI suffixes (`MB`, `GB`, ...) are decimal; `i`-suffixed
    /// ones (`MiB`, `GiB`, ...) are binary.
    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory
            .as_deref()
            .and_then(|s| s.parse::<bytesize::ByteSize>().ok())
            .map(|b| b.as_u64())
    }

    /// Parses `timeout` (`"5s"`, `"250ms"`, ...) into a [`Duration`].
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_duration)
    }
}

/// A tiny numeric-suffix duration parser (`"5s"`, `"250ms"`, `"2m"`,
/// `"1h"`). Kept dependency-free since the grammar is this small and the
/// crate's own retry-spec fields already need the same shape (spec
/// SPEC_FULL §4.8).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = s.split_at(split_at);
    let value: f64 = number.parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis.max(0.0) as u64))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Requirements {
    pub pocket: Option<String>,
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    pub runtime: String,
    pub binary: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub requirements: Requirements,
}

/// A manifest rejected for violating the minimal shape spec §4.8
/// requires.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest at {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("manifest is missing required field '{field}'")]
    MissingField { field: &'static str },
    #[error("manifest declares zero nodes; at least one is required")]
    NoNodes,
    #[error("node at index {index} is missing required field '{field}'")]
    NodeMissingField { index: usize, field: &'static str },
    #[error("unsupported runtime '{runtime}'; only 'wasm' is supported")]
    UnsupportedRuntime { runtime: String },
}

/// Loads and parses a manifest file (YAML or JSON, by extension), then
/// validates its minimal required shape (spec §4.8, "Manifest loading").
pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let bytes = std::fs::read(path).map_err(|e| ManifestError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let manifest: Manifest = if is_json {
        serde_json::from_slice(&bytes).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_slice(&bytes).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Rejects manifests missing name/version/runtime/binary/nodes, or with a
/// node missing type/category/description, or any runtime besides `wasm`
/// (spec §4.8).
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ManifestError> {
    if manifest.name.is_empty() {
        return Err(ManifestError::MissingField { field: "name" });
    }
    if manifest.version.is_empty() {
        return Err(ManifestError::MissingField { field: "version" });
    }
    if manifest.runtime.is_empty() {
        return Err(ManifestError::MissingField { field: "runtime" });
    }
    if manifest.binary.is_empty() {
        return Err(ManifestError::MissingField { field: "binary" });
    }
    if manifest.runtime != "wasm" {
        return Err(ManifestError::UnsupportedRuntime {
            runtime: manifest.runtime.clone(),
        });
    }
    if manifest.nodes.is_empty() {
        return Err(ManifestError::NoNodes);
    }
    for (index, node) in manifest.nodes.iter().enumerate() {
        if node.node_type.is_empty() {
            return Err(ManifestError::NodeMissingField { index, field: "type" });
        }
        if node.category.is_empty() {
            return Err(ManifestError::NodeMissingField {
                index,
                field: "category",
            });
        }
        if node.description.is_empty() {
            return Err(ManifestError::NodeMissingField {
                index,
                field: "description",
            });
        }
    }
    Ok(())
}

/// The default plugin search directories: user-home, a fixed system
/// location, the current working directory, and any path named by
/// `POCKET_PLUGIN_PATH` (spec §4.8, "Manifest loading").
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        dirs.push(PathBuf::from(home).join(".pocket").join("plugins"));
    }
    dirs.push(PathBuf::from("/etc/pocket/plugins"));
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd.join("plugins"));
    }
    if let Ok(override_path) = std::env::var(PLUGIN_PATH_ENV_VAR) {
        dirs.push(PathBuf::from(override_path));
    }
    dirs
}

/// A manifest found on disk, alongside the directory it lives in (binary
/// paths in the manifest are relative to this directory).
pub struct DiscoveredManifest {
    pub dir: PathBuf,
    pub manifest: Manifest,
}

/// Scans `dirs` for `manifest.yaml` or `manifest.json`. Invalid manifests
/// are skipped with a `tracing::warn`, not a hard error — one bad plugin
/// shouldn't prevent others from loading.
pub fn discover_manifests(dirs: &[PathBuf]) -> Vec<DiscoveredManifest> {
    let mut found = Vec::new();
    for dir in dirs {
        for candidate in ["manifest.yaml", "manifest.json"] {
            let path = dir.join(candidate);
            if !path.is_file() {
                continue;
            }
            match load_manifest(&path) {
                Ok(manifest) => found.push(DiscoveredManifest {
                    dir: dir.clone(),
                    manifest,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "rejecting invalid plugin manifest");
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_manifest() -> Manifest {
        Manifest {
            name: "echo-plugin".into(),
            version: "0.1.0".into(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            runtime: "wasm".into(),
            binary: "echo.wasm".into(),
            nodes: vec![NodeDefinition {
                node_type: "echo".into(),
                category: "utility".into(),
                description: "echoes its input".into(),
                config_schema: None,
                input_schema: None,
                output_schema: None,
                examples: vec![],
            }],
            permissions: Permissions::default(),
            requirements: Requirements::default(),
        }
    }

    #[test]
    fn minimal_manifest_validates() {
        assert!(validate_manifest(&minimal_manifest()).is_ok());
    }

    #[test]
    fn missing_name_is_rejected() {
        let mut m = minimal_manifest();
        m.name = String::new();
        assert!(matches!(
            validate_manifest(&m),
            Err(ManifestError::MissingField { field: "name" })
        ));
    }

    #[test]
    fn non_wasm_runtime_is_rejected() {
        let mut m = minimal_manifest();
        m.runtime = "native".into();
        assert!(matches!(
            validate_manifest(&m),
            Err(ManifestError::UnsupportedRuntime { .. })
        ));
    }

    #[test]
    fn zero_nodes_is_rejected() {
        let mut m = minimal_manifest();
        m.nodes.clear();
        assert!(matches!(validate_manifest(&m), Err(ManifestError::NoNodes)));
    }

    #[test]
    fn node_missing_description_is_rejected() {
        let mut m = minimal_manifest();
        m.nodes[0].description = String::new();
        assert!(matches!(
            validate_manifest(&m),
            Err(ManifestError::NodeMissingField { field: "description", .. })
        ));
    }

    #[test]
    fn duration_parsing_handles_common_suffixes() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("garbage"), None);
    }

    #[test]
    fn memory_permission_parses_byte_sizes() {
        // `bytesize` distinguishes SI suffixes ("MB" = 1_000_000) from
        // binary ones ("MiB" = 1_048_576); use the binary suffix here so
        // the assertion's `1024`-based arithmetic actually matches what
        // gets parsed.
        let mut p = Permissions::default();
        p.memory = Some("64MiB".to_string());
        assert_eq!(p.memory_bytes(), Some(64 * 1024 * 1024));
    }

    #[test]
    fn memory_permission_parses_si_byte_sizes() {
        let mut p = Permissions::default();
        p.memory = Some("64MB".to_string());
        assert_eq!(p.memory_bytes(), Some(64 * 1_000_000));
    }

    #[test]
    fn yaml_manifest_round_trips_through_serde() {
        let yaml = serde_yaml::to_string(&minimal_manifest()).unwrap();
        let parsed: Manifest = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.name, "echo-plugin");
        assert_eq!(parsed.nodes.len(), 1);
    }
}
