//! Configuration for the bridge runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env::EnvironmentConfig;
use crate::error::{BridgeError, Result};
use crate::memory::marshal::DEFAULT_ROTATION_BYTES;

/// Content type the direct instantiation path accepts.
pub const WASM_CONTENT_TYPE: &str = "application/wasm";

/// WASI capability grants for modules that import WASI preview1.
///
/// Following the deny-by-default model, all capabilities start disabled.
#[cfg(feature = "wasi")]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Allow access to stdin
    pub stdin: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Directories to pre-open read-only
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

#[cfg(feature = "wasi")]
impl WasiCapabilities {
    /// Nothing allowed
    pub fn none() -> Self {
        Self::default()
    }

    /// stdout/stderr only, for module-side logging
    pub fn logging() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Full stdio
    pub fn with_stdio() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for a [`Loader`](crate::Loader) and the instance it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum linear memory in bytes (default 256 MB)
    pub max_memory: usize,

    /// Fuel budget for the whole instance (enables fuel metering)
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// wasmtime cache configuration file
    pub cache_path: Option<PathBuf>,

    /// Cumulative decoded bytes after which the UTF-8 decoder is recreated
    pub decoder_rotation_bytes: usize,

    /// Leading reference table slots reserved before the sentinels
    pub ref_table_initial_len: u32,

    /// Run destructors of module closures the host dropped without releasing
    pub finalization: bool,

    /// Define imports the surface does not cover as trapping stubs
    pub trap_unknown_imports: bool,

    /// Content type required by the direct instantiation path
    pub expected_content_type: String,

    /// Default module file, resolved next to the running executable
    pub artifact: String,

    /// Global probes for environment detection
    pub environment: EnvironmentConfig,

    /// Install `console` and `crypto` when the embedder did not provide them
    pub install_builtins: bool,

    /// WASI grants (modules without WASI imports ignore these)
    #[cfg(feature = "wasi")]
    pub wasi: WasiCapabilities,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_memory: 256 * 1024 * 1024, // 256 MB
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
            cache_path: None,
            decoder_rotation_bytes: DEFAULT_ROTATION_BYTES,
            ref_table_initial_len: 1,
            finalization: true,
            trap_unknown_imports: false,
            expected_content_type: WASM_CONTENT_TYPE.to_string(),
            artifact: "module_bg.wasm".to_string(),
            environment: EnvironmentConfig::default(),
            install_builtins: true,
            #[cfg(feature = "wasi")]
            wasi: WasiCapabilities::logging(),
        }
    }
}

impl BridgeConfig {
    /// Maximum isolation: small memory, fuel metering, no builtins
    pub fn minimal() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: Some(1_000_000_000),
            install_builtins: false,
            #[cfg(feature = "wasi")]
            wasi: WasiCapabilities::none(),
            ..Default::default()
        }
    }

    /// Fast compilation, stdio, unknown imports trap instead of failing
    pub fn development() -> Self {
        Self {
            optimization_level: 0,
            trap_unknown_imports: true,
            #[cfg(feature = "wasi")]
            wasi: WasiCapabilities::with_stdio(),
            ..Default::default()
        }
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded bridge config");
        Ok(config)
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.decoder_rotation_bytes == 0 {
            return Err(BridgeError::Config(
                "decoder_rotation_bytes must be positive".to_string(),
            ));
        }
        if self.ref_table_initial_len == 0 {
            return Err(BridgeError::Config(
                "ref_table_initial_len must reserve slot 0".to_string(),
            ));
        }
        if self.optimization_level > 2 {
            return Err(BridgeError::Config(format!(
                "optimization_level {} out of range 0-2",
                self.optimization_level
            )));
        }
        Ok(())
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Builder: set decoder rotation threshold
    pub fn decoder_rotation(mut self, bytes: usize) -> Self {
        self.decoder_rotation_bytes = bytes;
        self
    }

    /// Builder: reserve leading reference table slots
    pub fn ref_table_reserve(mut self, slots: u32) -> Self {
        self.ref_table_initial_len = slots.max(1);
        self
    }

    /// Builder: enable finalization of dropped closures
    pub fn finalization(mut self, enable: bool) -> Self {
        self.finalization = enable;
        self
    }

    /// Builder: trap on unknown imports instead of failing to link
    pub fn trap_unknown_imports(mut self, enable: bool) -> Self {
        self.trap_unknown_imports = enable;
        self
    }

    /// Builder: set default artifact name
    pub fn artifact(mut self, name: impl Into<String>) -> Self {
        self.artifact = name.into();
        self
    }

    /// Builder: set environment probes
    pub fn environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    /// Builder: install builtin capabilities
    pub fn builtins(mut self, enable: bool) -> Self {
        self.install_builtins = enable;
        self
    }

    /// Builder: set WASI capabilities
    #[cfg(feature = "wasi")]
    pub fn wasi(mut self, caps: WasiCapabilities) -> Self {
        self.wasi = caps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_memory, 256 * 1024 * 1024);
        assert_eq!(config.decoder_rotation_bytes, 2_146_435_072);
        assert_eq!(config.expected_content_type, "application/wasm");
        assert!(config.finalization);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let minimal = BridgeConfig::minimal();
        assert_eq!(minimal.max_memory, 64 * 1024 * 1024);
        assert!(minimal.fuel_limit.is_some());
        assert!(!minimal.install_builtins);

        let dev = BridgeConfig::development();
        assert_eq!(dev.optimization_level, 0);
        assert!(dev.trap_unknown_imports);
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::default()
            .max_memory(1024 * 1024)
            .fuel_limit(1000)
            .optimize(9)
            .decoder_rotation(64)
            .ref_table_reserve(0);
        assert_eq!(config.max_memory, 1024 * 1024);
        assert_eq!(config.fuel_limit, Some(1000));
        assert_eq!(config.optimization_level, 2);
        assert_eq!(config.decoder_rotation_bytes, 64);
        assert_eq!(config.ref_table_initial_len, 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"decoder_rotation_bytes": 4096, "finalization": false}"#)
                .unwrap();
        assert_eq!(config.decoder_rotation_bytes, 4096);
        assert!(!config.finalization);
        assert_eq!(config.artifact, "module_bg.wasm");
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = BridgeConfig::default().decoder_rotation(0);
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"artifact": "app.wasm"}"#).unwrap();
        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.artifact, "app.wasm");
    }
}
