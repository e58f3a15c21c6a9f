//! Error types for the bridge crate.

use thiserror::Error;

use crate::value::Thrown;

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Failed to configure or create the wasmtime engine
    #[error("engine error: {0}")]
    Engine(String),

    /// Module bytes failed to compile
    #[error("compile error: {0}")]
    Compile(String),

    /// Failed to define an import on the linker
    #[error("link error: {0}")]
    Link(String),

    /// Instantiation failed (unresolved imports, start trap, limits)
    #[error("instantiation failed: {0}")]
    Instantiate(String),

    /// A required export is missing from the module
    #[error("module does not export `{0}`")]
    MissingExport(String),

    /// The module trapped
    #[error("module trapped: {0}")]
    Trap(String),

    /// A host capability threw through an adapter that does not catch
    #[error("uncaught host exception: {0}")]
    Uncaught(Thrown),

    /// The module raised an error through the throw intrinsic
    #[error("module threw: {0}")]
    ModuleThrow(String),

    /// Strict UTF-8 decoding failed
    #[error("invalid UTF-8 in module memory: {0}")]
    Decode(#[from] std::str::Utf8Error),

    /// Access outside the current linear memory
    #[error("memory access out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds {
        /// Byte offset requested
        offset: usize,
        /// Byte length requested
        len: usize,
        /// Current memory size in bytes
        size: usize,
    },

    /// Streaming instantiation refused the declared content type
    #[error("expected content type `{expected}`, found {found:?}")]
    ContentType {
        /// Content type the direct path requires
        expected: String,
        /// Content type declared by the response
        found: Option<String>,
    },

    /// Fetching the module failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current loader or instance state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A closure or export does not have the expected signature
    #[error("signature mismatch: {0}")]
    Signature(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Recover a bridge error from a wasmtime error.
    ///
    /// Host functions return `BridgeError` values wrapped in `wasmtime::Error`;
    /// those come back out unchanged. Anything else is a trap.
    pub fn from_wasm(err: wasmtime::Error) -> Self {
        match err.downcast::<BridgeError>() {
            Ok(err) => err,
            Err(err) => BridgeError::Trap(format!("{err:#}")),
        }
    }
}

#[cfg(feature = "fetch")]
impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Fetch(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
