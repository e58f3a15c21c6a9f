//! Module loading: fetch, compile, instantiate, initialize.
//!
//! A [`Loader`] owns the engine and produces at most one
//! [`ModuleInstance`]. The asynchronous path accepts a response-like
//! [`FetchResponse`] and prefers the direct path, which requires the
//! `application/wasm` content type. A response that is otherwise valid but
//! declares another content type takes the fallback path instead, with one
//! warning.
//!
//! wasmtime compiles only complete binaries, so neither path overlaps
//! download with compilation. The direct path reads the body chunk by chunk
//! and rejects a non-wasm payload as soon as the header arrives; the
//! fallback reads it whole. Both compile the buffered bytes on the blocking
//! pool. Every other failure is fatal and leaves the loader in
//! [`LoadState::Failed`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, error, info, warn};
use wasmtime::{Config, Engine, Linker, Module, OptLevel, Store};

use crate::config::{BridgeConfig, WASM_CONTENT_TYPE};
use crate::env::{Environment, HostEnvironment};
use crate::error::{BridgeError, Result};
use crate::instance::ModuleInstance;
use crate::state::{BridgeState, ExportTable};
use crate::surface::adapter::define_surface;
use crate::surface::intrinsics::Intrinsics;
use crate::surface::CallSurface;

const WASM_MAGIC: [u8; 4] = *b"\0asm";

/// Loader lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing attempted yet
    Unloaded,
    /// Fetching and compiling
    Fetching,
    /// Linking and running initializers
    Instantiating,
    /// Instance available
    Ready,
    /// A load failed; the loader cannot be reused
    Failed,
}

/// Response type, as far as the fallback decision is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Same-origin response
    Basic,
    /// Cross-origin response with CORS
    Cors,
    /// Response constructed locally
    Default,
    /// Opaque cross-origin response
    Opaque,
    /// Network error
    Error,
}

impl ResponseKind {
    /// Whether a content-type mismatch on this kind may fall back to buffering.
    pub fn allows_fallback(self) -> bool {
        matches!(self, ResponseKind::Basic | ResponseKind::Cors | ResponseKind::Default)
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// A fetched (or synthesized) module response with a streaming body.
pub struct FetchResponse {
    /// Status in the 2xx range
    pub ok: bool,
    /// HTTP status
    pub status: u16,
    /// Response type
    pub kind: ResponseKind,
    /// Declared `Content-Type`
    pub content_type: Option<String>,
    /// Where the response came from, for messages
    pub url: String,
    body: BodyStream,
}

impl FetchResponse {
    /// Response over an arbitrary body stream.
    pub fn new(
        status: u16,
        kind: ResponseKind,
        content_type: Option<String>,
        body: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            kind,
            content_type,
            url: String::new(),
            body: Box::pin(body),
        }
    }

    /// 200 response over an in-memory body.
    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        let bytes = bytes.into();
        Self::new(
            200,
            ResponseKind::Basic,
            content_type.map(str::to_string),
            stream::once(future::ready(Ok::<_, std::io::Error>(bytes))),
        )
    }

    /// Builder: set the status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self.ok = (200..300).contains(&status);
        self
    }

    /// Builder: set the response kind.
    pub fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder: set the URL used in messages.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Wrap a `reqwest` response without reading its body.
    #[cfg(feature = "fetch")]
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Self::new(status, ResponseKind::Cors, content_type, body).with_url(url)
    }

    /// Whether the declared content type is `expected` (parameters ignored).
    pub fn content_type_is(&self, expected: &str) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(expected))
    }

    /// Read the whole body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Buffer the body, rejecting anything that is not a wasm binary as soon
    /// as the header has arrived.
    ///
    /// Compilation starts only after the last chunk; the early header check
    /// is the only work done while the download is in progress.
    async fn stream_module_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let mut header_checked = false;
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
            if !header_checked && buf.len() >= WASM_MAGIC.len() {
                if buf[..WASM_MAGIC.len()] != WASM_MAGIC {
                    return Err(BridgeError::Compile(format!(
                        "{} is not a WebAssembly binary",
                        self.describe()
                    )));
                }
                header_checked = true;
            }
        }
        Ok(buf.freeze())
    }

    fn describe(&self) -> String {
        if self.url.is_empty() {
            "response".to_string()
        } else {
            format!("`{}`", self.url)
        }
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("kind", &self.kind)
            .field("content_type", &self.content_type)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Where [`Loader::init_async`] gets the module from.
pub enum ModuleSource {
    /// A file; its extension decides the content type
    Path(PathBuf),
    /// An HTTP(S) URL
    #[cfg(feature = "fetch")]
    Url(String),
    /// Raw module bytes
    Bytes(Bytes),
    /// An already compiled module
    Module(Module),
    /// A response whose body is the module
    Response(FetchResponse),
}

/// Where [`Loader::init_sync`] gets the module from.
pub enum SyncSource {
    /// Raw module bytes
    Bytes(Bytes),
    /// An already compiled module
    Module(Module),
    /// A file
    Path(PathBuf),
}

/// Loads one module and owns the resulting instance.
pub struct Loader {
    engine: Engine,
    config: BridgeConfig,
    surface: CallSurface,
    host: HostEnvironment,
    state: LoadState,
    instance: Option<ModuleInstance>,
    warnings: Vec<String>,
}

impl Loader {
    /// Create a loader and its engine.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let mut engine_config = Config::new();

        // Configure optimization
        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });

        engine_config.wasm_simd(config.enable_simd);

        // Enable fuel metering if configured
        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        // Configure caching if path provided
        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::Engine(format!("engine creation failed: {}", e)))?;

        Ok(Self {
            engine,
            config,
            surface: CallSurface::default_surface(),
            host: HostEnvironment::new(),
            state: LoadState::Unloaded,
            instance: None,
            warnings: Vec::new(),
        })
    }

    /// Builder: set the call surface.
    pub fn with_surface(mut self, surface: CallSurface) -> Self {
        self.surface = surface;
        self
    }

    /// Builder: set the host environment.
    pub fn with_host(mut self, host: HostEnvironment) -> Self {
        self.host = host;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Warnings emitted while loading (content-type fallbacks).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The engine modules are compiled with.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The call surface.
    pub fn surface(&self) -> &CallSurface {
        &self.surface
    }

    /// The instance, once ready.
    pub fn instance(&mut self) -> Option<&mut ModuleInstance> {
        self.instance.as_mut()
    }

    /// Default module location: the artifact next to the running executable.
    pub fn default_artifact(&self) -> Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(dir.join(&self.config.artifact))
    }

    /// Load asynchronously. `None` loads the default artifact.
    ///
    /// Returns the existing instance if already ready.
    pub async fn init_async(&mut self, source: Option<ModuleSource>) -> Result<&mut ModuleInstance> {
        if self.check_reentry()? {
            return self.ready_instance();
        }
        let source = match source {
            Some(source) => source,
            None => ModuleSource::Path(self.default_artifact()?),
        };

        self.transition(LoadState::Fetching);
        let module = match self.compile_source(source).await {
            Ok(module) => module,
            Err(e) => return Err(self.fail(e)),
        };
        self.finish(&module)
    }

    /// Load synchronously from bytes, a compiled module, or a file.
    pub fn init_sync(&mut self, source: SyncSource) -> Result<&mut ModuleInstance> {
        if self.check_reentry()? {
            return self.ready_instance();
        }
        let compiled = match source {
            SyncSource::Module(module) => Ok(module),
            SyncSource::Bytes(bytes) => self.compile(&bytes),
            SyncSource::Path(path) => std::fs::read(&path)
                .map_err(BridgeError::from)
                .and_then(|bytes| self.compile(&bytes)),
        };
        let module = match compiled {
            Ok(module) => module,
            Err(e) => return Err(self.fail(e)),
        };
        self.finish(&module)
    }

    /// Compile module bytes on the calling thread.
    pub fn compile(&self, bytes: &[u8]) -> Result<Module> {
        Module::new(&self.engine, bytes).map_err(|e| BridgeError::Compile(format!("{e:#}")))
    }

    /// `true` when already ready; an error when a previous load failed.
    fn check_reentry(&self) -> Result<bool> {
        match self.state {
            LoadState::Ready => Ok(true),
            LoadState::Failed => Err(BridgeError::InvalidState(
                "a previous initialization failed; create a new loader".to_string(),
            )),
            // A dropped init future leaves Fetching behind; start over
            LoadState::Unloaded | LoadState::Fetching | LoadState::Instantiating => Ok(false),
        }
    }

    fn ready_instance(&mut self) -> Result<&mut ModuleInstance> {
        self.instance
            .as_mut()
            .ok_or_else(|| BridgeError::InvalidState("instance missing after load".to_string()))
    }

    fn finish(&mut self, module: &Module) -> Result<&mut ModuleInstance> {
        self.transition(LoadState::Instantiating);
        match self.instantiate(module) {
            Ok(instance) => {
                self.instance = Some(instance);
                self.transition(LoadState::Ready);
                self.ready_instance()
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn transition(&mut self, next: LoadState) {
        info!(from = ?self.state, to = ?next, "loader state");
        self.state = next;
    }

    fn fail(&mut self, e: BridgeError) -> BridgeError {
        error!("module load failed: {e}");
        self.transition(LoadState::Failed);
        e
    }

    async fn compile_source(&mut self, source: ModuleSource) -> Result<Module> {
        match source {
            ModuleSource::Module(module) => Ok(module),
            ModuleSource::Bytes(bytes) => self.compile_blocking(bytes).await,
            ModuleSource::Path(path) => {
                let bytes = tokio::fs::read(&path).await?;
                let content_type = content_type_for(&path);
                let response = FetchResponse::from_bytes(bytes, content_type)
                    .with_kind(ResponseKind::Default)
                    .with_url(path.display().to_string());
                self.compile_response(response).await
            }
            #[cfg(feature = "fetch")]
            ModuleSource::Url(url) => {
                debug!(%url, "fetching module");
                let response = reqwest::get(&url).await?;
                self.compile_response(FetchResponse::from_reqwest(response)).await
            }
            ModuleSource::Response(response) => self.compile_response(response).await,
        }
    }

    async fn compile_response(&mut self, response: FetchResponse) -> Result<Module> {
        let expected = self.config.expected_content_type.clone();

        if response.content_type_is(&expected) {
            if !response.ok {
                return Err(BridgeError::Fetch(format!(
                    "{} failed with status {}",
                    response.describe(),
                    response.status
                )));
            }
            let bytes = response.stream_module_bytes().await?;
            return self.compile_blocking(bytes).await;
        }

        if response.ok && response.kind.allows_fallback() {
            let message = format!(
                "{} has Content-Type {:?}, not `{}`; falling back to buffered instantiation, which is slower",
                response.describe(),
                response.content_type.as_deref().unwrap_or("<none>"),
                expected
            );
            warn!("{message}");
            self.warnings.push(message);
            let bytes = response.bytes().await?;
            return self.compile_blocking(bytes).await;
        }

        Err(BridgeError::ContentType {
            expected,
            found: response.content_type,
        })
    }

    async fn compile_blocking(&self, bytes: Bytes) -> Result<Module> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| BridgeError::Compile(format!("compile task failed: {e}")))?
            .map_err(|e| BridgeError::Compile(format!("{e:#}")))
    }

    fn instantiate(&self, module: &Module) -> Result<ModuleInstance> {
        let environment = Environment::new(
            self.host.clone(),
            self.config.environment.clone(),
            self.config.install_builtins,
        );
        let state = BridgeState::new(&self.config, environment)?;
        let mut store = Store::new(&self.engine, state);

        // Configure resource limits via the stored limiter
        store.limiter(|state| &mut state.limits);

        // Add fuel if configured
        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Engine(format!("fuel setup failed: {}", e)))?;
        }

        let mut linker: Linker<BridgeState> = Linker::new(&self.engine);

        #[cfg(feature = "wasi")]
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| BridgeError::Link(format!("WASI link failed: {}", e)))?;

        Intrinsics::register(&mut linker)?;
        define_surface(&mut linker, &self.engine, &self.surface)?;

        if self.config.trap_unknown_imports {
            linker
                .define_unknown_imports_as_traps(module)
                .map_err(|e| BridgeError::Link(format!("failed to stub unknown imports: {}", e)))?;
        }

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| BridgeError::Instantiate(format!("{e:#}")))?;

        let exports = ExportTable::snapshot(&mut store, &instance)?;
        store.data_mut().attach(exports);

        let mut instance = ModuleInstance::new(store, instance);
        instance.initialize()?;
        Ok(instance)
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("state", &self.state)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("wasm") => Some(WASM_CONTENT_TYPE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_matching() {
        let r = FetchResponse::from_bytes(Bytes::new(), Some("application/wasm; charset=binary"));
        assert!(r.content_type_is("application/wasm"));
        let r = FetchResponse::from_bytes(Bytes::new(), Some("application/octet-stream"));
        assert!(!r.content_type_is("application/wasm"));
        let r = FetchResponse::from_bytes(Bytes::new(), None);
        assert!(!r.content_type_is("application/wasm"));
    }

    #[test]
    fn test_status_sets_ok() {
        let r = FetchResponse::from_bytes(Bytes::new(), None).with_status(404);
        assert!(!r.ok);
        assert!(FetchResponse::from_bytes(Bytes::new(), None).ok);
    }

    #[test]
    fn test_fallback_kinds() {
        assert!(ResponseKind::Basic.allows_fallback());
        assert!(ResponseKind::Cors.allows_fallback());
        assert!(ResponseKind::Default.allows_fallback());
        assert!(!ResponseKind::Opaque.allows_fallback());
        assert!(!ResponseKind::Error.allows_fallback());
    }

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(content_type_for(Path::new("app_bg.wasm")), Some("application/wasm"));
        assert_eq!(content_type_for(Path::new("app.bin")), None);
    }

    #[tokio::test]
    async fn test_stream_rejects_non_wasm_early() {
        let chunks: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"<html>")), Ok(Bytes::from_static(b"..."))];
        let r = FetchResponse::new(200, ResponseKind::Basic, None, stream::iter(chunks));
        let err = r.stream_module_bytes().await.unwrap_err();
        assert!(matches!(err, BridgeError::Compile(_)));
    }

    #[test]
    fn test_new_loader_is_unloaded() {
        let loader = Loader::new(BridgeConfig::default()).unwrap();
        assert_eq!(loader.state(), LoadState::Unloaded);
        assert!(loader.warnings().is_empty());
    }
}
