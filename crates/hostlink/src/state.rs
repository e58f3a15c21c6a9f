//! Per-instance state stored in the wasmtime `Store`.

use wasmtime::{Instance, Memory, Store, StoreContextMut, StoreLimits, StoreLimitsBuilder, Table, TypedFunc};

use crate::abi;
use crate::closure::FinalizationQueue;
use crate::config::BridgeConfig;
use crate::env::Environment;
use crate::error::{BridgeError, Result};
use crate::memory::{Utf8Decoder, ViewCache};
use crate::table::RefTable;
use crate::value::{HostValue, Thrown};

/// Exports the bridge needs, captured once after instantiation.
#[derive(Clone)]
pub struct ExportTable {
    /// Linear memory
    pub memory: Memory,
    /// Allocator
    pub malloc: Option<TypedFunc<(i32, i32), i32>>,
    /// Reallocator
    pub realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    /// Error slot notification
    pub exn_store: Option<TypedFunc<i32, ()>>,
    /// One-time initializer
    pub init: Option<TypedFunc<(), ()>>,
    /// Indirect function table
    pub functions: Option<Table>,
}

impl ExportTable {
    /// Look up the bridge exports of a fresh instance.
    ///
    /// Only `memory` is mandatory. Optional exports with the wrong
    /// signature are an error rather than silently absent.
    pub fn snapshot(store: &mut Store<BridgeState>, instance: &Instance) -> Result<Self> {
        let memory = instance
            .get_memory(&mut *store, abi::MEMORY)
            .ok_or_else(|| BridgeError::MissingExport(abi::MEMORY.to_string()))?;

        Ok(Self {
            memory,
            malloc: optional_typed(store, instance, abi::MALLOC)?,
            realloc: optional_typed(store, instance, abi::REALLOC)?,
            exn_store: optional_typed(store, instance, abi::EXN_STORE)?,
            init: optional_typed(store, instance, abi::INIT)?,
            functions: instance.get_table(&mut *store, abi::FUNCTION_TABLE),
        })
    }

    /// The allocator, or a missing-export error.
    pub fn require_malloc(&self) -> Result<TypedFunc<(i32, i32), i32>> {
        self.malloc
            .clone()
            .ok_or_else(|| BridgeError::MissingExport(abi::MALLOC.to_string()))
    }
}

fn optional_typed<P, R>(
    store: &mut Store<BridgeState>,
    instance: &Instance,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let Some(func) = instance.get_func(&mut *store, name) else {
        return Ok(None);
    };
    func.typed::<P, R>(&*store)
        .map(Some)
        .map_err(|e| BridgeError::Signature(format!("export `{name}`: {e}")))
}

/// Data owned by the store: everything the bridge keeps per instance.
pub struct BridgeState {
    pub(crate) refs: RefTable,
    pub(crate) views: ViewCache,
    pub(crate) decoder: Utf8Decoder,
    pub(crate) last_exception: Option<u32>,
    pub(crate) last_written_len: usize,
    pub(crate) finalizers: FinalizationQueue,
    pub(crate) finalization_enabled: bool,
    pub(crate) environment: Environment,
    pub(crate) exports: Option<ExportTable>,
    pub(crate) limits: StoreLimits,
    #[cfg(feature = "wasi")]
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
}

impl BridgeState {
    /// Fresh state for one instance.
    pub(crate) fn new(config: &BridgeConfig, environment: Environment) -> Result<Self> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory)
            .build();

        Ok(Self {
            refs: RefTable::new(config.ref_table_initial_len),
            views: ViewCache::new(),
            decoder: Utf8Decoder::new(config.decoder_rotation_bytes),
            last_exception: None,
            last_written_len: 0,
            finalizers: FinalizationQueue::default(),
            finalization_enabled: config.finalization,
            environment,
            exports: None,
            limits,
            #[cfg(feature = "wasi")]
            preview1: build_preview1(&config.wasi)?,
        })
    }

    /// Bridge exports, once the instance is attached.
    pub(crate) fn exports(&self) -> Result<&ExportTable> {
        self.exports
            .as_ref()
            .ok_or_else(|| BridgeError::InvalidState("module exports not attached yet".to_string()))
    }

    /// Attach a new export snapshot. All cached views become stale.
    pub(crate) fn attach(&mut self, exports: ExportTable) {
        self.exports = Some(exports);
        self.views.invalidate_all();
    }

    /// Box a thrown value and make it the current exception.
    pub(crate) fn record_exception(&mut self, value: HostValue) -> u32 {
        let handle = self.refs.insert(value);
        self.last_exception = Some(handle);
        handle
    }

    /// Reference table.
    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    /// Mutable reference table.
    pub fn refs_mut(&mut self) -> &mut RefTable {
        &mut self.refs
    }

    /// Resolved host environment.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Handle of the most recently recorded exception.
    pub fn last_exception(&self) -> Option<u32> {
        self.last_exception
    }

    /// Length published by the last string or array pass.
    pub fn last_written_len(&self) -> usize {
        self.last_written_len
    }

    /// Typed view cache.
    pub fn views(&self) -> &ViewCache {
        &self.views
    }

    /// UTF-8 decoder.
    pub fn decoder(&self) -> &Utf8Decoder {
        &self.decoder
    }

    /// Closures waiting for their destructor.
    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    #[cfg(feature = "wasi")]
    pub(crate) fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

#[cfg(feature = "wasi")]
fn build_preview1(
    caps: &crate::config::WasiCapabilities,
) -> Result<wasmtime_wasi::preview1::WasiP1Ctx> {
    let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

    if caps.stdin {
        builder.inherit_stdin();
    }
    if caps.stdout {
        builder.inherit_stdout();
    }
    if caps.stderr {
        builder.inherit_stderr();
    }

    for (key, value) in &caps.env_vars {
        builder.env(key, value);
    }
    builder.args(&caps.args);

    for dir in &caps.preopened_dirs_ro {
        builder
            .preopened_dir(
                dir,
                dir.to_string_lossy(),
                wasmtime_wasi::DirPerms::READ,
                wasmtime_wasi::FilePerms::READ,
            )
            .map_err(|e| BridgeError::Config(format!("failed to open dir {:?}: {}", dir, e)))?;
    }

    Ok(builder.build_p1())
}

/// Record `thrown` in the error slot and notify the module.
///
/// Returns the handle of the boxed value. The module is told through its
/// `exn_store` export when it has one.
pub(crate) fn report_exception(
    cx: &mut StoreContextMut<'_, BridgeState>,
    thrown: Thrown,
) -> Result<u32> {
    tracing::debug!(exception = %thrown, "host exception caught");
    let handle = cx.data_mut().record_exception(thrown.0);
    let exn_store = cx.data().exports.as_ref().and_then(|e| e.exn_store.clone());
    if let Some(exn_store) = exn_store {
        exn_store
            .call(&mut *cx, handle as i32)
            .map_err(BridgeError::from_wasm)?;
    }
    Ok(handle)
}
