//! A ready module instance and the host-side calls into it.

use std::time::Instant;

use tracing::{debug, trace};
use wasmtime::{AsContextMut, Instance, Store, WasmParams, WasmResults};

use crate::abi;
use crate::closure;
use crate::error::{BridgeError, Result};
use crate::memory::{marshal, Element, TypedView, ViewKind};
use crate::scope::Scope;
use crate::state::BridgeState;
use crate::value::{HostFunction, HostValue, Thrown};

/// Result of calling an export.
#[derive(Debug, Clone)]
pub struct CallResult<T> {
    /// Return value
    pub value: T,
    /// Execution time in microseconds
    pub execution_time_us: u64,
    /// Fuel consumed (if fuel metering enabled)
    pub fuel_consumed: Option<u64>,
}

/// An instantiated and initialized module.
pub struct ModuleInstance {
    store: Store<BridgeState>,
    instance: Instance,
    initialized: bool,
}

impl ModuleInstance {
    pub(crate) fn new(store: Store<BridgeState>, instance: Instance) -> Self {
        Self {
            store,
            instance,
            initialized: false,
        }
    }

    /// Run the module's one-time initializer, if it exports one.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        let init = self.store.data().exports()?.init.clone();
        if let Some(init) = init {
            debug!("running module initializer");
            init.call(&mut self.store, ()).map_err(BridgeError::from_wasm)?;
            self.run_finalizers();
        }
        Ok(())
    }

    /// Call the module's `start` export.
    pub fn start(&mut self) -> Result<CallResult<()>> {
        self.call::<(), ()>(abi::START, ())
    }

    /// Call an export with typed parameters and results.
    ///
    /// Queued closure destructors run once the call has returned.
    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<CallResult<R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| match self.instance.get_func(&mut self.store, name) {
                Some(_) => BridgeError::Signature(format!("export `{name}`: {e}")),
                None => BridgeError::MissingExport(name.to_string()),
            })?;

        let fuel_before = self.store.get_fuel().ok();
        let start = Instant::now();

        let outcome = func.call(&mut self.store, params);

        let execution_time_us = start.elapsed().as_micros() as u64;
        let fuel_after = self.store.get_fuel().ok();
        let fuel_consumed = fuel_before.zip(fuel_after).map(|(b, a)| b - a);
        trace!(export = name, execution_time_us, ?fuel_consumed, "export returned");

        self.run_finalizers();
        let value = outcome.map_err(BridgeError::from_wasm)?;

        Ok(CallResult {
            value,
            execution_time_us,
            fuel_consumed,
        })
    }

    /// Call a host function or module closure from the host.
    pub fn invoke(&mut self, function: &HostFunction, args: &[HostValue]) -> std::result::Result<HostValue, Thrown> {
        let result = Scope::new(self.store.as_context_mut()).invoke(function, args);
        self.run_finalizers();
        result
    }

    /// Names of all exports.
    pub fn exports(&mut self) -> Vec<String> {
        self.instance
            .exports(&mut self.store)
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.store
            .data()
            .exports
            .as_ref()
            .map_or(0, |e| e.memory.data_size(&self.store))
    }

    /// Current view of `kind`, rebuilt if memory grew.
    pub fn view(&mut self, kind: ViewKind) -> Result<TypedView> {
        marshal::view(&mut self.store.as_context_mut(), kind)
    }

    /// Copy bytes out of linear memory.
    pub fn read_memory(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        marshal::read_array::<u8>(&mut self.store.as_context_mut(), offset, len)
    }

    /// Copy bytes into linear memory.
    pub fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        marshal::write_bytes(&mut self.store.as_context_mut(), offset, bytes)
    }

    /// Copy a string into module memory; returns `(ptr, len)`.
    pub fn pass_string(&mut self, s: &str) -> Result<(u32, usize)> {
        marshal::pass_string(&mut self.store.as_context_mut(), s)
    }

    /// Decode the UTF-8 string at `(ptr, len)`.
    pub fn read_string(&mut self, ptr: u32, len: usize) -> Result<String> {
        marshal::read_string(&mut self.store.as_context_mut(), ptr, len)
    }

    /// Copy a slice into module memory; returns `(ptr, len)` in elements.
    pub fn pass_array<T: Element>(&mut self, values: &[T]) -> Result<(u32, usize)> {
        marshal::pass_array(&mut self.store.as_context_mut(), values)
    }

    /// Copy `len` elements out of module memory.
    pub fn read_array<T: Element>(&mut self, ptr: u32, len: usize) -> Result<Vec<T>> {
        marshal::read_array(&mut self.store.as_context_mut(), ptr, len)
    }

    /// Box a value and return its handle.
    pub fn box_value(&mut self, value: HostValue) -> u32 {
        self.store.data_mut().refs.boxed(value)
    }

    /// Value behind a handle.
    pub fn value(&self, handle: u32) -> HostValue {
        self.store.data().refs.get(handle)
    }

    /// Release a handle. Reserved sentinel slots are ignored.
    pub fn drop_ref(&mut self, handle: u32) {
        self.store.data_mut().refs.free(handle);
        self.run_finalizers();
    }

    /// The most recently recorded exception. Reading does not clear it.
    pub fn last_exception(&self) -> Option<HostValue> {
        let state = self.store.data();
        state.last_exception.map(|h| state.refs.get(h))
    }

    /// Run destructors of closures the host dropped while still registered.
    pub fn run_finalizers(&mut self) -> usize {
        let ran = closure::run_finalizers(&mut self.store.as_context_mut());
        if ran > 0 {
            debug!(ran, "closure finalizers ran");
        }
        ran
    }

    /// Fuel left, when metering is enabled.
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// Bridge state.
    pub fn state(&self) -> &BridgeState {
        self.store.data()
    }

    /// Mutable bridge state.
    pub fn state_mut(&mut self) -> &mut BridgeState {
        self.store.data_mut()
    }

    /// The underlying wasmtime instance and store.
    pub fn raw(&mut self) -> (&Instance, &mut Store<BridgeState>) {
        (&self.instance, &mut self.store)
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("memory_size", &self.memory_size())
            .field("live_refs", &self.store.data().refs.live())
            .field("pending_finalizers", &self.store.data().pending_finalizers())
            .finish_non_exhaustive()
    }
}
