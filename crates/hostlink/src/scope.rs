//! Access to the running instance from inside a host capability.

use wasmtime::StoreContextMut;

use crate::env::Environment;
use crate::state::BridgeState;
use crate::value::{HostFunction, HostValue, Thrown};

/// The context a host function runs in.
///
/// A capability receives a `Scope` for the duration of one call. Through it
/// the capability can call other host functions, including module closures,
/// and read the detected environment.
pub struct Scope<'a> {
    cx: StoreContextMut<'a, BridgeState>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(cx: StoreContextMut<'a, BridgeState>) -> Self {
        Self { cx }
    }

    /// Call `function` with `args`.
    pub fn invoke(&mut self, function: &HostFunction, args: &[HostValue]) -> Result<HostValue, Thrown> {
        match function {
            HostFunction::Native { f, .. } => {
                let f = f.clone();
                f(self, args)
            }
            HostFunction::Closure(wrapper) => wrapper.call(&mut self.cx, args),
        }
    }

    /// Call a function value; anything else throws a `TypeError`.
    pub fn call(&mut self, callee: &HostValue, args: &[HostValue]) -> Result<HostValue, Thrown> {
        match callee {
            HostValue::Function(f) => self.invoke(f, args),
            other => Err(Thrown::type_error(format!(
                "{} is not a function",
                other.debug_string()
            ))),
        }
    }

    /// Resolve a global by logical name.
    pub fn global(&self, name: &str) -> Option<HostValue> {
        self.environment().resolve(name)
    }

    /// The detected environment.
    pub fn environment(&self) -> &Environment {
        &self.cx.data().environment
    }

    /// Value behind a reference table handle.
    pub fn value(&self, handle: u32) -> HostValue {
        self.cx.data().refs.get(handle)
    }

    /// Box a value into the reference table.
    pub fn box_value(&mut self, value: HostValue) -> u32 {
        self.cx.data_mut().refs.boxed(value)
    }
}
