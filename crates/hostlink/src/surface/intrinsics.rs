//! Intrinsic imports every module may use.
//!
//! These are the building blocks generated bindings rely on regardless of
//! which host APIs they call: reference table housekeeping, casts into the
//! table, closure creation, type predicates, and the error channel.
//!
//! ## Import Module
//!
//! Intrinsics are imported under the `hostlink` namespace with a reserved
//! `__hostlink_` prefix:
//! ```wat
//! (import "hostlink" "__hostlink_string_new" (func $string_new (param i32 i32) (result i32)))
//! ```
//!
//! ## Return pointers
//!
//! Intrinsics returning more than one value write it at a return pointer
//! passed as the first argument:
//! - `number_get`: `is_some: i32` at +0, `value: f64` at +8
//! - `string_get`, `debug_string`: `ptr: i32` at +0, `len: i32` at +4
//!
//! ## Closures
//!
//! `closure_new(context, lifetime, dtor, invoke, shape_ptr, shape_len)`
//! takes the invoke shim's shape descriptor as a string (see
//! [`ClosureShape`](crate::closure::ClosureShape)). An empty descriptor
//! forwards every value as a plain number.

use wasmtime::{AsContextMut, Caller, Linker};

use super::adapter::{write_opt_f64, write_pair};
use crate::abi;
use crate::closure::ClosureWrapper;
use crate::error::{BridgeError, Result};
use crate::memory::{marshal, ViewKind};
use crate::state::{self, BridgeState};
use crate::value::{HostFunction, HostValue, Thrown, TypedArray};

/// Reserved prefix of intrinsic import names.
pub const PREFIX: &str = "__hostlink_";

/// Names of every intrinsic, for inspection tooling.
pub const NAMES: &[&str] = &[
    "__hostlink_init_ref_table",
    "__hostlink_ref_drop",
    "__hostlink_ref_clone",
    "__hostlink_string_new",
    "__hostlink_number_new",
    "__hostlink_array_new",
    "__hostlink_closure_new",
    "__hostlink_cb_drop",
    "__hostlink_is_undefined",
    "__hostlink_is_null",
    "__hostlink_is_object",
    "__hostlink_is_string",
    "__hostlink_is_function",
    "__hostlink_number_get",
    "__hostlink_boolean_get",
    "__hostlink_string_get",
    "__hostlink_debug_string",
    "__hostlink_throw",
    "__hostlink_rethrow",
    "__hostlink_last_exception",
    "__hostlink_random_fill",
];

/// Intrinsic host functions.
///
/// A marker struct for organizing registration, one `register_*` per import.
pub struct Intrinsics;

impl Intrinsics {
    /// Register all intrinsics with the linker.
    pub fn register(linker: &mut Linker<BridgeState>) -> Result<()> {
        // Reference table
        Self::register_init_ref_table(linker)?;
        Self::register_ref_drop(linker)?;
        Self::register_ref_clone(linker)?;

        // Casts into the table
        Self::register_string_new(linker)?;
        Self::register_number_new(linker)?;
        Self::register_array_new(linker)?;

        // Closures
        Self::register_closure_new(linker)?;
        Self::register_cb_drop(linker)?;

        // Predicates and accessors
        Self::register_predicates(linker)?;
        Self::register_number_get(linker)?;
        Self::register_boolean_get(linker)?;
        Self::register_string_get(linker)?;
        Self::register_debug_string(linker)?;

        // Errors
        Self::register_throw(linker)?;
        Self::register_rethrow(linker)?;
        Self::register_last_exception(linker)?;

        // Capabilities
        Self::register_random_fill(linker)?;

        Ok(())
    }

    // ========================================================================
    // Reference Table
    // ========================================================================

    fn register_init_ref_table(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_init_ref_table",
                |mut caller: Caller<'_, BridgeState>| -> i32 {
                    caller.data_mut().refs.seed_sentinels().undefined as i32
                },
            )
            .map_err(|e| link_error("init_ref_table", e))?;
        Ok(())
    }

    fn register_ref_drop(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_ref_drop",
                |mut caller: Caller<'_, BridgeState>, handle: i32| {
                    caller.data_mut().refs.free(handle as u32);
                },
            )
            .map_err(|e| link_error("ref_drop", e))?;
        Ok(())
    }

    fn register_ref_clone(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_ref_clone",
                |mut caller: Caller<'_, BridgeState>, handle: i32| -> i32 {
                    let refs = &mut caller.data_mut().refs;
                    let value = refs.get(handle as u32);
                    refs.insert(value) as i32
                },
            )
            .map_err(|e| link_error("ref_clone", e))?;
        Ok(())
    }

    // ========================================================================
    // Casts
    // ========================================================================

    fn register_string_new(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_string_new",
                |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
                    let mut cx = caller.as_context_mut();
                    let s = marshal::read_string(&mut cx, ptr as u32, len as u32 as usize)?;
                    Ok(cx.data_mut().refs.insert(HostValue::String(s)) as i32)
                },
            )
            .map_err(|e| link_error("string_new", e))?;
        Ok(())
    }

    fn register_number_new(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_number_new",
                |mut caller: Caller<'_, BridgeState>, n: f64| -> i32 {
                    caller.data_mut().refs.insert(HostValue::Number(n)) as i32
                },
            )
            .map_err(|e| link_error("number_new", e))?;
        Ok(())
    }

    fn register_array_new(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_array_new",
                |mut caller: Caller<'_, BridgeState>,
                 kind: i32,
                 ptr: i32,
                 len: i32|
                 -> wasmtime::Result<i32> {
                    let kind = ViewKind::from_code(kind).ok_or_else(|| {
                        BridgeError::Signature(format!("unknown array kind code {kind}"))
                    })?;
                    let mut cx = caller.as_context_mut();
                    let array = marshal::read_typed(&mut cx, kind, ptr as u32, len as u32 as usize)?;
                    Ok(cx.data_mut().refs.insert(HostValue::Array(array)) as i32)
                },
            )
            .map_err(|e| link_error("array_new", e))?;
        Ok(())
    }

    // ========================================================================
    // Closures
    // ========================================================================

    fn register_closure_new(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_closure_new",
                |mut caller: Caller<'_, BridgeState>,
                 context: i32,
                 lifetime: i32,
                 dtor_index: i32,
                 invoke_index: i32,
                 shape_ptr: i32,
                 shape_len: i32|
                 -> wasmtime::Result<i32> {
                    let mut cx = caller.as_context_mut();
                    let descriptor = match shape_len {
                        0 => None,
                        len => Some(marshal::read_string(&mut cx, shape_ptr as u32, len as u32 as usize)?),
                    };
                    let wrapper = ClosureWrapper::from_table(
                        &mut cx,
                        context as u32,
                        lifetime as u32,
                        dtor_index as u32,
                        invoke_index as u32,
                        descriptor.as_deref(),
                    )?;
                    let value = HostValue::Function(HostFunction::Closure(wrapper));
                    Ok(cx.data_mut().refs.insert(value) as i32)
                },
            )
            .map_err(|e| link_error("closure_new", e))?;
        Ok(())
    }

    fn register_cb_drop(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_cb_drop",
                |mut caller: Caller<'_, BridgeState>, handle: i32| -> i32 {
                    let value = caller.data_mut().refs.take(handle as u32);
                    let released = value
                        .as_function()
                        .and_then(HostFunction::as_closure)
                        .is_some_and(|wrapper| wrapper.drop_ref());
                    i32::from(released)
                },
            )
            .map_err(|e| link_error("cb_drop", e))?;
        Ok(())
    }

    // ========================================================================
    // Predicates and Accessors
    // ========================================================================

    fn register_predicates(linker: &mut Linker<BridgeState>) -> Result<()> {
        let predicates: [(&str, fn(&HostValue) -> bool); 5] = [
            ("__hostlink_is_undefined", HostValue::is_undefined),
            ("__hostlink_is_null", HostValue::is_null),
            ("__hostlink_is_object", HostValue::is_object),
            ("__hostlink_is_string", HostValue::is_string),
            ("__hostlink_is_function", HostValue::is_function),
        ];
        for (name, predicate) in predicates {
            linker
                .func_wrap(
                    abi::IMPORT_MODULE,
                    name,
                    move |caller: Caller<'_, BridgeState>, handle: i32| -> i32 {
                        i32::from(predicate(&caller.data().refs.get(handle as u32)))
                    },
                )
                .map_err(|e| link_error(name, e))?;
        }
        Ok(())
    }

    fn register_number_get(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_number_get",
                |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| -> wasmtime::Result<()> {
                    let mut cx = caller.as_context_mut();
                    let number = cx.data().refs.get(handle as u32).as_f64();
                    write_opt_f64(&mut cx, retptr as u32, number)?;
                    Ok(())
                },
            )
            .map_err(|e| link_error("number_get", e))?;
        Ok(())
    }

    fn register_boolean_get(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_boolean_get",
                |caller: Caller<'_, BridgeState>, handle: i32| -> i32 {
                    match caller.data().refs.get(handle as u32).as_bool() {
                        Some(b) => i32::from(b),
                        None => abi::OPT_BOOL_NONE,
                    }
                },
            )
            .map_err(|e| link_error("boolean_get", e))?;
        Ok(())
    }

    fn register_string_get(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_string_get",
                |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| -> wasmtime::Result<()> {
                    let mut cx = caller.as_context_mut();
                    let (ptr, len) = match cx.data().refs.get(handle as u32) {
                        HostValue::String(s) => marshal::pass_string(&mut cx, &s)?,
                        _ => (0, 0),
                    };
                    write_pair(&mut cx, retptr as u32, ptr, len)?;
                    Ok(())
                },
            )
            .map_err(|e| link_error("string_get", e))?;
        Ok(())
    }

    fn register_debug_string(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_debug_string",
                |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| -> wasmtime::Result<()> {
                    let mut cx = caller.as_context_mut();
                    let text = cx.data().refs.get(handle as u32).debug_string();
                    let (ptr, len) = marshal::pass_string(&mut cx, &text)?;
                    write_pair(&mut cx, retptr as u32, ptr, len)?;
                    Ok(())
                },
            )
            .map_err(|e| link_error("debug_string", e))?;
        Ok(())
    }

    // ========================================================================
    // Errors
    // ========================================================================

    fn register_throw(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_throw",
                |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                    let mut cx = caller.as_context_mut();
                    let message = marshal::read_string(&mut cx, ptr as u32, len as u32 as usize)?;
                    Err(BridgeError::ModuleThrow(message).into())
                },
            )
            .map_err(|e| link_error("throw", e))?;
        Ok(())
    }

    fn register_rethrow(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_rethrow",
                |mut caller: Caller<'_, BridgeState>, handle: i32| -> wasmtime::Result<()> {
                    let value = caller.data_mut().refs.take(handle as u32);
                    Err(BridgeError::Uncaught(Thrown(value)).into())
                },
            )
            .map_err(|e| link_error("rethrow", e))?;
        Ok(())
    }

    fn register_last_exception(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_last_exception",
                |caller: Caller<'_, BridgeState>| -> i32 {
                    caller.data().last_exception.unwrap_or(0) as i32
                },
            )
            .map_err(|e| link_error("last_exception", e))?;
        Ok(())
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// `crypto.getRandomValues` over a module buffer; errors are recorded,
    /// not trapped.
    fn register_random_fill(linker: &mut Linker<BridgeState>) -> Result<()> {
        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                "__hostlink_random_fill",
                |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                    let mut cx = caller.as_context_mut();
                    let (ptr, len) = (ptr as u32, len as u32 as usize);
                    let outcome = random_fill(&mut cx, ptr, len);
                    if let Err(thrown) = outcome {
                        state::report_exception(&mut cx, thrown)?;
                    }
                    Ok(())
                },
            )
            .map_err(|e| link_error("random_fill", e))?;
        Ok(())
    }
}

fn random_fill(
    cx: &mut wasmtime::StoreContextMut<'_, BridgeState>,
    ptr: u32,
    len: usize,
) -> std::result::Result<(), Thrown> {
    let crypto = cx
        .data()
        .environment
        .require("crypto")?;
    let buffer = TypedArray::zeroed(ViewKind::Uint8, len);
    {
        let mut scope = crate::scope::Scope::new(cx.as_context_mut());
        crypto.call_method(&mut scope, "getRandomValues", &[HostValue::Array(buffer.clone())])?;
    }
    marshal::write_typed(cx, ptr, &buffer).map_err(super::adapter::thrown_from_bridge)
}

fn link_error(name: &str, e: wasmtime::Error) -> BridgeError {
    BridgeError::Link(format!("failed to register {name}: {e}"))
}
