//! The generic adapter builder.
//!
//! Every surface entry becomes one host function that does the same four
//! steps: unmarshal the arguments by shape, dispatch the target, write
//! mutable slices back, marshal the result. Only the entry's data varies.

use std::sync::Arc;

use tracing::trace;
use wasmtime::{AsContextMut, Caller, Engine, Linker, StoreContextMut, Val};

use super::{ArgShape, CallSurface, RetShape, SurfaceEntry, Target};
use crate::abi;
use crate::error::{BridgeError, Result};
use crate::memory::marshal;
use crate::scope::Scope;
use crate::state::{self, BridgeState};
use crate::value::{HostValue, Thrown, TypedArray};

/// Define every entry of `surface` on `linker`.
pub fn define_surface(
    linker: &mut Linker<BridgeState>,
    engine: &Engine,
    surface: &CallSurface,
) -> Result<()> {
    surface.validate()?;
    for entry in &surface.entries {
        define_entry(linker, engine, entry)?;
    }
    tracing::debug!(entries = surface.entries.len(), "call surface linked");
    Ok(())
}

/// Define one entry on `linker`.
pub fn define_entry(
    linker: &mut Linker<BridgeState>,
    engine: &Engine,
    entry: &SurfaceEntry,
) -> Result<()> {
    let ty = entry.func_type(engine);
    let adapter = Arc::new(entry.clone());
    linker
        .func_new(
            abi::IMPORT_MODULE,
            &entry.import,
            ty,
            move |mut caller: Caller<'_, BridgeState>, params: &[Val], results: &mut [Val]| {
                let mut cx = caller.as_context_mut();
                run(&mut cx, &adapter, params, results)?;
                Ok(())
            },
        )
        .map_err(|e| BridgeError::Link(format!("failed to register {}: {}", entry.import, e)))?;
    Ok(())
}

fn run(
    cx: &mut StoreContextMut<'_, BridgeState>,
    entry: &SurfaceEntry,
    params: &[Val],
    results: &mut [Val],
) -> Result<()> {
    trace!(import = %entry.import, "adapter called");
    let (retptr, params) = if entry.ret.uses_retptr() {
        (Some(i32_at(params, 0) as u32), params.get(1..).unwrap_or_default())
    } else {
        (None, params)
    };

    let outcome = invoke(cx, entry, params)
        .and_then(|value| write_result(cx, &entry.ret, value, retptr, results));

    match outcome {
        Ok(()) => Ok(()),
        Err(thrown) if entry.catch => {
            state::report_exception(cx, thrown)?;
            write_default(cx, &entry.ret, retptr, results)
        }
        Err(thrown) => Err(BridgeError::Uncaught(thrown)),
    }
}

fn invoke(
    cx: &mut StoreContextMut<'_, BridgeState>,
    entry: &SurfaceEntry,
    params: &[Val],
) -> std::result::Result<HostValue, Thrown> {
    let mut args = Vec::with_capacity(entry.params.len());
    let mut write_back: Vec<(u32, TypedArray)> = Vec::new();
    let mut pos = 0;

    for shape in &entry.params {
        let value = match *shape {
            ArgShape::I32 => HostValue::Number(f64::from(i32_at(params, pos))),
            ArgShape::U32 => HostValue::Number(f64::from(i32_at(params, pos) as u32)),
            ArgShape::F32 => HostValue::Number(f64::from(params[pos].f32().unwrap_or_default())),
            ArgShape::F64 => HostValue::Number(params[pos].f64().unwrap_or_default()),
            ArgShape::Bool => HostValue::Bool(i32_at(params, pos) != 0),
            ArgShape::Ref => cx.data().refs.get(i32_at(params, pos) as u32),
            ArgShape::Str => {
                let (ptr, len) = slice_at(params, pos);
                HostValue::String(marshal::read_string(cx, ptr, len).map_err(thrown_from_bridge)?)
            }
            ArgShape::OptStr => match slice_at(params, pos) {
                (0, _) => HostValue::Undefined,
                (ptr, len) => {
                    HostValue::String(marshal::read_string(cx, ptr, len).map_err(thrown_from_bridge)?)
                }
            },
            ArgShape::Slice(kind) => {
                let (ptr, len) = slice_at(params, pos);
                HostValue::Array(marshal::read_typed(cx, kind, ptr, len).map_err(thrown_from_bridge)?)
            }
            ArgShape::SliceMut(kind) => {
                let (ptr, len) = slice_at(params, pos);
                let array = marshal::read_typed(cx, kind, ptr, len).map_err(thrown_from_bridge)?;
                write_back.push((ptr, array.clone()));
                HostValue::Array(array)
            }
        };
        pos += match shape {
            ArgShape::Str | ArgShape::OptStr | ArgShape::Slice(_) | ArgShape::SliceMut(_) => 2,
            _ => 1,
        };
        args.push(value);
    }

    let value = {
        let mut scope = Scope::new(cx.as_context_mut());
        dispatch(&mut scope, &entry.target, &args)?
    };

    // The capability may have grown memory; write_typed derives a fresh view
    for (ptr, array) in write_back {
        marshal::write_typed(cx, ptr, &array).map_err(thrown_from_bridge)?;
    }
    Ok(value)
}

/// Reach the host capability named by `target`.
pub fn dispatch(
    scope: &mut Scope<'_>,
    target: &Target,
    args: &[HostValue],
) -> std::result::Result<HostValue, Thrown> {
    match target {
        Target::Call(path) => match path.rsplit_once('.') {
            Some((parent, method)) => {
                let object = scope
                    .environment()
                    .resolve_path(parent)
                    .ok_or_else(|| Thrown::reference_error(format!("{parent} is not defined")))?;
                object.call_method(scope, method, args)
            }
            None => {
                let function = scope.environment().require(path)?;
                scope.call(&function, args)
            }
        },
        Target::Method(name) => receiver(args)?.call_method(scope, name, rest(args)),
        Target::Get(prop) => Ok(receiver(args)?.get(prop)),
        Target::Set(prop) => {
            let value = args.get(1).cloned().unwrap_or_default();
            receiver(args)?.set(prop, value)?;
            Ok(HostValue::Undefined)
        }
        Target::Construct(name) => match scope.environment().require(name)? {
            HostValue::Function(ctor) => scope.invoke(&ctor, args),
            _ => Err(Thrown::type_error(format!("{name} is not a constructor"))),
        },
        Target::Global(name) => Ok(scope.global(name).unwrap_or_default()),
        Target::InstanceOf(class) => Ok(HostValue::Bool(
            args.first().is_some_and(|v| v.instance_of(class)),
        )),
        Target::Invoke => {
            let callee = args.first().cloned().unwrap_or_default();
            scope.call(&callee, rest(args))
        }
    }
}

fn receiver(args: &[HostValue]) -> std::result::Result<&HostValue, Thrown> {
    match args.first() {
        Some(value) if !value.is_like_none() => Ok(value),
        Some(value) => Err(Thrown::type_error(format!(
            "cannot read properties of {}",
            value.debug_string()
        ))),
        None => Err(Thrown::type_error("missing receiver")),
    }
}

fn rest(args: &[HostValue]) -> &[HostValue] {
    args.get(1..).unwrap_or_default()
}

fn write_result(
    cx: &mut StoreContextMut<'_, BridgeState>,
    ret: &RetShape,
    value: HostValue,
    retptr: Option<u32>,
    results: &mut [Val],
) -> std::result::Result<(), Thrown> {
    let result = match ret {
        RetShape::Unit => return Ok(()),
        RetShape::I32 => Val::I32(value.to_int32()),
        RetShape::U32 => Val::I32(value.to_uint32() as i32),
        RetShape::F32 => Val::F32((value.to_number() as f32).to_bits()),
        RetShape::F64 => Val::F64(value.to_number().to_bits()),
        RetShape::Bool => Val::I32(i32::from(value.truthy())),
        RetShape::Ref => Val::I32(cx.data_mut().refs.boxed(value) as i32),
        RetShape::OptRef => Val::I32(cx.data_mut().refs.boxed_option(value) as i32),
        RetShape::OptBool => Val::I32(match value {
            v if v.is_like_none() => abi::OPT_BOOL_NONE,
            v => i32::from(v.truthy()),
        }),
        RetShape::Enum(variants) => {
            let index = value
                .as_str()
                .and_then(|s| variants.iter().position(|v| v == s))
                .unwrap_or(variants.len());
            Val::I32(index as i32)
        }
        RetShape::Str => {
            let retptr = retptr.unwrap_or_default();
            let (ptr, len) = match value {
                HostValue::String(s) => marshal::pass_string(cx, &s).map_err(thrown_from_bridge)?,
                v if v.is_like_none() => (0, 0),
                other => {
                    return Err(Thrown::type_error(format!(
                        "expected a string, got {}",
                        other.debug_string()
                    )))
                }
            };
            write_pair(cx, retptr, ptr, len).map_err(thrown_from_bridge)?;
            return Ok(());
        }
        RetShape::OptF64 => {
            let retptr = retptr.unwrap_or_default();
            let number = value.as_f64();
            write_opt_f64(cx, retptr, number).map_err(thrown_from_bridge)?;
            return Ok(());
        }
    };
    if let Some(slot) = results.first_mut() {
        *slot = result;
    }
    Ok(())
}

fn write_default(
    cx: &mut StoreContextMut<'_, BridgeState>,
    ret: &RetShape,
    retptr: Option<u32>,
    results: &mut [Val],
) -> Result<()> {
    match ret {
        RetShape::Unit => {}
        RetShape::Str => write_pair(cx, retptr.unwrap_or_default(), 0, 0)?,
        RetShape::OptF64 => write_opt_f64(cx, retptr.unwrap_or_default(), None)?,
        RetShape::F32 => results[0] = Val::F32(0),
        RetShape::F64 => results[0] = Val::F64(0),
        _ => results[0] = Val::I32(0),
    }
    Ok(())
}

/// `(ptr, len)` as two i32 at `retptr` and `retptr + 4`.
pub(crate) fn write_pair(
    cx: &mut StoreContextMut<'_, BridgeState>,
    retptr: u32,
    ptr: u32,
    len: usize,
) -> Result<()> {
    marshal::write_i32(cx, retptr, ptr as i32)?;
    marshal::write_i32(cx, retptr + 4, len as i32)
}

/// `(is_some: i32, value: f64)` at `retptr` and `retptr + 8`.
pub(crate) fn write_opt_f64(
    cx: &mut StoreContextMut<'_, BridgeState>,
    retptr: u32,
    value: Option<f64>,
) -> Result<()> {
    marshal::write_i32(cx, retptr, i32::from(value.is_some()))?;
    marshal::write_f64(cx, retptr + 8, value.unwrap_or(0.0))
}

/// Marshaling failures as values thrown on the host side.
pub(crate) fn thrown_from_bridge(err: BridgeError) -> Thrown {
    match err {
        BridgeError::Decode(e) => Thrown::type_error(format!("invalid UTF-8 string: {e}")),
        BridgeError::OutOfBounds { .. } => Thrown::error("RangeError", err.to_string()),
        BridgeError::Uncaught(thrown) => thrown,
        BridgeError::ModuleThrow(message) => Thrown::error("Error", message),
        BridgeError::Trap(message) => Thrown::error("RuntimeError", message),
        other => Thrown::error("Error", other.to_string()),
    }
}

fn i32_at(params: &[Val], pos: usize) -> i32 {
    params.get(pos).and_then(Val::i32).unwrap_or_default()
}

fn slice_at(params: &[Val], pos: usize) -> (u32, usize) {
    (i32_at(params, pos) as u32, i32_at(params, pos + 1) as u32 as usize)
}
