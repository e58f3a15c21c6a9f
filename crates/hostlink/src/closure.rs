//! Closure bridge: module closures as host functions.
//!
//! A module closure is an opaque `(context, lifetime)` pair plus two entries
//! in the module's function table: an *invoke* shim taking
//! `(context, lifetime, args...)` and a *destructor* taking
//! `(context, lifetime)`. The host wraps the pair in a [`ClosureWrapper`]
//! and counts references to it:
//!
//! - one reference for the module's ownership, released by `cb_drop`;
//! - one reference for every call in progress.
//!
//! The destructor runs exactly once, when the count reaches zero. A call in
//! progress moves the context out of the wrapper, so a nested call through
//! the same wrapper (or a call after teardown) throws instead of handing
//! the module a context it does not own.
//!
//! If the host drops its last reference while the wrapper still holds a
//! context, the destructor is queued on the instance's
//! [`FinalizationQueue`] and runs at the next safe point.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use wasmtime::{AsContext, AsContextMut, Func, FuncType, Ref, StoreContextMut, Table, Val, ValType};

use crate::error::{BridgeError, Result};
use crate::state::BridgeState;
use crate::value::{HostFunction, HostValue, Thrown};

/// How one forwarded argument or the result crosses to the invoke shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeParam {
    /// `i32` reference table handle; arguments are boxed, results taken
    Ref,
    /// `i32` signed number
    I32,
    /// `i32` unsigned number
    U32,
    /// `i32` boolean, zero is false
    Bool,
    /// `i64` number
    I64,
    /// `f32` number
    F32,
    /// `f64` number
    F64,
}

impl ShapeParam {
    /// Parse one descriptor character.
    ///
    /// `r` handle, `i` i32, `u` u32, `b` bool, `l` i64, `f` f32, `d` f64.
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'r' => ShapeParam::Ref,
            'i' => ShapeParam::I32,
            'u' => ShapeParam::U32,
            'b' => ShapeParam::Bool,
            'l' => ShapeParam::I64,
            'f' => ShapeParam::F32,
            'd' => ShapeParam::F64,
            _ => return None,
        })
    }

    /// Wasm type this shape travels as.
    pub fn val_type(self) -> ValType {
        match self {
            ShapeParam::Ref | ShapeParam::I32 | ShapeParam::U32 | ShapeParam::Bool => ValType::I32,
            ShapeParam::I64 => ValType::I64,
            ShapeParam::F32 => ValType::F32,
            ShapeParam::F64 => ValType::F64,
        }
    }

    /// Plain numeric shape for a wasm type. `i32` is a signed number.
    fn from_val_type(ty: &ValType) -> Result<Self> {
        match ty {
            ValType::I32 => Ok(ShapeParam::I32),
            ValType::I64 => Ok(ShapeParam::I64),
            ValType::F32 => Ok(ShapeParam::F32),
            ValType::F64 => Ok(ShapeParam::F64),
            other => Err(BridgeError::Signature(format!(
                "unsupported closure value type {other:?}"
            ))),
        }
    }

    fn to_wasm(self, cx: &mut StoreContextMut<'_, BridgeState>, value: &HostValue) -> Val {
        match self {
            ShapeParam::Ref => Val::I32(cx.data_mut().refs.boxed(value.clone()) as i32),
            ShapeParam::I32 => Val::I32(value.to_int32()),
            ShapeParam::U32 => Val::I32(value.to_uint32() as i32),
            ShapeParam::Bool => Val::I32(i32::from(value.truthy())),
            ShapeParam::I64 => Val::I64(value.to_number() as i64),
            ShapeParam::F32 => Val::F32((value.to_number() as f32).to_bits()),
            ShapeParam::F64 => Val::F64(value.to_number().to_bits()),
        }
    }

    fn to_host(self, cx: &mut StoreContextMut<'_, BridgeState>, val: &Val) -> HostValue {
        match (self, val) {
            (ShapeParam::Ref, Val::I32(h)) => cx.data_mut().refs.take(*h as u32),
            (ShapeParam::I32, Val::I32(n)) => HostValue::Number(f64::from(*n)),
            (ShapeParam::U32, Val::I32(n)) => HostValue::Number(f64::from(*n as u32)),
            (ShapeParam::Bool, Val::I32(n)) => HostValue::Bool(*n != 0),
            (ShapeParam::I64, Val::I64(n)) => HostValue::Number(*n as f64),
            (ShapeParam::F32, Val::F32(bits)) => HostValue::Number(f64::from(f32::from_bits(*bits))),
            (ShapeParam::F64, Val::F64(bits)) => HostValue::Number(f64::from_bits(*bits)),
            _ => HostValue::Undefined,
        }
    }

    fn zero(self) -> Val {
        match self.val_type() {
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            _ => Val::I32(0),
        }
    }
}

/// Argument and result shape of an invoke shim, after `(context, lifetime)`.
///
/// Bindings describe the shape with a short descriptor such as `"ri:b"`:
/// one [`ShapeParam`] code per forwarded argument, then `:` and the result
/// code when the shim returns a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureShape {
    params: Vec<ShapeParam>,
    result: Option<ShapeParam>,
}

impl ClosureShape {
    /// Derive a plain numeric shape from the invoke function's type.
    ///
    /// No argument is treated as a handle; `i32` values cross as signed
    /// numbers.
    pub fn from_func_type(ty: &FuncType) -> Result<Self> {
        let params = forwarded_params(ty)?
            .map(|ty| ShapeParam::from_val_type(&ty))
            .collect::<Result<Vec<_>>>()?;

        let mut results = ty.results();
        let result = match results.next() {
            None => None,
            Some(ty) => Some(ShapeParam::from_val_type(&ty)?),
        };
        if results.next().is_some() {
            return Err(BridgeError::Signature(
                "closure invoke returns more than one value".to_string(),
            ));
        }
        Ok(Self { params, result })
    }

    /// Parse a descriptor and check it against the invoke function's type.
    pub fn parse(descriptor: &str, ty: &FuncType) -> Result<Self> {
        let (args, ret) = match descriptor.split_once(':') {
            Some((args, ret)) => (args, Some(ret)),
            None => (descriptor, None),
        };
        let code = |c: char| {
            ShapeParam::from_code(c).ok_or_else(|| {
                BridgeError::Signature(format!("unknown closure shape code `{c}` in `{descriptor}`"))
            })
        };
        let params = args.chars().map(&code).collect::<Result<Vec<_>>>()?;
        let result = match ret.map(|r| r.chars().collect::<Vec<_>>()) {
            None => None,
            Some(chars) if chars.len() == 1 => Some(code(chars[0])?),
            Some(_) => {
                return Err(BridgeError::Signature(format!(
                    "closure shape `{descriptor}` must name exactly one result"
                )))
            }
        };

        let shape = Self { params, result };
        let declared: Vec<ValType> = forwarded_params(ty)?.collect();
        let results: Vec<ValType> = ty.results().collect();
        let params_match = declared.len() == shape.params.len()
            && declared
                .iter()
                .zip(&shape.params)
                .all(|(ty, p)| same_type(ty, &p.val_type()));
        let result_match = match (shape.result, results.as_slice()) {
            (None, []) => true,
            (Some(r), [ty]) => same_type(ty, &r.val_type()),
            _ => false,
        };
        if !params_match || !result_match {
            return Err(BridgeError::Signature(format!(
                "closure shape `{descriptor}` does not match invoke type {ty:?}"
            )));
        }
        Ok(shape)
    }

    /// Forwarded parameters.
    pub fn params(&self) -> &[ShapeParam] {
        &self.params
    }

    /// Result, if any.
    pub fn result(&self) -> Option<ShapeParam> {
        self.result
    }
}

fn forwarded_params(ty: &FuncType) -> Result<impl Iterator<Item = ValType> + '_> {
    let mut params = ty.params();
    for _ in 0..2 {
        if !matches!(params.next(), Some(ValType::I32)) {
            return Err(BridgeError::Signature(
                "closure invoke must start with (context: i32, lifetime: i32)".to_string(),
            ));
        }
    }
    Ok(params)
}

fn same_type(a: &ValType, b: &ValType) -> bool {
    matches!(
        (a, b),
        (ValType::I32, ValType::I32)
            | (ValType::I64, ValType::I64)
            | (ValType::F32, ValType::F32)
            | (ValType::F64, ValType::F64)
    )
}

#[derive(Debug)]
struct ClosureState {
    context: u32,
    lifetime: u32,
    count: u32,
    registered: bool,
}

/// A destructor waiting to run for a wrapper the host dropped.
pub(crate) struct PendingFinalizer {
    dtor: Func,
    context: u32,
    lifetime: u32,
}

/// Destructors of wrappers dropped by the host without `cb_drop`.
#[derive(Clone, Default)]
pub struct FinalizationQueue {
    pending: Arc<Mutex<Vec<PendingFinalizer>>>,
}

impl FinalizationQueue {
    fn push(&self, finalizer: PendingFinalizer) {
        self.pending.lock().push(finalizer);
    }

    fn drain(&self) -> Vec<PendingFinalizer> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Number of queued destructors.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FinalizationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizationQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Run every queued destructor, including ones queued while running.
///
/// Returns the number of destructors run. A trapping destructor is logged
/// and does not stop the others.
pub(crate) fn run_finalizers(cx: &mut StoreContextMut<'_, BridgeState>) -> usize {
    let queue = cx.data().finalizers.clone();
    let mut ran = 0;
    loop {
        let batch = queue.drain();
        if batch.is_empty() {
            return ran;
        }
        for pending in batch {
            let args = [Val::I32(pending.context as i32), Val::I32(pending.lifetime as i32)];
            if let Err(e) = pending.dtor.call(cx.as_context_mut(), &args, &mut []) {
                warn!(context = pending.context, "closure destructor trapped during finalization: {e}");
            }
            ran += 1;
        }
    }
}

/// A module closure exposed to the host.
pub struct ClosureWrapper {
    state: Mutex<ClosureState>,
    dtor_index: u32,
    dtor: Func,
    invoke: Func,
    shape: ClosureShape,
    finalizers: Option<FinalizationQueue>,
}

impl ClosureWrapper {
    /// Wrap a closure whose shims live in the module's function table.
    pub(crate) fn from_table(
        cx: &mut StoreContextMut<'_, BridgeState>,
        context: u32,
        lifetime: u32,
        dtor_index: u32,
        invoke_index: u32,
        descriptor: Option<&str>,
    ) -> Result<Arc<Self>> {
        let table = cx.data().exports()?.functions.ok_or_else(|| {
            BridgeError::MissingExport(crate::abi::FUNCTION_TABLE.to_string())
        })?;
        let dtor = table_func(cx, &table, dtor_index)?;
        let invoke = table_func(cx, &table, invoke_index)?;

        let dtor_ty = dtor.ty(cx.as_context());
        let dtor_ok = dtor_ty.params().len() == 2
            && dtor_ty.params().all(|t| matches!(t, ValType::I32))
            && dtor_ty.results().len() == 0;
        if !dtor_ok {
            return Err(BridgeError::Signature(format!(
                "closure destructor at slot {dtor_index} must be (i32, i32) -> ()"
            )));
        }
        let invoke_ty = invoke.ty(cx.as_context());
        let shape = match descriptor {
            Some(descriptor) => ClosureShape::parse(descriptor, &invoke_ty)?,
            None => ClosureShape::from_func_type(&invoke_ty)?,
        };

        let finalizers = cx
            .data()
            .finalization_enabled
            .then(|| cx.data().finalizers.clone());

        debug!(context, dtor_index, invoke_index, "closure wrapped");
        Ok(Arc::new(Self {
            state: Mutex::new(ClosureState {
                context,
                lifetime,
                count: 1,
                registered: finalizers.is_some(),
            }),
            dtor_index,
            dtor,
            invoke,
            shape,
            finalizers,
        }))
    }

    /// Shape of the forwarded arguments.
    pub fn shape(&self) -> &ClosureShape {
        &self.shape
    }

    /// Function table slot of the destructor.
    pub fn dtor_index(&self) -> u32 {
        self.dtor_index
    }

    /// Logical reference count (module ownership plus calls in progress).
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Whether the destructor has run or the module took teardown over.
    pub fn is_torn_down(&self) -> bool {
        let state = self.state.lock();
        state.count == 0
    }

    /// Call into the module.
    pub(crate) fn call(
        &self,
        cx: &mut StoreContextMut<'_, BridgeState>,
        args: &[HostValue],
    ) -> std::result::Result<HostValue, Thrown> {
        let (context, lifetime) = {
            let mut state = self.state.lock();
            if state.context == 0 {
                return Err(Thrown::error(
                    "Error",
                    "closure invoked recursively or after being dropped",
                ));
            }
            state.count += 1;
            let context = std::mem::replace(&mut state.context, 0);
            (context, state.lifetime)
        };

        let outcome = self.invoke_shim(cx, context, lifetime, args);

        let teardown = {
            let mut state = self.state.lock();
            state.count -= 1;
            if state.count == 0 {
                state.registered = false;
                true
            } else {
                state.context = context;
                false
            }
        };

        if teardown {
            debug!(context, "closure released after last call, running destructor");
            let args = [Val::I32(context as i32), Val::I32(lifetime as i32)];
            if let Err(e) = self.dtor.call(cx.as_context_mut(), &args, &mut []) {
                let thrown = thrown_from_trap(e);
                return outcome.and(Err(thrown));
            }
        }
        outcome
    }

    fn invoke_shim(
        &self,
        cx: &mut StoreContextMut<'_, BridgeState>,
        context: u32,
        lifetime: u32,
        args: &[HostValue],
    ) -> std::result::Result<HostValue, Thrown> {
        let mut params = Vec::with_capacity(2 + self.shape.params.len());
        params.push(Val::I32(context as i32));
        params.push(Val::I32(lifetime as i32));
        for (i, param) in self.shape.params.iter().enumerate() {
            let arg = args.get(i).cloned().unwrap_or_default();
            params.push(param.to_wasm(cx, &arg));
        }

        let mut results: Vec<Val> = self.shape.result.iter().map(|r| r.zero()).collect();
        self.invoke
            .call(cx.as_context_mut(), &params, &mut results)
            .map_err(thrown_from_trap)?;

        Ok(match (self.shape.result, results.first()) {
            (Some(shape), Some(val)) => shape.to_host(cx, val),
            _ => HostValue::Undefined,
        })
    }

    /// Release the module's ownership reference.
    ///
    /// Returns `true` when this was the last reference: the context is
    /// cleared and the caller is responsible for destroying the closure
    /// environment. Returns `false` while a call is still in progress; the
    /// destructor then runs when that call completes.
    pub fn drop_ref(&self) -> bool {
        let mut state = self.state.lock();
        if state.count == 1 {
            state.count = 0;
            state.context = 0;
            state.registered = false;
            true
        } else {
            state.count = state.count.saturating_sub(1);
            false
        }
    }
}

impl Drop for ClosureWrapper {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.registered || state.context == 0 {
            return;
        }
        if let Some(queue) = &self.finalizers {
            debug!(context = state.context, "closure dropped by host, queueing destructor");
            queue.push(PendingFinalizer {
                dtor: self.dtor,
                context: state.context,
                lifetime: state.lifetime,
            });
        }
    }
}

impl fmt::Debug for ClosureWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClosureWrapper")
            .field("context", &state.context)
            .field("count", &state.count)
            .field("dtor_index", &self.dtor_index)
            .field("shape", &self.shape)
            .finish()
    }
}

fn table_func(cx: &mut StoreContextMut<'_, BridgeState>, table: &Table, index: u32) -> Result<Func> {
    match table.get(cx.as_context_mut(), index.into()) {
        Some(Ref::Func(Some(func))) => Ok(func),
        _ => Err(BridgeError::Signature(format!(
            "function table slot {index} is not a function"
        ))),
    }
}

/// A trap inside the module seen from the host side.
///
/// Host exceptions that escaped an adapter keep their original value.
pub(crate) fn thrown_from_trap(err: wasmtime::Error) -> Thrown {
    match BridgeError::from_wasm(err) {
        BridgeError::Uncaught(thrown) => thrown,
        BridgeError::ModuleThrow(message) => Thrown::error("Error", message),
        other => Thrown::error("RuntimeError", other.to_string()),
    }
}

impl From<Arc<ClosureWrapper>> for HostFunction {
    fn from(wrapper: Arc<ClosureWrapper>) -> Self {
        HostFunction::Closure(wrapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::Engine;

    fn func_type(params: &[ValType], results: &[ValType]) -> FuncType {
        let engine = Engine::default();
        FuncType::new(&engine, params.iter().cloned(), results.iter().cloned())
    }

    #[test]
    fn test_shape_from_invoke_type() {
        let ty = func_type(
            &[ValType::I32, ValType::I32, ValType::I32, ValType::F64],
            &[ValType::I32],
        );
        let shape = ClosureShape::from_func_type(&ty).unwrap();
        assert_eq!(shape.params(), &[ShapeParam::I32, ShapeParam::F64]);
        assert_eq!(shape.result(), Some(ShapeParam::I32));
    }

    #[test]
    fn test_shape_descriptor_distinguishes_i32_kinds() {
        let ty = func_type(
            &[ValType::I32, ValType::I32, ValType::I32, ValType::I32, ValType::I32, ValType::F64],
            &[ValType::I32],
        );
        let shape = ClosureShape::parse("rubd:b", &ty).unwrap();
        assert_eq!(
            shape.params(),
            &[ShapeParam::Ref, ShapeParam::U32, ShapeParam::Bool, ShapeParam::F64]
        );
        assert_eq!(shape.result(), Some(ShapeParam::Bool));
    }

    #[test]
    fn test_shape_descriptor_must_match_type() {
        let ty = func_type(&[ValType::I32, ValType::I32, ValType::F64], &[]);
        assert!(ClosureShape::parse("d", &ty).is_ok());
        assert!(matches!(
            ClosureShape::parse("i", &ty),
            Err(BridgeError::Signature(_))
        ));
        assert!(ClosureShape::parse("d:i", &ty).is_err());
        assert!(ClosureShape::parse("x", &ty).is_err());
        assert!(ClosureShape::parse("d:", &ty).is_err());
    }

    #[test]
    fn test_shape_without_forwarded_args() {
        let ty = func_type(&[ValType::I32, ValType::I32], &[]);
        let shape = ClosureShape::from_func_type(&ty).unwrap();
        assert!(shape.params().is_empty());
        assert_eq!(shape.result(), None);
    }

    #[test]
    fn test_shape_requires_context_pair() {
        let ty = func_type(&[ValType::I32], &[]);
        assert!(matches!(
            ClosureShape::from_func_type(&ty),
            Err(BridgeError::Signature(_))
        ));
        let ty = func_type(&[ValType::F64, ValType::I32], &[]);
        assert!(ClosureShape::from_func_type(&ty).is_err());
    }

    #[test]
    fn test_queue_counts() {
        let queue = FinalizationQueue::default();
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
