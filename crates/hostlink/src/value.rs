//! Host values: the objects that live on the host side of the bridge.
//!
//! The module never sees a [`HostValue`] directly. Non-primitive values are
//! boxed into the reference table and the module holds integer handles;
//! numbers and booleans cross by value.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::closure::ClosureWrapper;
use crate::memory::views::{Element, ViewKind};
use crate::scope::Scope;

/// A value owned by the host.
#[derive(Clone, Default)]
pub enum HostValue {
    /// `undefined`
    #[default]
    Undefined,
    /// `null`
    Null,
    /// A boolean
    Bool(bool),
    /// A number (always a double on the host side)
    Number(f64),
    /// A string
    String(String),
    /// A host object (capability, record, handle to deferred work)
    Object(Arc<dyn HostObject>),
    /// A callable
    Function(HostFunction),
    /// An error value
    Error(HostError),
    /// A typed array holding its own copy of the elements
    Array(TypedArray),
}

impl HostValue {
    /// Wrap a host object.
    pub fn object(object: impl HostObject) -> Self {
        HostValue::Object(Arc::new(object))
    }

    /// Wrap a native function.
    pub fn function<F>(name: &str, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> Result<HostValue, Thrown> + Send + Sync + 'static,
    {
        HostValue::Function(HostFunction::native(name, f))
    }

    /// `undefined` or `null`.
    pub fn is_like_none(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// `undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Anything with identity (objects, functions, errors, arrays).
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            HostValue::Object(_) | HostValue::Function(_) | HostValue::Error(_) | HostValue::Array(_)
        )
    }

    /// A string.
    pub fn is_string(&self) -> bool {
        matches!(self, HostValue::String(_))
    }

    /// A callable.
    pub fn is_function(&self) -> bool {
        matches!(self, HostValue::Function(_))
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The function, if this is one.
    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The typed array, if this is one.
    pub fn as_array(&self) -> Option<&TypedArray> {
        match self {
            HostValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Downcast a wrapped host object to its concrete type.
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        match self {
            HostValue::Object(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Class name used by instance-of checks and debug rendering.
    pub fn class_name(&self) -> &str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "Boolean",
            HostValue::Number(_) => "Number",
            HostValue::String(_) => "String",
            HostValue::Object(obj) => obj.class_name(),
            HostValue::Function(_) => "Function",
            HostValue::Error(err) => &err.name,
            HostValue::Array(arr) => arr.kind().class_name(),
        }
    }

    /// Instance-of check that never throws.
    ///
    /// Errors match their own name and `Error`; everything with identity
    /// matches `Object`.
    pub fn instance_of(&self, class: &str) -> bool {
        if !self.is_object() {
            return false;
        }
        class == "Object"
            || self.class_name() == class
            || (class == "Error" && matches!(self, HostValue::Error(_)))
    }

    /// Property read. Missing properties are `undefined`.
    pub fn get(&self, prop: &str) -> HostValue {
        match (self, prop) {
            (HostValue::Object(obj), _) => obj.get(prop),
            (HostValue::String(s), "length") => HostValue::Number(s.encode_utf16().count() as f64),
            (HostValue::Array(arr), "length") => HostValue::Number(arr.len() as f64),
            (HostValue::Error(err), "name") => HostValue::String(err.name.clone()),
            (HostValue::Error(err), "message") => HostValue::String(err.message.clone()),
            (HostValue::Function(f), "name") => HostValue::String(f.name().to_string()),
            _ => HostValue::Undefined,
        }
    }

    /// Property write.
    pub fn set(&self, prop: &str, value: HostValue) -> Result<(), Thrown> {
        match self {
            HostValue::Object(obj) => obj.set(prop, value),
            HostValue::Undefined | HostValue::Null => Err(Thrown::type_error(format!(
                "cannot set properties of {} (setting '{prop}')",
                self.class_name()
            ))),
            // Writes to primitives are silently dropped
            _ => Ok(()),
        }
    }

    /// Method call with `self` as receiver.
    pub fn call_method(
        &self,
        scope: &mut Scope<'_>,
        name: &str,
        args: &[HostValue],
    ) -> Result<HostValue, Thrown> {
        match self {
            HostValue::Object(obj) => obj.call_method(scope, name, args),
            _ => match self.get(name) {
                HostValue::Function(f) => scope.invoke(&f, args),
                _ => Err(Thrown::type_error(format!(
                    "{}.{name} is not a function",
                    self.class_name()
                ))),
            },
        }
    }

    /// Host `ToNumber`.
    pub fn to_number(&self) -> f64 {
        match self {
            HostValue::Undefined => f64::NAN,
            HostValue::Null => 0.0,
            HostValue::Bool(b) => f64::from(u8::from(*b)),
            HostValue::Number(n) => *n,
            HostValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// Host truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
            HostValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Wrapping conversion to a signed 32-bit integer (`x | 0`).
    pub fn to_int32(&self) -> i32 {
        to_int32(self.to_number())
    }

    /// Wrapping conversion to an unsigned 32-bit integer (`x >>> 0`).
    pub fn to_uint32(&self) -> u32 {
        to_int32(self.to_number()) as u32
    }

    /// Human-readable rendering used by the `debug_string` intrinsic.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("\"{s}\""),
            HostValue::Function(f) => match f.name() {
                "" => "Function".to_string(),
                name => format!("Function({name})"),
            },
            HostValue::Error(err) => err.to_string(),
            HostValue::Array(arr) => arr.kind().class_name().to_string(),
            HostValue::Object(obj) => match (obj.class_name(), obj.to_json()) {
                ("Object", Some(json)) => format!("Object({json})"),
                ("Object", None) => "Object".to_string(),
                (class, _) => class.to_string(),
            },
        }
    }

    /// JSON form of primitives and plain records; `None` when not representable.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            HostValue::Null => Some(serde_json::Value::Null),
            HostValue::Bool(b) => Some(serde_json::Value::Bool(*b)),
            HostValue::Number(n) => Some(
                serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            ),
            HostValue::String(s) => Some(serde_json::Value::String(s.clone())),
            HostValue::Object(obj) => obj.to_json(),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) | (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => Arc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => a.same(b),
            (HostValue::Error(a), HostValue::Error(b)) => a == b,
            (HostValue::Array(a), HostValue::Array(b)) => a.same(b),
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Number(f64::from(n))
    }
}

impl From<u32> for HostValue {
    fn from(n: u32) -> Self {
        HostValue::Number(f64::from(n))
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<TypedArray> for HostValue {
    fn from(a: TypedArray) -> Self {
        HostValue::Array(a)
    }
}

impl From<HostError> for HostValue {
    fn from(e: HostError) -> Self {
        HostValue::Error(e)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(HostValue::Undefined)
    }
}

/// `ToInt32`: truncate, wrap modulo 2^32, reinterpret as signed.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

/// Number formatting close to the host's `String(n)`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let s = if n > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

/// An error value: name and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    /// Error class name (`Error`, `TypeError`, ...)
    pub name: String,
    /// Error message
    pub message: String,
}

impl HostError {
    /// Create an error value.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A value thrown by a host capability (or by the bridge itself).
#[derive(Debug, Clone, PartialEq)]
pub struct Thrown(pub HostValue);

impl Thrown {
    /// Throw an error value with the given class name.
    pub fn error(name: &str, message: impl Into<String>) -> Self {
        Thrown(HostValue::Error(HostError::new(name, message)))
    }

    /// Throw a `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::error("TypeError", message)
    }

    /// Throw a `ReferenceError`.
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::error("ReferenceError", message)
    }

    /// The thrown value.
    pub fn value(&self) -> &HostValue {
        &self.0
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            HostValue::Error(err) => err.fmt(f),
            other => f.write_str(&other.debug_string()),
        }
    }
}

impl From<HostValue> for Thrown {
    fn from(v: HostValue) -> Self {
        Thrown(v)
    }
}

/// Behaviour of a host object.
///
/// Everything except [`HostObject::class_name`] and [`HostObject::as_any`]
/// has a default, so a capability only overrides what it supports.
pub trait HostObject: Any + Send + Sync + fmt::Debug {
    /// Class name used for instance-of checks.
    fn class_name(&self) -> &str;

    /// Property read.
    fn get(&self, _prop: &str) -> HostValue {
        HostValue::Undefined
    }

    /// Property write.
    fn set(&self, prop: &str, _value: HostValue) -> Result<(), Thrown> {
        Err(Thrown::type_error(format!(
            "cannot assign to property '{prop}' of {}",
            self.class_name()
        )))
    }

    /// Method call. Defaults to invoking a function-valued property.
    fn call_method(
        &self,
        scope: &mut Scope<'_>,
        name: &str,
        args: &[HostValue],
    ) -> Result<HostValue, Thrown> {
        match self.get(name) {
            HostValue::Function(f) => scope.invoke(&f, args),
            _ => Err(Thrown::type_error(format!(
                "{}.{name} is not a function",
                self.class_name()
            ))),
        }
    }

    /// JSON rendering for plain records.
    fn to_json(&self) -> Option<serde_json::Value> {
        None
    }

    /// Concrete type access.
    fn as_any(&self) -> &dyn Any;
}

/// A property bag with a class name.
#[derive(Debug, Default)]
pub struct PlainObject {
    class: String,
    props: Mutex<BTreeMap<String, HostValue>>,
}

impl PlainObject {
    /// Empty object of class `Object`.
    pub fn new() -> Self {
        Self::with_class("Object")
    }

    /// Empty object with a custom class name.
    pub fn with_class(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            props: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builder-style property insertion.
    pub fn prop(self, name: &str, value: impl Into<HostValue>) -> Self {
        self.props.lock().insert(name.to_string(), value.into());
        self
    }

    /// Builder-style method insertion.
    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> Result<HostValue, Thrown> + Send + Sync + 'static,
    {
        self.prop(name, HostValue::function(name, f))
    }

    /// Property names, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.props.lock().keys().cloned().collect()
    }
}

impl HostObject for PlainObject {
    fn class_name(&self) -> &str {
        &self.class
    }

    fn get(&self, prop: &str) -> HostValue {
        self.props.lock().get(prop).cloned().unwrap_or_default()
    }

    fn set(&self, prop: &str, value: HostValue) -> Result<(), Thrown> {
        self.props.lock().insert(prop.to_string(), value);
        Ok(())
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        let props = self.props.lock();
        let map = props
            .iter()
            .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
            .collect();
        Some(serde_json::Value::Object(map))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Signature of native host functions.
pub type NativeFn = dyn Fn(&mut Scope<'_>, &[HostValue]) -> Result<HostValue, Thrown> + Send + Sync;

/// A callable host value.
#[derive(Clone)]
pub enum HostFunction {
    /// A function implemented by the embedder
    Native {
        /// Function name, for debug rendering
        name: Arc<str>,
        /// Implementation
        f: Arc<NativeFn>,
    },
    /// A module closure wrapped by the closure bridge
    Closure(Arc<ClosureWrapper>),
}

impl HostFunction {
    /// Wrap a Rust closure.
    pub fn native<F>(name: &str, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> Result<HostValue, Thrown> + Send + Sync + 'static,
    {
        HostFunction::Native {
            name: Arc::from(name),
            f: Arc::new(f),
        }
    }

    /// Function name (empty for module closures).
    pub fn name(&self) -> &str {
        match self {
            HostFunction::Native { name, .. } => name,
            HostFunction::Closure(_) => "",
        }
    }

    /// The closure wrapper, if this is a module closure.
    pub fn as_closure(&self) -> Option<&Arc<ClosureWrapper>> {
        match self {
            HostFunction::Closure(c) => Some(c),
            HostFunction::Native { .. } => None,
        }
    }

    fn same(&self, other: &HostFunction) -> bool {
        match (self, other) {
            (HostFunction::Native { f: a, .. }, HostFunction::Native { f: b, .. }) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (HostFunction::Closure(a), HostFunction::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFunction::Native { name, .. } => write!(f, "Function({name})"),
            HostFunction::Closure(c) => c.fmt(f),
        }
    }
}

/// A typed array owned by the host.
///
/// Clones share storage, so a capability that fills an array it received
/// is visible to whoever holds another clone.
#[derive(Clone)]
pub struct TypedArray {
    kind: ViewKind,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl TypedArray {
    /// Zero-filled array of `len` elements.
    pub fn zeroed(kind: ViewKind, len: usize) -> Self {
        Self::from_bytes(kind, vec![0; len * kind.width()])
    }

    /// Array over raw little-endian bytes. Trailing partial elements are dropped.
    pub fn from_bytes(kind: ViewKind, mut bytes: Vec<u8>) -> Self {
        bytes.truncate(bytes.len() - bytes.len() % kind.width());
        Self {
            kind,
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Array holding a copy of `values`.
    pub fn from_elements<T: Element>(values: &[T]) -> Self {
        let width = T::KIND.width();
        let mut bytes = vec![0; values.len() * width];
        for (chunk, value) in bytes.chunks_exact_mut(width).zip(values) {
            value.write(chunk);
        }
        Self::from_bytes(T::KIND, bytes)
    }

    /// Element kind.
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.lock().len() / self.kind.width()
    }

    /// True when the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the raw little-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Elements decoded as `T`; `None` if the kind does not match.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if T::KIND != self.kind {
            return None;
        }
        Some(
            self.bytes
                .lock()
                .chunks_exact(self.kind.width())
                .map(T::read)
                .collect(),
        )
    }

    /// Elements as host numbers.
    pub fn to_numbers(&self) -> Vec<f64> {
        fn numbers<T: Element>(bytes: &[u8]) -> Vec<f64> {
            bytes.chunks_exact(T::KIND.width()).map(|c| T::read(c).to_f64()).collect()
        }
        let bytes = self.bytes.lock();
        match self.kind {
            ViewKind::Int8 => numbers::<i8>(&bytes),
            ViewKind::Uint8 => numbers::<u8>(&bytes),
            ViewKind::Int16 => numbers::<i16>(&bytes),
            ViewKind::Uint16 => numbers::<u16>(&bytes),
            ViewKind::Int32 => numbers::<i32>(&bytes),
            ViewKind::Uint32 => numbers::<u32>(&bytes),
            ViewKind::Float32 => numbers::<f32>(&bytes),
            ViewKind::Float64 => numbers::<f64>(&bytes),
        }
    }

    /// Mutate the raw bytes in place.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.lock())
    }

    fn same(&self, other: &TypedArray) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for TypedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.class_name(), self.len())
    }
}
