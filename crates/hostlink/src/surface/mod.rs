//! Call surface: the fixed table of imports the module may call.
//!
//! Each [`SurfaceEntry`] names one import under the `hostlink` namespace,
//! the host capability it reaches ([`Target`]), how its arguments arrive
//! ([`ArgShape`]) and how its result leaves ([`RetShape`]). Tables are
//! generated ahead of time alongside the module and loaded as JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": [
//!     { "import": "log", "target": { "kind": "call", "name": "console.log" },
//!       "params": [{ "kind": "str" }] },
//!     { "import": "canvas_width", "target": { "kind": "get", "name": "width" },
//!       "params": [{ "kind": "ref" }], "ret": { "kind": "u32" } }
//!   ]
//! }
//! ```
//!
//! One builder in [`adapter`] turns every entry into a host function; the
//! always-present helper imports live in [`intrinsics`].

pub mod adapter;
pub mod intrinsics;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use wasmtime::{Engine, FuncType, ValType};

use crate::error::{BridgeError, Result};
use crate::memory::ViewKind;

/// Version of the surface table format.
pub const SURFACE_VERSION: u32 = 1;

/// The host capability an entry reaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// Call a global function, or a method when the path is dotted (`console.log`)
    Call(String),
    /// Call a method on the first argument with the remaining arguments
    Method(String),
    /// Read a property of the first argument
    Get(String),
    /// Set a property of the first argument to the second argument
    Set(String),
    /// Construct an instance of a class resolved through the probes
    Construct(String),
    /// A global by logical name, absent when not present
    Global(String),
    /// Whether the first argument is an instance of a class
    InstanceOf(String),
    /// Call the first argument with the remaining arguments
    Invoke,
}

/// How one argument arrives from the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "view", rename_all = "snake_case")]
pub enum ArgShape {
    /// `i32` as a signed number
    I32,
    /// `i32` reinterpreted as unsigned
    U32,
    /// `f32`
    F32,
    /// `f64`
    F64,
    /// `i32`, non-zero is true
    Bool,
    /// `i32` reference table handle (borrowed)
    Ref,
    /// `(ptr, len)` UTF-8 string
    Str,
    /// `(ptr, len)` UTF-8 string, absent when `ptr` is 0
    OptStr,
    /// `(ptr, len)` typed slice, copied
    Slice(ViewKind),
    /// `(ptr, len)` typed slice, copied and written back after the call
    SliceMut(ViewKind),
}

impl ArgShape {
    fn push_wasm_types(&self, out: &mut Vec<ValType>) {
        match self {
            ArgShape::I32 | ArgShape::U32 | ArgShape::Bool | ArgShape::Ref => out.push(ValType::I32),
            ArgShape::F32 => out.push(ValType::F32),
            ArgShape::F64 => out.push(ValType::F64),
            ArgShape::Str | ArgShape::OptStr | ArgShape::Slice(_) | ArgShape::SliceMut(_) => {
                out.push(ValType::I32);
                out.push(ValType::I32);
            }
        }
    }
}

/// How the result leaves for the module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "variants", rename_all = "snake_case")]
pub enum RetShape {
    /// Nothing
    #[default]
    Unit,
    /// `i32` with wrapping conversion
    I32,
    /// `i32` carrying an unsigned value
    U32,
    /// `f32`
    F32,
    /// `f64`
    F64,
    /// `i32` 0 or 1
    Bool,
    /// `i32` fresh reference table handle
    Ref,
    /// `i32` handle, 0 when absent
    OptRef,
    /// `i32` 0, 1, or `0xFFFFFF` when absent
    OptBool,
    /// `(ptr, len)` written at a leading return pointer
    Str,
    /// `(is_some: i32, value: f64)` written at a leading return pointer
    OptF64,
    /// `i32` index into the variant list, or the variant count when unknown
    Enum(Vec<String>),
}

impl RetShape {
    /// Whether the result is written through a leading return pointer.
    pub fn uses_retptr(&self) -> bool {
        matches!(self, RetShape::Str | RetShape::OptF64)
    }

    fn wasm_result(&self) -> Option<ValType> {
        match self {
            RetShape::Unit | RetShape::Str | RetShape::OptF64 => None,
            RetShape::F32 => Some(ValType::F32),
            RetShape::F64 => Some(ValType::F64),
            _ => Some(ValType::I32),
        }
    }
}

/// One import of the call surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceEntry {
    /// Import name under the `hostlink` namespace
    pub import: String,
    /// Capability reached
    pub target: Target,
    /// Argument shapes, in order
    #[serde(default)]
    pub params: Vec<ArgShape>,
    /// Result shape
    #[serde(default)]
    pub ret: RetShape,
    /// Record host exceptions instead of trapping
    #[serde(default)]
    pub catch: bool,
}

impl SurfaceEntry {
    /// Entry with no arguments, no result, not catching.
    pub fn new(import: impl Into<String>, target: Target) -> Self {
        Self {
            import: import.into(),
            target,
            params: Vec::new(),
            ret: RetShape::Unit,
            catch: false,
        }
    }

    /// Builder: set argument shapes.
    pub fn params(mut self, params: impl IntoIterator<Item = ArgShape>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    /// Builder: set result shape.
    pub fn ret(mut self, ret: RetShape) -> Self {
        self.ret = ret;
        self
    }

    /// Builder: record exceptions instead of trapping.
    pub fn catching(mut self) -> Self {
        self.catch = true;
        self
    }

    /// Core wasm parameter types, including the return pointer.
    pub fn wasm_params(&self) -> Vec<ValType> {
        let mut out = Vec::new();
        if self.ret.uses_retptr() {
            out.push(ValType::I32);
        }
        for shape in &self.params {
            shape.push_wasm_types(&mut out);
        }
        out
    }

    /// Core wasm result types.
    pub fn wasm_results(&self) -> Vec<ValType> {
        self.ret.wasm_result().into_iter().collect()
    }

    /// Function type of the import.
    pub fn func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(engine, self.wasm_params(), self.wasm_results())
    }

    fn check(&self) -> Result<()> {
        let min_args = match &self.target {
            Target::Method(_) | Target::Get(_) | Target::InstanceOf(_) | Target::Invoke => 1,
            Target::Set(_) => 2,
            Target::Call(_) | Target::Construct(_) | Target::Global(_) => 0,
        };
        if self.params.len() < min_args {
            return Err(BridgeError::Config(format!(
                "import `{}` needs at least {min_args} argument(s) for {:?}",
                self.import, self.target
            )));
        }
        Ok(())
    }
}

/// A versioned table of imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSurface {
    /// Format version, must equal [`SURFACE_VERSION`]
    pub version: u32,
    /// Imports
    pub entries: Vec<SurfaceEntry>,
}

impl Default for CallSurface {
    fn default() -> Self {
        Self::default_surface()
    }
}

impl CallSurface {
    /// Empty table of the current version.
    pub fn empty() -> Self {
        Self {
            version: SURFACE_VERSION,
            entries: Vec::new(),
        }
    }

    /// Builder: append an entry.
    pub fn entry(mut self, entry: SurfaceEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Generic entries every module can rely on.
    pub fn default_surface() -> Self {
        use ArgShape::*;
        Self::empty()
            .entry(SurfaceEntry::new("console_log", Target::Call("console.log".into())).params([Str]))
            .entry(SurfaceEntry::new("console_warn", Target::Call("console.warn".into())).params([Str]))
            .entry(SurfaceEntry::new("console_error", Target::Call("console.error".into())).params([Str]))
            .entry(
                SurfaceEntry::new("global_this", Target::Global("global".into())).ret(RetShape::OptRef),
            )
            .entry(
                SurfaceEntry::new("invoke0", Target::Invoke)
                    .params([Ref])
                    .ret(RetShape::Ref)
                    .catching(),
            )
            .entry(
                SurfaceEntry::new("invoke1", Target::Invoke)
                    .params([Ref, Ref])
                    .ret(RetShape::Ref)
                    .catching(),
            )
            .entry(
                SurfaceEntry::new("instance_of_error", Target::InstanceOf("Error".into()))
                    .params([Ref])
                    .ret(RetShape::Bool),
            )
    }

    /// Parse and validate a JSON table.
    pub fn from_json(text: &str) -> Result<Self> {
        let surface: Self = serde_json::from_str(text)?;
        surface.validate()?;
        Ok(surface)
    }

    /// Load and validate a JSON table from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check version, duplicate imports, and arities.
    pub fn validate(&self) -> Result<()> {
        if self.version != SURFACE_VERSION {
            return Err(BridgeError::Config(format!(
                "call surface version {} does not match expected {}",
                self.version, SURFACE_VERSION
            )));
        }
        let mut seen = BTreeSet::new();
        for entry in &self.entries {
            if entry.import.starts_with(intrinsics::PREFIX) {
                return Err(BridgeError::Config(format!(
                    "import `{}` uses the reserved intrinsic prefix",
                    entry.import
                )));
            }
            if !seen.insert(entry.import.as_str()) {
                return Err(BridgeError::Config(format!(
                    "duplicate import `{}`",
                    entry.import
                )));
            }
            entry.check()?;
        }
        Ok(())
    }

    /// Entry by import name.
    pub fn get(&self, import: &str) -> Option<&SurfaceEntry> {
        self.entries.iter().find(|e| e.import == import)
    }
}
