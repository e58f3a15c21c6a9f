//! Names shared with the module side of the bridge.
//!
//! ```wat
//! (import "hostlink" "__hostlink_string_new" (func (param i32 i32) (result i32)))
//! (export "__hostlink_malloc" (func $malloc))
//! ```

/// Import namespace of intrinsics and call surface adapters.
pub const IMPORT_MODULE: &str = "hostlink";

/// Exported linear memory.
pub const MEMORY: &str = "memory";

/// `malloc(size: i32, align: i32) -> ptr: i32`
pub const MALLOC: &str = "__hostlink_malloc";

/// `realloc(ptr: i32, old_size: i32, new_size: i32, align: i32) -> ptr: i32`
pub const REALLOC: &str = "__hostlink_realloc";

/// `exn_store(handle: i32)`, notified when a catching adapter records an error
pub const EXN_STORE: &str = "__hostlink_exn_store";

/// Module initializer, called once after instantiation
pub const INIT: &str = "__hostlink_start";

/// Application entry point, called by [`ModuleInstance::start`](crate::ModuleInstance::start)
pub const START: &str = "start";

/// Function table holding closure destructors and invoke shims
pub const FUNCTION_TABLE: &str = "__indirect_function_table";

/// Value written by `boolean_get` and `OptBool` results for "absent".
pub const OPT_BOOL_NONE: i32 = 0xFF_FFFF;
