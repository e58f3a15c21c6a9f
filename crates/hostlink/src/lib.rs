//! # Hostlink
//!
//! Host-side interop bridge for sandboxed WebAssembly modules that share
//! one linear memory with their host.
//!
//! The bridge loads a module, exposes a table of host capabilities to it,
//! and marshals values across the boundary:
//!
//! | Concern | Module |
//! |---------|--------|
//! | Loading and initialization | [`loader`] |
//! | Calls into a ready instance | [`instance`] |
//! | Host values held by the module | [`table`], [`value`] |
//! | Strings, arrays and views over memory | [`memory`] |
//! | Module closures handed to the host | [`closure`] |
//! | Import adapters and intrinsics | [`surface`] |
//! | Detected host globals | [`env`], [`builtins`] |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hostlink::{BridgeConfig, Loader, ModuleSource};
//!
//! let mut loader = Loader::new(BridgeConfig::default())?;
//! let instance = loader
//!     .init_async(Some(ModuleSource::Path("app_bg.wasm".into())))
//!     .await?;
//! instance.start()?;
//! ```
//!
//! ## Features
//!
//! - `wasi` - Link WASI preview1 for modules that import it
//! - `fetch` - Load modules from HTTP(S) URLs

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod builtins;
pub mod closure;
pub mod config;
pub mod env;
pub mod error;
pub mod instance;
pub mod loader;
pub mod memory;
pub mod scope;
pub mod state;
pub mod surface;
pub mod table;
pub mod value;

// Re-export main types
pub use config::BridgeConfig;
#[cfg(feature = "wasi")]
pub use config::WasiCapabilities;
pub use env::{Environment, EnvironmentConfig, HostEnvironment};
pub use error::{BridgeError, Result};
pub use instance::{CallResult, ModuleInstance};
pub use loader::{FetchResponse, LoadState, Loader, ModuleSource, ResponseKind, SyncSource};
pub use memory::{TypedView, ViewKind};
pub use scope::Scope;
pub use state::BridgeState;
pub use surface::{ArgShape, CallSurface, RetShape, SurfaceEntry, Target};
pub use table::RefTable;
pub use value::{HostError, HostFunction, HostObject, HostValue, PlainObject, Thrown, TypedArray};
