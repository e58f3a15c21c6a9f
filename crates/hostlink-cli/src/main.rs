//! Hostlink Command-Line Interface
//!
//! This CLI provides tools for:
//! - Loading a module and running one of its exports
//! - Inspecting a module's imports against the intrinsics and a call surface
//! - Fetching a module over HTTP and instantiating it
//! - Printing or validating call surface tables

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostlink::surface::intrinsics;
use hostlink::{abi, BridgeConfig, CallSurface, Loader, ModuleSource};
use tracing::info;
use wasmtime::ExternType;

#[derive(Parser)]
#[command(name = "hostlink")]
#[command(author, version, about = "Host-side bridge for WebAssembly modules", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and call an export
    Run {
        /// Module file, or an http(s) URL
        module: String,

        /// Export to call after initialization
        #[arg(short, long, default_value = abi::START)]
        export: String,

        /// Bridge configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Call surface table (JSON); the built-in table when omitted
        #[arg(short, long)]
        surface: Option<PathBuf>,

        /// Fuel limit for the instance
        #[arg(long)]
        fuel: Option<u64>,
    },

    /// List imports and exports and check them against the bridge
    Inspect {
        /// Module file
        module: PathBuf,

        /// Call surface table (JSON); the built-in table when omitted
        #[arg(short, long)]
        surface: Option<PathBuf>,
    },

    /// Fetch a module over HTTP, instantiate it, and report what loaded
    #[cfg(feature = "fetch")]
    Fetch {
        /// Module URL
        url: String,

        /// Bridge configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the built-in call surface, or validate a table
    Surface {
        /// Table to validate instead of printing the built-in one
        #[arg(long)]
        validate: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

fn load_surface(path: Option<&Path>) -> Result<CallSurface> {
    match path {
        Some(path) => CallSurface::load(path)
            .with_context(|| format!("Failed to load call surface {}", path.display())),
        None => Ok(CallSurface::default_surface()),
    }
}

fn module_source(module: &str) -> Result<ModuleSource> {
    if module.starts_with("http://") || module.starts_with("https://") {
        #[cfg(feature = "fetch")]
        return Ok(ModuleSource::Url(module.to_string()));
        #[cfg(not(feature = "fetch"))]
        anyhow::bail!("Loading from URLs requires the `fetch` feature");
    }
    Ok(ModuleSource::Path(PathBuf::from(module)))
}

fn cmd_run(
    module: String,
    export: String,
    config: Option<PathBuf>,
    surface: Option<PathBuf>,
    fuel: Option<u64>,
) -> Result<()> {
    let mut config = load_config(config.as_deref())?;
    if let Some(fuel) = fuel {
        config = config.fuel_limit(fuel);
    }
    let surface = load_surface(surface.as_deref())?;
    let source = module_source(&module)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let mut loader = Loader::new(config)?.with_surface(surface);

    let result = runtime.block_on(async {
        let instance = loader
            .init_async(Some(source))
            .await
            .with_context(|| format!("Failed to load {module}"))?;
        info!(memory = instance.memory_size(), "module ready");
        instance
            .call::<(), ()>(&export, ())
            .with_context(|| format!("Export `{export}` failed"))
    })?;

    for warning in loader.warnings() {
        println!("warning: {warning}");
    }
    println!("=== Run ===");
    println!("Export: {export}");
    println!("Time: {} us", result.execution_time_us);
    if let Some(fuel) = result.fuel_consumed {
        println!("Fuel consumed: {fuel}");
    }
    if let Some(instance) = loader.instance() {
        if let Some(exception) = instance.last_exception() {
            println!("Last recorded exception: {}", exception.debug_string());
        }
        println!("Live references: {}", instance.state().refs().live());
    }
    Ok(())
}

fn cmd_inspect(module: PathBuf, surface: Option<PathBuf>) -> Result<()> {
    let surface = load_surface(surface.as_deref())?;
    let loader = Loader::new(BridgeConfig::default())?;
    let bytes = std::fs::read(&module)
        .with_context(|| format!("Failed to read {}", module.display()))?;
    let compiled = loader.compile(&bytes)?;

    println!("=== Imports ===");
    let mut unresolved = 0;
    for import in compiled.imports() {
        let status = if import.module() == "wasi_snapshot_preview1" {
            "wasi"
        } else if import.module() != abi::IMPORT_MODULE {
            unresolved += 1;
            "unknown module"
        } else if intrinsics::NAMES.contains(&import.name()) {
            "intrinsic"
        } else if let Some(entry) = surface.get(import.name()) {
            match import.ty() {
                ExternType::Func(ty)
                    if ty.params().len() == entry.wasm_params().len()
                        && ty.results().len() == entry.wasm_results().len() =>
                {
                    "surface"
                }
                _ => {
                    unresolved += 1;
                    "surface (signature mismatch)"
                }
            }
        } else {
            unresolved += 1;
            "unresolved"
        };
        println!("  {}::{} [{}]", import.module(), import.name(), status);
    }

    println!();
    println!("=== Exports ===");
    for export in compiled.exports() {
        let role = match export.name() {
            abi::MEMORY => " (memory)",
            abi::MALLOC => " (allocator)",
            abi::REALLOC => " (reallocator)",
            abi::EXN_STORE => " (error slot)",
            abi::INIT => " (initializer)",
            abi::FUNCTION_TABLE => " (closure table)",
            abi::START => " (entry point)",
            _ => "",
        };
        println!("  {}{}", export.name(), role);
    }

    if compiled.exports().all(|e| e.name() != abi::MEMORY) {
        anyhow::bail!("Module does not export `{}`", abi::MEMORY);
    }
    if unresolved > 0 {
        anyhow::bail!("{unresolved} import(s) cannot be satisfied by this call surface");
    }
    Ok(())
}

#[cfg(feature = "fetch")]
fn cmd_fetch(url: String, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let mut loader = Loader::new(config)?;

    let (exports, memory) = runtime.block_on(async {
        let instance = loader
            .init_async(Some(ModuleSource::Url(url.clone())))
            .await
            .with_context(|| format!("Failed to load {url}"))?;
        anyhow::Ok((instance.exports(), instance.memory_size()))
    })?;

    println!("=== Fetch ===");
    println!("URL: {url}");
    println!("State: {:?}", loader.state());
    println!("Memory: {memory} bytes");
    println!("Exports: {}", exports.join(", "));
    for warning in loader.warnings() {
        println!("warning: {warning}");
    }
    Ok(())
}

fn cmd_surface(validate: Option<PathBuf>) -> Result<()> {
    match validate {
        Some(path) => {
            let surface = load_surface(Some(&path))?;
            println!("{}: {} entries, OK", path.display(), surface.entries.len());
        }
        None => println!("{}", CallSurface::default_surface().to_json()?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            module,
            export,
            config,
            surface,
            fuel,
        } => cmd_run(module, export, config, surface, fuel),

        Commands::Inspect { module, surface } => cmd_inspect(module, surface),

        #[cfg(feature = "fetch")]
        Commands::Fetch { url, config } => cmd_fetch(url, config),

        Commands::Surface { validate } => cmd_surface(validate),
    }
}
