//! SQLite WebAssembly embedder CLI.
//!
//! - `inspect`: list what a module imports and exports
//! - `run`: build a full environment and report the SQLite version

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlite_wasm_common::{ConfigFile, EmbedderConfig};
use sqlite_wasm_core::{CompiledModule, GuestMemoryExt, Value, WasmEngine, WasmPtr, WasmtimeAdapter};
use sqlite_wasm_host::{CallbackKind, SqliteWasmEnvironment};

#[derive(Debug, Parser)]
#[command(name = "sqlite-wasm-embedder", version, about = "Run SQLite compiled to WebAssembly")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true, env = "SQLITE_WASM_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the imports and exports of a module.
    Inspect {
        /// Path to a `.wasm` file.
        module: PathBuf,
    },
    /// Instantiate a module against the host and print its SQLite version.
    Run {
        /// Path to the module; overrides `module` in the configuration file.
        module: Option<PathBuf>,

        /// TOML configuration file.
        #[arg(short, long, env = "SQLITE_WASM_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Inspect { module } => inspect(&module),
        Command::Run { module, config } => run(module, config.as_deref()),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sqlite_wasm_embedder=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let engine = WasmEngine::new(&EmbedderConfig::default().engine)?;
    let module = CompiledModule::from_file(engine.inner(), path)
        .with_context(|| format!("failed to compile {}", path.display()))?;

    let imports: Vec<_> = module
        .imports()
        .into_iter()
        .map(|item| {
            serde_json::json!({
                "module": item.module,
                "name": item.name,
                "kind": item.kind.to_string(),
            })
        })
        .collect();
    let exports: Vec<_> = module
        .exports()
        .into_iter()
        .map(|item| serde_json::json!({ "name": item.name, "kind": item.kind.to_string() }))
        .collect();

    let report = serde_json::json!({ "imports": imports, "exports": exports });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run(module: Option<PathBuf>, config: Option<&Path>) -> anyhow::Result<()> {
    let file = match config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    let Some(path) = module.or(file.module) else {
        bail!("no module given on the command line or in the configuration file");
    };
    let EmbedderConfig { engine, memory, host } = file.embedder;

    let engine = WasmEngine::new(&engine)?;
    let module = CompiledModule::from_file(engine.inner(), &path)
        .with_context(|| format!("failed to compile {}", path.display()))?;
    let adapter = WasmtimeAdapter::new(&engine, &memory);

    let mut env = SqliteWasmEnvironment::builder(adapter)
        .host_config(host)
        .build(&module)
        .context("failed to build SQLite environment")?;

    if let Ok(version) = env.exports().sqlite3_libversion().cloned() {
        let results = env.call(&version, &[])?;
        let Some(ptr) = results.first().and_then(Value::as_i32) else {
            bail!("sqlite3_libversion returned {results:?}");
        };
        let version = env.memory()?.read_cstring(WasmPtr::<u8>::from_i32(ptr))?;
        println!("SQLite {version}");
    }
    if let Ok(number) = env.exports().sqlite3_libversion_number().cloned() {
        let results = env.call(&number, &[])?;
        println!("Version number: {results:?}");
    }

    match env.callback_indexes() {
        Some(indexes) => {
            for kind in CallbackKind::ALL {
                println!("{:<32} slot {}", kind.import_name(), indexes.get(kind));
            }
        }
        None => println!("No function table; host callbacks unavailable"),
    }

    env.check_stack_cookie()?;
    info!(module = %path.display(), "Done");
    env.close();
    Ok(())
}
