//! Host side of the SQLite WebAssembly embedding.
//!
//! This crate implements what a SQLite module built with Emscripten imports
//! and ties it to an instance through any [`EngineAdapter`]:
//!
//! # Import modules
//!
//! - [`wasi`]: `wasi_snapshot_preview1`, descriptor I/O, clocks, entropy
//! - [`emscripten`]: `env`, `__syscall_*`, heap growth, time zone, abort
//! - [`callbacks`]: `sqlite3-callback-manager` trampolines
//!
//! # Host state
//!
//! - [`fs`]: file descriptor table, channels and advisory locks
//! - [`embedder`]: clocks, environment, entropy and stdio of the application
//! - [`logging`]: forwarding of guest output and SQLite log messages
//!
//! # Error Model
//!
//! Handlers distinguish two failure classes:
//!
//! 1. **Guest-recoverable**: a [`SysError`](sqlite_wasm_common::SysError)
//!    lowered to the errno convention of the import module.
//! 2. **Fatal**: a [`RuntimeError`](sqlite_wasm_common::RuntimeError) that
//!    aborts the guest call and surfaces unchanged to the caller.
//!
//! [`EngineAdapter`]: sqlite_wasm_core::EngineAdapter

pub mod callbacks;
pub mod embedder;
pub mod emscripten;
pub mod environment;
pub mod exports;
pub mod fcntl;
pub mod fs;
pub mod linker;
pub mod logging;
pub mod runtime;
pub mod syscall;
pub mod wasi;

pub use callbacks::{CallbackFunctionIndexes, CallbackKind, build_callback_table};
pub use embedder::{EmbedderHost, LocalTime, SystemHost, TimeZoneInfo};
pub use environment::{SqliteWasmEnvironment, SqliteWasmEnvironmentBuilder};
pub use exports::SqliteExports;
pub use fs::HostFileSystem;
pub use linker::register_all;
pub use logging::LoggingHost;
pub use runtime::EmscriptenRuntime;
pub use syscall::SyscallContext;
