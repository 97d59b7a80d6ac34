//! Common types, errors, and configuration for sqlite-wasm-embedder.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror`, split into host-fatal and guest-recoverable classes
//! - The WASI errno enumeration
//! - Configuration structures and TOML configuration files

pub mod config;
pub mod config_file;
pub mod errno;
pub mod error;

pub use config::{EmbedderConfig, EngineConfig, HostConfig, MemoryConfig, OptLevel, WASM_PAGE_SIZE};
pub use config_file::{ConfigFile, ConfigFileError};
pub use errno::Errno;
pub use error::{HostFunctionError, RuntimeError, SysError};
