//! Configuration structures for the embedding.
//!
//! - [`EmbedderConfig`]: top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime compilation settings
//! - [`MemoryConfig`]: linear memory and function table limits
//! - [`HostConfig`]: what the embedding application exposes to the guest

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Size of one WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Top-level embedder configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EmbedderConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Linear memory and table limits.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Host data providers exposed to the guest.
    #[serde(default)]
    pub host: HostConfig,
}

/// Cranelift optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimizations.
    None,
    /// Optimize for speed.
    Speed,
    /// Optimize for speed and code size.
    SpeedAndSize,
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Cranelift optimization level.
    #[serde(default = "defaults::opt_level")]
    pub cranelift_opt_level: OptLevel,

    /// Maximum native stack available to guest code, in kilobytes.
    ///
    /// SQLite recurses deeply when parsing complex statements.
    #[serde(default = "defaults::max_wasm_stack_kb")]
    pub max_wasm_stack_kb: usize,

    /// Emit DWARF debug info for guest code.
    #[serde(default)]
    pub debug_info: bool,

    /// Enable caching of compiled modules on disk.
    #[serde(default)]
    pub cache_compiled_modules: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cranelift_opt_level: defaults::opt_level(),
            max_wasm_stack_kb: defaults::max_wasm_stack_kb(),
            debug_info: false,
            cache_compiled_modules: false,
        }
    }
}

/// Linear memory and function table limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Upper bound on linear memory, in 64 KiB pages.
    ///
    /// The effective limit is the smaller of this value and the maximum the
    /// module declares. The default matches Emscripten's 2 GiB ceiling.
    #[serde(default = "defaults::max_pages")]
    pub max_pages: u64,

    /// Upper bound on indirect function table elements.
    #[serde(default = "defaults::max_table_elements")]
    pub max_table_elements: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_pages: defaults::max_pages(),
            max_table_elements: defaults::max_table_elements(),
        }
    }
}

impl MemoryConfig {
    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_pages.saturating_mul(WASM_PAGE_SIZE)
    }
}

/// Data the host application exposes to the guest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Pass the host process environment through to `environ_get`.
    #[serde(default)]
    pub inherit_env: bool,

    /// Extra environment variables; these override inherited ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory reported to the guest and used for relative paths.
    ///
    /// Defaults to the host process working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Forward guest writes to fd 1 and 2 to the host log.
    #[serde(default = "defaults::forward_stdio")]
    pub forward_stdio: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            inherit_env: false,
            env: BTreeMap::new(),
            working_dir: None,
            forward_stdio: defaults::forward_stdio(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    use super::OptLevel;

    pub const fn opt_level() -> OptLevel {
        OptLevel::Speed
    }

    pub const fn max_wasm_stack_kb() -> usize {
        1024
    }

    pub const fn max_pages() -> u64 {
        32_768
    }

    pub const fn max_table_elements() -> usize {
        100_000
    }

    pub const fn forward_stdio() -> bool {
        true
    }
}
