//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every environment built from it and holds
//! no per-guest state. It is configured for synchronous execution: host
//! functions run to completion on the calling thread.

use std::sync::Arc;

use tracing::{debug, info, warn};
use wasmtime::{Config, Engine};

use sqlite_wasm_common::{EngineConfig, OptLevel, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Example
///
/// ```ignore
/// use sqlite_wasm_common::EngineConfig;
/// use sqlite_wasm_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        if config.max_wasm_stack_kb == 0 {
            return Err(RuntimeError::invalid_config("max_wasm_stack_kb must be positive"));
        }

        let mut wasmtime_config = Config::new();

        wasmtime_config.cranelift_opt_level(match config.cranelift_opt_level {
            OptLevel::None => wasmtime::OptLevel::None,
            OptLevel::Speed => wasmtime::OptLevel::Speed,
            OptLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
        });

        // SQLite's parser recurses deeply on nested expressions.
        wasmtime_config.max_wasm_stack(config.max_wasm_stack_kb * 1024);

        wasmtime_config.debug_info(config.debug_info);

        if config.cache_compiled_modules {
            match wasmtime_config.cache_config_load_default() {
                Ok(_) => debug!("Module cache enabled"),
                Err(e) => warn!(error = %e, "Module cache unavailable, compiling without it"),
            }
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            opt_level = ?config.cranelift_opt_level,
            max_wasm_stack_kb = config.max_wasm_stack_kb,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("cranelift_opt_level", &self.config.cranelift_opt_level)
            .field("max_wasm_stack_kb", &self.config.max_wasm_stack_kb)
            .field("debug_info", &self.config.debug_info)
            .finish_non_exhaustive()
    }
}
