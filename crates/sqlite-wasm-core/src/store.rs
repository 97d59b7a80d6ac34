//! Per-environment store state.
//!
//! Each environment owns exactly one [`wasmtime::Store`] whose data is a
//! [`StoreState`]: an identifier for log correlation, the resource limits
//! enforced on the guest, and the guest's linear memory once known.

use wasmtime::{Memory, Store, StoreLimits, StoreLimitsBuilder};

use sqlite_wasm_common::MemoryConfig;

use crate::WasmEngine;
use crate::memory::MAX_WASM32_PAGES;
use crate::types::Pages;

/// Data attached to an environment's store.
///
/// Host functions reach it through [`wasmtime::Caller::data`].
pub struct StoreState {
    /// Unique environment identifier for tracing.
    pub env_id: String,

    limits: StoreLimits,

    /// Configured page ceiling, before the module's own declared maximum.
    max_pages: Pages,

    /// The guest's linear memory, set when it is imported or after
    /// instantiation when it is exported.
    pub(crate) memory: Option<Memory>,
}

impl StoreState {
    /// Create store state enforcing `config`.
    pub fn new(env_id: String, config: &MemoryConfig) -> Self {
        let max_bytes = usize::try_from(config.max_memory_bytes()).unwrap_or(usize::MAX);
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_bytes)
            .table_elements(config.max_table_elements)
            .instances(1)
            .build();

        Self {
            env_id,
            limits,
            max_pages: Pages(config.max_pages).min(MAX_WASM32_PAGES),
            memory: None,
        }
    }

    /// Configured page ceiling.
    pub fn max_pages(&self) -> Pages {
        self.max_pages
    }

    /// The guest memory, if resolved.
    pub fn memory(&self) -> Option<Memory> {
        self.memory
    }
}

impl std::fmt::Debug for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreState")
            .field("env_id", &self.env_id)
            .field("max_pages", &self.max_pages)
            .field("has_memory", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}

/// Create a store for one environment.
///
/// A fresh v4 UUID identifies the environment in logs.
pub fn create_store(engine: &WasmEngine, config: &MemoryConfig) -> Store<StoreState> {
    let env_id = uuid::Uuid::new_v4().to_string();
    let mut store = Store::new(engine.inner(), StoreState::new(env_id, config));
    store.limiter(|state| &mut state.limits);
    store
}
