//! Engine adapter, linear memory and callback store for sqlite-wasm-embedder.
//!
//! This crate provides the engine-facing half of the embedding:
//! - [`GuestMemory`]: typed, bounds-checked access to guest linear memory
//! - [`CallbackStore`]: host callbacks the guest refers to by id or pointer
//! - [`EngineAdapter`]: the operations a WebAssembly engine must provide
//! - [`WasmtimeAdapter`]: the Wasmtime implementation of that contract
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared, thread-safe)                                  │
//! │  - Compilation settings                                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CompiledModule                        │
//! │  (Shared across environments)                           │
//! │  - Machine code, import/export descriptions             │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │      WasmtimeAdapter: Store<StoreState> + Instance      │
//! │  (One per environment)                                  │
//! │  - Linear memory and function table                     │
//! │  - Host functions from HostImports                      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod adapter;
pub mod callback;
pub mod engine;
pub mod instance;
pub mod memory;
pub mod module;
pub mod stack;
pub mod store;
pub mod types;

pub use abi::{Args, FuncSignature, HostFunction, HostImports, ValType, Value};
pub use adapter::EngineAdapter;
pub use callback::{CallbackStore, SqliteTrace};
pub use engine::WasmEngine;
pub use instance::{WasmtimeAdapter, WasmtimeMemory};
pub use memory::{GuestMemory, GuestMemoryExt, HeapMemory, checked_range};
pub use module::CompiledModule;
pub use store::StoreState;
pub use types::{CallbackId, Fd, IndirectFunctionTableIndex, Pages, SqliteDb, SqliteStatement, WasmPtr};
