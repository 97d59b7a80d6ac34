//! The contract a WebAssembly engine fulfils to host SQLite.
//!
//! Everything above this trait (syscall shim, callback trampolines, the
//! environment builder) is written once against [`EngineAdapter`]. A concrete
//! adapter owns the engine's store; the handles it returns are only
//! meaningful to that adapter.

use sqlite_wasm_common::RuntimeError;

use crate::abi::{HostFunction, HostImports, Value};
use crate::memory::GuestMemory;
use crate::types::IndirectFunctionTableIndex;

/// Operations the embedding needs from a WebAssembly engine.
pub trait EngineAdapter {
    /// A compiled module.
    type Module;

    /// An instantiated module.
    type Instance;

    /// A callable guest export.
    type Callable: Clone;

    /// Borrowed view of an instance's linear memory.
    type Memory<'a>: GuestMemory
    where
        Self: 'a;

    /// Compile raw wasm bytes.
    fn compile(&self, bytes: &[u8]) -> Result<Self::Module, RuntimeError>;

    /// Instantiate `module`, resolving its imports by `(module, name)` in
    /// `imports`.
    ///
    /// Fails with [`RuntimeError::MissingImport`] or
    /// [`RuntimeError::ImportSignatureMismatch`] before running any guest
    /// code when an import cannot be satisfied.
    fn instantiate(
        &mut self,
        module: &Self::Module,
        imports: &HostImports,
    ) -> Result<Self::Instance, RuntimeError>;

    /// Look up an exported function.
    fn export(&mut self, instance: &Self::Instance, name: &str) -> Option<Self::Callable>;

    /// The instance's linear memory.
    fn memory<'a>(&'a mut self, instance: &Self::Instance) -> Result<Self::Memory<'a>, RuntimeError>;

    /// Append `delta` null slots to the instance's indirect function table.
    ///
    /// Returns the index of the first new slot, or `None` when the instance
    /// exposes no table.
    fn grow_table(
        &mut self,
        instance: &Self::Instance,
        delta: u32,
    ) -> Result<Option<IndirectFunctionTableIndex>, RuntimeError>;

    /// Bind table slot `index` to `function`.
    fn set_table(
        &mut self,
        instance: &Self::Instance,
        index: IndirectFunctionTableIndex,
        function: &HostFunction,
    ) -> Result<(), RuntimeError>;

    /// Call a guest export.
    ///
    /// A fatal error raised by a host function during the call comes back
    /// unchanged; engine traps are converted to [`RuntimeError::Trap`].
    fn call(&mut self, callable: &Self::Callable, args: &[Value]) -> Result<Vec<Value>, RuntimeError>;
}
