//! Wasmtime implementation of [`EngineAdapter`].
//!
//! [`WasmtimeAdapter`] owns the store of one environment and handles the
//! instance lifecycle:
//!
//! 1. Check every guest import against the offered [`HostImports`]
//! 2. Link host functions (and an imported `env.memory`, if any)
//! 3. Instantiate the module
//! 4. Call exports, grow and fill the indirect function table
//!
//! Fatal errors raised by host functions travel through Wasmtime as the
//! error value of the trap and are recovered intact on the way out.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use wasmtime::{
    AsContextMut, Caller, Engine, Export, Extern, ExternType, Func, FuncType, Instance,
    Linker, Memory, MemoryType, Ref, Store, StoreContextMut, Trap, Val,
};

use sqlite_wasm_common::{MemoryConfig, RuntimeError};

use crate::abi::{HostFunction, HostImports, ValType, Value};
use crate::adapter::EngineAdapter;
use crate::memory::{GuestMemory, HeapMemory, MAX_WASM32_PAGES, checked_range};
use crate::module::{CompiledModule, signature_of};
use crate::store::{StoreState, create_store};
use crate::types::{IndirectFunctionTableIndex, Pages};
use crate::WasmEngine;

/// Name of the export Emscripten gives the indirect function table.
pub const INDIRECT_FUNCTION_TABLE: &str = "__indirect_function_table";

/// [`GuestMemory`] over a Wasmtime [`Memory`].
pub struct WasmtimeMemory<'a> {
    memory: Memory,
    store: StoreContextMut<'a, StoreState>,
}

impl<'a> WasmtimeMemory<'a> {
    /// Wrap `memory` for access through `store`.
    pub fn new(memory: Memory, store: StoreContextMut<'a, StoreState>) -> Self {
        Self { memory, store }
    }
}

impl GuestMemory for WasmtimeMemory<'_> {
    fn size_bytes(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }

    fn max_pages(&self) -> Pages {
        let declared = self
            .memory
            .ty(&self.store)
            .maximum()
            .map_or(MAX_WASM32_PAGES, Pages);
        declared.min(self.store.data().max_pages())
    }

    fn grow(&mut self, delta: Pages) -> Option<Pages> {
        if self.size_pages().0.checked_add(delta.0)? > self.max_pages().0 {
            return None;
        }
        match self.memory.grow(&mut self.store, delta.0) {
            Ok(old) => Some(Pages(old)),
            Err(e) => {
                debug!(delta = delta.0, error = %e, "Memory growth refused");
                None
            }
        }
    }

    fn read_into(&self, addr: u32, buf: &mut [u8]) -> Result<(), RuntimeError> {
        let data = self.memory.data(&self.store);
        let range = checked_range(addr, buf.len(), data.len() as u64)?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_from(&mut self, addr: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        let data = self.memory.data_mut(&mut self.store);
        let range = checked_range(addr, bytes.len(), data.len() as u64)?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

/// Engine adapter backed by one Wasmtime store.
pub struct WasmtimeAdapter {
    engine: Engine,
    store: Store<StoreState>,
}

impl WasmtimeAdapter {
    /// Create an adapter with a fresh store limited by `config`.
    pub fn new(engine: &WasmEngine, config: &MemoryConfig) -> Self {
        let store = create_store(engine, config);
        debug!(env_id = %store.data().env_id, "Store created");
        Self {
            engine: engine.inner().clone(),
            store,
        }
    }

    /// Identifier of this adapter's environment.
    pub fn env_id(&self) -> &str {
        &self.store.data().env_id
    }

    /// The underlying store.
    pub fn store(&self) -> &Store<StoreState> {
        &self.store
    }

    fn host_func(&mut self, function: &HostFunction) -> Func {
        let ty = FuncType::new(
            &self.engine,
            function.signature.params.iter().map(to_wasmtime_type),
            function.signature.results.iter().map(to_wasmtime_type),
        );
        let handler = Arc::clone(&function.handler);
        let name = function.name.clone();

        Func::new(&mut self.store, ty, move |mut caller: Caller<'_, StoreState>, params, results| {
            let args = params.iter().map(from_val).collect::<Result<Vec<_>, _>>()?;

            let outputs = match guest_memory(&mut caller) {
                Some(memory) => {
                    let mut memory = WasmtimeMemory::new(memory, caller.as_context_mut());
                    handler(&mut memory, &args)
                }
                None => {
                    let mut empty = HeapMemory::new(Pages(0), Pages(0));
                    handler(&mut empty, &args)
                }
            };
            let outputs = outputs.map_err(wasmtime::Error::new)?;

            if outputs.len() != results.len() {
                return Err(wasmtime::Error::new(RuntimeError::trap(format!(
                    "host function {name} returned {} values, expected {}",
                    outputs.len(),
                    results.len()
                ))));
            }
            for (slot, value) in results.iter_mut().zip(outputs) {
                *slot = to_val(value);
            }
            Ok(())
        })
    }

    fn find_table(&mut self, instance: Instance) -> Option<wasmtime::Table> {
        instance
            .get_table(&mut self.store, INDIRECT_FUNCTION_TABLE)
            .or_else(|| instance.exports(&mut self.store).find_map(Export::into_table))
    }
}

impl EngineAdapter for WasmtimeAdapter {
    type Module = CompiledModule;
    type Instance = Instance;
    type Callable = Func;
    type Memory<'a> = WasmtimeMemory<'a>;

    fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        CompiledModule::from_bytes(&self.engine, bytes)
    }

    #[instrument(skip_all, fields(env_id = %self.store.data().env_id))]
    fn instantiate(
        &mut self,
        module: &CompiledModule,
        imports: &HostImports,
    ) -> Result<Instance, RuntimeError> {
        let mut linker: Linker<StoreState> = Linker::new(&self.engine);

        for import in module.inner().imports() {
            let (module_name, name) = (import.module(), import.name());
            match import.ty() {
                ExternType::Func(guest_ty) => {
                    let host = imports.get(module_name, name).ok_or_else(|| {
                        RuntimeError::MissingImport {
                            module: module_name.to_string(),
                            name: name.to_string(),
                        }
                    })?;
                    let guest_sig = signature_of(&guest_ty);
                    if guest_sig.as_ref() != Some(&host.signature) {
                        return Err(RuntimeError::ImportSignatureMismatch {
                            module: module_name.to_string(),
                            name: name.to_string(),
                            expected: host.signature.to_string(),
                            actual: guest_sig.map_or_else(|| format!("{guest_ty:?}"), |s| s.to_string()),
                        });
                    }
                    let func = self.host_func(host);
                    linker
                        .define(&self.store, module_name, name, func)
                        .map_err(|e| RuntimeError::instantiation_failed(e.to_string()))?;
                }
                ExternType::Memory(memory_ty) if module_name == "env" && name == "memory" => {
                    let memory = self.create_memory(&memory_ty)?;
                    linker
                        .define(&self.store, module_name, name, memory)
                        .map_err(|e| RuntimeError::instantiation_failed(e.to_string()))?;
                }
                _ => {
                    return Err(RuntimeError::MissingImport {
                        module: module_name.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }

        debug!("Instantiating module");
        let instance = linker
            .instantiate(&mut self.store, module.inner())
            .map_err(|e| match e.downcast::<RuntimeError>() {
                Ok(fatal) => fatal,
                Err(e) => RuntimeError::instantiation_failed(format!("{e:#}")),
            })?;

        if self.store.data().memory.is_none() {
            self.store.data_mut().memory = instance.get_memory(&mut self.store, "memory");
        }

        info!(
            content_hash = %module.content_hash(),
            has_memory = self.store.data().memory.is_some(),
            "Module instantiated"
        );
        Ok(instance)
    }

    fn export(&mut self, instance: &Instance, name: &str) -> Option<Func> {
        instance.get_func(&mut self.store, name)
    }

    fn memory<'a>(&'a mut self, _instance: &Instance) -> Result<WasmtimeMemory<'a>, RuntimeError> {
        let memory = self
            .store
            .data()
            .memory
            .ok_or_else(|| RuntimeError::missing_export("memory"))?;
        Ok(WasmtimeMemory::new(memory, self.store.as_context_mut()))
    }

    fn grow_table(
        &mut self,
        instance: &Instance,
        delta: u32,
    ) -> Result<Option<IndirectFunctionTableIndex>, RuntimeError> {
        let Some(table) = self.find_table(*instance) else {
            return Ok(None);
        };
        let first = table
            .grow(&mut self.store, u64::from(delta), Ref::Func(None))
            .map_err(|e| RuntimeError::TableGrowFailed {
                reason: e.to_string(),
            })?;
        let first = i32::try_from(first).map_err(|_| RuntimeError::TableGrowFailed {
            reason: format!("table index {first} does not fit in i32"),
        })?;
        debug!(first, delta, "Function table grown");
        Ok(Some(IndirectFunctionTableIndex(first)))
    }

    fn set_table(
        &mut self,
        instance: &Instance,
        index: IndirectFunctionTableIndex,
        function: &HostFunction,
    ) -> Result<(), RuntimeError> {
        let table = self.find_table(*instance).ok_or_else(|| RuntimeError::TableGrowFailed {
            reason: "module exports no function table".to_string(),
        })?;
        let slot = u64::try_from(index.0).map_err(|_| RuntimeError::TableGrowFailed {
            reason: format!("negative table index {index}"),
        })?;
        let func = self.host_func(function);
        table
            .set(&mut self.store, slot, Ref::Func(Some(func)))
            .map_err(|e| RuntimeError::TableGrowFailed {
                reason: format!("setting slot {index} to {}: {e}", function.name),
            })
    }

    fn call(&mut self, callable: &Func, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let params: Vec<Val> = args.iter().copied().map(to_val).collect();
        let result_count = callable.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];

        callable
            .call(&mut self.store, &params, &mut results)
            .map_err(into_runtime_error)?;

        results
            .iter()
            .map(|v| from_val(v).map_err(into_runtime_error))
            .collect()
    }
}

impl WasmtimeAdapter {
    fn create_memory(&mut self, ty: &MemoryType) -> Result<Memory, RuntimeError> {
        let memory = Memory::new(&mut self.store, ty.clone()).map_err(|e| {
            RuntimeError::instantiation_failed(format!("cannot create env.memory: {e}"))
        })?;
        self.store.data_mut().memory = Some(memory);
        debug!(minimum = ty.minimum(), maximum = ?ty.maximum(), "Created imported memory");
        Ok(memory)
    }
}

impl std::fmt::Debug for WasmtimeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeAdapter")
            .field("store", self.store.data())
            .finish_non_exhaustive()
    }
}

fn guest_memory(caller: &mut Caller<'_, StoreState>) -> Option<Memory> {
    caller
        .data()
        .memory
        .or_else(|| caller.get_export("memory").and_then(Extern::into_memory))
}

/// Convert a Wasmtime error into a [`RuntimeError`].
///
/// A [`RuntimeError`] raised by a host function is returned as is; anything
/// else becomes [`RuntimeError::Trap`].
pub fn into_runtime_error(err: wasmtime::Error) -> RuntimeError {
    match err.downcast::<RuntimeError>() {
        Ok(fatal) => {
            error!(error = %fatal, "Host function aborted guest call");
            fatal
        }
        Err(err) => {
            let code = err.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));
            warn!(trap_code = ?code, "Guest call trapped");
            RuntimeError::trap(format!("{err:#}"))
        }
    }
}

fn to_wasmtime_type(ty: &ValType) -> wasmtime::ValType {
    match ty {
        ValType::I32 => wasmtime::ValType::I32,
        ValType::I64 => wasmtime::ValType::I64,
        ValType::F32 => wasmtime::ValType::F32,
        ValType::F64 => wasmtime::ValType::F64,
    }
}

fn to_val(value: Value) -> Val {
    match value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}

fn from_val(val: &Val) -> wasmtime::Result<Value> {
    match *val {
        Val::I32(v) => Ok(Value::I32(v)),
        Val::I64(v) => Ok(Value::I64(v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(bits))),
        _ => Err(wasmtime::Error::new(RuntimeError::trap(
            "reference and vector values cannot cross the host boundary",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMemoryExt;
    use crate::types::WasmPtr;
    use sqlite_wasm_common::EngineConfig;

    fn adapter() -> WasmtimeAdapter {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        WasmtimeAdapter::new(&engine, &MemoryConfig::default())
    }

    #[test]
    fn test_value_conversion() {
        for value in [Value::I32(-3), Value::I64(1 << 40), Value::F32(1.5), Value::F64(-0.25)] {
            assert_eq!(from_val(&to_val(value)).unwrap(), value);
        }
    }

    #[test]
    fn test_memory_via_adapter() {
        let mut adapter = adapter();
        let module = CompiledModule::from_wat(
            &adapter.engine,
            r#"(module (memory (export "memory") 1 3))"#,
        )
        .unwrap();
        let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

        let mut memory = adapter.memory(&instance).unwrap();
        assert_eq!(memory.size_pages(), Pages(1));
        assert_eq!(memory.max_pages(), Pages(3));
        memory.write_i32(WasmPtr::<i32>::new(5), 42).unwrap();
        assert_eq!(memory.read_i32(WasmPtr::<i32>::new(5)).unwrap(), 42);
        assert_eq!(memory.grow(Pages(3)), None);
        assert_eq!(memory.grow(Pages(2)), Some(Pages(1)));
    }

    #[test]
    fn test_missing_memory() {
        let mut adapter = adapter();
        let module = CompiledModule::from_wat(&adapter.engine, "(module)").unwrap();
        let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

        assert!(matches!(
            adapter.memory(&instance),
            Err(RuntimeError::MissingExport { .. })
        ));
        assert_eq!(adapter.grow_table(&instance, 6).unwrap(), None);
    }

    #[test]
    fn test_adapter_debug() {
        let adapter = adapter();
        let debug_str = format!("{adapter:?}");
        assert!(debug_str.contains("WasmtimeAdapter"));
        assert!(debug_str.contains(adapter.env_id()));
    }
}
