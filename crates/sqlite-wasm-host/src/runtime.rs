//! Emscripten runtime start-up.
//!
//! A module built with `-sSTANDALONE_WASM` or as a reactor expects its host
//! to set up the stack, run static constructors and keep an eye on the stack
//! cookie. [`EmscriptenRuntime::initialize`] does this in the order the
//! Emscripten JS glue uses:
//!
//! 1. `emscripten_stack_init`
//! 2. write the stack cookie at `emscripten_stack_get_end()`
//! 3. `_initialize` (reactor) or `__wasm_call_ctors`
//! 4. check the stack cookie

use tracing::{debug, info, instrument};

use sqlite_wasm_common::RuntimeError;
use sqlite_wasm_core::stack::{check_stack_cookie, write_stack_cookie};
use sqlite_wasm_core::{EngineAdapter, Value, WasmPtr};

/// Export that sets up the stack pointer and limits.
pub const STACK_INIT: &str = "emscripten_stack_init";
/// Export returning the lowest stack address.
pub const STACK_GET_END: &str = "emscripten_stack_get_end";
/// Reactor entry point.
pub const INITIALIZE: &str = "_initialize";
/// Static constructors.
pub const WASM_CALL_CTORS: &str = "__wasm_call_ctors";

/// State of the Emscripten runtime after start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmscriptenRuntime {
    stack_end: Option<WasmPtr<u8>>,
}

impl EmscriptenRuntime {
    /// Run the start-up sequence.
    ///
    /// Every step is skipped when the module lacks the export it needs, so
    /// plain (non-Emscripten) modules initialize to a runtime without a
    /// stack guard.
    #[instrument(skip_all)]
    pub fn initialize<E: EngineAdapter>(adapter: &mut E, instance: &E::Instance) -> Result<Self, RuntimeError> {
        if let Some(init) = adapter.export(instance, STACK_INIT) {
            adapter.call(&init, &[])?;
            debug!("Stack initialized");
        }

        let stack_end = match adapter.export(instance, STACK_GET_END) {
            Some(get_end) => {
                let end = first_i32(&adapter.call(&get_end, &[])?, STACK_GET_END)?;
                let end = WasmPtr::from_i32(end);
                write_stack_cookie(&mut adapter.memory(instance)?, end)?;
                Some(end)
            }
            None => None,
        };
        let runtime = Self { stack_end };

        let ctors = adapter
            .export(instance, INITIALIZE)
            .map(|f| (INITIALIZE, f))
            .or_else(|| adapter.export(instance, WASM_CALL_CTORS).map(|f| (WASM_CALL_CTORS, f)));
        if let Some((name, ctors)) = ctors {
            adapter.call(&ctors, &[])?;
            debug!(export = name, "Constructors ran");
        }

        runtime.check_stack_cookie(adapter, instance)?;
        info!(stack_end = ?runtime.stack_end, "Emscripten runtime initialized");
        Ok(runtime)
    }

    /// Lowest stack address, if the module reported one.
    pub fn stack_end(&self) -> Option<WasmPtr<u8>> {
        self.stack_end
    }

    /// Verify the stack cookie; a no-op without a stack guard.
    pub fn check_stack_cookie<E: EngineAdapter>(&self, adapter: &mut E, instance: &E::Instance) -> Result<(), RuntimeError> {
        match self.stack_end {
            Some(end) => check_stack_cookie(&adapter.memory(instance)?, end),
            None => Ok(()),
        }
    }
}

fn first_i32(results: &[Value], export: &str) -> Result<i32, RuntimeError> {
    results
        .first()
        .and_then(Value::as_i32)
        .ok_or_else(|| RuntimeError::trap(format!("{export} returned {results:?}, expected an i32")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_i32() {
        assert_eq!(first_i32(&[Value::I32(1024)], STACK_GET_END).unwrap(), 1024);
        assert!(first_i32(&[], STACK_GET_END).is_err());
        assert!(first_i32(&[Value::I64(1)], STACK_GET_END).is_err());
    }

    #[test]
    fn test_default_has_no_guard() {
        assert_eq!(EmscriptenRuntime::default().stack_end(), None);
    }
}
