//! Integration tests for sqlite-wasm-core.
//!
//! These tests drive the Wasmtime adapter through the engine-independent
//! contract:
//! - WAT compilation and instantiation with host imports
//! - Linear memory access and growth
//! - Function table growth and host trampolines reached by `call_indirect`
//! - Error normalization for traps and host-fatal errors

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use sqlite_wasm_common::{EngineConfig, MemoryConfig, RuntimeError};
use sqlite_wasm_core::{
    Args, CompiledModule, EngineAdapter, FuncSignature, GuestMemory, GuestMemoryExt, HostFunction,
    HostImports, Pages, ValType, Value, WasmEngine, WasmPtr, WasmtimeAdapter,
};

/// A fresh adapter and the module compiled from `wat`.
fn setup(wat: &str) -> (WasmtimeAdapter, CompiledModule) {
    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
    (WasmtimeAdapter::new(&engine, &MemoryConfig::default()), module)
}

// ============================================================================
// Test: Stub Module Memory Access
// ============================================================================

#[test]
fn test_stub_module_memory_round_trip() {
    let (mut adapter, module) = setup(r#"
        (module
            (memory (export "memory") 1 4)
            (func (export "noop"))
        )
        "#,
    );
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

    let noop = adapter.export(&instance, "noop").unwrap();
    assert!(adapter.call(&noop, &[]).unwrap().is_empty());

    let mut memory = adapter.memory(&instance).unwrap();
    for addr in [0u32, 4, 1024, 7, 1021] {
        let value = i32::try_from(addr).unwrap() * -3 + 11;
        memory.write_i32(WasmPtr::<i32>::new(addr), value).unwrap();
        assert_eq!(memory.read_i32(WasmPtr::<i32>::new(addr)).unwrap(), value);
    }
}

#[test]
fn test_grow_preserves_last_byte() {
    let (mut adapter, module) = setup(r#"(module (memory (export "memory") 1 4))"#);
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

    let mut memory = adapter.memory(&instance).unwrap();
    let last = WasmPtr::<i8>::new(65_535);
    memory.write_i8(last, 0x5a).unwrap();

    assert_eq!(memory.grow(Pages(1)), Some(Pages(1)));
    assert_eq!(memory.size_pages(), Pages(2));
    assert_eq!(memory.read_i8(last).unwrap(), 0x5a);
    assert_eq!(memory.read_i8(WasmPtr::<i8>::new(65_536)).unwrap(), 0);
}

#[test]
fn test_out_of_bounds_is_fatal() {
    let (mut adapter, module) = setup(r#"(module (memory (export "memory") 1))"#);
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

    let memory = adapter.memory(&instance).unwrap();
    let err = memory.read_i64(WasmPtr::<i64>::new(65_532)).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::MemoryAccessOutOfBounds { addr: 65_532, len: 8, memory_size: 65_536 }
    ));
}

#[test]
fn test_imported_memory() {
    let (mut adapter, module) = setup(r#"
        (module
            (import "env" "memory" (memory 2))
            (func (export "load") (param i32) (result i32)
                (i32.load (local.get 0)))
        )
        "#,
    );
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

    adapter
        .memory(&instance)
        .unwrap()
        .write_i32(WasmPtr::<i32>::new(70_000), 1234)
        .unwrap();

    let load = adapter.export(&instance, "load").unwrap();
    let result = adapter.call(&load, &[Value::I32(70_000)]).unwrap();
    assert_eq!(result, vec![Value::I32(1234)]);
}

// ============================================================================
// Test: Host Imports
// ============================================================================

#[test]
fn test_host_function_reads_guest_memory() {
    let seen = Arc::new(AtomicI32::new(0));
    let seen_in_handler = Arc::clone(&seen);

    let mut imports = HostImports::new();
    imports.define(HostFunction::new(
        "env",
        "report",
        FuncSignature::new(&[ValType::I32], &[ValType::I32]),
        move |memory, args| {
            let value = memory.read_i32(args.ptr::<i32>(0)?)?;
            seen_in_handler.store(value, Ordering::SeqCst);
            Ok(vec![Value::I32(value * 2)])
        },
    ));

    let (mut adapter, module) = setup(r#"
        (module
            (import "env" "report" (func $report (param i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "\2a\00\00\00")
            (func (export "run") (result i32)
                (call $report (i32.const 16)))
        )
        "#,
    );
    let instance = adapter.instantiate(&module, &imports).unwrap();
    let run = adapter.export(&instance, "run").unwrap();

    assert_eq!(adapter.call(&run, &[]).unwrap(), vec![Value::I32(84)]);
    assert_eq!(seen.load(Ordering::SeqCst), 42);
}

#[test]
fn test_missing_import_fails_before_running() {
    let (mut adapter, module) = setup(r#"
        (module
            (import "wasi_snapshot_preview1" "fd_close" (func (param i32) (result i32)))
        )
        "#,
    );

    let err = adapter.instantiate(&module, &HostImports::new()).unwrap_err();
    assert!(err.is_link_error());
    assert!(matches!(
        err,
        RuntimeError::MissingImport { ref module, ref name }
            if module == "wasi_snapshot_preview1" && name == "fd_close"
    ));
}

#[test]
fn test_import_signature_mismatch() {
    let mut imports = HostImports::new();
    imports.define(HostFunction::new(
        "env",
        "f",
        FuncSignature::new(&[ValType::I32], &[]),
        |_, _| Ok(Vec::new()),
    ));

    let (mut adapter, module) = setup(r#"(module (import "env" "f" (func (param i64))))"#);

    let err = adapter.instantiate(&module, &imports).unwrap_err();
    match err {
        RuntimeError::ImportSignatureMismatch { expected, actual, .. } => {
            assert_eq!(expected, "(i32) -> ()");
            assert_eq!(actual, "(i64) -> ()");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Test: Error Normalization
// ============================================================================

#[test]
fn test_trap_unreachable() {
    let (mut adapter, module) = setup(r#"(module (func (export "boom") unreachable))"#);
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();
    let boom = adapter.export(&instance, "boom").unwrap();

    let err = adapter.call(&boom, &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::Trap { .. }), "got {err:?}");
}

#[test]
fn test_fatal_host_error_survives_trap() {
    let mut imports = HostImports::new();
    imports.define(HostFunction::new(
        "env",
        "exit",
        FuncSignature::new(&[ValType::I32], &[]),
        |_, args| Err(RuntimeError::GuestExit { code: args.i32(0)? }),
    ));

    let (mut adapter, module) = setup(r#"
        (module
            (import "env" "exit" (func $exit (param i32)))
            (func (export "main") (call $exit (i32.const 3)))
        )
        "#,
    );
    let instance = adapter.instantiate(&module, &imports).unwrap();
    let main = adapter.export(&instance, "main").unwrap();

    let err = adapter.call(&main, &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::GuestExit { code: 3 }), "got {err:?}");
}

// ============================================================================
// Test: Function Table
// ============================================================================

#[test]
fn test_table_slot_bound_to_host_function() {
    let (mut adapter, module) = setup(r#"
        (module
            (type $binary (func (param i32 i32) (result i32)))
            (table (export "__indirect_function_table") 1 funcref)
            (func (export "invoke") (param i32 i32 i32) (result i32)
                (call_indirect (type $binary) (local.get 1) (local.get 2) (local.get 0)))
        )
        "#,
    );
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

    let first = adapter.grow_table(&instance, 2).unwrap().unwrap();
    assert_eq!(first.0, 1);

    let add = HostFunction::new(
        "sqlite3-callback-manager",
        "add",
        FuncSignature::new(&[ValType::I32, ValType::I32], &[ValType::I32]),
        |_, args| Ok(vec![Value::I32(args.i32(0)? + args.i32(1)?)]),
    );
    adapter.set_table(&instance, first, &add).unwrap();

    let invoke = adapter.export(&instance, "invoke").unwrap();
    let result = adapter
        .call(&invoke, &[Value::I32(first.0), Value::I32(40), Value::I32(2)])
        .unwrap();
    assert_eq!(result, vec![Value::I32(42)]);

    // The second new slot is still null.
    let err = adapter
        .call(&invoke, &[Value::I32(first.0 + 1), Value::I32(0), Value::I32(0)])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Trap { .. }));
}

#[test]
fn test_first_exported_table_used_as_fallback() {
    let (mut adapter, module) = setup(r#"(module (table (export "tbl") 3 funcref))"#,
    );
    let instance = adapter.instantiate(&module, &HostImports::new()).unwrap();

    let first = adapter.grow_table(&instance, 6).unwrap();
    assert_eq!(first.map(|i| i.0), Some(3));
}
