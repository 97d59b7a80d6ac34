//! Integration tests for sqlite-wasm-host.
//!
//! WAT guests stand in for an Emscripten build of SQLite and are driven
//! through the Wasmtime adapter:
//! - Environment assembly, start-up and teardown
//! - Syscalls reached from guest code (files, stdio, clocks, heap growth)
//! - Callback trampolines reached by `call_indirect`
//! - Link-time and guest-termination errors

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sqlite_wasm_common::{EngineConfig, HostConfig, MemoryConfig, RuntimeError};
use sqlite_wasm_core::stack::STACK_COOKIE_1;
use sqlite_wasm_core::{
    CompiledModule, FuncSignature, GuestMemory, GuestMemoryExt, HostFunction,
    Pages, SqliteDb, SqliteTrace, ValType, Value, WasmEngine, WasmPtr, WasmtimeAdapter,
};
use sqlite_wasm_host::{
    EmbedderHost, LocalTime, SqliteWasmEnvironment, SqliteWasmEnvironmentBuilder, SystemHost,
    TimeZoneInfo,
};

type Environment = SqliteWasmEnvironment<WasmtimeAdapter>;

/// A builder over a fresh Wasmtime adapter and the module compiled from `wat`.
fn builder(wat: &str) -> (SqliteWasmEnvironmentBuilder<WasmtimeAdapter>, CompiledModule) {
    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
    let adapter = WasmtimeAdapter::new(&engine, &MemoryConfig::default());
    (SqliteWasmEnvironment::builder(adapter), module)
}

fn host_config(dir: &Path) -> HostConfig {
    HostConfig {
        working_dir: Some(dir.to_path_buf()),
        forward_stdio: false,
        ..Default::default()
    }
}

fn build(wat: &str, dir: &Path) -> Result<Environment, RuntimeError> {
    let (builder, module) = builder(wat);
    builder.host_config(host_config(dir)).build(&module)
}

fn call_i32(env: &mut Environment, name: &str, args: &[Value]) -> i32 {
    env.call_export(name, args).unwrap()[0].as_i32().unwrap()
}

/// Embedder with a fixed clock that captures guest stdout.
struct CapturingHost {
    system: SystemHost,
    stdout: Mutex<Vec<u8>>,
}

impl CapturingHost {
    fn new(dir: &Path) -> Self {
        Self {
            system: SystemHost::new(host_config(dir)),
            stdout: Mutex::new(Vec::new()),
        }
    }
}

impl EmbedderHost for CapturingHost {
    fn environment(&self) -> Vec<(String, String)> {
        vec![("LANG".to_string(), "C".to_string())]
    }

    fn wall_clock(&self) -> Duration {
        Duration::from_secs(1_700_000_000)
    }

    fn monotonic_clock(&self) -> Duration {
        Duration::from_millis(1_500)
    }

    fn fill_entropy(&self, buf: &mut [u8]) -> io::Result<()> {
        buf.fill(0xab);
        Ok(())
    }

    fn local_time(&self, epoch_secs: i64) -> LocalTime {
        self.system.local_time(epoch_secs)
    }

    fn timezone(&self) -> TimeZoneInfo {
        TimeZoneInfo::from_offsets(0, 0)
    }

    fn current_dir(&self) -> io::Result<PathBuf> {
        self.system.current_dir()
    }

    fn write_stdout(&self, data: &[u8]) {
        self.stdout.lock().extend_from_slice(data);
    }

    fn write_stderr(&self, _data: &[u8]) {}
}

// ============================================================================
// Test: Environment Assembly
// ============================================================================

#[test]
fn test_stub_module_builds() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(
        r#"
        (module
            (memory (export "memory") 1 4)
            (func (export "noop"))
        )
        "#,
        dir.path(),
    )
    .unwrap();

    assert!(env.exports().is_empty());
    assert!(env.callback_indexes().is_none());
    assert_eq!(env.runtime().stack_end(), None);
    assert!(env.call_export("noop", &[]).unwrap().is_empty());

    let mut memory = env.memory().unwrap();
    memory.write_i32(WasmPtr::<i32>::new(13), -77).unwrap();
    assert_eq!(memory.read_i32(WasmPtr::<i32>::new(13)).unwrap(), -77);
}

#[test]
fn test_sqlite_exports_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(
        r#"
        (module
            (memory (export "memory") 1)
            (func (export "sqlite3_libversion_number") (result i32) (i32.const 3046001))
            (func (export "malloc") (param i32) (result i32) (i32.const 4096))
        )
        "#,
        dir.path(),
    )
    .unwrap();

    assert_eq!(env.exports().len(), 2);
    let version = env.exports().sqlite3_libversion_number().unwrap().clone();
    assert_eq!(env.call(&version, &[]).unwrap(), vec![Value::I32(3_046_001)]);
    assert!(matches!(
        env.exports().sqlite3_open_v2(),
        Err(RuntimeError::MissingExport { .. })
    ));
    assert!(matches!(
        env.call_export("sqlite3_step", &[]),
        Err(RuntimeError::MissingExport { .. })
    ));
}

#[test]
fn test_missing_import_fails_build() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(
        r#"(module (import "env" "not_a_real_import" (func)))"#,
        dir.path(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::MissingImport { ref module, ref name } if module == "env" && name == "not_a_real_import"
    ));
    assert!(err.is_link_error());
}

#[test]
fn test_callback_import_signature_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(
        r#"
        (module
            (import "sqlite3-callback-manager" "sqlite3_progress_cb" (func (param i64) (result i32)))
        )
        "#,
        dir.path(),
    )
    .unwrap_err();

    assert!(matches!(err, RuntimeError::ImportSignatureMismatch { .. }));
}

#[test]
fn test_import_override() {
    let dir = tempfile::tempdir().unwrap();
    let (builder, module) = builder(
        r#"
        (module
            (import "env" "emscripten_get_now" (func $now (result f64)))
            (memory (export "memory") 1)
            (func (export "now") (result f64) (call $now))
        )
        "#,
    );
    let mut env = builder
        .host_config(host_config(dir.path()))
        .import(HostFunction::new(
            "env",
            "emscripten_get_now",
            FuncSignature::new(&[], &[ValType::F64]),
            |_, _| Ok(vec![Value::F64(42.5)]),
        ))
        .build(&module)
        .unwrap();

    assert_eq!(env.call_export("now", &[]).unwrap(), vec![Value::F64(42.5)]);
}

// ============================================================================
// Test: Emscripten Start-up
// ============================================================================

const STARTUP_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (global $ctors (mut i32) (i32.const 0))
        (func (export "emscripten_stack_init"))
        (func (export "emscripten_stack_get_end") (result i32) (i32.const 1024))
        (func (export "_initialize") (global.set $ctors (i32.const 2)))
        (func (export "__wasm_call_ctors") (global.set $ctors (i32.const 1)))
        (func (export "ctors_ran") (result i32) (global.get $ctors))
        (func (export "smash_stack") (i32.store (i32.const 1024) (i32.const 0)))
    )
"#;

#[test]
fn test_startup_writes_stack_cookie() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(STARTUP_WAT, dir.path()).unwrap();

    assert_eq!(env.runtime().stack_end(), Some(WasmPtr::new(1024)));
    assert_eq!(call_i32(&mut env, "ctors_ran", &[]), 2);
    let cookie = env.memory().unwrap().read_u32(WasmPtr::<u32>::new(1024)).unwrap();
    assert_eq!(cookie, STACK_COOKIE_1);
    env.check_stack_cookie().unwrap();

    env.call_export("smash_stack", &[]).unwrap();
    let err = env.check_stack_cookie().unwrap_err();
    assert!(matches!(err, RuntimeError::StackOverflow { address: 1024, cookie1: 0, .. }));
}

#[test]
fn test_startup_can_be_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (builder, module) = builder(STARTUP_WAT);
    let mut env = builder
        .host_config(host_config(dir.path()))
        .run_initializers(false)
        .build(&module)
        .unwrap();

    assert_eq!(call_i32(&mut env, "ctors_ran", &[]), 0);
    env.check_stack_cookie().unwrap();
}

// ============================================================================
// Test: Syscalls From Guest Code
// ============================================================================

#[test]
fn test_guest_creates_and_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(
        r#"
        (module
            (import "env" "__syscall_openat" (func $openat (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "notes.txt\00")
            (data (i32.const 32) "hello, wasm\n")
            (func (export "write_file") (result i32)
                (local $fd i32)
                (i32.store (i32.const 64) (i32.const 420))
                (local.set $fd
                    (call $openat (i32.const -100) (i32.const 16) (i32.const 66) (i32.const 64)))
                (if (i32.lt_s (local.get $fd) (i32.const 0))
                    (then (return (local.get $fd))))
                (i32.store (i32.const 80) (i32.const 32))
                (i32.store (i32.const 84) (i32.const 12))
                (drop (call $fd_write (local.get $fd) (i32.const 80) (i32.const 1) (i32.const 96)))
                (i32.load (i32.const 96)))
        )
        "#,
        dir.path(),
    )
    .unwrap();

    assert_eq!(call_i32(&mut env, "write_file", &[]), 12);
    assert_eq!(env.syscalls().fs.open_count(), 1);
    assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"hello, wasm\n");

    env.close();
}

#[test]
fn test_guest_open_missing_file_gets_errno() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(
        r#"
        (module
            (import "env" "__syscall_openat" (func $openat (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "absent.db\00")
            (func (export "open_ro") (result i32)
                (call $openat (i32.const -100) (i32.const 16) (i32.const 0) (i32.const 0)))
        )
        "#,
        dir.path(),
    )
    .unwrap();

    assert_eq!(call_i32(&mut env, "open_ro", &[]), -44);
    assert_eq!(env.syscalls().fs.open_count(), 0);
}

#[test]
fn test_stdout_and_clock_go_through_embedder() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(CapturingHost::new(dir.path()));
    let (builder, module) = builder(
        r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "clock_time_get" (func $clock (param i32 i64 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 32) "SQLite 3.46\n")
            (func (export "print") (result i32)
                (i32.store (i32.const 80) (i32.const 32))
                (i32.store (i32.const 84) (i32.const 12))
                (call $fd_write (i32.const 1) (i32.const 80) (i32.const 1) (i32.const 96)))
            (func (export "now") (result i64)
                (drop (call $clock (i32.const 0) (i64.const 1000) (i32.const 200)))
                (i64.load (i32.const 200)))
        )
        "#,
    );
    let mut env = builder.embedder(host.clone()).build(&module).unwrap();

    assert_eq!(call_i32(&mut env, "print", &[]), 0);
    assert_eq!(host.stdout.lock().as_slice(), b"SQLite 3.46\n");
    assert_eq!(
        env.call_export("now", &[]).unwrap(),
        vec![Value::I64(1_700_000_000_000_000_000)]
    );
}

#[test]
fn test_guest_heap_growth() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(
        r#"
        (module
            (import "env" "emscripten_resize_heap" (func $resize (param i32) (result i32)))
            (memory (export "memory") 1 8)
            (func (export "grow") (param i32) (result i32) (call $resize (local.get 0)))
            (func (export "pages") (result i32) (memory.size))
        )
        "#,
        dir.path(),
    )
    .unwrap();

    assert_eq!(call_i32(&mut env, "grow", &[Value::I32(200_000)]), 1);
    assert_eq!(call_i32(&mut env, "pages", &[]), 4);
    assert_eq!(env.memory().unwrap().size_pages(), Pages(4));

    assert_eq!(call_i32(&mut env, "grow", &[Value::I32(8 * 65_536 + 1)]), -48);
    assert_eq!(call_i32(&mut env, "pages", &[]), 4);
}

#[test]
fn test_guest_exit_and_abort() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(
        r#"
        (module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (import "env" "__assert_fail" (func $assert (param i32 i32 i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "db != 0\00")
            (data (i32.const 32) "main.c\00")
            (data (i32.const 48) "open_db\00")
            (func (export "main") (call $exit (i32.const 3)))
            (func (export "check")
                (call $assert (i32.const 16) (i32.const 32) (i32.const 7) (i32.const 48)))
        )
        "#,
        dir.path(),
    )
    .unwrap();

    let err = env.call_export("main", &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::GuestExit { code: 3 }));
    assert!(err.is_guest_termination());

    let err = env.call_export("check", &[]).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::GuestAbort { ref message } if message == "Assertion failed: db != 0, at: main.c:7 (open_db)"
    ));
}

// ============================================================================
// Test: Callback Trampolines
// ============================================================================

const CALLBACK_WAT: &str = r#"
    (module
        (type $cmp (func (param i32 i32 i32 i32 i32) (result i32)))
        (type $destroy (func (param i32)))
        (type $progress (func (param i32) (result i32)))
        (type $trace (func (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (table (export "__indirect_function_table") 1 funcref)
        (data (i32.const 100) "apple")
        (data (i32.const 200) "banana")
        (func (export "compare") (param $slot i32) (param $id i32) (result i32)
            (call_indirect (type $cmp)
                (local.get $id) (i32.const 5) (i32.const 100) (i32.const 6) (i32.const 200)
                (local.get $slot)))
        (func (export "destroy") (param $slot i32) (param $id i32)
            (call_indirect (type $destroy) (local.get $id) (local.get $slot)))
        (func (export "progress") (param $slot i32) (param $db i32) (result i32)
            (call_indirect (type $progress) (local.get $db) (local.get $slot)))
        (func (export "trace") (param $slot i32) (param $flags i32) (param $db i32) (result i32)
            (call_indirect (type $trace)
                (local.get $flags) (local.get $db) (i32.const 0x80) (i32.const 200)
                (local.get $slot)))
    )
"#;

#[test]
fn test_callback_table_layout() {
    let dir = tempfile::tempdir().unwrap();
    let env = build(CALLBACK_WAT, dir.path()).unwrap();

    let indexes = *env.callback_indexes().unwrap();
    assert_eq!(indexes.exec.0, 1);
    assert_eq!(indexes.logging.0, 6);
}

#[test]
fn test_comparator_through_function_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(CALLBACK_WAT, dir.path()).unwrap();
    let slots = *env.callback_indexes().unwrap();
    let id = env
        .callback_store()
        .comparators()
        .put(Arc::new(|a: &str, b: &str| a.cmp(b) as i32))
        .unwrap();

    let args = [Value::I32(slots.comparator_call.0), Value::I32(id.get())];
    assert_eq!(call_i32(&mut env, "compare", &args), -1);

    env.call_export("destroy", &[Value::I32(slots.comparator_destroy.0), Value::I32(id.get())])
        .unwrap();
    let err = env.call_export("compare", &args).unwrap_err();
    assert!(matches!(err, RuntimeError::CallbackNotRegistered { kind: "comparator", .. }));
}

#[test]
fn test_progress_and_trace_through_function_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = build(CALLBACK_WAT, dir.path()).unwrap();
    let slots = *env.callback_indexes().unwrap();
    let db = WasmPtr::<SqliteDb>::new(0x40);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    env.callback_store().progress_callbacks().set(db, Arc::new(|_: WasmPtr<SqliteDb>| 1));
    env.callback_store()
        .trace_callbacks()
        .set(db, Arc::new(move |event: &SqliteTrace| sink.lock().push(event.clone())));

    let progress = [Value::I32(slots.progress.0), Value::I32(0x40)];
    assert_eq!(call_i32(&mut env, "progress", &progress), 1);

    let trace = [Value::I32(slots.trace.0), Value::I32(1 | 4), Value::I32(0x40)];
    assert_eq!(call_i32(&mut env, "trace", &trace), 0);
    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        SqliteTrace::Statement { unexpanded_sql, .. } if unexpanded_sql == "banana"
    ));
    assert!(matches!(events[1], SqliteTrace::Row { .. }));
}

#[test]
fn test_teardown_clears_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let env = build(CALLBACK_WAT, dir.path()).unwrap();
    let store = Arc::clone(env.callback_store());

    store.comparators().put(Arc::new(|_: &str, _: &str| 0)).unwrap();
    assert_eq!(store.comparators().len(), 1);

    drop(env);
    assert!(store.comparators().is_empty());
}

#[test]
fn test_environments_do_not_share_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = build(CALLBACK_WAT, dir.path()).unwrap();
    let second = build(CALLBACK_WAT, dir.path()).unwrap();
    assert!(!Arc::ptr_eq(first.callback_store(), second.callback_store()));

    let slots = *first.callback_indexes().unwrap();
    let id = first
        .callback_store()
        .comparators()
        .put(Arc::new(|a: &str, b: &str| a.cmp(b) as i32))
        .unwrap();
    assert!(second.callback_store().comparators().is_empty());

    drop(second);
    let args = [Value::I32(slots.comparator_call.0), Value::I32(id.get())];
    assert_eq!(call_i32(&mut first, "compare", &args), -1);
}
