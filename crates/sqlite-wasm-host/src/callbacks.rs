//! `sqlite3-callback-manager` trampolines and the callback table builder.
//!
//! SQLite stores C function pointers for its callbacks. The guest wrapper
//! hands it indices into the indirect function table instead, each bound to a
//! host trampoline that looks the real callback up in the environment's
//! [`CallbackStore`] by id or connection pointer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use sqlite_wasm_common::RuntimeError;
use sqlite_wasm_core::types::WASM_SIZEOF_PTR;
use sqlite_wasm_core::{
    Args, CallbackId, CallbackStore, EngineAdapter, FuncSignature, GuestMemory, GuestMemoryExt,
    HostFunction, HostImports, IndirectFunctionTableIndex, SqliteDb, SqliteStatement, SqliteTrace,
    ValType, Value, WasmPtr,
};

use crate::logging::LoggingHost;

/// Import module name.
pub const CALLBACK_MODULE: &str = "sqlite3-callback-manager";

/// `SQLITE_TRACE_STMT`.
pub const SQLITE_TRACE_STMT: u32 = 0x01;
/// `SQLITE_TRACE_PROFILE`.
pub const SQLITE_TRACE_PROFILE: u32 = 0x02;
/// `SQLITE_TRACE_ROW`.
pub const SQLITE_TRACE_ROW: u32 = 0x04;
/// `SQLITE_TRACE_CLOSE`.
pub const SQLITE_TRACE_CLOSE: u32 = 0x08;

use ValType::I32;

/// One trampoline per callback shape SQLite can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// `sqlite3_exec` row callback.
    Exec,
    /// `sqlite3_trace_v2` callback.
    Trace,
    /// `sqlite3_progress_handler` callback.
    Progress,
    /// Collation comparison.
    ComparatorCall,
    /// Collation destructor.
    ComparatorDestroy,
    /// `SQLITE_CONFIG_LOG` callback.
    Logging,
}

impl CallbackKind {
    /// Every kind, in table order.
    pub const ALL: [CallbackKind; 6] = [
        CallbackKind::Exec,
        CallbackKind::Trace,
        CallbackKind::Progress,
        CallbackKind::ComparatorCall,
        CallbackKind::ComparatorDestroy,
        CallbackKind::Logging,
    ];

    /// Import name of the trampoline.
    pub fn import_name(self) -> &'static str {
        match self {
            CallbackKind::Exec => "sqlite3_exec_cb",
            CallbackKind::Trace => "sqlite3_trace_cb",
            CallbackKind::Progress => "sqlite3_progress_cb",
            CallbackKind::ComparatorCall => "sqlite3_comparator_call_cb",
            CallbackKind::ComparatorDestroy => "sqlite3_comparator_destroy",
            CallbackKind::Logging => "sqlite3_logging_cb",
        }
    }

    /// Wasm signature of the trampoline.
    pub fn signature(self) -> FuncSignature {
        match self {
            CallbackKind::Exec | CallbackKind::Trace => FuncSignature::new(&[I32, I32, I32, I32], &[I32]),
            CallbackKind::Progress => FuncSignature::new(&[I32], &[I32]),
            CallbackKind::ComparatorCall => FuncSignature::new(&[I32, I32, I32, I32, I32], &[I32]),
            CallbackKind::ComparatorDestroy => FuncSignature::new(&[I32], &[]),
            CallbackKind::Logging => FuncSignature::new(&[I32, I32, I32], &[]),
        }
    }

    /// Build the trampoline over `store`.
    pub fn trampoline(self, store: &Arc<CallbackStore>) -> HostFunction {
        let store = Arc::clone(store);
        let name = self.import_name();
        let signature = self.signature();
        match self {
            CallbackKind::Exec => HostFunction::new(CALLBACK_MODULE, name, signature, move |memory, args| {
                exec(&store, memory, args).map(|code| vec![Value::I32(code)])
            }),
            CallbackKind::Trace => HostFunction::new(CALLBACK_MODULE, name, signature, move |memory, args| {
                trace_event(&store, memory, args).map(|()| vec![Value::I32(0)])
            }),
            CallbackKind::Progress => HostFunction::new(CALLBACK_MODULE, name, signature, move |_, args| {
                let db = args.ptr::<SqliteDb>(0)?;
                let callback = store
                    .progress_callbacks()
                    .get(db)
                    .ok_or_else(|| RuntimeError::callback_not_registered("progress", db))?;
                Ok(vec![Value::I32(callback(db))])
            }),
            CallbackKind::ComparatorCall => HostFunction::new(CALLBACK_MODULE, name, signature, move |memory, args| {
                compare(&store, memory, args).map(|order| vec![Value::I32(order)])
            }),
            CallbackKind::ComparatorDestroy => HostFunction::new(CALLBACK_MODULE, name, signature, move |_, args| {
                let raw = args.i32(0)?;
                let removed = CallbackId::new(raw).and_then(|id| store.comparators().remove(id));
                if removed.is_none() {
                    warn!(id = raw, "Destroying unknown comparator");
                }
                Ok(Vec::new())
            }),
            CallbackKind::Logging => HostFunction::new(CALLBACK_MODULE, name, signature, move |memory, args| {
                let code = args.i32(1)?;
                let message = memory.read_cstring(args.ptr::<u8>(2)?)?;
                match store.logging_callback() {
                    Some(callback) => callback(code, &message),
                    None => LoggingHost::log_sqlite(code, &message),
                }
                Ok(Vec::new())
            }),
        }
    }
}

fn callback_id(kind: &'static str, raw: i32) -> Result<CallbackId, RuntimeError> {
    CallbackId::new(raw).ok_or_else(|| RuntimeError::callback_not_registered(kind, raw))
}

fn read_string_array(
    memory: &dyn GuestMemory,
    array: WasmPtr<WasmPtr<u8>>,
    count: u32,
) -> Result<Vec<Option<String>>, RuntimeError> {
    (0..count)
        .map(|i| {
            let ptr = memory.read_ptr(array.add_bytes(i * WASM_SIZEOF_PTR))?;
            if ptr.is_null() {
                Ok(None)
            } else {
                memory.read_cstring(ptr).map(Some)
            }
        })
        .collect()
}

fn exec(store: &CallbackStore, memory: &mut dyn GuestMemory, args: &[Value]) -> Result<i32, RuntimeError> {
    let raw = args.i32(0)?;
    let columns = args.u32(1)?;
    let callback = store
        .exec_callbacks()
        .get(callback_id("exec", raw)?)
        .ok_or_else(|| RuntimeError::callback_not_registered("exec", raw))?;

    let values = read_string_array(memory, args.ptr(2)?, columns)?;
    let names = read_string_array(memory, args.ptr(3)?, columns)?
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect::<Vec<_>>();
    trace!(id = raw, columns, "exec callback");
    Ok(callback(&names, &values))
}

fn trace_event(store: &CallbackStore, memory: &mut dyn GuestMemory, args: &[Value]) -> Result<(), RuntimeError> {
    let flags = args.u32(0)?;
    let db = args.ptr::<SqliteDb>(1)?;
    let arg1 = args.ptr::<u8>(2)?;
    let arg2 = args.ptr::<u8>(3)?;
    let callback = store
        .trace_callbacks()
        .get(db)
        .ok_or_else(|| RuntimeError::callback_not_registered("trace", db))?;
    let statement = arg1.cast::<SqliteStatement>();

    if flags & SQLITE_TRACE_STMT != 0 {
        callback(&SqliteTrace::Statement {
            db,
            statement,
            unexpanded_sql: memory.read_cstring(arg2)?,
        });
    }
    if flags & SQLITE_TRACE_PROFILE != 0 {
        let nanos = memory.read_i64(arg2)?;
        callback(&SqliteTrace::Profile {
            db,
            statement,
            elapsed: Duration::from_nanos(u64::try_from(nanos).unwrap_or_default()),
        });
    }
    if flags & SQLITE_TRACE_ROW != 0 {
        callback(&SqliteTrace::Row { db, statement });
    }
    if flags & SQLITE_TRACE_CLOSE != 0 {
        callback(&SqliteTrace::Close { db: arg1.cast() });
    }
    Ok(())
}

fn compare(store: &CallbackStore, memory: &mut dyn GuestMemory, args: &[Value]) -> Result<i32, RuntimeError> {
    let raw = args.i32(0)?;
    let callback = store
        .comparators()
        .get(callback_id("comparator", raw)?)
        .ok_or_else(|| RuntimeError::callback_not_registered("comparator", raw))?;
    let read = |len: usize, ptr: WasmPtr<u8>| -> Result<String, RuntimeError> {
        let bytes = memory.read_bytes(ptr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    };
    let len = |index: usize| -> Result<usize, RuntimeError> {
        let n = args.i32(index)?;
        usize::try_from(n).map_err(|_| RuntimeError::trap(format!("negative comparator string length {n}")))
    };
    let a = read(len(1)?, args.ptr(2)?)?;
    let b = read(len(3)?, args.ptr(4)?)?;
    Ok(callback(&a, &b))
}

/// Offer every trampoline as a `sqlite3-callback-manager` import.
pub fn register(imports: &mut HostImports, store: &Arc<CallbackStore>) {
    imports.extend(CallbackKind::ALL.map(|kind| kind.trampoline(store)));
}

/// Function table slots bound to the callback trampolines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackFunctionIndexes {
    /// `sqlite3_exec` callback.
    pub exec: IndirectFunctionTableIndex,
    /// Trace callback.
    pub trace: IndirectFunctionTableIndex,
    /// Progress callback.
    pub progress: IndirectFunctionTableIndex,
    /// Collation comparison.
    pub comparator_call: IndirectFunctionTableIndex,
    /// Collation destructor.
    pub comparator_destroy: IndirectFunctionTableIndex,
    /// Logging callback.
    pub logging: IndirectFunctionTableIndex,
}

impl CallbackFunctionIndexes {
    /// Slot of `kind`.
    pub fn get(&self, kind: CallbackKind) -> IndirectFunctionTableIndex {
        match kind {
            CallbackKind::Exec => self.exec,
            CallbackKind::Trace => self.trace,
            CallbackKind::Progress => self.progress,
            CallbackKind::ComparatorCall => self.comparator_call,
            CallbackKind::ComparatorDestroy => self.comparator_destroy,
            CallbackKind::Logging => self.logging,
        }
    }

    fn consecutive(first: IndirectFunctionTableIndex) -> Self {
        let at = |offset: i32| IndirectFunctionTableIndex(first.0 + offset);
        Self {
            exec: at(0),
            trace: at(1),
            progress: at(2),
            comparator_call: at(3),
            comparator_destroy: at(4),
            logging: at(5),
        }
    }
}

/// Grow the guest's function table and bind one slot per [`CallbackKind`].
///
/// Returns `None` when the instance exports no table; SQLite then has no
/// way to reach host callbacks, which is only acceptable for modules that
/// never register any.
#[instrument(skip_all)]
pub fn build_callback_table<E: EngineAdapter>(
    adapter: &mut E,
    instance: &E::Instance,
    store: &Arc<CallbackStore>,
) -> Result<Option<CallbackFunctionIndexes>, RuntimeError> {
    let delta = u32::try_from(CallbackKind::ALL.len()).unwrap_or(u32::MAX);
    let Some(first) = adapter.grow_table(instance, delta)? else {
        warn!("Module exports no function table; host callbacks are unavailable");
        return Ok(None);
    };
    let indexes = CallbackFunctionIndexes::consecutive(first);
    for kind in CallbackKind::ALL {
        let index = indexes.get(kind);
        adapter.set_table(instance, index, &kind.trampoline(store))?;
        debug!(callback = kind.import_name(), %index, "Bound callback slot");
    }
    info!(first = first.0, count = delta, "Callback table built");
    Ok(Some(indexes))
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use sqlite_wasm_core::{HeapMemory, Pages};

    use super::*;

    fn memory() -> HeapMemory {
        HeapMemory::new(Pages(1), Pages(1))
    }

    fn call(store: &Arc<CallbackStore>, kind: CallbackKind, memory: &mut HeapMemory, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        kind.trampoline(store).call(memory, args)
    }

    #[test]
    fn test_signatures_match_import_table() {
        let sigs: Vec<String> = CallbackKind::ALL.iter().map(|k| k.signature().to_string()).collect();
        assert_eq!(
            sigs,
            [
                "(i32, i32, i32, i32) -> (i32)",
                "(i32, i32, i32, i32) -> (i32)",
                "(i32) -> (i32)",
                "(i32, i32, i32, i32, i32) -> (i32)",
                "(i32) -> ()",
                "(i32, i32, i32) -> ()",
            ]
        );
    }

    #[test]
    fn test_register_defines_all_imports() {
        let mut imports = HostImports::new();
        register(&mut imports, &Arc::new(CallbackStore::new()));
        assert_eq!(imports.len(), 6);
        assert!(imports.contains(CALLBACK_MODULE, "sqlite3_comparator_destroy"));
    }

    #[test]
    fn test_comparator_lifecycle() {
        let store = Arc::new(CallbackStore::new());
        let id = store
            .comparators()
            .put(Arc::new(|a: &str, b: &str| a.len().cmp(&b.len()) as i32))
            .unwrap();
        let mut memory = memory();
        memory.write_bytes(WasmPtr::<u8>::new(100), b"abc").unwrap();
        memory.write_bytes(WasmPtr::<u8>::new(200), b"de").unwrap();
        let args = [
            Value::I32(id.get()),
            Value::I32(3),
            Value::I32(100),
            Value::I32(2),
            Value::I32(200),
        ];

        let result = call(&store, CallbackKind::ComparatorCall, &mut memory, &args).unwrap();
        assert_eq!(result, vec![Value::I32(1)]);

        call(&store, CallbackKind::ComparatorDestroy, &mut memory, &[Value::I32(id.get())]).unwrap();
        let err = call(&store, CallbackKind::ComparatorCall, &mut memory, &args).unwrap_err();
        assert!(matches!(err, RuntimeError::CallbackNotRegistered { kind: "comparator", .. }));
    }

    #[test]
    fn test_comparator_decodes_invalid_utf8_lossily() {
        let store = Arc::new(CallbackStore::new());
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let id = store
            .comparators()
            .put(Arc::new(move |a: &str, _: &str| {
                *sink.lock() = a.to_string();
                0
            }))
            .unwrap();
        let mut memory = memory();
        memory.write_bytes(WasmPtr::<u8>::new(100), &[b'a', 0xff]).unwrap();

        let args = [Value::I32(id.get()), Value::I32(2), Value::I32(100), Value::I32(0), Value::I32(0)];
        call(&store, CallbackKind::ComparatorCall, &mut memory, &args).unwrap();
        assert_eq!(*seen.lock(), "a\u{fffd}");
    }

    #[test]
    fn test_exec_reads_columns() {
        let store = Arc::new(CallbackStore::new());
        let rows = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rows);
        let id = store
            .exec_callbacks()
            .put(Arc::new(move |names: &[String], values: &[Option<String>]| {
                sink.lock().push((names.to_vec(), values.to_vec()));
                0
            }))
            .unwrap();

        let mut memory = memory();
        memory.write_cstring(WasmPtr::<u8>::new(0x100), "id").unwrap();
        memory.write_cstring(WasmPtr::<u8>::new(0x110), "name").unwrap();
        memory.write_cstring(WasmPtr::<u8>::new(0x120), "1").unwrap();
        memory.write_u32(WasmPtr::<u32>::new(0x200), 0x120).unwrap();
        memory.write_u32(WasmPtr::<u32>::new(0x204), 0).unwrap();
        memory.write_u32(WasmPtr::<u32>::new(0x300), 0x100).unwrap();
        memory.write_u32(WasmPtr::<u32>::new(0x304), 0x110).unwrap();

        let args = [Value::I32(id.get()), Value::I32(2), Value::I32(0x200), Value::I32(0x300)];
        let result = call(&store, CallbackKind::Exec, &mut memory, &args).unwrap();
        assert_eq!(result, vec![Value::I32(0)]);
        assert_eq!(
            rows.lock().as_slice(),
            &[(
                vec!["id".to_string(), "name".to_string()],
                vec![Some("1".to_string()), None]
            )]
        );
    }

    #[test]
    fn test_exec_with_unknown_id() {
        let store = Arc::new(CallbackStore::new());
        let mut memory = memory();
        for id in [0, 7] {
            let args = [Value::I32(id), Value::I32(0), Value::I32(0), Value::I32(0)];
            let err = call(&store, CallbackKind::Exec, &mut memory, &args).unwrap_err();
            assert!(matches!(err, RuntimeError::CallbackNotRegistered { kind: "exec", .. }));
        }
    }

    #[test]
    fn test_trace_fires_each_flag_in_order() {
        let store = Arc::new(CallbackStore::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let db = WasmPtr::<SqliteDb>::new(0x40);
        store
            .trace_callbacks()
            .set(db, Arc::new(move |event: &SqliteTrace| sink.lock().push(event.clone())));

        let mut memory = memory();
        memory.write_cstring(WasmPtr::<u8>::new(0x100), "SELECT 1").unwrap();
        let stmt = [Value::I32(1 | 4), Value::I32(0x40), Value::I32(0x80), Value::I32(0x100)];
        assert_eq!(call(&store, CallbackKind::Trace, &mut memory, &stmt).unwrap(), vec![Value::I32(0)]);

        memory.write_i64(WasmPtr::<i64>::new(0x108), 1_500).unwrap();
        let profile = [Value::I32(2), Value::I32(0x40), Value::I32(0x80), Value::I32(0x108)];
        call(&store, CallbackKind::Trace, &mut memory, &profile).unwrap();

        let close = [Value::I32(8), Value::I32(0x40), Value::I32(0x40), Value::I32(0)];
        call(&store, CallbackKind::Trace, &mut memory, &close).unwrap();

        let statement = WasmPtr::<SqliteStatement>::new(0x80);
        assert_eq!(
            events.lock().as_slice(),
            &[
                SqliteTrace::Statement {
                    db,
                    statement,
                    unexpanded_sql: "SELECT 1".to_string()
                },
                SqliteTrace::Row { db, statement },
                SqliteTrace::Profile {
                    db,
                    statement,
                    elapsed: Duration::from_nanos(1_500)
                },
                SqliteTrace::Close { db },
            ]
        );
    }

    #[test]
    fn test_progress() {
        let store = Arc::new(CallbackStore::new());
        let db = WasmPtr::<SqliteDb>::new(0x40);
        let mut memory = memory();

        let err = call(&store, CallbackKind::Progress, &mut memory, &[Value::I32(0x40)]).unwrap_err();
        assert!(matches!(err, RuntimeError::CallbackNotRegistered { kind: "progress", .. }));

        store.progress_callbacks().set(db, Arc::new(|_: WasmPtr<SqliteDb>| 1));
        let result = call(&store, CallbackKind::Progress, &mut memory, &[Value::I32(0x40)]).unwrap();
        assert_eq!(result, vec![Value::I32(1)]);
    }

    #[test]
    fn test_logging_callback() {
        let store = Arc::new(CallbackStore::new());
        let mut memory = memory();
        memory.write_cstring(WasmPtr::<u8>::new(0x100), "disk I/O error").unwrap();
        let args = [Value::I32(0), Value::I32(10), Value::I32(0x100)];

        call(&store, CallbackKind::Logging, &mut memory, &args).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        store.set_logging_callback(Some(Arc::new(move |code: i32, message: &str| {
            *sink.lock() = Some((code, message.to_string()));
        })));
        call(&store, CallbackKind::Logging, &mut memory, &args).unwrap();
        assert_eq!(*seen.lock(), Some((10, "disk I/O error".to_string())));
    }

    #[test]
    fn test_consecutive_indexes() {
        let indexes = CallbackFunctionIndexes::consecutive(IndirectFunctionTableIndex(10));
        let slots: Vec<i32> = CallbackKind::ALL.iter().map(|&k| indexes.get(k).0).collect();
        assert_eq!(slots, vec![10, 11, 12, 13, 14, 15]);
    }
}
