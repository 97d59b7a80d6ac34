//! Registry of host callbacks the guest refers to by number.
//!
//! SQLite hands C function pointers back to the embedding for comparators,
//! `sqlite3_exec` rows, tracing, progress and logging. Inside the guest those
//! pointers are fixed trampoline slots; the trampoline finds the actual host
//! closure here, keyed either by a small [`CallbackId`] or by the connection
//! pointer.
//!
//! Every operation holds a lock only for the map access itself. Callbacks are
//! stored as `Arc`s and cloned out before they run, so a callback that calls
//! back into the guest (and from there into another trampoline) never
//! deadlocks on this store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use sqlite_wasm_common::RuntimeError;

use crate::types::{CallbackId, SqliteDb, SqliteStatement, WasmPtr};

/// Collation comparator: returns negative, zero or positive like `strcmp`.
pub type ComparatorCallback = Arc<dyn Fn(&str, &str) -> i32 + Send + Sync>;

/// `sqlite3_exec` row callback; non-zero aborts the statement.
pub type ExecCallback = Arc<dyn Fn(&[String], &[Option<String>]) -> i32 + Send + Sync>;

/// `sqlite3_trace_v2` callback.
pub type TraceCallback = Arc<dyn Fn(&SqliteTrace) + Send + Sync>;

/// `sqlite3_progress_handler` callback; non-zero interrupts the operation.
pub type ProgressCallback = Arc<dyn Fn(WasmPtr<SqliteDb>) -> i32 + Send + Sync>;

/// `SQLITE_CONFIG_LOG` callback receiving the result code and message.
pub type LoggingCallback = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// One `sqlite3_trace_v2` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTrace {
    /// A prepared statement starts running.
    Statement {
        /// Connection.
        db: WasmPtr<SqliteDb>,
        /// Statement.
        statement: WasmPtr<SqliteStatement>,
        /// SQL text as prepared.
        unexpanded_sql: String,
    },
    /// A statement finished.
    Profile {
        /// Connection.
        db: WasmPtr<SqliteDb>,
        /// Statement.
        statement: WasmPtr<SqliteStatement>,
        /// Wall-clock run time.
        elapsed: Duration,
    },
    /// A statement produced a row.
    Row {
        /// Connection.
        db: WasmPtr<SqliteDb>,
        /// Statement.
        statement: WasmPtr<SqliteStatement>,
    },
    /// A connection closed.
    Close {
        /// Connection.
        db: WasmPtr<SqliteDb>,
    },
}

struct IdMapInner<V> {
    counter: i32,
    max_id: i32,
    entries: HashMap<CallbackId, V>,
}

/// Map from freshly allocated [`CallbackId`]s to values.
///
/// Ids come from a rotating counter starting at 1. Allocation scans forward
/// from the counter, skipping ids still in use, and wraps from the largest id
/// back to 1; `0` is never issued.
pub struct IdMap<V> {
    inner: Mutex<IdMapInner<V>>,
}

impl<V: Clone> IdMap<V> {
    /// Create an empty map using the full positive `i32` id range.
    pub fn new() -> Self {
        Self::with_max_id(i32::MAX)
    }

    fn with_max_id(max_id: i32) -> Self {
        Self {
            inner: Mutex::new(IdMapInner {
                counter: 1,
                max_id,
                entries: HashMap::new(),
            }),
        }
    }

    /// Store `value` under a new id.
    pub fn put(&self, value: V) -> Result<CallbackId, RuntimeError> {
        let mut inner = self.inner.lock();
        let id = inner.allocate()?;
        inner.entries.insert(id, value);
        Ok(id)
    }

    /// Clone out the value registered under `id`.
    pub fn get(&self, id: CallbackId) -> Option<V> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Remove and return the value registered under `id`.
    pub fn remove(&self, id: CallbackId) -> Option<V> {
        self.inner.lock().entries.remove(&id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

impl<V: Clone> Default for IdMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IdMapInner<V> {
    fn next_id(&self, id: i32) -> i32 {
        if id >= self.max_id { 1 } else { id + 1 }
    }

    fn allocate(&mut self) -> Result<CallbackId, RuntimeError> {
        let start = self.counter;
        let mut id = start;
        loop {
            let candidate = CallbackId::new(id).ok_or(RuntimeError::CallbackIdsExhausted)?;
            if !self.entries.contains_key(&candidate) {
                self.counter = self.next_id(id);
                return Ok(candidate);
            }
            id = self.next_id(id);
            if id == start {
                return Err(RuntimeError::CallbackIdsExhausted);
            }
        }
    }
}

/// Map keyed by connection pointer; at most one value per connection.
pub struct PointerMap<V> {
    entries: DashMap<WasmPtr<SqliteDb>, V>,
}

impl<V: Clone> PointerMap<V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Clone out the value for `db`.
    pub fn get(&self, db: WasmPtr<SqliteDb>) -> Option<V> {
        self.entries.get(&db).map(|entry| entry.value().clone())
    }

    /// Register `value` for `db`, returning the value it replaces.
    pub fn set(&self, db: WasmPtr<SqliteDb>, value: V) -> Option<V> {
        self.entries.insert(db, value)
    }

    /// Remove the value for `db`.
    pub fn remove(&self, db: WasmPtr<SqliteDb>) -> Option<V> {
        self.entries.remove(&db).map(|(_, value)| value)
    }

    /// Number of connections with a registration.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every host callback one environment's guest can reach.
pub struct CallbackStore {
    comparators: IdMap<ComparatorCallback>,
    exec_callbacks: IdMap<ExecCallback>,
    trace_callbacks: PointerMap<TraceCallback>,
    progress_callbacks: PointerMap<ProgressCallback>,
    logging_callback: Mutex<Option<LoggingCallback>>,
}

impl CallbackStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            comparators: IdMap::new(),
            exec_callbacks: IdMap::new(),
            trace_callbacks: PointerMap::new(),
            progress_callbacks: PointerMap::new(),
            logging_callback: Mutex::new(None),
        }
    }

    /// Collation comparators, referenced by id.
    pub fn comparators(&self) -> &IdMap<ComparatorCallback> {
        &self.comparators
    }

    /// `sqlite3_exec` callbacks, referenced by id.
    pub fn exec_callbacks(&self) -> &IdMap<ExecCallback> {
        &self.exec_callbacks
    }

    /// Trace callbacks, one per connection.
    pub fn trace_callbacks(&self) -> &PointerMap<TraceCallback> {
        &self.trace_callbacks
    }

    /// Progress callbacks, one per connection.
    pub fn progress_callbacks(&self) -> &PointerMap<ProgressCallback> {
        &self.progress_callbacks
    }

    /// The logging callback, if one is registered.
    pub fn logging_callback(&self) -> Option<LoggingCallback> {
        self.logging_callback.lock().clone()
    }

    /// Replace the logging callback; `None` unregisters it.
    pub fn set_logging_callback(&self, callback: Option<LoggingCallback>) -> Option<LoggingCallback> {
        std::mem::replace(&mut *self.logging_callback.lock(), callback)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        trace!("Clearing callback store");
        self.comparators.clear();
        self.exec_callbacks.clear();
        self.trace_callbacks.entries.clear();
        self.progress_callbacks.entries.clear();
        *self.logging_callback.lock() = None;
    }
}

impl Default for CallbackStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStore")
            .field("comparators", &self.comparators.len())
            .field("exec_callbacks", &self.exec_callbacks.len())
            .field("trace_callbacks", &self.trace_callbacks.len())
            .field("progress_callbacks", &self.progress_callbacks.len())
            .field("logging_callback", &self.logging_callback.lock().is_some())
            .finish()
    }
}
