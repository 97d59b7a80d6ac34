//! Bindings to the functions the SQLite module exports.

use std::collections::HashMap;

use tracing::debug;

use sqlite_wasm_common::RuntimeError;
use sqlite_wasm_core::EngineAdapter;

/// Exported functions of one instance, keyed by export name.
///
/// Every known name is looked up once when the environment is built. A name
/// the module does not export only fails when its accessor is called, so a
/// trimmed build of SQLite still loads.
#[derive(Debug, Clone)]
pub struct SqliteExports<C> {
    bindings: HashMap<&'static str, C>,
}

impl<C> SqliteExports<C> {
    /// Resolve every name in [`SQLITE_EXPORT_NAMES`] against `instance`.
    pub fn resolve<E>(adapter: &mut E, instance: &E::Instance) -> Self
    where
        E: EngineAdapter<Callable = C>,
    {
        let bindings: HashMap<_, _> = SQLITE_EXPORT_NAMES
            .iter()
            .filter_map(|&name| adapter.export(instance, name).map(|callable| (name, callable)))
            .collect();
        debug!(
            resolved = bindings.len(),
            missing = SQLITE_EXPORT_NAMES.len() - bindings.len(),
            "SQLite exports resolved"
        );
        Self { bindings }
    }

    /// The binding for `name`.
    pub fn get(&self, name: &str) -> Result<&C, RuntimeError> {
        self.bindings
            .get(name)
            .ok_or_else(|| RuntimeError::missing_export(name))
    }

    /// Returns `true` if the module exports `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Number of resolved exports.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns `true` if nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

macro_rules! export_name {
    ($name:ident) => {
        stringify!($name)
    };
    ($name:ident $export:literal) => {
        $export
    };
}

macro_rules! sqlite_exports {
    ($($name:ident $(= $export:literal)?),* $(,)?) => {
        /// Export names bound by [`SqliteExports`].
        pub const SQLITE_EXPORT_NAMES: &[&str] = &[$(export_name!($name $($export)?)),*];

        /// Typed accessors, one per export.
        impl<C> SqliteExports<C> {
            $(
                #[allow(missing_docs)]
                pub fn $name(&self) -> Result<&C, RuntimeError> {
                    self.get(export_name!($name $($export)?))
                }
            )*
        }
    };
}

sqlite_exports! {
    sqlite3_db_status,
    sqlite3_initialize,
    sqlite3_prepare_v2,
    sqlite3_step,
    sqlite3_column_int64,
    sqlite3_finalize,
    sqlite3_reset,
    sqlite3_clear_bindings,
    sqlite3_column_count,
    sqlite3_column_bytes,
    sqlite3_column_double,
    sqlite3_column_text,
    sqlite3_column_type,
    sqlite3_column_name,
    sqlite3_bind_blob,
    sqlite3_bind_double,
    sqlite3_bind_int64,
    sqlite3_bind_null,
    sqlite3_bind_text,
    sqlite3_bind_parameter_count,
    sqlite3_stmt_readonly,
    sqlite3_expanded_sql,
    sqlite3_errmsg,
    sqlite3_libversion,
    sqlite3_libversion_number,
    sqlite3_last_insert_rowid,
    sqlite3_changes,
    sqlite3_close_v2,
    sqlite3_progress_handler,
    sqlite3_soft_heap_limit64,
    sqlite3_busy_timeout,
    sqlite3_trace_v2,
    sqlite3_errcode,
    sqlite3_extended_errcode,
    sqlite3_open,
    sqlite3_open_v2,
    sqlite3_db_readonly,
    sqlite3_sourceid,
    wasm_enum_json = "sqlite3__wasm_enum_json",
    wasm_config_i = "sqlite3__wasm_config_i",
    wasm_config_ii = "sqlite3__wasm_config_ii",
    wasm_config_j = "sqlite3__wasm_config_j",
    wasm_db_config_ip = "sqlite3__wasm_db_config_ip",
    wasm_db_config_pii = "sqlite3__wasm_db_config_pii",
    wasm_db_config_s = "sqlite3__wasm_db_config_s",
    register_localized_collators,
    register_android_functions,
    malloc,
    free,
    realloc,
}
