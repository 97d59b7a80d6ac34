//! One SQLite instance together with the host state it runs against.
//!
//! [`SqliteWasmEnvironmentBuilder`] wires the pieces together:
//!
//! 1. Create the syscall context (embedder services plus filesystem)
//! 2. Register WASI, Emscripten and callback imports
//! 3. Instantiate the module through the [`EngineAdapter`]
//! 4. Run Emscripten start-up (stack, constructors, stack cookie)
//! 5. Bind the callback trampolines into the function table
//! 6. Resolve the SQLite exports
//!
//! The builder is written once against [`EngineAdapter`]; the Wasmtime
//! adapter is one implementation.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use sqlite_wasm_common::{HostConfig, RuntimeError};
use sqlite_wasm_core::{CallbackStore, EngineAdapter, HostFunction, Value};

use crate::callbacks::{CallbackFunctionIndexes, build_callback_table};
use crate::embedder::{EmbedderHost, SystemHost};
use crate::exports::SqliteExports;
use crate::linker::register_all;
use crate::runtime::EmscriptenRuntime;
use crate::syscall::SyscallContext;

/// Builder for [`SqliteWasmEnvironment`].
pub struct SqliteWasmEnvironmentBuilder<E: EngineAdapter> {
    adapter: E,
    embedder: Option<Arc<dyn EmbedderHost>>,
    host_config: HostConfig,
    overrides: Vec<HostFunction>,
    run_initializers: bool,
}

impl<E: EngineAdapter> SqliteWasmEnvironmentBuilder<E> {
    /// Start a builder that will instantiate through `adapter`.
    pub fn new(adapter: E) -> Self {
        Self {
            adapter,
            embedder: None,
            host_config: HostConfig::default(),
            overrides: Vec::new(),
            run_initializers: true,
        }
    }

    /// Use `embedder` instead of a [`SystemHost`].
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn EmbedderHost>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Configuration for the default [`SystemHost`].
    ///
    /// Ignored when an explicit [`embedder`](Self::embedder) is set.
    #[must_use]
    pub fn host_config(mut self, config: HostConfig) -> Self {
        self.host_config = config;
        self
    }

    /// Replace (or add) one host import.
    #[must_use]
    pub fn import(mut self, function: HostFunction) -> Self {
        self.overrides.push(function);
        self
    }

    /// Whether to run Emscripten start-up after instantiation (default `true`).
    #[must_use]
    pub fn run_initializers(mut self, run: bool) -> Self {
        self.run_initializers = run;
        self
    }

    /// Compile `bytes` with the adapter and build.
    pub fn build_from_bytes(self, bytes: &[u8]) -> Result<SqliteWasmEnvironment<E>, RuntimeError> {
        let module = self.adapter.compile(bytes)?;
        self.build(&module)
    }

    /// Instantiate `module` and assemble the environment.
    #[instrument(skip_all)]
    pub fn build(self, module: &E::Module) -> Result<SqliteWasmEnvironment<E>, RuntimeError> {
        let Self {
            mut adapter,
            embedder,
            host_config,
            overrides,
            run_initializers,
        } = self;

        let embedder = embedder.unwrap_or_else(|| Arc::new(SystemHost::new(host_config)));
        let syscalls = Arc::new(SyscallContext::new(embedder)?);
        let callback_store = Arc::new(CallbackStore::new());

        let mut imports = register_all(&syscalls, &callback_store);
        imports.extend(overrides);

        let instance = adapter.instantiate(module, &imports)?;

        let runtime = if run_initializers {
            EmscriptenRuntime::initialize(&mut adapter, &instance)?
        } else {
            debug!("Skipping Emscripten start-up");
            EmscriptenRuntime::default()
        };

        let callback_indexes = build_callback_table(&mut adapter, &instance, &callback_store)?;
        let exports = SqliteExports::resolve(&mut adapter, &instance);

        info!(
            exports = exports.len(),
            callbacks = callback_indexes.is_some(),
            cwd = %syscalls.fs.cwd().display(),
            "SQLite environment ready"
        );

        Ok(SqliteWasmEnvironment {
            adapter,
            instance,
            exports,
            callback_store,
            callback_indexes,
            syscalls,
            runtime,
        })
    }
}

/// An instantiated SQLite module and the host state it owns.
///
/// Dropping the environment closes every descriptor the guest left open and
/// drops every registered callback.
pub struct SqliteWasmEnvironment<E: EngineAdapter> {
    adapter: E,
    instance: E::Instance,
    exports: SqliteExports<E::Callable>,
    callback_store: Arc<CallbackStore>,
    callback_indexes: Option<CallbackFunctionIndexes>,
    syscalls: Arc<SyscallContext>,
    runtime: EmscriptenRuntime,
}

impl<E: EngineAdapter> SqliteWasmEnvironment<E> {
    /// Start a builder.
    pub fn builder(adapter: E) -> SqliteWasmEnvironmentBuilder<E> {
        SqliteWasmEnvironmentBuilder::new(adapter)
    }

    /// Bindings to the module's exports.
    pub fn exports(&self) -> &SqliteExports<E::Callable> {
        &self.exports
    }

    /// The module's linear memory.
    pub fn memory(&mut self) -> Result<E::Memory<'_>, RuntimeError> {
        self.adapter.memory(&self.instance)
    }

    /// Registry the callback trampolines dispatch through.
    pub fn callback_store(&self) -> &Arc<CallbackStore> {
        &self.callback_store
    }

    /// Table slots of the callback trampolines, if the module has a table.
    pub fn callback_indexes(&self) -> Option<&CallbackFunctionIndexes> {
        self.callback_indexes.as_ref()
    }

    /// Host state shared by the syscall handlers.
    pub fn syscalls(&self) -> &SyscallContext {
        &self.syscalls
    }

    /// Emscripten start-up state.
    pub fn runtime(&self) -> &EmscriptenRuntime {
        &self.runtime
    }

    /// The instance handle.
    pub fn instance(&self) -> &E::Instance {
        &self.instance
    }

    /// The engine adapter.
    pub fn adapter_mut(&mut self) -> &mut E {
        &mut self.adapter
    }

    /// Call `callable` with `args`.
    pub fn call(&mut self, callable: &E::Callable, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        self.adapter.call(callable, args)
    }

    /// Call the export `name`.
    ///
    /// Looks in the resolved SQLite exports first, then asks the instance.
    pub fn call_export(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let callable = match self.exports.get(name) {
            Ok(callable) => callable.clone(),
            Err(_) => self
                .adapter
                .export(&self.instance, name)
                .ok_or_else(|| RuntimeError::missing_export(name))?,
        };
        self.adapter.call(&callable, args)
    }

    /// Verify the Emscripten stack cookie.
    pub fn check_stack_cookie(&mut self) -> Result<(), RuntimeError> {
        self.runtime.check_stack_cookie(&mut self.adapter, &self.instance)
    }

    /// Release host resources now.
    pub fn close(self) {
        drop(self);
    }

    fn teardown(&self) {
        let closed = self.syscalls.fs.close_all();
        self.callback_store.clear();
        debug!(closed_fds = closed, "Environment torn down");
    }
}

impl<E: EngineAdapter> Drop for SqliteWasmEnvironment<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<E: EngineAdapter> std::fmt::Debug for SqliteWasmEnvironment<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteWasmEnvironment")
            .field("exports", &self.exports.len())
            .field("callback_indexes", &self.callback_indexes)
            .field("runtime", &self.runtime)
            .field("syscalls", &self.syscalls)
            .finish_non_exhaustive()
    }
}
