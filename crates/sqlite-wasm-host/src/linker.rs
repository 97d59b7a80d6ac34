//! Assembly of the complete import set a SQLite module links against.
//!
//! The result is an engine-independent [`HostImports`]; the engine adapter
//! matches it against the module's imports at instantiation.

use std::sync::Arc;

use tracing::debug;

use sqlite_wasm_core::{CallbackStore, HostImports};

use crate::syscall::SyscallContext;
use crate::{callbacks, emscripten, wasi};

/// Register all host functions.
///
/// This registers:
/// - `wasi_snapshot_preview1::*` - descriptors, clocks, entropy, environment
/// - `env::*` - Emscripten syscalls, heap growth, time zone, process control
/// - `sqlite3-callback-manager::*` - callback trampolines
pub fn register_all(ctx: &Arc<SyscallContext>, store: &Arc<CallbackStore>) -> HostImports {
    let mut imports = HostImports::new();
    wasi::register(&mut imports, ctx);
    emscripten::register(&mut imports, ctx);
    callbacks::register(&mut imports, store);
    debug!(count = imports.len(), "Host functions registered");
    imports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::SystemHost;

    #[test]
    fn test_register_all() {
        let ctx = Arc::new(SyscallContext::new(Arc::new(SystemHost::default())).unwrap());
        let imports = register_all(&ctx, &Arc::new(CallbackStore::new()));

        assert!(imports.contains(wasi::WASI_MODULE, "fd_write"));
        assert!(imports.contains(wasi::WASI_MODULE, "path_open"));
        assert!(imports.contains(emscripten::ENV_MODULE, "__syscall_openat"));
        assert!(imports.contains(emscripten::ENV_MODULE, "emscripten_resize_heap"));
        assert!(imports.contains(callbacks::CALLBACK_MODULE, "sqlite3_trace_cb"));
    }

    #[test]
    fn test_modules_do_not_collide() {
        let ctx = Arc::new(SyscallContext::new(Arc::new(SystemHost::default())).unwrap());
        let imports = register_all(&ctx, &Arc::new(CallbackStore::new()));

        let count = |module: &str| imports.iter().filter(|f| f.module == module).count();
        assert_eq!(
            count(wasi::WASI_MODULE) + count(emscripten::ENV_MODULE) + count(callbacks::CALLBACK_MODULE),
            imports.len()
        );
        assert_eq!(count(callbacks::CALLBACK_MODULE), 6);
    }
}
