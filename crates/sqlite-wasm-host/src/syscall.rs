//! Shared plumbing for the WASI and Emscripten import modules.
//!
//! Syscall handlers return `Result<i32, HostFunctionError>`. [`syscall`]
//! wraps one into a [`HostFunction`] that lowers guest-recoverable errors to
//! the errno convention of its import module and lets fatal errors through.

use std::sync::Arc;

use tracing::{debug, warn};

use sqlite_wasm_common::{Errno, HostFunctionError, RuntimeError};
use sqlite_wasm_core::{
    FuncSignature, GuestMemory, GuestMemoryExt, HostFunction, ValType, Value, WasmPtr, checked_range,
};

use crate::embedder::EmbedderHost;
use crate::fs::HostFileSystem;

/// Host state every syscall handler of one environment shares.
pub struct SyscallContext {
    /// Clocks, entropy, environment and standard streams.
    pub embedder: Arc<dyn EmbedderHost>,
    /// Descriptors and locks.
    pub fs: HostFileSystem,
}

impl SyscallContext {
    /// Create a context whose filesystem starts in the embedder's working directory.
    pub fn new(embedder: Arc<dyn EmbedderHost>) -> Result<Self, RuntimeError> {
        let cwd = embedder.current_dir()?;
        Ok(Self {
            fs: HostFileSystem::new(cwd),
            embedder,
        })
    }
}

impl std::fmt::Debug for SyscallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallContext")
            .field("fs", &self.fs)
            .finish_non_exhaustive()
    }
}

/// How an import module reports errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoConvention {
    /// `wasi_snapshot_preview1`: `0` or a positive errno.
    Positive,
    /// Emscripten `__syscall_*`: a result or a negated errno.
    Negative,
}

impl ErrnoConvention {
    fn lower(self, errno: Errno) -> i32 {
        match self {
            ErrnoConvention::Positive => errno.code(),
            ErrnoConvention::Negative => errno.negative(),
        }
    }
}

/// Result of a syscall handler.
pub type SyscallResult = Result<i32, HostFunctionError>;

/// Build an `(i32...) -> i32` style import from a syscall handler.
pub fn syscall<F>(
    module: &str,
    name: &'static str,
    params: &[ValType],
    convention: ErrnoConvention,
    ctx: &Arc<SyscallContext>,
    handler: F,
) -> HostFunction
where
    F: Fn(&SyscallContext, &mut dyn GuestMemory, &[Value]) -> SyscallResult + Send + Sync + 'static,
{
    let ctx = Arc::clone(ctx);
    HostFunction::new(
        module,
        name,
        FuncSignature::new(params, &[ValType::I32]),
        move |memory, args| {
            let code = match handler(&ctx, memory, args) {
                Ok(value) => value,
                Err(HostFunctionError::Sys(e)) => {
                    debug!(syscall = name, errno = %e.errno, "{}", e.message);
                    convention.lower(e.errno)
                }
                Err(HostFunctionError::Fatal(e)) => return Err(e),
            };
            Ok(vec![Value::I32(code)])
        },
    )
}

/// An import that always fails with `errno`.
pub fn unsupported(
    module: &str,
    name: &'static str,
    params: &[ValType],
    results: &[ValType],
    errno: Errno,
    convention: ErrnoConvention,
) -> HostFunction {
    let code = convention.lower(errno);
    let results = results.to_vec();
    HostFunction::new(
        module,
        name,
        FuncSignature::new(params, &results),
        move |_, _| {
            warn!(syscall = name, "Unsupported syscall");
            Ok(results
                .iter()
                .map(|ty| match ty {
                    ValType::I32 => Value::I32(code),
                    ValType::I64 => Value::I64(i64::from(code)),
                    ValType::F32 => Value::F32(0.0),
                    ValType::F64 => Value::F64(f64::from(code)),
                })
                .collect())
        },
    )
}

/// Convert a byte count to a guest `size_t`.
pub fn guest_size(n: usize) -> Result<i32, HostFunctionError> {
    i32::try_from(n).map_err(|_| HostFunctionError::sys(Errno::OVERFLOW, format!("{n} bytes")))
}

/// Convert a guest length argument.
pub fn guest_len(n: i32) -> Result<usize, HostFunctionError> {
    usize::try_from(n).map_err(|_| HostFunctionError::sys(Errno::INVAL, format!("negative length {n}")))
}

/// Size of a WASI `iovec`/`ciovec`.
pub const IOVEC_SIZE: u32 = 8;

/// `(buf, len)` pairs of a guest iovec array.
///
/// Every entry is checked against the memory size, so callers may size host
/// buffers from the lengths.
pub fn read_iovecs(
    memory: &dyn GuestMemory,
    iovs: WasmPtr<u8>,
    count: u32,
) -> Result<Vec<(WasmPtr<u8>, u32)>, RuntimeError> {
    let size = memory.size_bytes();
    checked_range(iovs.addr(), (count as usize).saturating_mul(IOVEC_SIZE as usize), size)?;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry = iovs.add_bytes(i * IOVEC_SIZE);
        let buf = memory.read_u32(entry)?;
        let len = memory.read_u32(entry.add_bytes(4))?;
        checked_range(buf, len as usize, size)?;
        out.push((WasmPtr::new(buf), len));
    }
    Ok(out)
}

/// Gather the bytes of a `ciovec` array.
pub fn gather(memory: &dyn GuestMemory, iovecs: &[(WasmPtr<u8>, u32)]) -> Result<Vec<Vec<u8>>, RuntimeError> {
    iovecs
        .iter()
        .map(|&(buf, len)| memory.read_bytes(buf, len as usize))
        .collect()
}

/// Scatter `bufs` back into an `iovec` array.
pub fn scatter(
    memory: &mut dyn GuestMemory,
    iovecs: &[(WasmPtr<u8>, u32)],
    bufs: &[Vec<u8>],
) -> Result<(), RuntimeError> {
    for (&(dst, _), data) in iovecs.iter().zip(bufs) {
        memory.write_bytes(dst, data)?;
    }
    Ok(())
}
