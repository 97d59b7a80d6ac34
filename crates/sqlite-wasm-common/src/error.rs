//! Error types for the SQLite WebAssembly embedding.
//!
//! Two classes of failure exist:
//! - [`SysError`]: guest-recoverable errors, always lowered to an [`Errno`]
//!   and handed back to the guest as an ordinary integer result
//! - [`RuntimeError`]: host-fatal errors and build failures that abort the
//!   current operation with a diagnostic
//!
//! [`HostFunctionError`] is what syscall handlers produce internally before the
//! dispatch boundary splits it back into these two classes.

use std::io;

use thiserror::Error;

use crate::errno::Errno;

/// Host-fatal and build-time errors.
///
/// None of these are ever mapped to an errno: they indicate an invariant
/// violation in the embedding or a guest that cannot be driven.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The engine rejected the module during instantiation.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The guest imports a function the host does not provide.
    #[error("Missing import: {module}.{name}")]
    MissingImport {
        /// Import module namespace.
        module: String,
        /// Import field name.
        name: String,
    },

    /// The guest declares an import with a signature different from the host function.
    #[error("Import {module}.{name} signature mismatch: host provides {expected}, guest expects {actual}")]
    ImportSignatureMismatch {
        /// Import module namespace.
        module: String,
        /// Import field name.
        name: String,
        /// Host signature.
        expected: String,
        /// Guest signature.
        actual: String,
    },

    /// A required export is absent from the guest module.
    #[error("Missing export: {name}")]
    MissingExport {
        /// Export name.
        name: String,
    },

    /// The Emscripten stack cookie was overwritten.
    #[error(
        "Stack overflow! Stack cookie has been overwritten at 0x{address:x}, expected hex dwords \
         0x89BACDFE and 0x2135467, but received 0x{cookie2:x} 0x{cookie1:x}"
    )]
    StackOverflow {
        /// Address of the first cookie word.
        address: u32,
        /// Observed first word.
        cookie1: u32,
        /// Observed second word.
        cookie2: u32,
    },

    /// Every file descriptor number in the allowed range is in use.
    #[error("File descriptor table exhausted: all descriptors in [{min}, {max}] are open")]
    FileDescriptorsExhausted {
        /// Lowest allocatable descriptor.
        min: i32,
        /// Highest allocatable descriptor.
        max: i32,
    },

    /// No free callback identifier remains.
    #[error("Can not allocate ID")]
    CallbackIdsExhausted,

    /// A trampoline was invoked for a callback the host does not know.
    #[error("Callback {key} not registered ({kind})")]
    CallbackNotRegistered {
        /// Callback kind, e.g. `comparator`.
        kind: &'static str,
        /// Id or connection pointer the guest passed.
        key: String,
    },

    /// A guest address range falls outside linear memory.
    #[error("Memory access out of bounds: {len} bytes at 0x{addr:x} (memory size {memory_size})")]
    MemoryAccessOutOfBounds {
        /// Start address.
        addr: u64,
        /// Access length in bytes.
        len: u64,
        /// Current memory size in bytes.
        memory_size: u64,
    },

    /// Growing the indirect function table failed.
    #[error("Function table growth failed: {reason}")]
    TableGrowFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The guest called `abort` or failed an assertion.
    #[error("Guest aborted: {message}")]
    GuestAbort {
        /// Abort diagnostic.
        message: String,
    },

    /// The guest called `exit` or `proc_exit`.
    #[error("Guest exited with code {code}")]
    GuestExit {
        /// Exit status.
        code: i32,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// I/O operation failed outside of guest syscall handling.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// A guest-recoverable error carrying the errno returned to the guest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{errno}: {message}")]
pub struct SysError {
    /// Code handed to the guest.
    pub errno: Errno,
    /// Diagnostic for the host log.
    pub message: String,
}

/// Error produced inside a syscall handler.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// Lowered to an errno at the dispatch boundary.
    #[error(transparent)]
    Sys(#[from] SysError),

    /// Propagated to the caller as a trap.
    #[error(transparent)]
    Fatal(#[from] RuntimeError),
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>) -> Self {
        Self::MissingExport { name: name.into() }
    }

    /// Create a new `CallbackNotRegistered` error.
    pub fn callback_not_registered(kind: &'static str, key: impl ToString) -> Self {
        Self::CallbackNotRegistered {
            kind,
            key: key.to_string(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if a bounded host resource ran out.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            Self::FileDescriptorsExhausted { .. } | Self::CallbackIdsExhausted
        )
    }

    /// Returns `true` if the guest terminated itself through `exit` or `abort`.
    pub fn is_guest_termination(&self) -> bool {
        matches!(self, Self::GuestExit { .. } | Self::GuestAbort { .. })
    }

    /// Returns `true` if the module could not be linked against the host.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            Self::MissingImport { .. } | Self::ImportSignatureMismatch { .. } | Self::MissingExport { .. }
        )
    }
}

impl SysError {
    /// Create a new guest-recoverable error.
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    /// Wrap a host I/O error, deriving the errno from its kind.
    pub fn from_io(error: &io::Error, context: impl AsRef<str>) -> Self {
        Self {
            errno: Errno::from(error),
            message: format!("{}: {error}", context.as_ref()),
        }
    }
}

impl HostFunctionError {
    /// Shorthand for a guest-recoverable error.
    pub fn sys(errno: Errno, message: impl Into<String>) -> Self {
        Self::Sys(SysError::new(errno, message))
    }

    /// The errno, if this error is guest-recoverable.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Sys(e) => Some(e.errno),
            Self::Fatal(_) => None,
        }
    }
}
