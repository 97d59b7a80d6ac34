//! WebAssembly module compilation and introspection.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] together with a content hash
//! and can describe the guest's imports and exports without instantiating it.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, ExternType, Module};

use sqlite_wasm_common::RuntimeError;

use crate::abi::{FuncSignature, ValType};

/// A compiled WebAssembly module.
///
/// Cheap to clone; the underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,
}

/// Kind of an import or export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    /// A function with the given signature, or `None` if it uses
    /// types the embedding does not model (references, vectors).
    Func(Option<FuncSignature>),
    /// A linear memory with its minimum and optional maximum page count.
    Memory {
        /// Initial pages.
        minimum: u64,
        /// Declared maximum pages.
        maximum: Option<u64>,
    },
    /// A table with its minimum element count.
    Table {
        /// Initial elements.
        minimum: u64,
    },
    /// A global.
    Global,
    /// Anything else (tags).
    Other,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Func(Some(sig)) => write!(f, "func {sig}"),
            ItemKind::Func(None) => f.write_str("func (unsupported types)"),
            ItemKind::Memory { minimum, maximum: Some(max) } => {
                write!(f, "memory {minimum}..{max} pages")
            }
            ItemKind::Memory { minimum, maximum: None } => write!(f, "memory {minimum}.. pages"),
            ItemKind::Table { minimum } => write!(f, "table {minimum} elements"),
            ItemKind::Global => f.write_str("global"),
            ItemKind::Other => f.write_str("other"),
        }
    }
}

/// One import or export of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleItem {
    /// Import namespace; `None` for exports.
    pub module: Option<String>,
    /// Field name.
    pub name: String,
    /// What the item is.
    pub kind: ItemKind,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Read and compile a `.wasm` file.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            RuntimeError::compilation_failed(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_bytes(engine, &bytes)
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());
        debug!(content_hash = %content_hash, "WAT module compiled");

        Ok(Self {
            module,
            content_hash,
        })
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// The inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Imports in declaration order.
    pub fn imports(&self) -> Vec<ModuleItem> {
        self.module
            .imports()
            .map(|import| ModuleItem {
                module: Some(import.module().to_string()),
                name: import.name().to_string(),
                kind: item_kind(&import.ty()),
            })
            .collect()
    }

    /// Exports in declaration order.
    pub fn exports(&self) -> Vec<ModuleItem> {
        self.module
            .exports()
            .map(|export| ModuleItem {
                module: None,
                name: export.name().to_string(),
                kind: item_kind(&export.ty()),
            })
            .collect()
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed("Invalid Wasm: file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed("Invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Convert a Wasmtime value type; `None` for reference and vector types.
pub(crate) fn from_wasmtime_type(ty: &wasmtime::ValType) -> Option<ValType> {
    match ty {
        wasmtime::ValType::I32 => Some(ValType::I32),
        wasmtime::ValType::I64 => Some(ValType::I64),
        wasmtime::ValType::F32 => Some(ValType::F32),
        wasmtime::ValType::F64 => Some(ValType::F64),
        _ => None,
    }
}

/// Signature of a Wasmtime function type, if it only uses numeric types.
pub(crate) fn signature_of(ty: &wasmtime::FuncType) -> Option<FuncSignature> {
    let params = ty.params().map(|p| from_wasmtime_type(&p)).collect::<Option<Vec<_>>>()?;
    let results = ty.results().map(|r| from_wasmtime_type(&r)).collect::<Option<Vec<_>>>()?;
    Some(FuncSignature { params, results })
}

fn item_kind(ty: &ExternType) -> ItemKind {
    match ty {
        ExternType::Func(func) => ItemKind::Func(signature_of(func)),
        ExternType::Memory(memory) => ItemKind::Memory {
            minimum: memory.minimum(),
            maximum: memory.maximum(),
        },
        ExternType::Table(table) => ItemKind::Table {
            minimum: table.minimum(),
        },
        ExternType::Global(_) => ItemKind::Global,
        #[allow(unreachable_patterns)]
        _ => ItemKind::Other,
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
