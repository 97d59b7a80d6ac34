//! Engine-independent description of host functions.
//!
//! Host functions are defined once as a [`HostFunction`]: an import name, a
//! wasm signature and a handler that receives the guest's linear memory and
//! the call arguments. An [`EngineAdapter`](crate::adapter::EngineAdapter)
//! turns each one into whatever its engine needs.

use std::fmt;
use std::sync::Arc;

use sqlite_wasm_common::RuntimeError;

use crate::memory::GuestMemory;
use crate::types::WasmPtr;

/// A wasm value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A wasm value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl Value {
    /// Type of this value.
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    /// The value if it is an `i32`.
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    /// The value if it is an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    /// The value if it is an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

/// Typed access to handler arguments.
///
/// The adapter checks signatures at link time, so a type mismatch here means
/// the host registered a handler that disagrees with its own signature.
pub trait Args {
    /// Argument `index` as an `i32`.
    fn i32(&self, index: usize) -> Result<i32, RuntimeError>;

    /// Argument `index` as an `i64`.
    fn i64(&self, index: usize) -> Result<i64, RuntimeError>;

    /// Argument `index` reinterpreted as a `u32`.
    #[allow(clippy::cast_sign_loss)]
    fn u32(&self, index: usize) -> Result<u32, RuntimeError> {
        self.i32(index).map(|v| v as u32)
    }

    /// Argument `index` as a guest pointer.
    fn ptr<T>(&self, index: usize) -> Result<WasmPtr<T>, RuntimeError> {
        self.i32(index).map(WasmPtr::from_i32)
    }
}

impl Args for [Value] {
    fn i32(&self, index: usize) -> Result<i32, RuntimeError> {
        self.get(index)
            .and_then(Value::as_i32)
            .ok_or_else(|| bad_argument(self, index, ValType::I32))
    }

    fn i64(&self, index: usize) -> Result<i64, RuntimeError> {
        self.get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| bad_argument(self, index, ValType::I64))
    }
}

fn bad_argument(args: &[Value], index: usize, expected: ValType) -> RuntimeError {
    RuntimeError::trap(format!(
        "argument {index} is not an {expected} (got {:?})",
        args.get(index)
    ))
}

/// Parameter and result types of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncSignature {
    /// Parameter types.
    pub params: Vec<ValType>,
    /// Result types.
    pub results: Vec<ValType>,
}

impl FuncSignature {
    /// Create a signature.
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        Self {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

impl fmt::Display for FuncSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[ValType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}

/// Handler invoked when the guest calls a host function.
///
/// Returns the results in signature order, or a fatal error that aborts the
/// guest call.
pub type HostHandler =
    Arc<dyn Fn(&mut dyn GuestMemory, &[Value]) -> Result<Vec<Value>, RuntimeError> + Send + Sync>;

/// A host function importable by the guest.
#[derive(Clone)]
pub struct HostFunction {
    /// Import module namespace.
    pub module: String,
    /// Import field name.
    pub name: String,
    /// Wasm signature.
    pub signature: FuncSignature,
    /// Implementation.
    pub handler: HostHandler,
}

impl HostFunction {
    /// Create a host function.
    pub fn new<F>(module: &str, name: &str, signature: FuncSignature, handler: F) -> Self
    where
        F: Fn(&mut dyn GuestMemory, &[Value]) -> Result<Vec<Value>, RuntimeError> + Send + Sync + 'static,
    {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            signature,
            handler: Arc::new(handler),
        }
    }

    /// Invoke the handler directly.
    pub fn call(&self, memory: &mut dyn GuestMemory, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        (self.handler)(memory, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The set of host functions offered to a guest, keyed by `(module, name)`.
#[derive(Debug, Clone, Default)]
pub struct HostImports {
    functions: Vec<HostFunction>,
}

impl HostImports {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any previous one with the same name.
    pub fn define(&mut self, function: HostFunction) -> &mut Self {
        self.functions
            .retain(|f| !(f.module == function.module && f.name == function.name));
        self.functions.push(function);
        self
    }

    /// Look up a function by import name.
    pub fn get(&self, module: &str, name: &str) -> Option<&HostFunction> {
        self.functions
            .iter()
            .find(|f| f.module == module && f.name == name)
    }

    /// Returns `true` if a function with this import name is defined.
    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.get(module, name).is_some()
    }

    /// All functions in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &HostFunction> {
        self.functions.iter()
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns `true` if no functions are defined.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Extend<HostFunction> for HostImports {
    fn extend<I: IntoIterator<Item = HostFunction>>(&mut self, iter: I) {
        for function in iter {
            self.define(function);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GuestMemoryExt, HeapMemory};
    use crate::types::Pages;

    fn store_at(module: &str, name: &str) -> HostFunction {
        HostFunction::new(
            module,
            name,
            FuncSignature::new(&[ValType::I32, ValType::I32], &[]),
            |memory, args| {
                memory.write_i32(args.ptr::<i32>(0)?, args.i32(1)?)?;
                Ok(Vec::new())
            },
        )
    }

    #[test]
    fn test_signature_display() {
        let sig = FuncSignature::new(&[ValType::I32, ValType::I64], &[ValType::F64]);
        assert_eq!(sig.to_string(), "(i32, i64) -> (f64)");
        assert_eq!(FuncSignature::new(&[], &[]).to_string(), "() -> ()");
    }

    #[test]
    fn test_args_access() {
        let args = [Value::I32(-1), Value::I64(1 << 40)];

        assert_eq!(args.i32(0).unwrap(), -1);
        assert_eq!(args.u32(0).unwrap(), u32::MAX);
        assert_eq!(args.i64(1).unwrap(), 1 << 40);
        assert!(args.i64(0).is_err());
        assert!(args.i32(2).is_err());
    }

    #[test]
    fn test_handler_uses_memory() {
        let function = store_at("env", "store");
        let mut memory = HeapMemory::new(Pages(1), Pages(1));

        let results = function
            .call(&mut memory, &[Value::I32(16), Value::I32(77)])
            .unwrap();

        assert!(results.is_empty());
        assert_eq!(memory.read_i32(WasmPtr::<i32>::new(16)).unwrap(), 77);
    }

    #[test]
    fn test_define_replaces_same_name() {
        let mut imports = HostImports::new();
        imports.define(store_at("env", "a"));
        imports.define(store_at("env", "b"));
        imports.define(store_at("other", "a"));
        imports.define(store_at("env", "a"));

        assert_eq!(imports.len(), 3);
        assert!(imports.contains("env", "a"));
        assert!(imports.contains("other", "a"));
        assert!(!imports.contains("env", "c"));
    }
}
