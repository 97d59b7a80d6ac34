//! Strongly-typed handles shared between host and guest.
//!
//! - [`WasmPtr`]: an address in guest linear memory tagged with the pointee type
//! - [`Pages`]: a count of 64 KiB memory pages
//! - [`Fd`]: a guest-visible file descriptor
//! - [`CallbackId`]: a guest-visible callback identifier
//! - [`IndirectFunctionTableIndex`]: a slot in the guest's function table

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Add;

use sqlite_wasm_common::WASM_PAGE_SIZE;

/// Size of a pointer in the wasm32 guest.
pub const WASM_SIZEOF_PTR: u32 = 4;

/// Opaque `sqlite3*` connection handle.
#[derive(Debug)]
pub enum SqliteDb {}

/// Opaque `sqlite3_stmt*` statement handle.
#[derive(Debug)]
pub enum SqliteStatement {}

/// An address in guest linear memory.
///
/// `T` is a compile-time tag only; nothing checks it against the guest's real
/// layout. Address `0` is NULL and is never dereferenced by the host.
pub struct WasmPtr<T> {
    addr: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> WasmPtr<T> {
    /// The NULL pointer.
    pub const NULL: Self = Self::new(0);

    /// Create a pointer from a raw guest address.
    pub const fn new(addr: u32) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    /// Reinterpret an `i32` wasm value as an address.
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_i32(value: i32) -> Self {
        Self::new(value as u32)
    }

    /// Raw guest address.
    pub const fn addr(self) -> u32 {
        self.addr
    }

    /// The address as an `i32` wasm value.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_i32(self) -> i32 {
        self.addr as i32
    }

    /// Returns `true` for the NULL pointer.
    pub const fn is_null(self) -> bool {
        self.addr == 0
    }

    /// Reinterpret the pointee type.
    pub const fn cast<U>(self) -> WasmPtr<U> {
        WasmPtr::new(self.addr)
    }

    /// Address `bytes` past this one, wrapping like guest pointer arithmetic.
    #[must_use]
    pub const fn add_bytes(self, bytes: u32) -> Self {
        Self::new(self.addr.wrapping_add(bytes))
    }
}

impl<T> Clone for WasmPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for WasmPtr<T> {}

impl<T> PartialEq for WasmPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for WasmPtr<T> {}

impl<T> Hash for WasmPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl<T> Default for WasmPtr<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T> Add<u32> for WasmPtr<T> {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        self.add_bytes(rhs)
    }
}

impl<T> fmt::Debug for WasmPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WasmPtr(0x{:x})", self.addr)
    }
}

impl<T> fmt::Display for WasmPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.addr)
    }
}

/// A count of 64 KiB linear memory pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pages(pub u64);

impl Pages {
    /// Size in bytes.
    pub const fn in_bytes(self) -> u64 {
        self.0 * WASM_PAGE_SIZE
    }

    /// Smallest page count holding `bytes`.
    pub const fn from_bytes_ceil(bytes: u64) -> Self {
        Self(bytes.div_ceil(WASM_PAGE_SIZE))
    }
}

impl fmt::Display for Pages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pages", self.0)
    }
}

/// A guest-visible file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(pub i32);

impl Fd {
    /// Standard input.
    pub const STDIN: Fd = Fd(0);
    /// Standard output.
    pub const STDOUT: Fd = Fd(1);
    /// Standard error.
    pub const STDERR: Fd = Fd(2);

    /// Returns `true` for descriptors 0, 1 and 2.
    pub const fn is_std_stream(self) -> bool {
        self.0 >= 0 && self.0 <= 2
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// Identifier the guest passes back when invoking a registered callback.
///
/// Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(i32);

impl CallbackId {
    /// Wrap a raw id; returns `None` for `0`.
    pub const fn new(id: i32) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    /// Raw id value.
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A slot in the guest's indirect function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndirectFunctionTableIndex(pub i32);

impl fmt::Display for IndirectFunctionTableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasm_ptr_null() {
        let ptr: WasmPtr<u8> = WasmPtr::NULL;
        assert!(ptr.is_null());
        assert!(!WasmPtr::<u8>::new(8).is_null());
        assert_eq!(WasmPtr::<u8>::default(), WasmPtr::NULL);
    }

    #[test]
    fn test_wasm_ptr_arithmetic() {
        let ptr: WasmPtr<u32> = WasmPtr::new(0x100);
        assert_eq!((ptr + 4).addr(), 0x104);
        assert_eq!(ptr.add_bytes(u32::MAX).addr(), 0xff);
        assert_eq!(ptr.cast::<u8>().addr(), 0x100);
    }

    #[test]
    fn test_wasm_ptr_i32_round_trip() {
        let ptr: WasmPtr<u8> = WasmPtr::from_i32(-8);
        assert_eq!(ptr.addr(), 0xffff_fff8);
        assert_eq!(ptr.as_i32(), -8);
        assert_eq!(ptr.to_string(), "0xfffffff8");
    }

    #[test]
    fn test_pages() {
        assert_eq!(Pages(2).in_bytes(), 131_072);
        assert_eq!(Pages::from_bytes_ceil(0), Pages(0));
        assert_eq!(Pages::from_bytes_ceil(1), Pages(1));
        assert_eq!(Pages::from_bytes_ceil(65_536), Pages(1));
        assert_eq!(Pages::from_bytes_ceil(65_537), Pages(2));
    }

    #[test]
    fn test_callback_id_non_zero() {
        assert!(CallbackId::new(0).is_none());
        assert_eq!(CallbackId::new(5).map(CallbackId::get), Some(5));
    }

    #[test]
    fn test_std_streams() {
        assert!(Fd::STDOUT.is_std_stream());
        assert!(!Fd(4).is_std_stream());
        assert!(!Fd(-1).is_std_stream());
    }
}
