//! Linear memory access.
//!
//! [`GuestMemory`] is the engine-independent view of a guest's linear memory:
//! byte-range reads and writes plus page growth. [`GuestMemoryExt`] layers the
//! typed accessors on top (`read_i32`, `write_i64`, NUL-terminated strings,
//! pointers), so an engine adapter only implements the five primitive methods.
//!
//! All multi-byte values are little-endian with no padding, matching what wasm32
//! C code compiled by Emscripten observes.

use std::ops::Range;

use sqlite_wasm_common::RuntimeError;

use crate::types::{Pages, WasmPtr};

/// Maximum page count addressable by a 32-bit memory.
pub const MAX_WASM32_PAGES: Pages = Pages(65_536);

/// Emscripten over-allocation headroom used by `emscripten_resize_heap`.
pub const HEAP_GROWTH_HEADROOM: u64 = 100_663_296;

/// Byte-addressable access to a guest's linear memory.
pub trait GuestMemory {
    /// Current size in bytes.
    fn size_bytes(&self) -> u64;

    /// Largest page count the memory may grow to.
    fn max_pages(&self) -> Pages;

    /// Grow by `delta` pages.
    ///
    /// Returns the page count before growth, or `None` when the memory cannot
    /// grow that far. Existing bytes are preserved.
    fn grow(&mut self, delta: Pages) -> Option<Pages>;

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read_into(&self, addr: u32, buf: &mut [u8]) -> Result<(), RuntimeError>;

    /// Copy `data` into memory starting at `addr`.
    fn write_from(&mut self, addr: u32, data: &[u8]) -> Result<(), RuntimeError>;

    /// Current size in pages.
    fn size_pages(&self) -> Pages {
        Pages(self.size_bytes() / sqlite_wasm_common::WASM_PAGE_SIZE)
    }
}

/// Typed accessors over any [`GuestMemory`].
pub trait GuestMemoryExt: GuestMemory {
    /// Read `len` bytes.
    fn read_bytes<T>(&self, addr: WasmPtr<T>, len: usize) -> Result<Vec<u8>, RuntimeError> {
        checked_range(addr.addr(), len, self.size_bytes())?;
        let mut buf = vec![0; len];
        self.read_into(addr.addr(), &mut buf)?;
        Ok(buf)
    }

    /// Read one signed byte.
    fn read_i8<T>(&self, addr: WasmPtr<T>) -> Result<i8, RuntimeError> {
        let mut buf = [0; 1];
        self.read_into(addr.addr(), &mut buf)?;
        Ok(i8::from_le_bytes(buf))
    }

    /// Read a little-endian `i16`.
    fn read_i16<T>(&self, addr: WasmPtr<T>) -> Result<i16, RuntimeError> {
        let mut buf = [0; 2];
        self.read_into(addr.addr(), &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    /// Read a little-endian `i32`.
    fn read_i32<T>(&self, addr: WasmPtr<T>) -> Result<i32, RuntimeError> {
        let mut buf = [0; 4];
        self.read_into(addr.addr(), &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a little-endian `u32`.
    fn read_u32<T>(&self, addr: WasmPtr<T>) -> Result<u32, RuntimeError> {
        let mut buf = [0; 4];
        self.read_into(addr.addr(), &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian `i64`.
    fn read_i64<T>(&self, addr: WasmPtr<T>) -> Result<i64, RuntimeError> {
        let mut buf = [0; 8];
        self.read_into(addr.addr(), &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Read a 32-bit guest pointer stored at `addr`.
    fn read_ptr<T>(&self, addr: WasmPtr<WasmPtr<T>>) -> Result<WasmPtr<T>, RuntimeError> {
        self.read_u32(addr).map(WasmPtr::new)
    }

    /// Read a NUL-terminated string.
    ///
    /// Invalid UTF-8 sequences are replaced rather than rejected.
    fn read_cstring<T>(&self, addr: WasmPtr<T>) -> Result<String, RuntimeError> {
        let size = self.size_bytes();
        let start = u64::from(addr.addr());
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 256];
        let mut pos = start;
        loop {
            if pos >= size {
                return Err(RuntimeError::MemoryAccessOutOfBounds {
                    addr: start,
                    len: pos - start + 1,
                    memory_size: size,
                });
            }
            #[allow(clippy::cast_possible_truncation)]
            let n = chunk.len().min((size - pos) as usize);
            #[allow(clippy::cast_possible_truncation)]
            self.read_into(pos as u32, &mut chunk[..n])?;
            if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                break;
            }
            bytes.extend_from_slice(&chunk[..n]);
            pos += n as u64;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write raw bytes.
    fn write_bytes<T>(&mut self, addr: WasmPtr<T>, data: &[u8]) -> Result<(), RuntimeError> {
        self.write_from(addr.addr(), data)
    }

    /// Write one signed byte.
    fn write_i8<T>(&mut self, addr: WasmPtr<T>, value: i8) -> Result<(), RuntimeError> {
        self.write_from(addr.addr(), &value.to_le_bytes())
    }

    /// Write a little-endian `i16`.
    fn write_i16<T>(&mut self, addr: WasmPtr<T>, value: i16) -> Result<(), RuntimeError> {
        self.write_from(addr.addr(), &value.to_le_bytes())
    }

    /// Write a little-endian `i32`.
    fn write_i32<T>(&mut self, addr: WasmPtr<T>, value: i32) -> Result<(), RuntimeError> {
        self.write_from(addr.addr(), &value.to_le_bytes())
    }

    /// Write a little-endian `u32`.
    fn write_u32<T>(&mut self, addr: WasmPtr<T>, value: u32) -> Result<(), RuntimeError> {
        self.write_from(addr.addr(), &value.to_le_bytes())
    }

    /// Write a little-endian `i64`.
    fn write_i64<T>(&mut self, addr: WasmPtr<T>, value: i64) -> Result<(), RuntimeError> {
        self.write_from(addr.addr(), &value.to_le_bytes())
    }

    /// Write a 32-bit guest pointer.
    fn write_ptr<T>(&mut self, addr: WasmPtr<WasmPtr<T>>, value: WasmPtr<T>) -> Result<(), RuntimeError> {
        self.write_u32(addr, value.addr())
    }

    /// Write `value` followed by a NUL byte; returns the bytes written.
    fn write_cstring<T>(&mut self, addr: WasmPtr<T>, value: &str) -> Result<u32, RuntimeError> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.write_from(addr.addr(), &bytes)?;
        u32::try_from(bytes.len()).map_err(|_| RuntimeError::MemoryAccessOutOfBounds {
            addr: u64::from(addr.addr()),
            len: bytes.len() as u64,
            memory_size: self.size_bytes(),
        })
    }
}

impl<M: GuestMemory + ?Sized> GuestMemoryExt for M {}

/// Validate `[addr, addr + len)` against a memory of `size` bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn checked_range(addr: u32, len: usize, size: u64) -> Result<Range<usize>, RuntimeError> {
    let start = u64::from(addr);
    let end = start.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(start as usize..end as usize),
        _ => Err(RuntimeError::MemoryAccessOutOfBounds {
            addr: start,
            len: len as u64,
            memory_size: size,
        }),
    }
}

/// Page count `emscripten_resize_heap` should grow to.
///
/// Over-allocates by 20% of the current size, but never more than
/// [`HEAP_GROWTH_HEADROOM`] past the request, never less than the request, and
/// never beyond `max`. The result may still be below `requested_bytes` when
/// `max` is too small; callers must treat that as out of memory.
pub fn resize_heap_target(requested_bytes: u64, current: Pages, max: Pages) -> Pages {
    let old_size = current.in_bytes();
    let over_grown = (old_size + old_size / 5)
        .min(requested_bytes + HEAP_GROWTH_HEADROOM)
        .max(requested_bytes);
    Pages::from_bytes_ceil(over_grown).min(max)
}

/// Vec-backed [`GuestMemory`].
///
/// Used where a guest memory is needed without an engine, e.g. to exercise
/// syscall handlers in isolation.
#[derive(Debug, Clone)]
pub struct HeapMemory {
    data: Vec<u8>,
    max_pages: Pages,
}

impl HeapMemory {
    /// Create a zeroed memory of `initial` pages that may grow up to `max`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(initial: Pages, max: Pages) -> Self {
        Self {
            data: vec![0; initial.in_bytes() as usize],
            max_pages: max,
        }
    }

    /// Raw contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl GuestMemory for HeapMemory {
    fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn max_pages(&self) -> Pages {
        self.max_pages
    }

    fn grow(&mut self, delta: Pages) -> Option<Pages> {
        let old = self.size_pages();
        let new = old.0.checked_add(delta.0)?;
        if new > self.max_pages.0 {
            return None;
        }
        let new_len = usize::try_from(Pages(new).in_bytes()).ok()?;
        self.data.resize(new_len, 0);
        Some(old)
    }

    fn read_into(&self, addr: u32, buf: &mut [u8]) -> Result<(), RuntimeError> {
        let range = checked_range(addr, buf.len(), self.size_bytes())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_from(&mut self, addr: u32, data: &[u8]) -> Result<(), RuntimeError> {
        let range = checked_range(addr, data.len(), self.size_bytes())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}
