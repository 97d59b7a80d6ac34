//! Emscripten stack cookie.
//!
//! Two magic words are written just past the end of the guest's stack region
//! (the stack grows down towards them). If guest code overruns its stack the
//! words get clobbered, which [`check_stack_cookie`] reports as a fatal
//! [`RuntimeError::StackOverflow`].

use sqlite_wasm_common::RuntimeError;
use tracing::{error, trace};

use crate::memory::{GuestMemory, GuestMemoryExt};
use crate::types::WasmPtr;

/// First cookie word.
pub const STACK_COOKIE_1: u32 = 0x0213_5467;

/// Second cookie word.
pub const STACK_COOKIE_2: u32 = 0x89BA_CDFE;

/// Word written at address 0 to detect NULL-pointer writes.
pub const NULL_COOKIE: i32 = 1_668_509_029;

/// Addresses of the two cookie words.
fn cookie_addresses(stack_end: WasmPtr<u8>, memory_size: u64) -> Result<(u32, u32), RuntimeError> {
    let max = stack_end.addr();
    if max & 0x03 != 0 {
        return Err(RuntimeError::trap(format!(
            "Stack end 0x{max:x} is not 4-byte aligned"
        )));
    }
    let max = if max == 0 { 4 } else { max };
    let second = max.checked_add(4).ok_or(RuntimeError::MemoryAccessOutOfBounds {
        addr: u64::from(max),
        len: 8,
        memory_size,
    })?;
    Ok((max, second))
}

/// Write the cookie for a stack ending at `stack_end`.
pub fn write_stack_cookie(
    memory: &mut (impl GuestMemory + ?Sized),
    stack_end: WasmPtr<u8>,
) -> Result<(), RuntimeError> {
    let (max, second) = cookie_addresses(stack_end, memory.size_bytes())?;
    trace!(address = max, "Writing stack cookie");

    memory.write_u32(WasmPtr::<u32>::new(max), STACK_COOKIE_1)?;
    memory.write_u32(WasmPtr::<u32>::new(second), STACK_COOKIE_2)?;
    memory.write_i32(WasmPtr::<i32>::NULL, NULL_COOKIE)?;
    Ok(())
}

/// Verify the cookie written by [`write_stack_cookie`].
pub fn check_stack_cookie(
    memory: &(impl GuestMemory + ?Sized),
    stack_end: WasmPtr<u8>,
) -> Result<(), RuntimeError> {
    let (max, second) = cookie_addresses(stack_end, memory.size_bytes())?;
    let cookie1 = memory.read_u32(WasmPtr::<u32>::new(max))?;
    let cookie2 = memory.read_u32(WasmPtr::<u32>::new(second))?;

    if cookie1 == STACK_COOKIE_1 && cookie2 == STACK_COOKIE_2 {
        Ok(())
    } else {
        error!(
            address = max,
            cookie1 = cookie1,
            cookie2 = cookie2,
            "Stack cookie overwritten"
        );
        Err(RuntimeError::StackOverflow {
            address: max,
            cookie1,
            cookie2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapMemory;
    use crate::types::Pages;

    #[test]
    fn test_write_then_check() {
        let mut mem = HeapMemory::new(Pages(1), Pages(1));
        let end = WasmPtr::new(0x800);

        write_stack_cookie(&mut mem, end).unwrap();
        check_stack_cookie(&mem, end).unwrap();
        assert_eq!(mem.read_i32(WasmPtr::<i32>::NULL).unwrap(), NULL_COOKIE);
    }

    #[test]
    fn test_corrupted_cookie_is_stack_overflow() {
        let mut mem = HeapMemory::new(Pages(1), Pages(1));
        let end = WasmPtr::new(0x800);

        write_stack_cookie(&mut mem, end).unwrap();
        mem.write_i8(WasmPtr::<u8>::new(0x805), 0x11).unwrap();

        let err = check_stack_cookie(&mem, end).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::StackOverflow { address: 0x800, cookie1: STACK_COOKIE_1, .. }
        ));
    }

    #[test]
    fn test_zero_stack_end_uses_address_four() {
        let mut mem = HeapMemory::new(Pages(1), Pages(1));

        write_stack_cookie(&mut mem, WasmPtr::NULL).unwrap();
        assert_eq!(mem.read_u32(WasmPtr::<u32>::new(4)).unwrap(), STACK_COOKIE_1);
        assert_eq!(mem.read_u32(WasmPtr::<u32>::new(8)).unwrap(), STACK_COOKIE_2);
        check_stack_cookie(&mem, WasmPtr::NULL).unwrap();
    }

    #[test]
    fn test_unaligned_stack_end_rejected() {
        let mut mem = HeapMemory::new(Pages(1), Pages(1));
        assert!(write_stack_cookie(&mut mem, WasmPtr::new(0x801)).is_err());
    }

    #[test]
    fn test_stack_end_at_top_of_address_space() {
        let mut mem = HeapMemory::new(Pages(1), Pages(1));
        let end = WasmPtr::new(0xFFFF_FFFC);

        let err = write_stack_cookie(&mut mem, end).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::MemoryAccessOutOfBounds { addr: 0xFFFF_FFFC, len: 8, memory_size: 65_536 }
        ));
        let err = check_stack_cookie(&mem, end).unwrap_err();
        assert!(matches!(err, RuntimeError::MemoryAccessOutOfBounds { .. }));
        assert_eq!(mem.read_i32(WasmPtr::<i32>::NULL).unwrap(), 0);

        // Last aligned end whose second word still has an address.
        let err = write_stack_cookie(&mut mem, WasmPtr::new(0xFFFF_FFF8)).unwrap_err();
        assert!(matches!(err, RuntimeError::MemoryAccessOutOfBounds { addr: 0xFFFF_FFF8, len: 4, .. }));
    }
}
