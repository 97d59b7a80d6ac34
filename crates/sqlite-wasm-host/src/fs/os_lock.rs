//! Host advisory locks backing the in-memory lock table.
//!
//! On Linux the locks are open file description locks (`F_OFD_SETLK`), so
//! two channels of one process conflict the same way two processes do. Other
//! Unix systems fall back to process-associated `F_SETLK` locks, which only
//! guard against other processes. Elsewhere every request is granted.

use std::fs::File;
use std::io;

use super::lock::LockType;

/// Try to take (`Some`) or release (`None`) `[start, end)` on `file`.
///
/// Returns `Ok(false)` when another open file description holds a
/// conflicting lock. `end == u64::MAX` covers everything from `start` on.
pub fn try_lock(file: &File, lock_type: Option<LockType>, start: u64, end: u64) -> io::Result<bool> {
    imp::try_lock(file, lock_type, start, end)
}

fn offsets(start: u64, end: u64) -> io::Result<(i64, i64)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("lock range [{start}, {end}) out of range"));
    let l_start = i64::try_from(start).map_err(|_| invalid())?;
    let l_len = if end == u64::MAX {
        0
    } else {
        i64::try_from(end - start).map_err(|_| invalid())?
    };
    Ok((l_start, l_len))
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    use super::{LockType, offsets};

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const SETLK: libc::c_int = libc::F_OFD_SETLK;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const SETLK: libc::c_int = libc::F_SETLK;

    #[allow(unsafe_code, clippy::cast_possible_truncation, clippy::unnecessary_cast, clippy::useless_conversion)]
    pub fn try_lock(file: &File, lock_type: Option<LockType>, start: u64, end: u64) -> io::Result<bool> {
        let (l_start, l_len) = offsets(start, end)?;
        let l_type = match lock_type {
            Some(LockType::Shared) => libc::F_RDLCK,
            Some(LockType::Exclusive) => libc::F_WRLCK,
            None => libc::F_UNLCK,
        };

        // SAFETY: `flock` is a plain C struct; all-zero is a valid value and
        // leaves `l_pid` at 0 as OFD locks require.
        let mut flock: libc::flock = unsafe { std::mem::zeroed() };
        flock.l_type = l_type as libc::c_short;
        flock.l_whence = libc::SEEK_SET as libc::c_short;
        flock.l_start = libc::off_t::try_from(l_start).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        flock.l_len = libc::off_t::try_from(l_len).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: the descriptor stays open for the borrow of `file` and
        // `flock` outlives the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), SETLK, &raw const flock) };
        if rc == 0 {
            return Ok(true);
        }
        let error = io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::EAGAIN | libc::EACCES) => Ok(false),
            _ => Err(error),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::File;
    use std::io;

    use super::{LockType, offsets};

    pub fn try_lock(_file: &File, _lock_type: Option<LockType>, start: u64, end: u64) -> io::Result<bool> {
        offsets(start, end).map(|_| true)
    }
}
