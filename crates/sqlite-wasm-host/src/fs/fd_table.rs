//! Guest file descriptor numbers.
//!
//! Descriptors 0 to 2 are the standard streams and 3 is left unused, so
//! allocation starts at [`MIN_FD`] and takes the lowest free number.

use std::collections::BTreeMap;

use sqlite_wasm_common::RuntimeError;
use sqlite_wasm_core::Fd;

use super::channel::Channel;

/// Lowest descriptor handed out by `openat`.
pub const MIN_FD: i32 = 4;

/// Highest descriptor handed out by `openat`.
pub const MAX_FD: i32 = 1024;

/// Map of open descriptors to their channels.
#[derive(Debug, Default)]
pub struct FdTable {
    channels: BTreeMap<Fd, Channel>,
}

impl FdTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `channel` under the lowest free descriptor.
    ///
    /// Running out of descriptors is fatal.
    pub fn allocate(&mut self, channel: Channel) -> Result<Fd, RuntimeError> {
        let mut candidate = MIN_FD;
        for fd in self.channels.keys() {
            if fd.0 > candidate {
                break;
            }
            if fd.0 == candidate {
                candidate += 1;
            }
        }
        if candidate > MAX_FD {
            return Err(RuntimeError::FileDescriptorsExhausted {
                min: MIN_FD,
                max: MAX_FD,
            });
        }
        let fd = Fd(candidate);
        self.channels.insert(fd, channel);
        Ok(fd)
    }

    /// Channel behind `fd`.
    pub fn get(&self, fd: Fd) -> Option<&Channel> {
        self.channels.get(&fd)
    }

    /// Mutable channel behind `fd`.
    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut Channel> {
        self.channels.get_mut(&fd)
    }

    /// Remove `fd`, returning its channel.
    pub fn remove(&mut self, fd: Fd) -> Option<Channel> {
        self.channels.remove(&fd)
    }

    /// Remove every descriptor.
    pub fn drain(&mut self) -> Vec<(Fd, Channel)> {
        std::mem::take(&mut self.channels).into_iter().collect()
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns `true` if no descriptor is open.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
