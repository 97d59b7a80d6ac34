//! `struct stat`, WASI `filestat` and `fdstat` encoding.

use std::fs::Metadata;
use std::time::{Duration, SystemTime};

use sqlite_wasm_common::RuntimeError;
use sqlite_wasm_core::{GuestMemory, GuestMemoryExt, WasmPtr};

use crate::fcntl::{S_IFCHR, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

/// Size of the Emscripten `struct stat`.
pub const STAT_SIZE: u32 = 96;

/// Size of WASI `filestat`.
pub const FILESTAT_SIZE: u32 = 64;

/// Size of WASI `fdstat`.
pub const FDSTAT_SIZE: u32 = 24;

/// Block size reported in `st_blksize`.
pub const BLOCK_SIZE: i32 = 4096;

/// WASI `filetype` values.
pub mod filetype {
    /// Unknown.
    pub const UNKNOWN: u8 = 0;
    /// Character device.
    pub const CHARACTER_DEVICE: u8 = 2;
    /// Directory.
    pub const DIRECTORY: u8 = 3;
    /// Regular file.
    pub const REGULAR_FILE: u8 = 4;
    /// Symbolic link.
    pub const SYMBOLIC_LINK: u8 = 7;
}

/// A point in time as `(seconds, nanoseconds)` since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    /// Seconds.
    pub sec: i64,
    /// Nanoseconds (0..1_000_000_000).
    pub nsec: i32,
}

impl Timespec {
    /// Convert a `SystemTime`; times before the epoch are clamped.
    #[allow(clippy::cast_possible_wrap)]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            sec: i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
            nsec: since.subsec_nanos() as i32,
        }
    }

    /// Nanoseconds since the epoch, saturating.
    #[allow(clippy::cast_sign_loss)]
    pub fn as_nanos(&self) -> u64 {
        (self.sec.max(0) as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(self.nsec.max(0) as u64)
    }
}

/// File attributes in the shape guests expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    /// Device id.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Type and permission bits.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u64,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Device id for special files.
    pub rdev: u64,
    /// Size in bytes.
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Last access.
    pub atime: Timespec,
    /// Last modification.
    pub mtime: Timespec,
    /// Last status change.
    pub ctime: Timespec,
}

impl FileStat {
    /// Attributes from host metadata.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        let ts = |sec: i64, nsec: i64| Timespec {
            sec,
            nsec: i32::try_from(nsec).unwrap_or(0),
        };
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
            mode: metadata.mode(),
            nlink: metadata.nlink(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev(),
            size: metadata.size(),
            blocks: metadata.blocks(),
            atime: ts(metadata.atime(), metadata.atime_nsec()),
            mtime: ts(metadata.mtime(), metadata.mtime_nsec()),
            ctime: ts(metadata.ctime(), metadata.ctime_nsec()),
        }
    }

    /// Attributes from host metadata.
    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mode = if metadata.is_dir() {
            S_IFDIR | 0o755
        } else if metadata.file_type().is_symlink() {
            S_IFLNK | 0o777
        } else if metadata.permissions().readonly() {
            S_IFREG | 0o444
        } else {
            S_IFREG | 0o644
        };
        let time = |t: std::io::Result<SystemTime>| t.map(Timespec::from_system_time).unwrap_or_default();
        let mtime = time(metadata.modified());
        Self {
            mode,
            nlink: 1,
            size: metadata.len(),
            blocks: metadata.len().div_ceil(512),
            atime: time(metadata.accessed()),
            mtime,
            ctime: mtime,
            ..Self::default()
        }
    }

    /// Attributes of a standard stream.
    pub fn character_device() -> Self {
        Self {
            mode: S_IFCHR | 0o620,
            nlink: 1,
            ..Self::default()
        }
    }

    /// WASI filetype for `mode`.
    pub fn filetype(&self) -> u8 {
        match self.mode & S_IFMT {
            S_IFREG => filetype::REGULAR_FILE,
            S_IFDIR => filetype::DIRECTORY,
            S_IFCHR => filetype::CHARACTER_DEVICE,
            S_IFLNK => filetype::SYMBOLIC_LINK,
            _ => filetype::UNKNOWN,
        }
    }
}

fn put_timespec(buf: &mut [u8], offset: usize, ts: Timespec) {
    buf[offset..offset + 8].copy_from_slice(&ts.sec.to_le_bytes());
    buf[offset + 8..offset + 12].copy_from_slice(&ts.nsec.to_le_bytes());
}

/// Write `stat` into a guest `struct stat`.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn write_stat<T>(
    memory: &mut (impl GuestMemory + ?Sized),
    dst: WasmPtr<T>,
    stat: &FileStat,
) -> Result<(), RuntimeError> {
    let mut buf = [0u8; STAT_SIZE as usize];
    let mut put_i32 = |offset: usize, value: i32| buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    put_i32(0, stat.dev as i32);
    put_i32(4, stat.mode as i32);
    put_i32(8, stat.nlink as i32);
    put_i32(12, stat.uid as i32);
    put_i32(16, stat.gid as i32);
    put_i32(20, stat.rdev as i32);
    put_i32(32, BLOCK_SIZE);
    put_i32(36, stat.blocks as i32);
    buf[24..32].copy_from_slice(&(stat.size as i64).to_le_bytes());
    put_timespec(&mut buf, 40, stat.atime);
    put_timespec(&mut buf, 56, stat.mtime);
    put_timespec(&mut buf, 72, stat.ctime);
    buf[88..96].copy_from_slice(&(stat.ino as i64).to_le_bytes());
    memory.write_bytes(dst, &buf)
}

/// Write `stat` into a WASI `filestat`.
pub fn write_filestat<T>(
    memory: &mut (impl GuestMemory + ?Sized),
    dst: WasmPtr<T>,
    stat: &FileStat,
) -> Result<(), RuntimeError> {
    let mut buf = [0u8; FILESTAT_SIZE as usize];
    buf[0..8].copy_from_slice(&stat.dev.to_le_bytes());
    buf[8..16].copy_from_slice(&stat.ino.to_le_bytes());
    buf[16] = stat.filetype();
    buf[24..32].copy_from_slice(&stat.nlink.to_le_bytes());
    buf[32..40].copy_from_slice(&stat.size.to_le_bytes());
    buf[40..48].copy_from_slice(&stat.atime.as_nanos().to_le_bytes());
    buf[48..56].copy_from_slice(&stat.mtime.as_nanos().to_le_bytes());
    buf[56..64].copy_from_slice(&stat.ctime.as_nanos().to_le_bytes());
    memory.write_bytes(dst, &buf)
}

/// Write a WASI `fdstat` with full rights.
pub fn write_fdstat<T>(
    memory: &mut (impl GuestMemory + ?Sized),
    dst: WasmPtr<T>,
    filetype: u8,
    flags: u16,
) -> Result<(), RuntimeError> {
    let mut buf = [0u8; FDSTAT_SIZE as usize];
    buf[0] = filetype;
    buf[2..4].copy_from_slice(&flags.to_le_bytes());
    buf[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
    buf[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
    memory.write_bytes(dst, &buf)
}

#[cfg(test)]
mod tests {
    use sqlite_wasm_core::{HeapMemory, Pages};

    use super::*;

    fn sample() -> FileStat {
        FileStat {
            dev: 7,
            ino: 0x1_0000_0001,
            mode: S_IFREG | 0o640,
            nlink: 1,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 8192,
            blocks: 16,
            atime: Timespec { sec: 1_700_000_000, nsec: 5 },
            mtime: Timespec { sec: 1_700_000_001, nsec: 6 },
            ctime: Timespec { sec: 1_700_000_002, nsec: 7 },
        }
    }

    #[test]
    fn test_stat_layout() {
        let mut memory = HeapMemory::new(Pages(1), Pages(1));
        let dst = WasmPtr::<u8>::new(256);
        write_stat(&mut memory, dst, &sample()).unwrap();

        let at = |offset: u32| dst.add_bytes(offset);
        assert_eq!(memory.read_i32(at(0)).unwrap(), 7);
        assert_eq!(memory.read_i32(at(4)).unwrap(), 0o100_640);
        assert_eq!(memory.read_i32(at(12)).unwrap(), 1000);
        assert_eq!(memory.read_i64(at(24)).unwrap(), 8192);
        assert_eq!(memory.read_i32(at(32)).unwrap(), 4096);
        assert_eq!(memory.read_i32(at(36)).unwrap(), 16);
        assert_eq!(memory.read_i64(at(40)).unwrap(), 1_700_000_000);
        assert_eq!(memory.read_i32(at(48)).unwrap(), 5);
        assert_eq!(memory.read_i64(at(56)).unwrap(), 1_700_000_001);
        assert_eq!(memory.read_i32(at(80)).unwrap(), 7);
        assert_eq!(memory.read_i64(at(88)).unwrap(), 0x1_0000_0001);
    }

    #[test]
    fn test_filestat_layout() {
        let mut memory = HeapMemory::new(Pages(1), Pages(1));
        let dst = WasmPtr::<u8>::new(64);
        write_filestat(&mut memory, dst, &sample()).unwrap();

        assert_eq!(memory.read_i64(dst.add_bytes(8)).unwrap(), 0x1_0000_0001);
        assert_eq!(memory.read_i8(dst.add_bytes(16)).unwrap(), 4);
        assert_eq!(memory.read_i64(dst.add_bytes(32)).unwrap(), 8192);
        assert_eq!(
            memory.read_i64(dst.add_bytes(48)).unwrap(),
            1_700_000_001_000_000_006
        );
    }

    #[test]
    fn test_fdstat_layout() {
        let mut memory = HeapMemory::new(Pages(1), Pages(1));
        let dst = WasmPtr::<u8>::new(0);
        write_fdstat(&mut memory, dst, filetype::CHARACTER_DEVICE, 1).unwrap();

        assert_eq!(memory.read_i8(dst).unwrap(), 2);
        assert_eq!(memory.read_i16(dst.add_bytes(2)).unwrap(), 1);
        assert_eq!(memory.read_i64(dst.add_bytes(8)).unwrap(), -1);
    }

    #[test]
    fn test_filetype_from_mode() {
        assert_eq!(FileStat::character_device().filetype(), filetype::CHARACTER_DEVICE);
        let dir = FileStat {
            mode: S_IFDIR | 0o755,
            ..FileStat::default()
        };
        assert_eq!(dir.filetype(), filetype::DIRECTORY);
    }

    #[test]
    fn test_metadata_of_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.db");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        let stat = FileStat::from_metadata(&std::fs::metadata(&path).unwrap());
        assert_eq!(stat.size, 1000);
        assert_eq!(stat.filetype(), filetype::REGULAR_FILE);
        assert!(stat.mtime.sec > 0);
    }
}
