//! Flag and command values used by the Emscripten musl ABI.

/// Open for reading only.
pub const O_RDONLY: i32 = 0;
/// Open for writing only.
pub const O_WRONLY: i32 = 0o1;
/// Open for reading and writing.
pub const O_RDWR: i32 = 0o2;
/// Access mode mask.
pub const O_ACCMODE: i32 = 0o3;
/// Create if missing.
pub const O_CREAT: i32 = 0o100;
/// Fail if the file exists (with `O_CREAT`).
pub const O_EXCL: i32 = 0o200;
/// Truncate to zero length.
pub const O_TRUNC: i32 = 0o1000;
/// Writes go to the end of the file.
pub const O_APPEND: i32 = 0o2000;
/// Non-blocking mode; ignored.
pub const O_NONBLOCK: i32 = 0o4000;
/// Fail unless the path is a directory.
pub const O_DIRECTORY: i32 = 0o200_000;
/// Do not follow a trailing symlink.
pub const O_NOFOLLOW: i32 = 0o400_000;
/// Close on exec; ignored.
pub const O_CLOEXEC: i32 = 0o2_000_000;
/// Unnamed temporary file.
pub const O_TMPFILE: i32 = 0o20_200_000;

/// Resolve relative paths against the working directory.
pub const AT_FDCWD: i32 = -100;
/// Do not follow symlinks.
pub const AT_SYMLINK_NOFOLLOW: i32 = 0x100;
/// `unlinkat` removes a directory.
pub const AT_REMOVEDIR: i32 = 0x200;
/// Operate on `dirfd` itself when the path is empty.
pub const AT_EMPTY_PATH: i32 = 0x1000;
/// `faccessat` checks with the effective ids.
pub const AT_EACCESS: i32 = 0x200;

/// Duplicate a descriptor.
pub const F_DUPFD: i32 = 0;
/// Get descriptor flags.
pub const F_GETFD: i32 = 1;
/// Set descriptor flags.
pub const F_SETFD: i32 = 2;
/// Get status flags.
pub const F_GETFL: i32 = 3;
/// Set status flags.
pub const F_SETFL: i32 = 4;
/// Query the lock that would block a request.
pub const F_GETLK: i32 = 12;
/// Acquire or release a lock without waiting.
pub const F_SETLK: i32 = 13;
/// Acquire or release a lock, waiting if needed.
pub const F_SETLKW: i32 = 14;

/// Shared lock.
pub const F_RDLCK: i16 = 0;
/// Exclusive lock.
pub const F_WRLCK: i16 = 1;
/// Unlock.
pub const F_UNLCK: i16 = 2;

/// `l_whence`/`lseek` origin: start of file.
pub const SEEK_SET: i32 = 0;
/// `l_whence`/`lseek` origin: current position.
pub const SEEK_CUR: i32 = 1;
/// `l_whence`/`lseek` origin: end of file.
pub const SEEK_END: i32 = 2;

/// `access` existence check.
pub const F_OK: i32 = 0;
/// `access` execute check.
pub const X_OK: i32 = 1;
/// `access` write check.
pub const W_OK: i32 = 2;
/// `access` read check.
pub const R_OK: i32 = 4;

/// `utimensat`: set to the current time.
pub const UTIME_NOW: i64 = 0x3FFF_FFFF;
/// `utimensat`: leave unchanged.
pub const UTIME_OMIT: i64 = 0x3FFF_FFFE;

/// Size of `struct timespec` on wasm32 Emscripten.
pub const TIMESPEC_SIZE: u32 = 16;

/// `struct flock` field offsets.
pub mod flock {
    /// `l_type`, i16.
    pub const TYPE: u32 = 0;
    /// `l_whence`, i16.
    pub const WHENCE: u32 = 2;
    /// `l_start`, i64.
    pub const START: u32 = 8;
    /// `l_len`, i64.
    pub const LEN: u32 = 16;
    /// `l_pid`, i32.
    pub const PID: u32 = 24;
    /// Total size.
    pub const SIZE: u32 = 32;
}

/// File type bits of `st_mode`.
pub const S_IFMT: u32 = 0o170_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;

/// Human-readable rendering of open flags for trace logs.
pub fn describe_open_flags(flags: i32) -> String {
    let mut parts = vec![match flags & O_ACCMODE {
        O_RDONLY => "O_RDONLY",
        O_WRONLY => "O_WRONLY",
        O_RDWR => "O_RDWR",
        _ => "O_ACCMODE?",
    }];
    let named = [
        (O_TMPFILE, "O_TMPFILE"),
        (O_CREAT, "O_CREAT"),
        (O_EXCL, "O_EXCL"),
        (O_TRUNC, "O_TRUNC"),
        (O_APPEND, "O_APPEND"),
        (O_NONBLOCK, "O_NONBLOCK"),
        (O_DIRECTORY, "O_DIRECTORY"),
        (O_NOFOLLOW, "O_NOFOLLOW"),
        (O_CLOEXEC, "O_CLOEXEC"),
    ];
    let mut rest = flags & !O_ACCMODE;
    for (bit, name) in named {
        if rest & bit == bit {
            parts.push(name);
            rest &= !bit;
        }
    }
    let mut out = parts.join("|");
    if rest != 0 {
        out.push_str(&format!("|0x{rest:x}"));
    }
    out
}
