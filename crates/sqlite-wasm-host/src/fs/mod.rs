//! Host filesystem seen through guest file descriptors.
//!
//! [`HostFileSystem`] owns the descriptor table and the advisory lock state of
//! one environment. Every operation reports guest-recoverable failures as
//! [`SysError`]s carrying the errno the guest will see; only descriptor
//! exhaustion is fatal.

pub mod channel;
pub mod fd_table;
pub mod lock;
pub mod os_lock;
pub mod stat;

use std::fs::{self, FileTimes, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, trace};

use sqlite_wasm_common::{Errno, HostFunctionError, SysError};
use sqlite_wasm_core::Fd;

use crate::fcntl::{
    AT_FDCWD, AT_REMOVEDIR, F_OK, F_RDLCK, F_UNLCK, F_WRLCK, O_ACCMODE, O_APPEND, O_CREAT,
    O_DIRECTORY, O_EXCL, O_NOFOLLOW, O_RDONLY, O_TMPFILE, O_TRUNC, O_WRONLY, R_OK, SEEK_CUR,
    SEEK_END, SEEK_SET, W_OK, X_OK, describe_open_flags,
};

pub use channel::{Channel, ChannelKind};
pub use fd_table::{FdTable, MAX_FD, MIN_FD};
pub use lock::{LockManager, LockRecord, LockType, lock_range, outside};
pub use stat::FileStat;

/// Result of a filesystem operation.
pub type FsResult<T> = Result<T, HostFunctionError>;

fn sys(errno: Errno, message: impl Into<String>) -> HostFunctionError {
    HostFunctionError::sys(errno, message)
}

fn io_error(context: impl AsRef<str>) -> impl FnOnce(io::Error) -> HostFunctionError {
    move |error| SysError::from_io(&error, context).into()
}

/// A `struct flock` as the guest passed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlockRequest {
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub l_type: i16,
    /// Origin of `l_start`.
    pub l_whence: i16,
    /// Start offset relative to `l_whence`.
    pub l_start: i64,
    /// Length; `0` extends to end of file.
    pub l_len: i64,
}

/// Files, directories and locks of one environment.
#[derive(Debug)]
pub struct HostFileSystem {
    fds: Mutex<FdTable>,
    locks: LockManager,
    cwd: PathBuf,
    tmpfile_counter: AtomicU64,
}

impl HostFileSystem {
    /// Create a filesystem resolving relative paths against `cwd`.
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            fds: Mutex::new(FdTable::new()),
            locks: LockManager::new(),
            cwd,
            tmpfile_counter: AtomicU64::new(0),
        }
    }

    /// Working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Advisory lock state.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.fds.lock().len()
    }

    /// Run `f` against the channel behind `fd`.
    pub fn with_channel<R>(&self, fd: Fd, f: impl FnOnce(&mut Channel) -> FsResult<R>) -> FsResult<R> {
        let mut fds = self.fds.lock();
        let channel = fds
            .get_mut(fd)
            .ok_or_else(|| sys(Errno::BADF, format!("{fd} is not open")))?;
        f(channel)
    }

    /// Resolve `path` against directory descriptor `dirfd`.
    pub fn resolve(&self, dirfd: i32, path: &str) -> FsResult<PathBuf> {
        if path.is_empty() {
            return Err(sys(Errno::NOENT, "empty path"));
        }
        let path = Path::new(path);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if dirfd == AT_FDCWD {
            return Ok(self.cwd.join(path));
        }
        self.with_channel(Fd(dirfd), |channel| {
            if channel.is_directory() {
                Ok(channel.path().join(path))
            } else {
                Err(sys(Errno::NOTDIR, format!("fd{dirfd} is not a directory")))
            }
        })
    }

    /// `openat`.
    pub fn open(&self, dirfd: i32, path: &str, flags: i32, mode: u32) -> FsResult<Fd> {
        let resolved = self.resolve(dirfd, path)?;
        trace!(path = %resolved.display(), flags = %describe_open_flags(flags), mode, "open");

        let channel = if flags & O_TMPFILE == O_TMPFILE {
            self.open_tmpfile(&resolved, flags)?
        } else {
            Self::open_path(resolved, flags, mode)?
        };

        let fd = self.fds.lock().allocate(channel)?;
        debug!(fd = fd.0, path, "Opened");
        Ok(fd)
    }

    fn open_tmpfile(&self, dir: &Path, flags: i32) -> FsResult<Channel> {
        if flags & O_ACCMODE == O_RDONLY {
            return Err(sys(Errno::INVAL, "O_TMPFILE requires write access"));
        }
        let file = tempfile::tempfile_in(dir).map_err(io_error(format!("tmpfile({})", dir.display())))?;
        let serial = self.tmpfile_counter.fetch_add(1, Ordering::Relaxed);
        let canonical = dir
            .canonicalize()
            .unwrap_or_else(|_| dir.to_path_buf())
            .join(format!("#tmpfile-{serial}"));
        Ok(Channel::file(
            dir.to_path_buf(),
            canonical,
            file,
            flags & O_APPEND != 0,
            flags,
        ))
    }

    fn open_path(path: PathBuf, flags: i32, mode: u32) -> FsResult<Channel> {
        if flags & O_NOFOLLOW != 0
            && fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink())
        {
            return Err(sys(Errno::LOOP, format!("{} is a symlink", path.display())));
        }

        let access = flags & O_ACCMODE;
        let existing = fs::metadata(&path).ok();
        if let Some(metadata) = &existing {
            if flags & O_CREAT != 0 && flags & O_EXCL != 0 {
                return Err(sys(Errno::EXIST, format!("{} exists", path.display())));
            }
            if metadata.is_dir() {
                if access != O_RDONLY {
                    return Err(sys(Errno::ISDIR, format!("{} is a directory", path.display())));
                }
                let canonical = path.canonicalize().map_err(io_error("canonicalize"))?;
                return Ok(Channel::directory(path, canonical, flags));
            }
        }
        if flags & O_DIRECTORY != 0 {
            return Err(match existing {
                Some(_) => sys(Errno::NOTDIR, format!("{} is not a directory", path.display())),
                None => sys(Errno::NOENT, format!("{} does not exist", path.display())),
            });
        }

        let mut options = OpenOptions::new();
        options
            .read(access != O_WRONLY)
            .write(access != O_RDONLY)
            .truncate(flags & O_TRUNC != 0);
        if flags & O_CREAT != 0 {
            if flags & O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode & 0o7777);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options
            .open(&path)
            .map_err(io_error(format!("open({})", path.display())))?;
        let canonical = path.canonicalize().map_err(io_error("canonicalize"))?;
        Ok(Channel::file(path, canonical, file, flags & O_APPEND != 0, flags))
    }

    /// Close `fd`, releasing its locks.
    pub fn close(&self, fd: Fd) -> FsResult<()> {
        let channel = self
            .fds
            .lock()
            .remove(fd)
            .ok_or_else(|| sys(Errno::BADF, format!("{fd} is not open")))?;
        self.locks.release_all(channel.canonical(), fd);
        debug!(fd = fd.0, path = %channel.path().display(), "Closed");
        Ok(())
    }

    /// Close every descriptor. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let drained = self.fds.lock().drain();
        for (fd, channel) in &drained {
            self.locks.release_all(channel.canonical(), *fd);
        }
        self.locks.clear();
        drained.len()
    }

    /// Read up to one buffer per guest iovec length; the last may be short.
    pub fn read(&self, fd: Fd, lens: &[usize]) -> FsResult<Vec<Vec<u8>>> {
        self.with_channel(fd, |c| c.read(lens).map_err(io_error("read")))
    }

    /// Positional read.
    pub fn pread(&self, fd: Fd, lens: &[usize], offset: u64) -> FsResult<Vec<Vec<u8>>> {
        self.with_channel(fd, |c| c.pread(lens, offset).map_err(io_error("pread")))
    }

    /// Write at the current position.
    pub fn write(&self, fd: Fd, bufs: &[&[u8]]) -> FsResult<usize> {
        self.with_channel(fd, |c| c.write(bufs).map_err(io_error("write")))
    }

    /// Positional write.
    pub fn pwrite(&self, fd: Fd, bufs: &[&[u8]], offset: u64) -> FsResult<usize> {
        self.with_channel(fd, |c| c.pwrite(bufs, offset).map_err(io_error("pwrite")))
    }

    /// Move the position.
    ///
    /// `SEEK_END` counts backwards from the end of the file.
    pub fn seek(&self, fd: Fd, offset: i64, whence: i32) -> FsResult<u64> {
        self.with_channel(fd, |c| {
            let base = match whence {
                SEEK_SET => 0,
                SEEK_CUR => i128::from(c.position()),
                SEEK_END => i128::from(c.len().map_err(io_error("seek"))?),
                _ => return Err(sys(Errno::INVAL, format!("bad whence {whence}"))),
            };
            let target = if whence == SEEK_END {
                base - i128::from(offset)
            } else {
                base + i128::from(offset)
            };
            let position = u64::try_from(target)
                .map_err(|_| sys(Errno::INVAL, format!("seek to negative offset {target}")))?;
            c.set_position(position);
            Ok(position)
        })
    }

    /// Current position.
    pub fn tell(&self, fd: Fd) -> FsResult<u64> {
        self.with_channel(fd, |c| Ok(c.position()))
    }

    /// Truncate or extend.
    pub fn set_len(&self, fd: Fd, len: u64) -> FsResult<()> {
        self.with_channel(fd, |c| c.set_len(len).map_err(io_error("truncate")))
    }

    /// Flush data and metadata.
    pub fn sync(&self, fd: Fd) -> FsResult<()> {
        self.with_channel(fd, |c| c.sync_all().map_err(io_error("fsync")))
    }

    /// Flush data.
    pub fn datasync(&self, fd: Fd) -> FsResult<()> {
        self.with_channel(fd, |c| c.sync_data().map_err(io_error("fdatasync")))
    }

    /// Attributes of an open descriptor.
    pub fn stat_fd(&self, fd: Fd) -> FsResult<FileStat> {
        self.with_channel(fd, |c| {
            c.metadata()
                .map(|m| FileStat::from_metadata(&m))
                .map_err(io_error("fstat"))
        })
    }

    /// Attributes of a path; `follow` selects `stat` over `lstat`.
    pub fn stat_path(&self, dirfd: i32, path: &str, follow: bool) -> FsResult<FileStat> {
        let resolved = self.resolve(dirfd, path)?;
        let metadata = if follow {
            fs::metadata(&resolved)
        } else {
            fs::symlink_metadata(&resolved)
        };
        metadata
            .map(|m| FileStat::from_metadata(&m))
            .map_err(io_error(format!("stat({})", resolved.display())))
    }

    /// `unlinkat`.
    pub fn unlink(&self, dirfd: i32, path: &str, flags: i32) -> FsResult<()> {
        let resolved = self.resolve(dirfd, path)?;
        if flags & !AT_REMOVEDIR != 0 {
            return Err(sys(Errno::INVAL, format!("bad unlinkat flags 0x{flags:x}")));
        }
        if flags & AT_REMOVEDIR != 0 {
            return fs::remove_dir(&resolved).map_err(io_error(format!("rmdir({})", resolved.display())));
        }
        let metadata = fs::symlink_metadata(&resolved)
            .map_err(io_error(format!("unlink({})", resolved.display())))?;
        if metadata.is_dir() {
            return Err(sys(Errno::ISDIR, format!("{} is a directory", resolved.display())));
        }
        fs::remove_file(&resolved).map_err(io_error(format!("unlink({})", resolved.display())))
    }

    /// `mkdirat`.
    pub fn mkdir(&self, dirfd: i32, path: &str, mode: u32) -> FsResult<()> {
        let resolved = self.resolve(dirfd, path)?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode & 0o7777);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder
            .create(&resolved)
            .map_err(io_error(format!("mkdir({})", resolved.display())))
    }

    /// `faccessat`.
    pub fn access(&self, dirfd: i32, path: &str, amode: i32) -> FsResult<()> {
        if amode & !(R_OK | W_OK | X_OK) != 0 {
            return Err(sys(Errno::INVAL, format!("bad access mode 0x{amode:x}")));
        }
        let resolved = self.resolve(dirfd, path)?;
        let metadata =
            fs::metadata(&resolved).map_err(io_error(format!("access({})", resolved.display())))?;
        if amode == F_OK {
            return Ok(());
        }
        let mode = FileStat::from_metadata(&metadata).mode;
        let denied = (amode & R_OK != 0 && mode & 0o444 == 0)
            || (amode & W_OK != 0 && metadata.permissions().readonly())
            || (amode & X_OK != 0 && mode & 0o111 == 0);
        if denied {
            Err(sys(Errno::ACCES, format!("{} denies mode {amode}", resolved.display())))
        } else {
            Ok(())
        }
    }

    /// `chmod`.
    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let resolved = self.resolve(AT_FDCWD, path)?;
        set_mode(&resolved, mode).map_err(io_error(format!("chmod({})", resolved.display())))
    }

    /// `fchmod`.
    pub fn fchmod(&self, fd: Fd, mode: u32) -> FsResult<()> {
        let path = self.with_channel(fd, |c| Ok(c.path().to_path_buf()))?;
        set_mode(&path, mode).map_err(io_error("fchmod"))
    }

    /// `fchown`; ownership is not changed, only the descriptor is checked.
    pub fn fchown(&self, fd: Fd, uid: u32, gid: u32) -> FsResult<()> {
        self.with_channel(fd, |c| {
            debug!(fd = fd.0, uid, gid, path = %c.path().display(), "Ignoring fchown");
            Ok(())
        })
    }

    /// `readlinkat`.
    pub fn readlink(&self, dirfd: i32, path: &str) -> FsResult<PathBuf> {
        let resolved = self.resolve(dirfd, path)?;
        fs::read_link(&resolved).map_err(io_error(format!("readlink({})", resolved.display())))
    }

    /// Set access and modification times; `None` leaves a time unchanged.
    pub fn set_times(
        &self,
        dirfd: i32,
        path: &str,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> FsResult<()> {
        let resolved = self.resolve(dirfd, path)?;
        let mut times = FileTimes::new();
        if let Some(t) = accessed {
            times = times.set_accessed(t);
        }
        if let Some(t) = modified {
            times = times.set_modified(t);
        }
        let file = fs::File::options()
            .write(true)
            .open(&resolved)
            .or_else(|_| fs::File::open(&resolved))
            .map_err(io_error(format!("utimensat({})", resolved.display())))?;
        file.set_times(times)
            .map_err(io_error(format!("utimensat({})", resolved.display())))
    }

    fn lock_target(&self, fd: Fd, request: &FlockRequest) -> FsResult<(PathBuf, u64, u64)> {
        self.with_channel(fd, |c| {
            let base = match i32::from(request.l_whence) {
                SEEK_SET => 0,
                SEEK_CUR => i64::try_from(c.position()).unwrap_or(i64::MAX),
                SEEK_END => i64::try_from(c.len().map_err(io_error("fcntl"))?).unwrap_or(i64::MAX),
                whence => return Err(sys(Errno::INVAL, format!("bad l_whence {whence}"))),
            };
            let start = base
                .checked_add(request.l_start)
                .ok_or_else(|| sys(Errno::INVAL, "l_start overflows"))?;
            let (start, end) = lock_range(start, request.l_len)
                .ok_or_else(|| sys(Errno::INVAL, format!("bad lock range {start}+{}", request.l_len)))?;
            Ok((c.canonical().to_path_buf(), start, end))
        })
    }

    fn lock_type(l_type: i16) -> FsResult<LockType> {
        match l_type {
            F_RDLCK => Ok(LockType::Shared),
            F_WRLCK => Ok(LockType::Exclusive),
            other => Err(sys(Errno::INVAL, format!("bad l_type {other}"))),
        }
    }

    /// `F_SETLK`/`F_SETLKW`.
    ///
    /// Never blocks: a conflict is reported as `AGAIN` for both commands.
    /// Descriptors of this environment are checked in the lock table first;
    /// the range is then mirrored to a host advisory lock, which is what
    /// other environments and processes see.
    pub fn set_lock(&self, fd: Fd, request: &FlockRequest) -> FsResult<()> {
        let (path, start, end) = self.lock_target(fd, request)?;
        if request.l_type == F_UNLCK {
            let removed = self.locks.unlock(&path, fd, start, end);
            self.with_channel(fd, |c| {
                let ranges = removed.iter().map(|r| (r.start, r.end)).chain([(start, end)]);
                for (start, end) in ranges {
                    c.os_lock(None, start, end).map_err(io_error("fcntl(F_UNLCK)"))?;
                }
                Ok(())
            })?;
            trace!(fd = fd.0, start, end, "Unlocked");
            return Ok(());
        }
        let lock_type = Self::lock_type(request.l_type)?;
        let conflict = |holder: String| {
            sys(Errno::AGAIN, format!("[{start}, {end}) conflicts with lock held by {holder}"))
        };

        if let Some(record) = self.locks.conflicting(&path, fd, start, end, lock_type) {
            return Err(conflict(record.owner.to_string()));
        }
        let granted = self.with_channel(fd, |c| {
            c.os_lock(Some(lock_type), start, end).map_err(io_error("fcntl(F_SETLK)"))
        })?;
        if !granted {
            return Err(conflict("another process".to_string()));
        }
        let replaced = self
            .locks
            .lock(&path, fd, start, end, lock_type)
            .map_err(|record| conflict(record.owner.to_string()))?;
        if !replaced.is_empty() {
            self.with_channel(fd, |c| {
                for (start, end) in replaced.iter().flat_map(|r| outside(r, start, end)) {
                    c.os_lock(None, start, end).map_err(io_error("fcntl(F_UNLCK)"))?;
                }
                Ok(())
            })?;
        }
        trace!(fd = fd.0, start, end, ?lock_type, "Locked");
        Ok(())
    }

    /// `F_GETLK`: the lock that would block `request`, if any.
    pub fn get_lock(&self, fd: Fd, request: &FlockRequest) -> FsResult<Option<LockRecord>> {
        let (path, start, end) = self.lock_target(fd, request)?;
        let lock_type = Self::lock_type(request.l_type)?;
        Ok(self.locks.conflicting(&path, fd, start, end, lock_type))
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, permissions)
}
