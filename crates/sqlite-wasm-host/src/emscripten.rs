//! Emscripten `env` imports.
//!
//! `__syscall_*` functions return a non-negative result or a negated errno.
//! The `_js` helpers, clocks and process-control functions have their own
//! signatures and are built directly as [`HostFunction`]s. Pthread support is
//! not provided: thread creation answers `NOSYS` and the bookkeeping hooks
//! are no-ops.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use sqlite_wasm_common::{Errno, HostFunctionError, RuntimeError, SysError};
use sqlite_wasm_core::memory::resize_heap_target;
use sqlite_wasm_core::{
    Args, Fd, FuncSignature, GuestMemory, GuestMemoryExt, HostFunction, HostImports, Pages,
    ValType, Value, WasmPtr,
};

use crate::embedder::TimeZoneInfo;
use crate::fcntl::{
    AT_EMPTY_PATH, AT_FDCWD, AT_REMOVEDIR, AT_SYMLINK_NOFOLLOW, F_GETFD, F_GETFL, F_GETLK,
    F_SETFD, F_SETFL, F_SETLK, F_SETLKW, F_RDLCK, F_UNLCK, F_WRLCK, O_CREAT, O_TMPFILE,
    SEEK_SET, TIMESPEC_SIZE, UTIME_NOW, UTIME_OMIT, describe_open_flags, flock,
};
use crate::fs::stat::{FileStat, write_stat};
use crate::fs::{ChannelKind, FlockRequest, LockType};
use crate::syscall::{ErrnoConvention, SyscallContext, SyscallResult, guest_len, guest_size, syscall, unsupported};

/// Import module name.
pub const ENV_MODULE: &str = "env";

/// Longest zone name `_tzset_js` writes, excluding the NUL.
pub const TZ_NAME_MAX: usize = 16;

/// Largest buffer `getentropy` accepts.
pub const GETENTROPY_MAX: u32 = 256;

use ValType::{F64, I32, I64};

/// `struct tm` field offsets.
mod tm {
    pub const SEC: u32 = 0;
    pub const MIN: u32 = 4;
    pub const HOUR: u32 = 8;
    pub const MDAY: u32 = 12;
    pub const MON: u32 = 16;
    pub const YEAR: u32 = 20;
    pub const WDAY: u32 = 24;
    pub const YDAY: u32 = 28;
    pub const ISDST: u32 = 32;
    pub const GMTOFF: u32 = 36;
}

/// Pthread hooks that are linked as no-ops.
const PTHREAD_NOOPS: &[(&str, &[ValType])] = &[
    ("_emscripten_init_main_thread_js", &[I32]),
    ("_emscripten_notify_mailbox_postmessage", &[I32, I32, I32]),
    ("_emscripten_thread_cleanup", &[I32]),
    ("_emscripten_thread_mailbox_await", &[I32]),
    ("_emscripten_thread_set_strongref", &[I32]),
    ("emscripten_check_blocking_allowed", &[]),
    ("emscripten_exit_with_live_runtime", &[]),
];

fn sys(errno: Errno, message: impl Into<String>) -> HostFunctionError {
    HostFunctionError::sys(errno, message)
}

fn env<F>(name: &'static str, params: &[ValType], ctx: &Arc<SyscallContext>, handler: F) -> HostFunction
where
    F: Fn(&SyscallContext, &mut dyn GuestMemory, &[Value]) -> SyscallResult + Send + Sync + 'static,
{
    syscall(ENV_MODULE, name, params, ErrnoConvention::Negative, ctx, handler)
}

fn noop(name: &'static str, params: &[ValType]) -> HostFunction {
    HostFunction::new(ENV_MODULE, name, FuncSignature::new(params, &[]), move |_, _| {
        trace!(function = name, "Ignored pthread hook");
        Ok(Vec::new())
    })
}

fn abort(name: &'static str, params: &[ValType], describe: fn(&dyn GuestMemory, &[Value]) -> String) -> HostFunction {
    HostFunction::new(ENV_MODULE, name, FuncSignature::new(params, &[]), move |memory, args| {
        Err(RuntimeError::GuestAbort {
            message: describe(memory, args),
        })
    })
}

/// Register every `env` import.
pub fn register(imports: &mut HostImports, ctx: &Arc<SyscallContext>) {
    imports.extend([
        env("__syscall_openat", &[I32, I32, I32, I32], ctx, syscall_openat),
        env("__syscall_fcntl64", &[I32, I32, I32], ctx, syscall_fcntl64),
        env("__syscall_fstat64", &[I32, I32], ctx, syscall_fstat64),
        env("__syscall_stat64", &[I32, I32], ctx, |ctx, memory, args| {
            stat_path(ctx, memory, AT_FDCWD, args.ptr(0)?, args.ptr(1)?, true)
        }),
        env("__syscall_lstat64", &[I32, I32], ctx, |ctx, memory, args| {
            stat_path(ctx, memory, AT_FDCWD, args.ptr(0)?, args.ptr(1)?, false)
        }),
        env("__syscall_newfstatat", &[I32, I32, I32, I32], ctx, syscall_newfstatat),
        env("__syscall_ftruncate64", &[I32, I64], ctx, syscall_ftruncate64),
        env("__syscall_fdatasync", &[I32], ctx, |ctx, _, args| {
            let fd = Fd(args.i32(0)?);
            if !fd.is_std_stream() {
                ctx.fs.datasync(fd)?;
            }
            Ok(0)
        }),
        env("__syscall_unlinkat", &[I32, I32, I32], ctx, |ctx, memory, args| {
            let path = read_path(memory, args.ptr(1)?)?;
            ctx.fs.unlink(args.i32(0)?, &path, args.i32(2)?)?;
            Ok(0)
        }),
        env("__syscall_rmdir", &[I32], ctx, |ctx, memory, args| {
            let path = read_path(memory, args.ptr(0)?)?;
            ctx.fs.unlink(AT_FDCWD, &path, AT_REMOVEDIR)?;
            Ok(0)
        }),
        env("__syscall_mkdirat", &[I32, I32, I32], ctx, |ctx, memory, args| {
            let path = read_path(memory, args.ptr(1)?)?;
            ctx.fs.mkdir(args.i32(0)?, &path, args.u32(2)?)?;
            Ok(0)
        }),
        env("__syscall_faccessat", &[I32, I32, I32, I32], ctx, |ctx, memory, args| {
            let path = read_path(memory, args.ptr(1)?)?;
            ctx.fs.access(args.i32(0)?, &path, args.i32(2)?)?;
            Ok(0)
        }),
        env("__syscall_chmod", &[I32, I32], ctx, |ctx, memory, args| {
            let path = read_path(memory, args.ptr(0)?)?;
            ctx.fs.chmod(&path, args.u32(1)?)?;
            Ok(0)
        }),
        env("__syscall_fchmod", &[I32, I32], ctx, |ctx, _, args| {
            ctx.fs.fchmod(Fd(args.i32(0)?), args.u32(1)?)?;
            Ok(0)
        }),
        env("__syscall_fchown32", &[I32, I32, I32], ctx, |ctx, _, args| {
            ctx.fs.fchown(Fd(args.i32(0)?), args.u32(1)?, args.u32(2)?)?;
            Ok(0)
        }),
        env("__syscall_getcwd", &[I32, I32], ctx, syscall_getcwd),
        env("__syscall_readlinkat", &[I32, I32, I32, I32], ctx, syscall_readlinkat),
        env("__syscall_utimensat", &[I32, I32, I32, I32], ctx, syscall_utimensat),
        env("__syscall_ioctl", &[I32, I32, I32], ctx, |_, _, args| {
            let fd = Fd(args.i32(0)?);
            if fd.is_std_stream() {
                Err(sys(Errno::NOTTY, format!("ioctl(0x{:x}) on {fd}", args.i32(1)?)))
            } else {
                Err(sys(Errno::NOSYS, format!("ioctl(0x{:x}) on {fd}", args.i32(1)?)))
            }
        }),
        env("_mmap_js", &[I32, I32, I32, I32, I64, I32, I32], ctx, |ctx, _, args| {
            refuse_mapping(ctx, Fd(args.i32(3)?))
        }),
        env("_munmap_js", &[I32, I32, I32, I32, I32, I64], ctx, |ctx, _, args| {
            refuse_mapping(ctx, Fd(args.i32(4)?))
        }),
        env("emscripten_resize_heap", &[I32], ctx, resize_heap),
        syscall(ENV_MODULE, "getentropy", &[I32, I32], ErrnoConvention::Positive, ctx, getentropy),
        HostFunction::new(
            ENV_MODULE,
            "_emscripten_get_now_is_monotonic",
            FuncSignature::new(&[], &[I32]),
            |_, _| Ok(vec![Value::I32(1)]),
        ),
        clock("emscripten_date_now", ctx, |ctx| ctx.embedder.wall_clock()),
        clock("emscripten_get_now", ctx, |ctx| ctx.embedder.monotonic_clock()),
        localtime(ctx),
        tzset(ctx),
        HostFunction::new(ENV_MODULE, "exit", FuncSignature::new(&[I32], &[]), |_, args| {
            Err(RuntimeError::GuestExit { code: args.i32(0)? })
        }),
        abort("abort", &[], |_, _| "abort() called".to_string()),
        abort("_abort_js", &[], |_, _| "native code called abort()".to_string()),
        abort("__assert_fail", &[I32, I32, I32, I32], describe_assertion),
        abort("__handle_stack_overflow", &[I32], |_, args| {
            format!(
                "stack overflow (attempt to set SP to 0x{:x})",
                args.u32(0).unwrap_or_default()
            )
        }),
        unsupported(ENV_MODULE, "__pthread_create_js", &[I32, I32, I32, I32], &[I32], Errno::NOSYS, ErrnoConvention::Negative),
        unsupported(
            ENV_MODULE,
            "_emscripten_receive_on_main_thread_js",
            &[I32, I32, I32, I32, I32],
            &[F64],
            Errno::NOSYS,
            ErrnoConvention::Negative,
        ),
    ]);

    imports.extend(PTHREAD_NOOPS.iter().map(|&(name, params)| noop(name, params)));
}

fn read_path(memory: &dyn GuestMemory, ptr: WasmPtr<u8>) -> Result<String, HostFunctionError> {
    if ptr.is_null() {
        return Err(sys(Errno::FAULT, "NULL path"));
    }
    Ok(memory.read_cstring(ptr)?)
}

fn describe_assertion(memory: &dyn GuestMemory, args: &[Value]) -> String {
    let text = |index: usize| {
        args.ptr::<u8>(index)
            .ok()
            .filter(|ptr| !ptr.is_null())
            .and_then(|ptr| memory.read_cstring(ptr).ok())
            .unwrap_or_else(|| "unknown".to_string())
    };
    format!(
        "Assertion failed: {}, at: {}:{} ({})",
        text(0),
        text(1),
        args.i32(2).unwrap_or_default(),
        text(3)
    )
}

fn syscall_openat(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let dirfd = args.i32(0)?;
    let path = read_path(memory, args.ptr(1)?)?;
    let flags = args.i32(2)?;
    let varargs = args.ptr::<i32>(3)?;
    let mode = if flags & O_CREAT != 0 || flags & O_TMPFILE == O_TMPFILE {
        memory.read_u32(varargs)?
    } else {
        0
    };
    debug!(dirfd, path = %path, flags = %describe_open_flags(flags), mode = format_args!("{mode:o}"), "openat");
    let fd = ctx.fs.open(dirfd, &path, flags, mode)?;
    Ok(fd.0)
}

fn read_flock(memory: &dyn GuestMemory, ptr: WasmPtr<u8>) -> Result<FlockRequest, RuntimeError> {
    Ok(FlockRequest {
        l_type: memory.read_i16(ptr.add_bytes(flock::TYPE))?,
        l_whence: memory.read_i16(ptr.add_bytes(flock::WHENCE))?,
        l_start: memory.read_i64(ptr.add_bytes(flock::START))?,
        l_len: memory.read_i64(ptr.add_bytes(flock::LEN))?,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn syscall_fcntl64(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    let cmd = args.i32(1)?;
    let varargs = args.ptr::<WasmPtr<u8>>(2)?;
    match cmd {
        F_GETLK => {
            let ptr = memory.read_ptr(varargs)?;
            let request = read_flock(memory, ptr)?;
            match ctx.fs.get_lock(fd, &request)? {
                None => memory.write_i16(ptr.add_bytes(flock::TYPE), F_UNLCK)?,
                Some(conflict) => {
                    let l_type = match conflict.lock_type {
                        LockType::Shared => F_RDLCK,
                        LockType::Exclusive => F_WRLCK,
                    };
                    let len = if conflict.end == u64::MAX {
                        0
                    } else {
                        conflict.end - conflict.start
                    };
                    memory.write_i16(ptr.add_bytes(flock::TYPE), l_type)?;
                    memory.write_i16(ptr.add_bytes(flock::WHENCE), SEEK_SET as i16)?;
                    memory.write_i64(ptr.add_bytes(flock::START), conflict.start as i64)?;
                    memory.write_i64(ptr.add_bytes(flock::LEN), len as i64)?;
                    memory.write_i32(ptr.add_bytes(flock::PID), std::process::id() as i32)?;
                }
            }
            Ok(0)
        }
        F_SETLK | F_SETLKW => {
            let ptr = memory.read_ptr(varargs)?;
            let request = read_flock(memory, ptr)?;
            if let Err(e) = ctx.fs.set_lock(fd, &request) {
                if e.errno() == Some(Errno::AGAIN) {
                    warn!(fd = fd.0, start = request.l_start, len = request.l_len, "Lock conflict");
                }
                return Err(e);
            }
            Ok(0)
        }
        F_GETFD | F_SETFD | F_GETFL | F_SETFL => Ok(0),
        other => Err(sys(Errno::INVAL, format!("fcntl command {other} on {fd}"))),
    }
}

fn syscall_fstat64(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    let stat = if fd.is_std_stream() {
        FileStat::character_device()
    } else {
        ctx.fs.stat_fd(fd)?
    };
    write_stat(memory, args.ptr::<u8>(1)?, &stat)?;
    Ok(0)
}

fn stat_path(
    ctx: &SyscallContext,
    memory: &mut dyn GuestMemory,
    dirfd: i32,
    path: WasmPtr<u8>,
    buf: WasmPtr<u8>,
    follow: bool,
) -> SyscallResult {
    let path = read_path(memory, path)?;
    let stat = ctx.fs.stat_path(dirfd, &path, follow)?;
    write_stat(memory, buf, &stat)?;
    Ok(0)
}

fn syscall_newfstatat(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let dirfd = args.i32(0)?;
    let path_ptr = args.ptr::<u8>(1)?;
    let buf = args.ptr::<u8>(2)?;
    let flags = args.i32(3)?;
    if flags & AT_EMPTY_PATH != 0 && !path_ptr.is_null() && memory.read_cstring(path_ptr)?.is_empty() {
        let stat = if Fd(dirfd).is_std_stream() {
            FileStat::character_device()
        } else {
            ctx.fs.stat_fd(Fd(dirfd))?
        };
        write_stat(memory, buf, &stat)?;
        return Ok(0);
    }
    stat_path(ctx, memory, dirfd, path_ptr, buf, flags & AT_SYMLINK_NOFOLLOW == 0)
}

fn syscall_ftruncate64(ctx: &SyscallContext, _: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    let length = args.i64(1)?;
    let length = u64::try_from(length).map_err(|_| sys(Errno::INVAL, format!("negative length {length}")))?;
    ctx.fs.set_len(fd, length)?;
    Ok(0)
}

fn syscall_getcwd(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let buf = args.ptr::<u8>(0)?;
    let size = args.u32(1)?;
    if size == 0 {
        return Err(sys(Errno::INVAL, "getcwd with zero-sized buffer"));
    }
    let cwd = ctx.fs.cwd().to_string_lossy().into_owned();
    let needed = guest_size(cwd.len() + 1)?;
    if usize::try_from(size).unwrap_or(usize::MAX) < cwd.len() + 1 {
        return Err(sys(Errno::RANGE, format!("getcwd needs {needed} bytes, got {size}")));
    }
    memory.write_cstring(buf, &cwd)?;
    Ok(needed)
}

fn syscall_readlinkat(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let dirfd = args.i32(0)?;
    let path = read_path(memory, args.ptr(1)?)?;
    let buf = args.ptr::<u8>(2)?;
    let size = args.i32(3)?;
    if size <= 0 {
        return Err(sys(Errno::INVAL, format!("readlinkat buffer size {size}")));
    }
    let target = ctx.fs.readlink(dirfd, &path)?;
    let target = target.to_string_lossy();
    let bytes = &target.as_bytes()[..target.len().min(guest_len(size)?)];
    memory.write_bytes(buf, bytes)?;
    guest_size(bytes.len())
}

fn timespec_time(memory: &dyn GuestMemory, ptr: WasmPtr<u8>, now: SystemTime) -> Result<Option<SystemTime>, HostFunctionError> {
    let sec = memory.read_i64(ptr)?;
    let nsec = i64::from(memory.read_i32(ptr.add_bytes(8))?);
    match nsec {
        UTIME_NOW => Ok(Some(now)),
        UTIME_OMIT => Ok(None),
        0..=999_999_999 => {
            let nsec = u32::try_from(nsec).unwrap_or_default();
            let time = match u64::try_from(sec) {
                Ok(sec) => UNIX_EPOCH.checked_add(Duration::new(sec, nsec)),
                Err(_) => UNIX_EPOCH
                    .checked_sub(Duration::from_secs(sec.unsigned_abs()))
                    .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(nsec)))),
            };
            time.map(Some)
                .ok_or_else(|| sys(Errno::INVAL, format!("timestamp {sec}.{nsec:09} out of range")))
        }
        _ => Err(sys(Errno::INVAL, format!("tv_nsec {nsec} out of range"))),
    }
}

fn syscall_utimensat(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let dirfd = args.i32(0)?;
    let path = read_path(memory, args.ptr(1)?)?;
    let times = args.ptr::<u8>(2)?;
    let now = UNIX_EPOCH + ctx.embedder.wall_clock();
    let (accessed, modified) = if times.is_null() {
        (Some(now), Some(now))
    } else {
        (
            timespec_time(memory, times, now)?,
            timespec_time(memory, times.add_bytes(TIMESPEC_SIZE), now)?,
        )
    };
    trace!(dirfd, path = %path, ?accessed, ?modified, "utimensat");
    ctx.fs.set_times(dirfd, &path, accessed, modified)?;
    Ok(0)
}

fn refuse_mapping(ctx: &SyscallContext, fd: Fd) -> SyscallResult {
    let regular = !fd.is_std_stream() && ctx.fs.with_channel(fd, |c| Ok(c.kind() == ChannelKind::File))?;
    if regular {
        Err(sys(Errno::INVAL, format!("memory-mapping {fd} is not supported")))
    } else {
        Err(sys(Errno::NODEV, format!("{fd} is not a regular file")))
    }
}

fn resize_heap(_: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let requested = u64::from(args.u32(0)?);
    let current = memory.size_pages();
    if requested <= current.in_bytes() {
        return Ok(1);
    }
    let target = resize_heap_target(requested, current, memory.max_pages());
    if target.in_bytes() < requested {
        warn!(requested, max_pages = memory.max_pages().0, "Heap cannot grow to the requested size");
        return Err(sys(Errno::NOMEM, format!("cannot grow heap to {requested} bytes")));
    }
    match memory.grow(Pages(target.0 - current.0)) {
        Some(old) => {
            debug!(old = old.0, new = target.0, requested, "Heap grown");
            Ok(1)
        }
        None => {
            warn!(requested, target = target.0, "Heap growth refused");
            Err(sys(Errno::NOMEM, format!("growing heap to {target} failed")))
        }
    }
}

fn getentropy(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let len = args.u32(1)?;
    if len > GETENTROPY_MAX {
        return Err(sys(Errno::IO, format!("getentropy of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    ctx.embedder
        .fill_entropy(&mut buf)
        .map_err(|e| SysError::from_io(&e, "getentropy"))?;
    memory.write_bytes(args.ptr::<u8>(0)?, &buf)?;
    Ok(0)
}

fn clock(name: &'static str, ctx: &Arc<SyscallContext>, read: fn(&SyscallContext) -> Duration) -> HostFunction {
    let ctx = Arc::clone(ctx);
    HostFunction::new(ENV_MODULE, name, FuncSignature::new(&[], &[F64]), move |_, _| {
        Ok(vec![Value::F64(read(&ctx).as_secs_f64() * 1000.0)])
    })
}

fn localtime(ctx: &Arc<SyscallContext>) -> HostFunction {
    let ctx = Arc::clone(ctx);
    HostFunction::new(
        ENV_MODULE,
        "_localtime_js",
        FuncSignature::new(&[I64, I32], &[]),
        move |memory, args| {
            let time = args.i64(0)?;
            let dst = args.ptr::<u8>(1)?;
            let lt = ctx.embedder.local_time(time);
            for (offset, value) in [
                (tm::SEC, lt.sec),
                (tm::MIN, lt.min),
                (tm::HOUR, lt.hour),
                (tm::MDAY, lt.mday),
                (tm::MON, lt.mon),
                (tm::YEAR, lt.year),
                (tm::WDAY, lt.wday),
                (tm::YDAY, lt.yday),
                (tm::ISDST, lt.isdst),
                (tm::GMTOFF, lt.gmtoff),
            ] {
                memory.write_i32(dst.add_bytes(offset), value)?;
            }
            Ok(Vec::new())
        },
    )
}

fn zone_name(name: &str) -> &str {
    let mut end = name.len().min(TZ_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn tzset(ctx: &Arc<SyscallContext>) -> HostFunction {
    let ctx = Arc::clone(ctx);
    HostFunction::new(
        ENV_MODULE,
        "_tzset_js",
        FuncSignature::new(&[I32, I32, I32, I32], &[]),
        move |memory, args| {
            let TimeZoneInfo {
                timezone,
                daylight,
                std_name,
                dst_name,
            } = ctx.embedder.timezone();
            let timezone = i32::try_from(timezone)
                .map_err(|_| RuntimeError::trap(format!("time zone offset {timezone} out of range")))?;
            memory.write_i32(args.ptr::<i32>(0)?, timezone)?;
            memory.write_i32(args.ptr::<i32>(1)?, daylight)?;
            memory.write_cstring(args.ptr::<u8>(2)?, zone_name(&std_name))?;
            memory.write_cstring(args.ptr::<u8>(3)?, zone_name(&dst_name))?;
            Ok(Vec::new())
        },
    )
}
