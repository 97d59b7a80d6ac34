//! `wasi_snapshot_preview1` imports.
//!
//! The subset an Emscripten-built SQLite reaches (descriptor I/O, clocks,
//! entropy, environment) is implemented; every other preview1 function is
//! linked so instantiation succeeds, and answers `NOTSUP`.

use std::sync::Arc;

use tracing::trace;

use sqlite_wasm_common::{Errno, HostFunctionError, RuntimeError, SysError};
use sqlite_wasm_core::{
    Args, Fd, FuncSignature, GuestMemory, GuestMemoryExt, HostFunction, HostImports, ValType,
    Value, WasmPtr, checked_range,
};

use crate::fs::stat::{FileStat, filetype, write_fdstat, write_filestat};
use crate::fs::ChannelKind;
use crate::syscall::{
    ErrnoConvention, SyscallContext, SyscallResult, gather, guest_size, read_iovecs, scatter,
    syscall, unsupported,
};

/// Import module name.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// `fdflags::APPEND`.
const FDFLAGS_APPEND: u16 = 1;

/// Resolution reported by `clock_res_get`, in nanoseconds.
pub const CLOCK_RESOLUTION_NS: i64 = 1_000;

/// `clockid::REALTIME`.
pub const CLOCK_REALTIME: i32 = 0;

use ValType::{I32, I64};

/// Preview1 functions that are linked but not implemented.
const UNSUPPORTED: &[(&str, &[ValType])] = &[
    ("fd_advise", &[I32, I64, I64, I32]),
    ("fd_allocate", &[I32, I64, I64]),
    ("fd_fdstat_set_flags", &[I32, I32]),
    ("fd_fdstat_set_rights", &[I32, I64, I64]),
    ("fd_filestat_set_times", &[I32, I64, I64, I32]),
    ("fd_prestat_dir_name", &[I32, I32, I32]),
    ("fd_readdir", &[I32, I32, I32, I64, I32]),
    ("fd_renumber", &[I32, I32]),
    ("path_create_directory", &[I32, I32, I32]),
    ("path_filestat_get", &[I32, I32, I32, I32, I32]),
    ("path_filestat_set_times", &[I32, I32, I32, I32, I64, I64, I32]),
    ("path_link", &[I32, I32, I32, I32, I32, I32, I32]),
    ("path_open", &[I32, I32, I32, I32, I32, I64, I64, I32, I32]),
    ("path_readlink", &[I32, I32, I32, I32, I32, I32]),
    ("path_remove_directory", &[I32, I32, I32]),
    ("path_rename", &[I32, I32, I32, I32, I32, I32]),
    ("path_symlink", &[I32, I32, I32, I32, I32]),
    ("path_unlink_file", &[I32, I32, I32]),
    ("poll_oneoff", &[I32, I32, I32, I32]),
    ("proc_raise", &[I32]),
    ("sock_accept", &[I32, I32, I32]),
    ("sock_recv", &[I32, I32, I32, I32, I32, I32]),
    ("sock_send", &[I32, I32, I32, I32, I32]),
    ("sock_shutdown", &[I32, I32]),
];

fn badf(fd: Fd) -> HostFunctionError {
    HostFunctionError::sys(Errno::BADF, format!("{fd} is not open"))
}

fn offset_arg(offset: i64) -> Result<u64, HostFunctionError> {
    u64::try_from(offset).map_err(|_| HostFunctionError::sys(Errno::INVAL, format!("negative offset {offset}")))
}

fn nanos(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn wasi<F>(name: &'static str, params: &[ValType], ctx: &Arc<SyscallContext>, handler: F) -> HostFunction
where
    F: Fn(&SyscallContext, &mut dyn GuestMemory, &[Value]) -> SyscallResult + Send + Sync + 'static,
{
    syscall(WASI_MODULE, name, params, ErrnoConvention::Positive, ctx, handler)
}

/// Register every preview1 import.
pub fn register(imports: &mut HostImports, ctx: &Arc<SyscallContext>) {
    imports.extend([
        wasi("args_get", &[I32, I32], ctx, |_, _, _| Ok(0)),
        wasi("args_sizes_get", &[I32, I32], ctx, args_sizes_get),
        wasi("environ_get", &[I32, I32], ctx, environ_get),
        wasi("environ_sizes_get", &[I32, I32], ctx, environ_sizes_get),
        wasi("clock_res_get", &[I32, I32], ctx, clock_res_get),
        wasi("clock_time_get", &[I32, I64, I32], ctx, clock_time_get),
        wasi("fd_close", &[I32], ctx, fd_close),
        wasi("fd_datasync", &[I32], ctx, fd_datasync),
        wasi("fd_sync", &[I32], ctx, fd_sync),
        wasi("fd_fdstat_get", &[I32, I32], ctx, fd_fdstat_get),
        wasi("fd_filestat_get", &[I32, I32], ctx, fd_filestat_get),
        wasi("fd_filestat_set_size", &[I32, I64], ctx, fd_filestat_set_size),
        wasi("fd_prestat_get", &[I32, I32], ctx, |_, _, _| {
            Err(HostFunctionError::sys(Errno::BADF, "no preopened directories"))
        }),
        wasi("fd_read", &[I32, I32, I32, I32], ctx, fd_read),
        wasi("fd_pread", &[I32, I32, I32, I64, I32], ctx, fd_pread),
        wasi("fd_write", &[I32, I32, I32, I32], ctx, fd_write),
        wasi("fd_pwrite", &[I32, I32, I32, I64, I32], ctx, fd_pwrite),
        wasi("fd_seek", &[I32, I64, I32, I32], ctx, fd_seek),
        wasi("fd_tell", &[I32, I32], ctx, fd_tell),
        wasi("random_get", &[I32, I32], ctx, random_get),
        wasi("sched_yield", &[], ctx, |_, _, _| {
            std::thread::yield_now();
            Ok(0)
        }),
        HostFunction::new(WASI_MODULE, "proc_exit", FuncSignature::new(&[I32], &[]), |_, args| {
            Err(RuntimeError::GuestExit { code: args.i32(0)? })
        }),
    ]);

    imports.extend(UNSUPPORTED.iter().map(|&(name, params)| {
        unsupported(WASI_MODULE, name, params, &[I32], Errno::NOTSUP, ErrnoConvention::Positive)
    }));
}

fn args_sizes_get(_: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    memory.write_u32(args.ptr::<u32>(0)?, 0)?;
    memory.write_u32(args.ptr::<u32>(1)?, 0)?;
    Ok(0)
}

fn environ_entries(ctx: &SyscallContext) -> Vec<String> {
    ctx.embedder
        .environment()
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

fn environ_sizes_get(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let entries = environ_entries(ctx);
    let buf_size: usize = entries.iter().map(|e| e.len() + 1).sum();
    memory.write_i32(args.ptr::<u32>(0)?, guest_size(entries.len())?)?;
    memory.write_i32(args.ptr::<u32>(1)?, guest_size(buf_size)?)?;
    Ok(0)
}

fn environ_get(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let environ = args.ptr::<WasmPtr<u8>>(0)?;
    let mut buf = args.ptr::<u8>(1)?;
    for (i, entry) in environ_entries(ctx).iter().enumerate() {
        let slot = environ.add_bytes(u32::try_from(i * 4).unwrap_or(u32::MAX));
        memory.write_ptr(slot, buf)?;
        let written = memory.write_cstring(buf, entry)?;
        buf = buf.add_bytes(written);
    }
    Ok(0)
}

fn clock_res_get(_: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    memory.write_i64(args.ptr::<u64>(1)?, CLOCK_RESOLUTION_NS)?;
    Ok(0)
}

fn clock_time_get(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let id = args.i32(0)?;
    let now = match id {
        CLOCK_REALTIME => ctx.embedder.wall_clock(),
        1..=3 => ctx.embedder.monotonic_clock(),
        _ => return Err(HostFunctionError::sys(Errno::INVAL, format!("bad clock id {id}"))),
    };
    memory.write_i64(args.ptr::<u64>(2)?, i64::try_from(nanos(now)).unwrap_or(i64::MAX))?;
    Ok(0)
}

fn fd_close(ctx: &SyscallContext, _: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    if fd.is_std_stream() {
        return Ok(0);
    }
    ctx.fs.close(fd)?;
    Ok(0)
}

fn fd_sync(ctx: &SyscallContext, _: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    if !fd.is_std_stream() {
        ctx.fs.sync(fd)?;
    }
    Ok(0)
}

fn fd_datasync(ctx: &SyscallContext, _: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    if !fd.is_std_stream() {
        ctx.fs.datasync(fd)?;
    }
    Ok(0)
}

fn fd_fdstat_get(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    let (kind, flags) = if fd.is_std_stream() {
        (filetype::CHARACTER_DEVICE, 0)
    } else {
        ctx.fs.with_channel(fd, |c| {
            let kind = match c.kind() {
                ChannelKind::File => filetype::REGULAR_FILE,
                ChannelKind::Directory => filetype::DIRECTORY,
            };
            let flags = if c.flags() & crate::fcntl::O_APPEND != 0 { FDFLAGS_APPEND } else { 0 };
            Ok((kind, flags))
        })?
    };
    write_fdstat(memory, args.ptr::<u8>(1)?, kind, flags)?;
    Ok(0)
}

fn fd_filestat_get(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    let stat = if fd.is_std_stream() {
        FileStat::character_device()
    } else {
        ctx.fs.stat_fd(fd)?
    };
    write_filestat(memory, args.ptr::<u8>(1)?, &stat)?;
    Ok(0)
}

fn fd_filestat_set_size(ctx: &SyscallContext, _: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    let size = offset_arg(args.i64(1)?)?;
    ctx.fs.set_len(fd, size)?;
    Ok(0)
}

fn read_common(
    ctx: &SyscallContext,
    memory: &mut dyn GuestMemory,
    fd: Fd,
    iovs: WasmPtr<u8>,
    iovs_len: u32,
    offset: Option<u64>,
    nread: WasmPtr<u32>,
) -> SyscallResult {
    let iovecs = read_iovecs(memory, iovs, iovs_len)?;
    let lens: Vec<usize> = iovecs.iter().map(|&(_, len)| len as usize).collect();
    let bufs = if fd == Fd::STDIN {
        Vec::new()
    } else if fd.is_std_stream() {
        return Err(badf(fd));
    } else {
        match offset {
            Some(offset) => ctx.fs.pread(fd, &lens, offset)?,
            None => ctx.fs.read(fd, &lens)?,
        }
    };
    let total: usize = bufs.iter().map(Vec::len).sum();
    scatter(memory, &iovecs, &bufs)?;
    memory.write_i32(nread, guest_size(total)?)?;
    trace!(fd = fd.0, offset, total, "read");
    Ok(0)
}

fn fd_read(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    read_common(ctx, memory, Fd(args.i32(0)?), args.ptr(1)?, args.u32(2)?, None, args.ptr(3)?)
}

fn fd_pread(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let offset = offset_arg(args.i64(3)?)?;
    read_common(ctx, memory, Fd(args.i32(0)?), args.ptr(1)?, args.u32(2)?, Some(offset), args.ptr(4)?)
}

fn write_common(
    ctx: &SyscallContext,
    memory: &mut dyn GuestMemory,
    fd: Fd,
    iovs: WasmPtr<u8>,
    iovs_len: u32,
    offset: Option<u64>,
    nwritten: WasmPtr<u32>,
) -> SyscallResult {
    let iovecs = read_iovecs(memory, iovs, iovs_len)?;
    let data = gather(memory, &iovecs)?;
    let slices: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
    let total = match fd {
        Fd::STDOUT | Fd::STDERR => {
            let joined = slices.concat();
            if fd == Fd::STDOUT {
                ctx.embedder.write_stdout(&joined);
            } else {
                ctx.embedder.write_stderr(&joined);
            }
            joined.len()
        }
        Fd::STDIN => return Err(badf(fd)),
        _ => match offset {
            Some(offset) => ctx.fs.pwrite(fd, &slices, offset)?,
            None => ctx.fs.write(fd, &slices)?,
        },
    };
    memory.write_i32(nwritten, guest_size(total)?)?;
    trace!(fd = fd.0, offset, total, "write");
    Ok(0)
}

fn fd_write(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    write_common(ctx, memory, Fd(args.i32(0)?), args.ptr(1)?, args.u32(2)?, None, args.ptr(3)?)
}

fn fd_pwrite(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let offset = offset_arg(args.i64(3)?)?;
    write_common(ctx, memory, Fd(args.i32(0)?), args.ptr(1)?, args.u32(2)?, Some(offset), args.ptr(4)?)
}

fn fd_seek(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    if fd.is_std_stream() {
        return Err(HostFunctionError::sys(Errno::SPIPE, "standard streams are not seekable"));
    }
    let position = ctx.fs.seek(fd, args.i64(1)?, args.i32(2)?)?;
    memory.write_i64(args.ptr::<u64>(3)?, i64::try_from(position).unwrap_or(i64::MAX))?;
    Ok(0)
}

fn fd_tell(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let fd = Fd(args.i32(0)?);
    if fd.is_std_stream() {
        return Err(HostFunctionError::sys(Errno::SPIPE, "standard streams are not seekable"));
    }
    let position = ctx.fs.tell(fd)?;
    memory.write_i64(args.ptr::<u64>(1)?, i64::try_from(position).unwrap_or(i64::MAX))?;
    Ok(0)
}

fn random_get(ctx: &SyscallContext, memory: &mut dyn GuestMemory, args: &[Value]) -> SyscallResult {
    let ptr = args.ptr::<u8>(0)?;
    let len = args.u32(1)? as usize;
    checked_range(ptr.addr(), len, memory.size_bytes())?;
    let mut buf = vec![0u8; len];
    ctx.embedder
        .fill_entropy(&mut buf)
        .map_err(|e| SysError::from_io(&e, "random_get"))?;
    memory.write_bytes(ptr, &buf)?;
    Ok(0)
}
