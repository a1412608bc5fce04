//! WASI preview1 system calls over the in-memory environment.
//!
//! Each function is the body of one syscall: it takes the guest's linear
//! memory as a plain byte slice plus the [`HostContext`], and returns the
//! errno on failure. Nothing here touches Wasmtime, which keeps the calls
//! testable against a `Vec<u8>`; [`crate::linker`] adapts them to imports.
//!
//! Only the calls a single-threaded file converter makes are implemented.
//! Anything else the module imports is answered with `ENOSYS` by the
//! instantiator's fallback stubs.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tracing::{debug, trace};

use pandoc_unwasm_core::HostContext;
use pandoc_unwasm_core::vfs::{Descriptor, OpenFile, VirtualDirectory, VirtualFile};

use crate::abi::{
    self, Errno, PREOPENTYPE_DIR, PRESTAT_SIZE, WasiResult, clock, fdflags, filetype, oflags,
    rights, whence,
};

fn descriptor(ctx: &HostContext, fd: u32) -> WasiResult<&Descriptor> {
    ctx.env.fds.get(fd).ok_or(Errno::Badf)
}

fn descriptor_mut(ctx: &mut HostContext, fd: u32) -> WasiResult<&mut Descriptor> {
    ctx.env.fds.get_mut(fd).ok_or(Errno::Badf)
}

fn open_file(ctx: &mut HostContext, fd: u32) -> WasiResult<&mut OpenFile> {
    match descriptor_mut(ctx, fd)? {
        Descriptor::File(file) => Ok(file),
        Descriptor::Console(_) => Err(Errno::Spipe),
        Descriptor::Directory { .. } => Err(Errno::Isdir),
    }
}

fn directory(ctx: &HostContext, fd: u32) -> WasiResult<VirtualDirectory> {
    match descriptor(ctx, fd)? {
        Descriptor::Directory { dir, .. } => Ok(dir.clone()),
        _ => Err(Errno::Notdir),
    }
}

// ============================================================================
// Arguments and environment
// ============================================================================

fn list_sizes(items: &[String]) -> (usize, usize) {
    (items.len(), items.iter().map(|item| item.len() + 1).sum())
}

/// Lay out NUL-terminated strings at `buf` and their addresses at `ptrs`.
fn write_string_list(memory: &mut [u8], items: &[String], ptrs: u32, buf: u32) -> WasiResult<()> {
    let mut cursor = buf;
    let mut slot = ptrs;
    for item in items {
        abi::write_u32(memory, slot, cursor)?;
        abi::write_bytes(memory, cursor, item.as_bytes())?;
        let end = u32::try_from(item.len())
            .ok()
            .and_then(|len| cursor.checked_add(len))
            .ok_or(Errno::Fault)?;
        abi::write_u8(memory, end, 0)?;
        cursor = end.checked_add(1).ok_or(Errno::Fault)?;
        slot = slot.checked_add(4).ok_or(Errno::Fault)?;
    }
    Ok(())
}

pub fn args_get(memory: &mut [u8], ctx: &HostContext, argv: u32, argv_buf: u32) -> WasiResult<()> {
    write_string_list(memory, &ctx.env.args, argv, argv_buf)
}

pub fn args_sizes_get(
    memory: &mut [u8],
    ctx: &HostContext,
    argc_out: u32,
    size_out: u32,
) -> WasiResult<()> {
    let (count, size) = list_sizes(&ctx.env.args);
    abi::write_size(memory, argc_out, count)?;
    abi::write_size(memory, size_out, size)
}

pub fn environ_get(
    memory: &mut [u8],
    ctx: &HostContext,
    environ: u32,
    environ_buf: u32,
) -> WasiResult<()> {
    write_string_list(memory, &ctx.env.env, environ, environ_buf)
}

pub fn environ_sizes_get(
    memory: &mut [u8],
    ctx: &HostContext,
    count_out: u32,
    size_out: u32,
) -> WasiResult<()> {
    let (count, size) = list_sizes(&ctx.env.env);
    abi::write_size(memory, count_out, count)?;
    abi::write_size(memory, size_out, size)
}

// ============================================================================
// Clocks, randomness
// ============================================================================

pub fn clock_res_get(memory: &mut [u8], id: u32, out: u32) -> WasiResult<()> {
    let resolution = match id {
        clock::REALTIME => 1_000,
        clock::MONOTONIC | clock::PROCESS_CPUTIME | clock::THREAD_CPUTIME => 1,
        _ => return Err(Errno::Inval),
    };
    abi::write_u64(memory, out, resolution)
}

/// Realtime is wall-clock time; the other clocks count from instance creation.
pub fn clock_time_get(
    memory: &mut [u8],
    ctx: &HostContext,
    id: u32,
    _precision: u64,
    out: u32,
) -> WasiResult<()> {
    let now = match id {
        clock::REALTIME => {
            let since_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|_| Errno::Io)?;
            u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX)
        }
        clock::MONOTONIC | clock::PROCESS_CPUTIME | clock::THREAD_CPUTIME => ctx.monotonic_nanos(),
        _ => return Err(Errno::Inval),
    };
    abi::write_u64(memory, out, now)
}

pub fn random_get(memory: &mut [u8], buf: u32, len: u32) -> WasiResult<()> {
    rand::thread_rng().fill_bytes(abi::slice_mut(memory, buf, len)?);
    Ok(())
}

// ============================================================================
// Descriptors
// ============================================================================

pub fn fd_close(ctx: &mut HostContext, fd: u32) -> WasiResult<()> {
    let closed = ctx.env.fds.remove(fd).ok_or(Errno::Badf)?;
    trace!(fd, ?closed, "fd_close");
    Ok(())
}

pub fn fd_fdstat_get(memory: &mut [u8], ctx: &HostContext, fd: u32, out: u32) -> WasiResult<()> {
    let (kind, flags, base, inheriting) = match descriptor(ctx, fd)? {
        Descriptor::File(file) => {
            let base = if file.writable {
                rights::FILE
            } else {
                rights::FILE & !(rights::FD_WRITE | rights::FD_FILESTAT_SET_SIZE)
            };
            let flags = if file.append { fdflags::APPEND } else { 0 };
            (filetype::REGULAR_FILE, flags, base, 0)
        }
        Descriptor::Console(_) => (filetype::CHARACTER_DEVICE, 0, rights::FD_WRITE, 0),
        // Inheriting rights bound what path_open may request below this directory.
        Descriptor::Directory { .. } => (
            filetype::DIRECTORY,
            0,
            rights::DIRECTORY,
            rights::FILE | rights::DIRECTORY,
        ),
    };
    abi::write_fdstat(memory, out, kind, flags, base, inheriting)
}

pub fn fd_fdstat_set_flags(ctx: &mut HostContext, fd: u32, flags: u16) -> WasiResult<()> {
    if let Descriptor::File(file) = descriptor_mut(ctx, fd)? {
        file.append = flags & fdflags::APPEND != 0;
    }
    Ok(())
}

pub fn fd_filestat_get(memory: &mut [u8], ctx: &HostContext, fd: u32, out: u32) -> WasiResult<()> {
    let (kind, size) = match descriptor(ctx, fd)? {
        Descriptor::File(file) => (filetype::REGULAR_FILE, file.file.len() as u64),
        Descriptor::Console(_) => (filetype::CHARACTER_DEVICE, 0),
        Descriptor::Directory { .. } => (filetype::DIRECTORY, 0),
    };
    abi::write_filestat(memory, out, kind, size)
}

pub fn fd_filestat_set_size(ctx: &mut HostContext, fd: u32, size: u64) -> WasiResult<()> {
    match descriptor_mut(ctx, fd)? {
        Descriptor::File(file) if file.writable => {
            if file.file.truncate(size) {
                Ok(())
            } else {
                Err(Errno::Fbig)
            }
        }
        Descriptor::File(_) => Err(Errno::Badf),
        Descriptor::Console(_) => Err(Errno::Inval),
        Descriptor::Directory { .. } => Err(Errno::Isdir),
    }
}

pub fn fd_prestat_get(memory: &mut [u8], ctx: &HostContext, fd: u32, out: u32) -> WasiResult<()> {
    let Descriptor::Directory {
        preopen_name: Some(name),
        ..
    } = descriptor(ctx, fd)?
    else {
        return Err(Errno::Badf);
    };
    abi::slice_mut(memory, out, PRESTAT_SIZE)?.fill(0);
    abi::write_u8(memory, out, PREOPENTYPE_DIR)?;
    abi::write_size(memory, out + 4, name.len())
}

pub fn fd_prestat_dir_name(
    memory: &mut [u8],
    ctx: &HostContext,
    fd: u32,
    path: u32,
    path_len: u32,
) -> WasiResult<()> {
    let Descriptor::Directory {
        preopen_name: Some(name),
        ..
    } = descriptor(ctx, fd)?
    else {
        return Err(Errno::Badf);
    };
    if name.len() > path_len as usize {
        return Err(Errno::Nametoolong);
    }
    abi::write_bytes(memory, path, name.as_bytes())
}

pub fn fd_read(
    memory: &mut [u8],
    ctx: &mut HostContext,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nread_out: u32,
) -> WasiResult<()> {
    let iovecs = abi::read_iovecs(memory, iovs, iovs_len)?;
    let file = match descriptor_mut(ctx, fd)? {
        Descriptor::File(file) => file,
        Descriptor::Console(_) => return Err(Errno::Badf),
        Descriptor::Directory { .. } => return Err(Errno::Isdir),
    };

    let mut total = 0usize;
    for iov in iovecs {
        let buf = abi::slice_mut(memory, iov.ptr, iov.len)?;
        let wanted = buf.len();
        let n = file.read(buf);
        total += n;
        if n < wanted {
            break;
        }
    }
    abi::write_size(memory, nread_out, total)
}

pub fn fd_pread(
    memory: &mut [u8],
    ctx: &mut HostContext,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    offset: u64,
    nread_out: u32,
) -> WasiResult<()> {
    let iovecs = abi::read_iovecs(memory, iovs, iovs_len)?;
    let file = open_file(ctx, fd)?.file.clone();

    let mut total = 0usize;
    for iov in iovecs {
        let buf = abi::slice_mut(memory, iov.ptr, iov.len)?;
        let wanted = buf.len();
        let n = file.read_at(offset.saturating_add(total as u64), buf);
        total += n;
        if n < wanted {
            break;
        }
    }
    abi::write_size(memory, nread_out, total)
}

pub fn fd_write(
    memory: &mut [u8],
    ctx: &mut HostContext,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nwritten_out: u32,
) -> WasiResult<()> {
    let iovecs = abi::read_iovecs(memory, iovs, iovs_len)?;

    let mut total = 0usize;
    match descriptor_mut(ctx, fd)? {
        Descriptor::Console(sink) => {
            for iov in iovecs {
                total += sink.write(abi::slice(memory, iov.ptr, iov.len)?);
            }
        }
        Descriptor::File(file) if file.writable => {
            for iov in iovecs {
                total += file
                    .write(abi::slice(memory, iov.ptr, iov.len)?)
                    .ok_or(Errno::Fbig)?;
            }
        }
        Descriptor::File(_) => return Err(Errno::Badf),
        Descriptor::Directory { .. } => return Err(Errno::Isdir),
    }
    abi::write_size(memory, nwritten_out, total)
}

pub fn fd_pwrite(
    memory: &mut [u8],
    ctx: &mut HostContext,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    offset: u64,
    nwritten_out: u32,
) -> WasiResult<()> {
    let iovecs = abi::read_iovecs(memory, iovs, iovs_len)?;
    let file = open_file(ctx, fd)?;
    if !file.writable {
        return Err(Errno::Badf);
    }
    let file = file.file.clone();

    let mut total = 0usize;
    for iov in iovecs {
        let bytes = abi::slice(memory, iov.ptr, iov.len)?;
        total += file
            .write_at(offset.saturating_add(total as u64), bytes)
            .ok_or(Errno::Fbig)?;
    }
    abi::write_size(memory, nwritten_out, total)
}

pub fn fd_seek(
    memory: &mut [u8],
    ctx: &mut HostContext,
    fd: u32,
    offset: i64,
    whence: u8,
    out: u32,
) -> WasiResult<()> {
    let file = open_file(ctx, fd)?;
    let base = match whence {
        whence::SET => 0,
        whence::CUR => file.position,
        whence::END => file.file.len() as u64,
        _ => return Err(Errno::Inval),
    };
    let target = i64::try_from(base)
        .ok()
        .and_then(|base| base.checked_add(offset))
        .and_then(|target| u64::try_from(target).ok())
        .ok_or(Errno::Inval)?;
    file.position = target;
    abi::write_u64(memory, out, target)
}

pub fn fd_tell(memory: &mut [u8], ctx: &mut HostContext, fd: u32, out: u32) -> WasiResult<()> {
    let position = open_file(ctx, fd)?.position;
    abi::write_u64(memory, out, position)
}

/// `fd_sync` and `fd_datasync`: everything is already in memory.
pub fn fd_sync(ctx: &HostContext, fd: u32) -> WasiResult<()> {
    descriptor(ctx, fd).map(|_| ())
}

// ============================================================================
// Paths
// ============================================================================

/// Resolve `path` inside a flat directory.
///
/// `None` names the directory itself. Parent components are refused outright
/// so the guest can never address anything outside its preopen.
fn resolve(path: &str) -> WasiResult<Option<&str>> {
    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(Errno::Notcapable),
            name => parts.push(name),
        }
    }
    match parts.as_slice() {
        [] => Ok(None),
        [name] => Ok(Some(name)),
        _ => Err(Errno::Noent),
    }
}

fn open_entry(
    dir: &VirtualDirectory,
    name: &str,
    open_flags: u16,
    rights_base: u64,
    fd_flags: u16,
) -> WasiResult<Descriptor> {
    let writable = rights_base & rights::FD_WRITE != 0;
    let create = open_flags & oflags::CREAT != 0;
    let truncate = open_flags & oflags::TRUNC != 0;

    let file = match dir.get(name) {
        Some(_) if create && open_flags & oflags::EXCL != 0 => return Err(Errno::Exist),
        Some(_) if open_flags & oflags::DIRECTORY != 0 => return Err(Errno::Notdir),
        Some(file) if file.is_readonly() && (writable || truncate) => return Err(Errno::Perm),
        Some(file) => {
            if truncate {
                file.clear();
            }
            file
        }
        None if create => {
            let file = VirtualFile::new();
            dir.insert(name, file.clone());
            file
        }
        None => return Err(Errno::Noent),
    };

    let mut open = OpenFile::new(file, writable);
    open.append = fd_flags & fdflags::APPEND != 0;
    Ok(Descriptor::File(open))
}

#[allow(clippy::too_many_arguments)]
pub fn path_open(
    memory: &mut [u8],
    ctx: &mut HostContext,
    dirfd: u32,
    path_ptr: u32,
    path_len: u32,
    open_flags: u16,
    rights_base: u64,
    fd_flags: u16,
    fd_out: u32,
) -> WasiResult<()> {
    let dir = directory(ctx, dirfd)?;
    let path = abi::read_str(memory, path_ptr, path_len)?;

    let opened = match resolve(path)? {
        None if open_flags & oflags::CREAT != 0 && open_flags & oflags::EXCL != 0 => {
            Err(Errno::Exist)
        }
        None => Ok(Descriptor::Directory {
            preopen_name: None,
            dir,
        }),
        Some(name) => open_entry(&dir, name, open_flags, rights_base, fd_flags),
    };
    let descriptor = match opened {
        Ok(descriptor) => descriptor,
        Err(errno) => {
            debug!(path, %errno, "path_open refused");
            return Err(errno);
        }
    };

    debug!(path, dirfd, "path_open");
    let fd = ctx.env.fds.insert(descriptor);
    abi::write_u32(memory, fd_out, fd)
}

pub fn path_filestat_get(
    memory: &mut [u8],
    ctx: &HostContext,
    dirfd: u32,
    path_ptr: u32,
    path_len: u32,
    out: u32,
) -> WasiResult<()> {
    let dir = directory(ctx, dirfd)?;
    let path = abi::read_str(memory, path_ptr, path_len)?;
    let (kind, size) = match resolve(path)? {
        None => (filetype::DIRECTORY, 0),
        Some(name) => {
            let file = dir.get(name).ok_or(Errno::Noent)?;
            (filetype::REGULAR_FILE, file.len() as u64)
        }
    };
    abi::write_filestat(memory, out, kind, size)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pandoc_unwasm_common::MemoryConfig;
    use pandoc_unwasm_core::{GuestEnvironment, GuestLog, LineSink};

    use super::*;

    const PREOPEN: u32 = 3;

    fn context(stdout: LineSink) -> HostContext {
        let env = GuestEnvironment::new(
            vec!["pandoc".into(), "+RTS".into(), "-H64m".into(), "-RTS".into()],
            vec![("LANG".into(), "C.UTF-8".into())],
            stdout,
            LineSink::discard(),
            GuestLog::new(),
        );
        HostContext::new(env, &MemoryConfig::default(), "wasi-test".into())
    }

    fn memory() -> Vec<u8> {
        vec![0u8; 4096]
    }

    fn u32_at(memory: &[u8], ptr: u32) -> u32 {
        abi::read_u32(memory, ptr).unwrap()
    }

    fn u64_at(memory: &[u8], ptr: u32) -> u64 {
        let at = ptr as usize;
        u64::from_le_bytes(memory[at..at + 8].try_into().unwrap())
    }

    /// Write `path` at 2048 and open it relative to the preopen; fd lands at 100.
    fn open(
        memory: &mut [u8],
        ctx: &mut HostContext,
        path: &str,
        open_flags: u16,
        rights_base: u64,
    ) -> WasiResult<u32> {
        abi::write_bytes(memory, 2048, path.as_bytes()).unwrap();
        path_open(memory, ctx, PREOPEN, 2048, path.len() as u32, open_flags, rights_base, 0, 100)?;
        Ok(u32_at(memory, 100))
    }

    /// One iovec at 200 pointing at `len` bytes at `buf`.
    fn iovec(memory: &mut [u8], buf: u32, len: u32) {
        abi::write_u32(memory, 200, buf).unwrap();
        abi::write_u32(memory, 204, len).unwrap();
    }

    #[test]
    fn test_args_layout() {
        let ctx = context(LineSink::discard());
        let mut mem = memory();

        args_sizes_get(&mut mem, &ctx, 0, 4).unwrap();
        assert_eq!(u32_at(&mem, 0), 4);
        assert_eq!(u32_at(&mem, 4), "pandoc\0+RTS\0-H64m\0-RTS\0".len() as u32);

        args_get(&mut mem, &ctx, 16, 64).unwrap();
        assert_eq!(u32_at(&mem, 16), 64);
        assert_eq!(u32_at(&mem, 20), 71);
        assert_eq!(&mem[64..88], b"pandoc\0+RTS\0-H64m\0-RTS\0\0");
    }

    #[test]
    fn test_environ_layout() {
        let ctx = context(LineSink::discard());
        let mut mem = memory();

        environ_sizes_get(&mut mem, &ctx, 0, 4).unwrap();
        assert_eq!(u32_at(&mem, 0), 1);
        assert_eq!(u32_at(&mem, 4), 13);

        environ_get(&mut mem, &ctx, 16, 32).unwrap();
        assert_eq!(&mem[32..44], b"LANG=C.UTF-8");
        assert_eq!(mem[44], 0);
    }

    #[test]
    fn test_args_out_of_bounds_is_fault() {
        let ctx = context(LineSink::discard());
        let mut mem = vec![0u8; 32];
        assert_eq!(args_get(&mut mem, &ctx, 0, 20), Err(Errno::Fault));
    }

    #[test]
    fn test_clocks() {
        let ctx = context(LineSink::discard());
        let mut mem = memory();

        clock_time_get(&mut mem, &ctx, clock::REALTIME, 0, 0).unwrap();
        // Some time after 2020-01-01.
        assert!(u64_at(&mem, 0) > 1_577_836_800_000_000_000);

        clock_res_get(&mut mem, clock::MONOTONIC, 8).unwrap();
        assert_eq!(u64_at(&mem, 8), 1);

        assert_eq!(clock_time_get(&mut mem, &ctx, 9, 0, 0), Err(Errno::Inval));
    }

    #[test]
    fn test_random_fills_buffer() {
        let mut mem = memory();
        random_get(&mut mem, 0, 64).unwrap();
        assert!(mem[..64].iter().any(|&b| b != 0));
        assert_eq!(random_get(&mut mem, 4090, 64), Err(Errno::Fault));
    }

    #[test]
    fn test_preopen_is_discoverable() {
        let ctx = context(LineSink::discard());
        let mut mem = memory();

        fd_prestat_get(&mut mem, &ctx, PREOPEN, 0).unwrap();
        assert_eq!(mem[0], PREOPENTYPE_DIR);
        assert_eq!(u32_at(&mem, 4), 1);

        fd_prestat_dir_name(&mut mem, &ctx, PREOPEN, 16, 1).unwrap();
        assert_eq!(mem[16], b'/');

        // libc scans descriptors upward until EBADF.
        assert_eq!(fd_prestat_get(&mut mem, &ctx, 1, 0), Err(Errno::Badf));
        assert_eq!(fd_prestat_get(&mut mem, &ctx, 4, 0), Err(Errno::Badf));
        assert_eq!(fd_prestat_dir_name(&mut mem, &ctx, PREOPEN, 16, 0), Err(Errno::Nametoolong));
    }

    #[test]
    fn test_read_input_file() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();
        ctx.env.files.input.replace(b"# Hello");

        let fd = open(&mut mem, &mut ctx, "/in", 0, rights::FD_READ).unwrap();
        assert_eq!(fd, 4);

        iovec(&mut mem, 512, 4);
        fd_read(&mut mem, &mut ctx, fd, 200, 1, 300).unwrap();
        assert_eq!(u32_at(&mem, 300), 4);
        assert_eq!(&mem[512..516], b"# He");

        iovec(&mut mem, 512, 64);
        fd_read(&mut mem, &mut ctx, fd, 200, 1, 300).unwrap();
        assert_eq!(u32_at(&mem, 300), 3);
        assert_eq!(&mem[512..515], b"llo");

        fd_read(&mut mem, &mut ctx, fd, 200, 1, 300).unwrap();
        assert_eq!(u32_at(&mem, 300), 0);
    }

    #[test]
    fn test_write_output_file() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();
        let output = ctx.env.files.output.clone();
        output.replace(b"stale contents from last call");

        let fd = open(
            &mut mem,
            &mut ctx,
            "out",
            oflags::CREAT | oflags::TRUNC,
            rights::FD_WRITE,
        )
        .unwrap();
        assert!(output.is_empty());

        abi::write_bytes(&mut mem, 512, b"<h1>Hello</h1>").unwrap();
        iovec(&mut mem, 512, 14);
        fd_write(&mut mem, &mut ctx, fd, 200, 1, 300).unwrap();

        assert_eq!(u32_at(&mem, 300), 14);
        assert_eq!(output.contents(), b"<h1>Hello</h1>");

        fd_close(&mut ctx, fd).unwrap();
        assert_eq!(fd_close(&mut ctx, fd), Err(Errno::Badf));
    }

    #[test]
    fn test_input_is_read_only() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();

        assert_eq!(open(&mut mem, &mut ctx, "in", 0, rights::FD_WRITE), Err(Errno::Perm));
        assert_eq!(open(&mut mem, &mut ctx, "in", oflags::TRUNC, 0), Err(Errno::Perm));

        let fd = open(&mut mem, &mut ctx, "in", 0, rights::FD_READ).unwrap();
        iovec(&mut mem, 512, 1);
        assert_eq!(fd_write(&mut mem, &mut ctx, fd, 200, 1, 300), Err(Errno::Badf));
        assert_eq!(fd_filestat_set_size(&mut ctx, fd, 0), Err(Errno::Badf));
    }

    #[test]
    fn test_path_resolution() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();

        assert_eq!(open(&mut mem, &mut ctx, "../etc/passwd", 0, 0), Err(Errno::Notcapable));
        assert_eq!(open(&mut mem, &mut ctx, "missing", 0, 0), Err(Errno::Noent));
        assert_eq!(open(&mut mem, &mut ctx, "a/b", oflags::CREAT, 0), Err(Errno::Noent));
        assert_eq!(
            open(&mut mem, &mut ctx, "out", oflags::CREAT | oflags::EXCL, 0),
            Err(Errno::Exist)
        );
        assert_eq!(open(&mut mem, &mut ctx, "in", oflags::DIRECTORY, 0), Err(Errno::Notdir));

        let dir = open(&mut mem, &mut ctx, ".", oflags::DIRECTORY, 0).unwrap();
        assert!(matches!(
            ctx.env.fds.get(dir),
            Some(Descriptor::Directory {
                preopen_name: None,
                ..
            })
        ));

        let created =
            open(&mut mem, &mut ctx, "./scratch", oflags::CREAT, rights::FD_WRITE).unwrap();
        assert!(created > dir);

        // Opening relative to a file is refused.
        abi::write_bytes(&mut mem, 2048, b"in").unwrap();
        assert_eq!(
            path_open(&mut mem, &mut ctx, 0, 2048, 2, 0, 0, 0, 100),
            Err(Errno::Notdir)
        );
    }

    #[test]
    fn test_filestat() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();
        ctx.env.files.input.replace(b"12345");

        abi::write_bytes(&mut mem, 2048, b"in").unwrap();
        path_filestat_get(&mut mem, &ctx, PREOPEN, 2048, 2, 0).unwrap();
        assert_eq!(mem[16], filetype::REGULAR_FILE);
        assert_eq!(u64_at(&mem, 32), 5);

        fd_filestat_get(&mut mem, &ctx, 1, 0).unwrap();
        assert_eq!(mem[16], filetype::CHARACTER_DEVICE);

        fd_fdstat_get(&mut mem, &ctx, PREOPEN, 0).unwrap();
        assert_eq!(mem[0], filetype::DIRECTORY);
        assert_ne!(u64_at(&mem, 16) & rights::FD_WRITE, 0);
    }

    #[test]
    fn test_seek_and_tell() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();
        ctx.env.files.input.replace(b"0123456789");
        let fd = open(&mut mem, &mut ctx, "in", 0, rights::FD_READ).unwrap();

        fd_seek(&mut mem, &mut ctx, fd, -3, whence::END, 0).unwrap();
        assert_eq!(u64_at(&mem, 0), 7);
        fd_seek(&mut mem, &mut ctx, fd, 1, whence::CUR, 0).unwrap();
        fd_tell(&mut mem, &mut ctx, fd, 8).unwrap();
        assert_eq!(u64_at(&mem, 8), 8);

        assert_eq!(fd_seek(&mut mem, &mut ctx, fd, -1, whence::SET, 0), Err(Errno::Inval));
        assert_eq!(fd_seek(&mut mem, &mut ctx, 1, 0, whence::SET, 0), Err(Errno::Spipe));

        iovec(&mut mem, 512, 2);
        fd_pread(&mut mem, &mut ctx, fd, 200, 1, 2, 300).unwrap();
        assert_eq!(&mem[512..514], b"23");
        fd_tell(&mut mem, &mut ctx, fd, 8).unwrap();
        assert_eq!(u64_at(&mem, 8), 8);
    }

    #[test]
    fn test_console_write_is_line_buffered() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&lines);
        let mut ctx = context(LineSink::new(Arc::new(move |line: &str| {
            captured.lock().push(line.to_string());
        })));
        let mut mem = memory();

        abi::write_bytes(&mut mem, 512, b"first\nsecond").unwrap();
        iovec(&mut mem, 512, 12);
        fd_write(&mut mem, &mut ctx, 1, 200, 1, 300).unwrap();

        assert_eq!(u32_at(&mem, 300), 12);
        assert_eq!(*lines.lock(), ["first"]);

        fd_close(&mut ctx, 1).unwrap();
        assert_eq!(*lines.lock(), ["first", "second"]);
    }

    #[test]
    fn test_bad_descriptor() {
        let mut ctx = context(LineSink::discard());
        let mut mem = memory();

        iovec(&mut mem, 512, 4);
        assert_eq!(fd_read(&mut mem, &mut ctx, 42, 200, 1, 300), Err(Errno::Badf));
        assert_eq!(fd_read(&mut mem, &mut ctx, 1, 200, 1, 300), Err(Errno::Badf));
        assert_eq!(fd_read(&mut mem, &mut ctx, PREOPEN, 200, 1, 300), Err(Errno::Isdir));
        assert_eq!(fd_sync(&ctx, 42), Err(Errno::Badf));
        assert!(fd_sync(&ctx, 0).is_ok());
    }
}
