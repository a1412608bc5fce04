//! Host function registration for Wasmtime linkers.
//!
//! Adapts the syscall bodies in [`crate::wasi`] to `wasi_snapshot_preview1`
//! imports. Each import borrows the instance's linear memory and the store
//! data at the same time through [`Memory::data_and_store_mut`], so a call
//! never copies guest buffers it does not need to.
//!
//! Imports registered here take precedence over the instantiator's fallback
//! stubs; everything else in `wasi_snapshot_preview1` answers `ENOSYS` and
//! every function the module expects under `env` answers zero.

use pandoc_unwasm_common::{RuntimeError, cause};
use pandoc_unwasm_core::{HostContext, Instantiator, WASI_NAMESPACE, WasmEngine};
use tracing::{debug, trace, warn};
use wasmtime::{Caller, Linker};
use wasmtime_wasi::I32Exit;

use crate::abi::{Errno, WasiResult};
use crate::wasi;

/// Run one syscall body against the caller's memory and context.
fn dispatch<F>(caller: &mut Caller<'_, HostContext>, syscall: &'static str, body: F) -> i32
where
    F: FnOnce(&mut [u8], &mut HostContext) -> WasiResult<()>,
{
    let Some(memory) = caller.data().memory else {
        warn!(syscall, "Guest memory not attached to the store");
        return Errno::Fault.code();
    };
    let (data, ctx) = memory.data_and_store_mut(&mut *caller);
    match body(data, ctx) {
        Ok(()) => Errno::Success.code(),
        Err(errno) => {
            trace!(syscall, %errno, "Syscall failed");
            errno.code()
        }
    }
}

fn registration_error(name: &str, e: wasmtime::Error) -> RuntimeError {
    RuntimeError::link(format!("cannot register {WASI_NAMESPACE}.{name}: {e}"), Some(cause(e)))
}

fn narrow<T: TryFrom<u32>>(value: u32) -> WasiResult<T> {
    T::try_from(value).map_err(|_| Errno::Inval)
}

/// Register one errno-returning syscall.
macro_rules! syscall {
    ($linker:expr, $name:literal, |$mem:ident, $ctx:ident $(, $arg:ident : $ty:ty)*| $body:expr) => {
        $linker
            .func_wrap(
                WASI_NAMESPACE,
                $name,
                |mut caller: Caller<'_, HostContext>, $($arg: $ty),*| -> i32 {
                    dispatch(&mut caller, $name, |$mem, $ctx| $body)
                },
            )
            .map_err(|e| registration_error($name, e))?;
    };
}

/// Register every host function the converter module needs.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<HostContext>) -> Result<(), RuntimeError> {
    register_process(linker)?;
    register_descriptors(linker)?;
    register_paths(linker)?;
    Ok(())
}

/// Arguments, environment, clocks, randomness, and process control.
pub fn register_process(linker: &mut Linker<HostContext>) -> Result<(), RuntimeError> {
    syscall!(linker, "args_get", |mem, ctx, argv: u32, buf: u32| {
        wasi::args_get(mem, ctx, argv, buf)
    });
    syscall!(linker, "args_sizes_get", |mem, ctx, argc: u32, size: u32| {
        wasi::args_sizes_get(mem, ctx, argc, size)
    });
    syscall!(linker, "environ_get", |mem, ctx, environ: u32, buf: u32| {
        wasi::environ_get(mem, ctx, environ, buf)
    });
    syscall!(linker, "environ_sizes_get", |mem, ctx, count: u32, size: u32| {
        wasi::environ_sizes_get(mem, ctx, count, size)
    });
    syscall!(linker, "clock_res_get", |mem, _ctx, id: u32, out: u32| {
        wasi::clock_res_get(mem, id, out)
    });
    syscall!(linker, "clock_time_get", |mem, ctx, id: u32, precision: u64, out: u32| {
        wasi::clock_time_get(mem, ctx, id, precision, out)
    });
    syscall!(linker, "random_get", |mem, _ctx, buf: u32, len: u32| wasi::random_get(mem, buf, len));

    linker
        .func_wrap(WASI_NAMESPACE, "sched_yield", |_caller: Caller<'_, HostContext>| -> i32 {
            Errno::Success.code()
        })
        .map_err(|e| registration_error("sched_yield", e))?;

    // Unwinds the guest; the caller sees a trap carrying the exit code.
    linker
        .func_wrap(
            WASI_NAMESPACE,
            "proc_exit",
            |caller: Caller<'_, HostContext>, code: i32| -> wasmtime::Result<()> {
                debug!(instance_id = %caller.data().instance_id, code, "Guest called proc_exit");
                Err(I32Exit(code).into())
            },
        )
        .map_err(|e| registration_error("proc_exit", e))?;

    Ok(())
}

/// Descriptor-level calls.
pub fn register_descriptors(linker: &mut Linker<HostContext>) -> Result<(), RuntimeError> {
    syscall!(linker, "fd_close", |_mem, ctx, fd: u32| wasi::fd_close(ctx, fd));
    syscall!(linker, "fd_sync", |_mem, ctx, fd: u32| wasi::fd_sync(ctx, fd));
    syscall!(linker, "fd_datasync", |_mem, ctx, fd: u32| wasi::fd_sync(ctx, fd));
    syscall!(linker, "fd_fdstat_get", |mem, ctx, fd: u32, out: u32| {
        wasi::fd_fdstat_get(mem, ctx, fd, out)
    });
    syscall!(linker, "fd_fdstat_set_flags", |_mem, ctx, fd: u32, flags: u32| {
        wasi::fd_fdstat_set_flags(ctx, fd, narrow(flags)?)
    });
    syscall!(linker, "fd_filestat_get", |mem, ctx, fd: u32, out: u32| {
        wasi::fd_filestat_get(mem, ctx, fd, out)
    });
    syscall!(linker, "fd_filestat_set_size", |_mem, ctx, fd: u32, size: u64| {
        wasi::fd_filestat_set_size(ctx, fd, size)
    });
    syscall!(linker, "fd_prestat_get", |mem, ctx, fd: u32, out: u32| {
        wasi::fd_prestat_get(mem, ctx, fd, out)
    });
    syscall!(linker, "fd_prestat_dir_name", |mem, ctx, fd: u32, path: u32, len: u32| {
        wasi::fd_prestat_dir_name(mem, ctx, fd, path, len)
    });
    syscall!(linker, "fd_read", |mem, ctx, fd: u32, iovs: u32, iovs_len: u32, out: u32| {
        wasi::fd_read(mem, ctx, fd, iovs, iovs_len, out)
    });
    syscall!(linker, "fd_pread", |mem, ctx, fd: u32, iovs: u32, n: u32, offset: u64, out: u32| {
        wasi::fd_pread(mem, ctx, fd, iovs, n, offset, out)
    });
    syscall!(linker, "fd_write", |mem, ctx, fd: u32, iovs: u32, iovs_len: u32, out: u32| {
        wasi::fd_write(mem, ctx, fd, iovs, iovs_len, out)
    });
    syscall!(linker, "fd_pwrite", |mem, ctx, fd: u32, iovs: u32, n: u32, offset: u64, out: u32| {
        wasi::fd_pwrite(mem, ctx, fd, iovs, n, offset, out)
    });
    syscall!(linker, "fd_seek", |mem, ctx, fd: u32, offset: i64, whence: u32, out: u32| {
        wasi::fd_seek(mem, ctx, fd, offset, narrow(whence)?, out)
    });
    syscall!(linker, "fd_tell", |mem, ctx, fd: u32, out: u32| wasi::fd_tell(mem, ctx, fd, out));
    Ok(())
}

/// Path-level calls, relative to a directory descriptor.
pub fn register_paths(linker: &mut Linker<HostContext>) -> Result<(), RuntimeError> {
    syscall!(
        linker,
        "path_open",
        |mem,
         ctx,
         dirfd: u32,
         _dirflags: u32,
         path: u32,
         path_len: u32,
         open_flags: u32,
         rights_base: u64,
         _rights_inheriting: u64,
         fd_flags: u32,
         out: u32| {
            wasi::path_open(
                mem,
                ctx,
                dirfd,
                path,
                path_len,
                narrow(open_flags)?,
                rights_base,
                narrow(fd_flags)?,
                out,
            )
        }
    );
    syscall!(
        linker,
        "path_filestat_get",
        |mem, ctx, dirfd: u32, _flags: u32, path: u32, path_len: u32, out: u32| {
            wasi::path_filestat_get(mem, ctx, dirfd, path, path_len, out)
        }
    );
    Ok(())
}

/// Create an instantiator with every host function registered.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn create_instantiator(engine: &WasmEngine) -> Result<Instantiator, RuntimeError> {
    let mut instantiator = Instantiator::new(engine);
    register_all(instantiator.linker_mut())?;
    Ok(instantiator)
}
