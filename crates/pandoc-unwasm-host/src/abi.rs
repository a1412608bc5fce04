//! WASI preview1 ABI: errno values, flag constants, struct layouts, and
//! bounds-checked little-endian access to guest memory.
//!
//! Every accessor fails with [`Errno::Fault`] instead of panicking when a
//! guest pointer falls outside linear memory.

use std::fmt;

/// WASI preview1 error numbers used by this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// No error.
    Success = 0,
    /// Permission denied.
    Acces = 2,
    /// Bad file descriptor.
    Badf = 8,
    /// File exists.
    Exist = 20,
    /// Bad address.
    Fault = 21,
    /// File too large.
    Fbig = 22,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// Is a directory.
    Isdir = 31,
    /// Filename too long.
    Nametoolong = 37,
    /// No such file or directory.
    Noent = 44,
    /// Function not supported.
    Nosys = 52,
    /// Not a directory.
    Notdir = 54,
    /// Operation not permitted.
    Perm = 63,
    /// Invalid seek.
    Spipe = 70,
    /// Capabilities insufficient.
    Notcapable = 76,
}

impl Errno {
    /// The value returned to the guest.
    pub fn code(self) -> i32 {
        i32::from(self as u16)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Result of a syscall body.
pub type WasiResult<T> = Result<T, Errno>;

/// `filetype` values.
pub mod filetype {
    pub const UNKNOWN: u8 = 0;
    pub const CHARACTER_DEVICE: u8 = 2;
    pub const DIRECTORY: u8 = 3;
    pub const REGULAR_FILE: u8 = 4;
}

/// `whence` values for `fd_seek`.
pub mod whence {
    pub const SET: u8 = 0;
    pub const CUR: u8 = 1;
    pub const END: u8 = 2;
}

/// `oflags` for `path_open`.
pub mod oflags {
    pub const CREAT: u16 = 1 << 0;
    pub const DIRECTORY: u16 = 1 << 1;
    pub const EXCL: u16 = 1 << 2;
    pub const TRUNC: u16 = 1 << 3;
}

/// `fdflags`.
pub mod fdflags {
    pub const APPEND: u16 = 1 << 0;
}

/// `rights` bits the host inspects or reports.
pub mod rights {
    pub const FD_DATASYNC: u64 = 1 << 0;
    pub const FD_READ: u64 = 1 << 1;
    pub const FD_SEEK: u64 = 1 << 2;
    pub const FD_FDSTAT_SET_FLAGS: u64 = 1 << 3;
    pub const FD_SYNC: u64 = 1 << 4;
    pub const FD_TELL: u64 = 1 << 5;
    pub const FD_WRITE: u64 = 1 << 6;
    pub const PATH_OPEN: u64 = 1 << 13;
    pub const FD_FILESTAT_GET: u64 = 1 << 21;
    pub const FD_FILESTAT_SET_SIZE: u64 = 1 << 22;
    pub const PATH_FILESTAT_GET: u64 = 1 << 18;

    /// Rights reported for a regular file.
    pub const FILE: u64 = FD_DATASYNC
        | FD_READ
        | FD_SEEK
        | FD_FDSTAT_SET_FLAGS
        | FD_SYNC
        | FD_TELL
        | FD_WRITE
        | FD_FILESTAT_GET
        | FD_FILESTAT_SET_SIZE;

    /// Rights reported for a directory.
    pub const DIRECTORY: u64 = PATH_OPEN | PATH_FILESTAT_GET | FD_FILESTAT_GET;
}

/// `clockid` values.
pub mod clock {
    pub const REALTIME: u32 = 0;
    pub const MONOTONIC: u32 = 1;
    pub const PROCESS_CPUTIME: u32 = 2;
    pub const THREAD_CPUTIME: u32 = 3;
}

/// `preopentype` tag for directories.
pub const PREOPENTYPE_DIR: u8 = 0;

/// Size of `fdstat`.
pub const FDSTAT_SIZE: u32 = 24;
/// Size of `filestat`.
pub const FILESTAT_SIZE: u32 = 64;
/// Size of `prestat`.
pub const PRESTAT_SIZE: u32 = 8;

/// Borrow `len` bytes at `ptr`.
pub fn slice(memory: &[u8], ptr: u32, len: u32) -> WasiResult<&[u8]> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    memory.get(start..end).ok_or(Errno::Fault)
}

/// Mutably borrow `len` bytes at `ptr`.
pub fn slice_mut(memory: &mut [u8], ptr: u32, len: u32) -> WasiResult<&mut [u8]> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
    memory.get_mut(start..end).ok_or(Errno::Fault)
}

/// Borrow a UTF-8 string at `ptr`.
pub fn read_str(memory: &[u8], ptr: u32, len: u32) -> WasiResult<&str> {
    std::str::from_utf8(slice(memory, ptr, len)?).map_err(|_| Errno::Inval)
}

pub fn read_u32(memory: &[u8], ptr: u32) -> WasiResult<u32> {
    let bytes = slice(memory, ptr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn write_bytes(memory: &mut [u8], ptr: u32, bytes: &[u8]) -> WasiResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| Errno::Fault)?;
    slice_mut(memory, ptr, len)?.copy_from_slice(bytes);
    Ok(())
}

pub fn write_u8(memory: &mut [u8], ptr: u32, value: u8) -> WasiResult<()> {
    write_bytes(memory, ptr, &[value])
}

pub fn write_u16(memory: &mut [u8], ptr: u32, value: u16) -> WasiResult<()> {
    write_bytes(memory, ptr, &value.to_le_bytes())
}

pub fn write_u32(memory: &mut [u8], ptr: u32, value: u32) -> WasiResult<()> {
    write_bytes(memory, ptr, &value.to_le_bytes())
}

pub fn write_u64(memory: &mut [u8], ptr: u32, value: u64) -> WasiResult<()> {
    write_bytes(memory, ptr, &value.to_le_bytes())
}

/// Write a size as a `u32`, failing with `Inval` if it does not fit.
pub fn write_size(memory: &mut [u8], ptr: u32, value: usize) -> WasiResult<()> {
    write_u32(memory, ptr, u32::try_from(value).map_err(|_| Errno::Inval)?)
}

/// One `iovec` / `ciovec`: a buffer pointer and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub ptr: u32,
    pub len: u32,
}

/// Decode `count` iovecs starting at `ptr`.
pub fn read_iovecs(memory: &[u8], ptr: u32, count: u32) -> WasiResult<Vec<IoVec>> {
    (0..count)
        .map(|i| {
            let at = i
                .checked_mul(8)
                .and_then(|offset| ptr.checked_add(offset))
                .ok_or(Errno::Fault)?;
            Ok(IoVec {
                ptr: read_u32(memory, at)?,
                len: read_u32(memory, at.checked_add(4).ok_or(Errno::Fault)?)?,
            })
        })
        .collect()
}

/// Write an `fdstat` record.
pub fn write_fdstat(
    memory: &mut [u8],
    ptr: u32,
    filetype: u8,
    flags: u16,
    rights_base: u64,
    rights_inheriting: u64,
) -> WasiResult<()> {
    slice_mut(memory, ptr, FDSTAT_SIZE)?.fill(0);
    write_u8(memory, ptr, filetype)?;
    write_u16(memory, ptr + 2, flags)?;
    write_u64(memory, ptr + 8, rights_base)?;
    write_u64(memory, ptr + 16, rights_inheriting)
}

/// Write a `filestat` record. Device, inode, and timestamps are zero.
pub fn write_filestat(memory: &mut [u8], ptr: u32, filetype: u8, size: u64) -> WasiResult<()> {
    slice_mut(memory, ptr, FILESTAT_SIZE)?.fill(0);
    write_u8(memory, ptr + 16, filetype)?;
    write_u64(memory, ptr + 24, 1)?;
    write_u64(memory, ptr + 32, size)
}
