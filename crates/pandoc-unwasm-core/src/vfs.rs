//! In-memory file system presented to the guest.
//!
//! The converter module only ever sees:
//! - fd 0: an empty, read-only stdin
//! - fd 1 / fd 2: line-buffered console sinks
//! - fd 3: a preopened directory holding the files `in` and `out`
//!
//! [`VirtualFile`] handles are shared between the host and the guest's
//! descriptor table, so the host can overwrite `in` and read `out` between calls
//! without going through the syscall layer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Largest size a virtual file may reach through guest writes.
pub const MAX_FILE_LEN: u64 = 1 << 30;

/// A named, resizable byte buffer.
///
/// Cloning yields another handle to the same contents.
#[derive(Clone, Default)]
pub struct VirtualFile {
    data: Arc<RwLock<Vec<u8>>>,
    readonly: bool,
}

impl VirtualFile {
    /// Create an empty, writable file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty file the guest may not write to.
    ///
    /// The host can still replace its contents.
    pub fn readonly() -> Self {
        Self {
            data: Arc::default(),
            readonly: true,
        }
    }

    /// Whether guest writes are refused.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Replace the whole contents.
    pub fn replace(&self, bytes: &[u8]) {
        let mut data = self.data.write();
        data.clear();
        data.extend_from_slice(bytes);
    }

    /// Truncate to zero length.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Copy out the whole contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Read into `buf` starting at `offset`; returns the number of bytes read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.data.read();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    /// Write `bytes` at `offset`, zero-filling any gap past the end.
    ///
    /// Returns `None` if the write would grow the file past [`MAX_FILE_LEN`].
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Option<usize> {
        let end = offset.checked_add(bytes.len() as u64)?;
        if end > MAX_FILE_LEN {
            return None;
        }
        let (start, end) = (usize::try_from(offset).ok()?, usize::try_from(end).ok()?);
        let mut data = self.data.write();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Some(bytes.len())
    }

    /// Resize to `len`, zero-filling on growth.
    ///
    /// Returns `false` if `len` exceeds [`MAX_FILE_LEN`].
    pub fn truncate(&self, len: u64) -> bool {
        let Some(len) = usize::try_from(len).ok().filter(|_| len <= MAX_FILE_LEN) else {
            return false;
        };
        self.data.write().resize(len, 0);
        true
    }
}

impl fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile")
            .field("len", &self.len())
            .field("readonly", &self.readonly)
            .finish()
    }
}

/// A flat directory of named [`VirtualFile`]s.
#[derive(Clone, Default)]
pub struct VirtualDirectory {
    entries: Arc<RwLock<BTreeMap<String, VirtualFile>>>,
}

impl VirtualDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&self, name: impl Into<String>, file: VirtualFile) {
        self.entries.write().insert(name.into(), file);
    }

    /// Look up an entry.
    pub fn get(&self, name: &str) -> Option<VirtualFile> {
        self.entries.read().get(name).cloned()
    }

    /// Remove an entry, returning it.
    pub fn remove(&self, name: &str) -> Option<VirtualFile> {
        self.entries.write().remove(name)
    }

    /// Entry names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl fmt::Debug for VirtualDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDirectory")
            .field("entries", &self.names())
            .finish()
    }
}

/// Callback receiving one complete console line, without the newline.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A line-buffered console sink.
///
/// Bytes are accumulated until a newline, then the line is decoded lossily and
/// handed to the callback. A trailing partial line is delivered on
/// [`LineSink::flush`] and on drop.
pub struct LineSink {
    buffer: Mutex<Vec<u8>>,
    callback: LineCallback,
}

impl LineSink {
    /// Create a sink delivering lines to `callback`.
    pub fn new(callback: LineCallback) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            callback,
        }
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self::new(Arc::new(|_| {}))
    }

    /// Append bytes, emitting every completed line.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut buffer = self.buffer.lock();
        buffer.extend_from_slice(bytes);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            (self.callback)(&String::from_utf8_lossy(&line[..pos]));
        }
        bytes.len()
    }

    /// Emit any buffered partial line.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock();
        if !buffer.is_empty() {
            let line = std::mem::take(&mut *buffer);
            (self.callback)(&String::from_utf8_lossy(&line));
        }
    }
}

impl Drop for LineSink {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for LineSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSink")
            .field("buffered", &self.buffer.lock().len())
            .finish_non_exhaustive()
    }
}

/// A regular file opened by the guest.
#[derive(Debug, Clone)]
pub struct OpenFile {
    /// The underlying file.
    pub file: VirtualFile,
    /// Current cursor.
    pub position: u64,
    /// Writes always go to the end.
    pub append: bool,
    /// Whether this descriptor may write.
    pub writable: bool,
}

impl OpenFile {
    /// Open `file` at position zero.
    pub fn new(file: VirtualFile, writable: bool) -> Self {
        Self {
            file,
            position: 0,
            append: false,
            writable,
        }
    }

    /// Read at the cursor and advance it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.file.read_at(self.position, buf);
        self.position += n as u64;
        n
    }

    /// Write at the cursor (or the end, in append mode) and advance it.
    ///
    /// Returns `None` if the file would grow past [`MAX_FILE_LEN`].
    pub fn write(&mut self, bytes: &[u8]) -> Option<usize> {
        if self.append {
            self.position = self.file.len() as u64;
        }
        let n = self.file.write_at(self.position, bytes)?;
        self.position += n as u64;
        Some(n)
    }
}

/// An entry in the guest's descriptor table.
#[derive(Debug)]
pub enum Descriptor {
    /// A regular file.
    File(OpenFile),
    /// A console stream.
    Console(LineSink),
    /// A directory, optionally preopened under a name.
    Directory {
        /// Name reported by `fd_prestat_dir_name`, for preopens.
        preopen_name: Option<String>,
        /// The directory contents.
        dir: VirtualDirectory,
    },
}

/// The guest's file descriptor table.
///
/// New descriptors take the lowest free slot, matching POSIX numbering.
#[derive(Debug, Default)]
pub struct FdTable {
    slots: Vec<Option<Descriptor>>,
}

impl FdTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor, returning its number.
    pub fn insert(&mut self, descriptor: Descriptor) -> u32 {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(descriptor);
                free
            }
            None => {
                self.slots.push(Some(descriptor));
                self.slots.len() - 1
            }
        };
        u32::try_from(index).unwrap_or(u32::MAX)
    }

    /// Look up a descriptor.
    pub fn get(&self, fd: u32) -> Option<&Descriptor> {
        self.slots.get(fd as usize).and_then(Option::as_ref)
    }

    /// Look up a descriptor mutably.
    pub fn get_mut(&mut self, fd: u32) -> Option<&mut Descriptor> {
        self.slots.get_mut(fd as usize).and_then(Option::as_mut)
    }

    /// Close a descriptor, returning it.
    pub fn remove(&mut self, fd: u32) -> Option<Descriptor> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no descriptor is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host-side handles to the two conversion files.
#[derive(Debug, Clone, Default)]
pub struct GuestFiles {
    /// Conversion input, read-only for the guest.
    pub input: VirtualFile,
    /// Conversion output.
    pub output: VirtualFile,
}

impl GuestFiles {
    /// Name of the input file inside the preopened directory.
    pub const INPUT: &'static str = "in";
    /// Name of the output file inside the preopened directory.
    pub const OUTPUT: &'static str = "out";

    /// Create a fresh pair: a read-only `in` and a writable `out`.
    pub fn new() -> Self {
        Self {
            input: VirtualFile::readonly(),
            output: VirtualFile::new(),
        }
    }

    /// A directory containing both files under their well-known names.
    pub fn directory(&self) -> VirtualDirectory {
        let dir = VirtualDirectory::new();
        dir.insert(Self::INPUT, self.input.clone());
        dir.insert(Self::OUTPUT, self.output.clone());
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_read_write_at() {
        let file = VirtualFile::new();
        assert_eq!(file.write_at(0, b"hello"), Some(5));
        assert_eq!(file.write_at(7, b"!"), Some(1));
        assert_eq!(file.write_at(MAX_FILE_LEN, b"x"), None);
        assert_eq!(file.contents(), b"hello\0\0!");

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(1, &mut buf), 4);
        assert_eq!(&buf, b"ello");
        assert_eq!(file.read_at(100, &mut buf), 0);
    }

    #[test]
    fn test_handles_share_contents() {
        let file = VirtualFile::readonly();
        let alias = file.clone();
        file.replace("héllo".as_bytes());

        assert_eq!(alias.contents(), "héllo".as_bytes());
        assert!(alias.is_readonly());

        alias.clear();
        assert!(file.is_empty());
    }

    #[test]
    fn test_truncate_grows_and_shrinks() {
        let file = VirtualFile::new();
        file.replace(b"abcdef");
        assert!(file.truncate(3));
        assert_eq!(file.contents(), b"abc");
        assert!(file.truncate(5));
        assert!(!file.truncate(MAX_FILE_LEN + 1));
        assert_eq!(file.contents(), b"abc\0\0");
    }

    #[test]
    fn test_open_file_cursor_and_append() {
        let file = VirtualFile::new();
        file.replace(b"12345");

        let mut open = OpenFile::new(file.clone(), true);
        let mut buf = [0u8; 2];
        assert_eq!(open.read(&mut buf), 2);
        assert_eq!(open.position, 2);

        open.append = true;
        assert_eq!(open.write(b"67"), Some(2));
        assert_eq!(file.contents(), b"1234567");
        assert_eq!(open.position, 7);
    }

    #[test]
    fn test_line_sink_splits_and_flushes() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&lines);
        let sink =
            LineSink::new(Arc::new(move |line: &str| captured.lock().push(line.to_string())));

        sink.write(b"first\nsec");
        sink.write(b"ond\nthird");
        assert_eq!(*lines.lock(), ["first", "second"]);

        drop(sink);
        assert_eq!(*lines.lock(), ["first", "second", "third"]);
    }

    #[test]
    fn test_fd_table_reuses_lowest_slot() {
        let mut table = FdTable::new();
        for _ in 0..4 {
            table.insert(Descriptor::Console(LineSink::discard()));
        }
        assert!(table.remove(1).is_some());
        assert!(table.remove(2).is_some());
        assert_eq!(table.len(), 2);

        let fd = table.insert(Descriptor::File(OpenFile::new(VirtualFile::new(), true)));
        assert_eq!(fd, 1);
        assert!(table.get(2).is_none());
        assert!(table.remove(9).is_none());
    }

    #[test]
    fn test_guest_files_directory() {
        let files = GuestFiles::new();
        let dir = files.directory();

        assert_eq!(dir.names(), ["in", "out"]);
        assert!(dir.get("in").is_some_and(|f| f.is_readonly()));
        files.output.replace(b"done");
        assert_eq!(dir.get("out").map(|f| f.contents()), Some(b"done".to_vec()));
    }
}
