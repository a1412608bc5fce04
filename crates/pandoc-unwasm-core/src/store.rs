//! Per-instance host context and store management.
//!
//! This module provides:
//! - [`GuestEnvironment`]: the synthetic process (argv, envp, descriptors)
//! - [`HostContext`]: store data reachable from every host function
//! - [`GuestLog`], [`LogEntry`] and [`LogLevel`]: console lines captured from the guest
//! - [`create_store`]: a store with the memory limiter and epoch policy applied
//!
//! The converter keeps one store for the lifetime of the facade: the embedded
//! runtime is bootstrapped into it once.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use wasmtime::{Memory, Store, StoreLimits, StoreLimitsBuilder};

use crate::WasmEngine;
use crate::vfs::{Descriptor, FdTable, GuestFiles, LineSink, OpenFile, VirtualFile};
use pandoc_unwasm_common::MemoryConfig;

/// Name under which the conversion directory is preopened.
pub const PREOPEN_NAME: &str = "/";

/// A single console line from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (derived from the stream the line was written to).
    pub level: LogLevel,

    /// Line content, without the trailing newline.
    pub message: String,

    /// Wall-clock time the line was completed.
    pub timestamp: SystemTime,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages (guest stdout).
    Info,
    /// Warning messages (guest stderr).
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Shared buffer of captured console lines.
///
/// The converter drains it before each call, so after a call it holds exactly
/// the lines that call produced.
#[derive(Debug, Clone, Default)]
pub struct GuestLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl GuestLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line.
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        self.entries.lock().push(LogEntry {
            level,
            message: message.into(),
            timestamp: SystemTime::now(),
        });
    }

    /// Take every recorded line, leaving the log empty.
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Number of recorded lines.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no line has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The synthetic process environment the guest runs in.
///
/// # Descriptor layout
///
/// | fd | descriptor |
/// |----|------------|
/// | 0  | empty, read-only stdin |
/// | 1  | stdout line sink |
/// | 2  | stderr line sink |
/// | 3  | directory preopened as `/` holding `in` (read-only) and `out` |
#[derive(Debug)]
pub struct GuestEnvironment {
    /// Argument vector, program name first.
    pub args: Vec<String>,

    /// Environment as `KEY=VALUE` strings.
    pub env: Vec<String>,

    /// Open descriptors.
    pub fds: FdTable,

    /// Host handles to the conversion files.
    pub files: GuestFiles,

    /// Captured console lines.
    pub log: GuestLog,
}

impl GuestEnvironment {
    /// Build the environment with the standard descriptor layout.
    pub fn new(
        args: Vec<String>,
        env: Vec<(String, String)>,
        stdout: LineSink,
        stderr: LineSink,
        log: GuestLog,
    ) -> Self {
        let files = GuestFiles::new();

        let mut fds = FdTable::new();
        fds.insert(Descriptor::File(OpenFile::new(VirtualFile::readonly(), false)));
        fds.insert(Descriptor::Console(stdout));
        fds.insert(Descriptor::Console(stderr));
        fds.insert(Descriptor::Directory {
            preopen_name: Some(PREOPEN_NAME.to_string()),
            dir: files.directory(),
        });

        Self {
            args,
            env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            fds,
            files,
            log,
        }
    }
}

/// Store data for the single long-lived instance.
///
/// Host functions reach it through [`wasmtime::Caller`]; the memory handle is
/// set by the instantiator once the linear memory exists.
pub struct HostContext {
    /// The guest's process environment.
    pub env: GuestEnvironment,

    /// The instance's linear memory.
    pub memory: Option<Memory>,

    /// Unique identifier for tracing.
    pub instance_id: String,

    limits: StoreLimits,

    /// Monotonic clock origin.
    started: Instant,
}

impl HostContext {
    /// Create a context whose linear memory may not exceed `memory.max_bytes()`.
    pub fn new(env: GuestEnvironment, memory: &MemoryConfig, instance_id: String) -> Self {
        let max_bytes = usize::try_from(memory.max_bytes()).unwrap_or(usize::MAX);
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_bytes)
            // A failed memory.grow returns -1 to the guest instead of trapping,
            // so the module's allocator can report null.
            .trap_on_grow_failure(false)
            .build();

        Self {
            env,
            memory: None,
            instance_id,
            limits,
            started: Instant::now(),
        }
    }

    /// Nanoseconds since the context was created.
    pub fn monotonic_nanos(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("instance_id", &self.instance_id)
            .field("fds", &self.env.fds.len())
            .finish_non_exhaustive()
    }
}

/// Create a new Wasmtime store owning `context`.
///
/// The store enforces the linear memory limit, and when epoch interruption is
/// enabled the guest yields to the executor at every tick so host-level
/// timeouts can fire.
pub fn create_store(engine: &WasmEngine, context: HostContext) -> Store<HostContext> {
    let mut store = Store::new(engine.inner(), context);
    store.limiter(|ctx| &mut ctx.limits);

    if engine.is_epoch_enabled() {
        store.epoch_deadline_async_yield_and_update(1);
    }

    store
}
