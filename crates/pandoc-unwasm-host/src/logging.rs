//! Guest console capture.
//!
//! The guest's stdout and stderr are line-buffered sinks. Every completed line
//! is both:
//! 1. Stored in the instance's [`GuestLog`] for later retrieval
//! 2. Emitted via `tracing` when debug output is enabled
//!
//! Nothing the guest prints ever reaches the host process's own streams.

use std::fmt;
use std::sync::Arc;

use pandoc_unwasm_core::{GuestLog, LineSink, LogLevel};
use tracing::{debug, error, info, warn};

/// Tracing target for lines printed by the guest.
pub const GUEST_TARGET: &str = "pandoc_unwasm::guest";

/// Which console stream a sink stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

impl ConsoleStream {
    /// Level recorded for lines on this stream.
    pub fn level(self) -> LogLevel {
        match self {
            ConsoleStream::Stdout => LogLevel::Info,
            ConsoleStream::Stderr => LogLevel::Warn,
        }
    }
}

impl fmt::Display for ConsoleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleStream::Stdout => f.write_str("stdout"),
            ConsoleStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Host side of the guest's console output.
pub struct LoggingHost;

impl LoggingHost {
    /// Record one line, and forward it to `tracing` if `emit` is set.
    pub fn log(log: &GuestLog, level: LogLevel, message: &str, instance_id: &str, emit: bool) {
        log.push(level, message);

        if !emit {
            return;
        }
        match level {
            LogLevel::Debug => debug!(target: GUEST_TARGET, instance_id, "{}", message),
            LogLevel::Info => info!(target: GUEST_TARGET, instance_id, "{}", message),
            LogLevel::Warn => warn!(target: GUEST_TARGET, instance_id, "{}", message),
            LogLevel::Error => error!(target: GUEST_TARGET, instance_id, "{}", message),
        }
    }

    /// Build the line sink backing one console stream.
    pub fn console(
        stream: ConsoleStream,
        debug: bool,
        log: GuestLog,
        instance_id: String,
    ) -> LineSink {
        let level = stream.level();
        LineSink::new(Arc::new(move |line: &str| {
            Self::log(&log, level, line, &instance_id, debug);
        }))
    }
}
