//! Host functions for pandoc-unwasm.
//!
//! This crate provides the system-call surface a WASI preview1 module
//! imports, implemented entirely over the in-memory environment from
//! `pandoc-unwasm-core`: no real file, clock source, or stream of the host
//! process is ever exposed to the guest.
//!
//! # Modules
//!
//! - [`abi`]: Errno values, flag constants, and bounds-checked memory access
//! - [`wasi`]: One function per implemented syscall
//! - [`linker`]: Registration of those functions as Wasmtime imports
//! - [`logging`]: Guest stdout/stderr capture
//! - [`environ`]: The synthetic process (argv, envp, descriptors)
//!
//! # Isolation
//!
//! 1. **Paths**: Only the preopened directory is reachable; `..` is refused.
//! 2. **Input**: The `in` file is read-only from the guest's side.
//! 3. **Output**: Console writes land in a per-instance log, never on the
//!    host's stdout or stderr.

pub mod abi;
pub mod environ;
pub mod linker;
pub mod logging;
pub mod wasi;

pub use abi::Errno;
pub use environ::EnvironmentBridge;
pub use linker::{create_instantiator, register_all};
pub use logging::{ConsoleStream, GUEST_TARGET, LoggingHost};
