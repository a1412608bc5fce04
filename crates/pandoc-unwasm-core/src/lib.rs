//! Core Wasmtime host for pandoc-unwasm.
//!
//! This crate owns everything on the host side of the linear-memory boundary
//! except the syscall surface itself:
//! - [`WasmEngine`]: Configured Wasmtime engine with epoch interruption
//! - [`ModuleSource`] / [`CompiledModule`]: Module loading and compilation
//! - [`vfs`]: The in-memory files and consoles the guest sees
//! - [`HostContext`]: Store data reachable from host functions
//! - [`Instantiator`] / [`WasmtimeInstance`]: Import table assembly and the live instance
//! - [`Marshaler`]: Host-initiated writes into linear memory
//! - [`Bootstrapper`]: The two-phase cold start of the embedded runtime
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared, thread-safe)                                  │
//! │  - Async support, epoch interruption                    │
//! │  - Compilation settings and cache                       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CompiledModule                        │
//! │  (Immutable image, loaded once)                         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │       Store<HostContext> + WasmtimeInstance             │
//! │  (One per converter, long-lived)                        │
//! │  - Host-created linear memory (env.memory)              │
//! │  - Virtual files, consoles, captured log                │
//! │  - Bootstrapped runtime, allocation record              │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod bootstrap;
pub mod engine;
pub mod instance;
pub mod marshal;
pub mod module;
pub mod store;
pub mod vfs;

pub use backend::{ImageLoader, ModuleImage, ModuleInstance};
pub use bootstrap::{Bootstrapper, InitState};
pub use engine::{EpochTicker, WasmEngine};
pub use instance::{ENV_NAMESPACE, Instantiator, WASI_NAMESPACE, WasmtimeInstance};
pub use marshal::{Allocation, AllocationRecord, AllocationScope, Marshaler};
pub use module::{CompiledModule, ModuleSource};
pub use store::{GuestEnvironment, GuestLog, HostContext, LogEntry, LogLevel, create_store};
pub use vfs::{GuestFiles, LineSink, VirtualDirectory, VirtualFile};
