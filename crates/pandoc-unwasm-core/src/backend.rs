//! Seams between the lifecycle logic and the opaque module.
//!
//! The converter is written against these traits rather than against wasmtime
//! directly. The production implementation compiles and instantiates a real
//! module; tests substitute counting or failing stand-ins to exercise the
//! lifecycle without a multi-megabyte binary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::GuestEnvironment;
use pandoc_unwasm_common::RuntimeError;

/// Produces a compiled module image.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    /// Fetch and compile the module.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if the module cannot be obtained or compiled.
    async fn load(&self) -> Result<Arc<dyn ModuleImage>, RuntimeError>;
}

/// An immutable compiled module.
#[async_trait]
pub trait ModuleImage: Send + Sync {
    /// Create a live instance bound to `environment`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Link` if imports cannot be satisfied or required
    /// exports are missing.
    async fn instantiate(
        &self,
        environment: GuestEnvironment,
    ) -> Result<Box<dyn ModuleInstance>, RuntimeError>;

    /// Short identifier for logs.
    fn describe(&self) -> String {
        "module".to_string()
    }
}

/// A live instance of the module.
///
/// Every method that enters the guest maps traps to
/// `RuntimeError::RuntimeTrap`. Implementations are not re-entrant; callers
/// serialize access.
#[async_trait]
pub trait ModuleInstance: Send {
    /// Run the module's global constructors.
    async fn run_constructors(&mut self) -> Result<(), RuntimeError>;

    /// Initialize the embedded runtime with pointers to `argc` and `argv`.
    async fn init_runtime(&mut self, argc_ptr: u32, argv_ptr: u32) -> Result<(), RuntimeError>;

    /// Allocate `size` bytes with the module's allocator. Returns 0 on failure.
    async fn allocate(&mut self, size: u32) -> Result<u32, RuntimeError>;

    /// Release an allocation.
    ///
    /// Returns `Ok(false)` when the module exports no deallocator.
    async fn deallocate(&mut self, offset: u32) -> Result<bool, RuntimeError>;

    /// Call the conversion entry point and return its exit code.
    async fn run_main(&mut self, args_ptr: u32, args_len: u32) -> Result<i32, RuntimeError>;

    /// Copy `bytes` into linear memory at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Conversion` if the span lies outside linear memory.
    fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<(), RuntimeError>;

    /// Copy `len` bytes out of linear memory starting at `offset`.
    fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, RuntimeError>;

    /// Current linear memory size in bytes.
    fn memory_size(&self) -> u64;

    /// Maximum linear memory size in bytes.
    fn memory_limit(&self) -> u64;

    /// Deliver any partial console line still buffered.
    fn flush_consoles(&mut self) {}
}
