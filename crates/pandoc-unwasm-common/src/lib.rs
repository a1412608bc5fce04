//! Common types, errors, and configuration for pandoc-unwasm.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror`, clonable so one failure can reach every waiter
//! - Configuration structures for the engine, linear memory, and guest process
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    EngineConfig, ExecutionConfig, ExportNames, GuestConfig, MemoryConfig, RuntimeConfig,
    WASM_PAGE_SIZE,
};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry};
pub use error::{Cause, InitStage, RuntimeError, cause};
