//! Configuration structures for pandoc-unwasm.
//!
//! This module defines configuration options for the layers of the host:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (epochs, caching)
//! - [`MemoryConfig`]: Linear memory sizing for the single instance
//! - [`GuestConfig`]: The synthetic process the module runs as (argv, env, exports)
//! - [`ExecutionConfig`]: Host-level timeouts for bootstrap and conversion calls

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Size of one WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Largest page count a 32-bit linear memory can address.
pub const MAX_WASM32_PAGES: u32 = 65_536;

/// Top-level runtime configuration.
///
/// Every field carries a serde default, so partial TOML or JSON documents
/// deserialize into a complete configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Linear memory configuration.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Synthetic process environment presented to the module.
    #[serde(default)]
    pub guest: GuestConfig,

    /// Host-level execution limits.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl RuntimeConfig {
    /// Check the configuration for values the host cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.memory.validate()?;
        if self.engine.epoch_tick_ms == 0 {
            return Err(RuntimeError::invalid_config("engine.epoch_tick_ms must be positive"));
        }
        if self.guest.program_name.is_empty() {
            return Err(RuntimeError::invalid_config("guest.program_name must not be empty"));
        }
        Ok(())
    }
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable epoch-based interruption.
    ///
    /// Guest code then yields back to the async executor at every epoch tick,
    /// which is what lets host-level timeouts fire while the module computes.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Enable wasmtime's on-disk cache of compiled artifacts.
    ///
    /// The converter module is large, so repeat cold starts benefit a lot.
    #[serde(default = "defaults::cache_compiled_modules")]
    pub cache_compiled_modules: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            cache_compiled_modules: defaults::cache_compiled_modules(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }
}

/// Linear memory configuration.
///
/// The host creates the memory itself and hands it to the module as the
/// `env.memory` import, so these bounds are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Initial size in 64 KiB pages.
    #[serde(default = "defaults::initial_pages")]
    pub initial_pages: u32,

    /// Hard maximum in 64 KiB pages. Growth past this fails.
    #[serde(default = "defaults::maximum_pages")]
    pub maximum_pages: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_pages: defaults::initial_pages(),
            maximum_pages: defaults::maximum_pages(),
        }
    }
}

impl MemoryConfig {
    /// Maximum linear memory size in bytes.
    pub fn max_bytes(&self) -> u64 {
        u64::from(self.maximum_pages) * WASM_PAGE_SIZE
    }

    /// Initial linear memory size in bytes.
    pub fn initial_bytes(&self) -> u64 {
        u64::from(self.initial_pages) * WASM_PAGE_SIZE
    }

    /// Check that `initial <= maximum <= 65536`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if the bounds are inconsistent.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.initial_pages > self.maximum_pages {
            return Err(RuntimeError::invalid_config(format!(
                "memory.initial_pages ({}) exceeds memory.maximum_pages ({})",
                self.initial_pages, self.maximum_pages
            )));
        }
        if self.maximum_pages > MAX_WASM32_PAGES {
            return Err(RuntimeError::invalid_config(format!(
                "memory.maximum_pages ({}) exceeds the 32-bit limit of {MAX_WASM32_PAGES}",
                self.maximum_pages
            )));
        }
        Ok(())
    }
}

/// The synthetic process the module believes it is running as.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestConfig {
    /// `argv[0]`.
    #[serde(default = "defaults::program_name")]
    pub program_name: String,

    /// Runtime tuning flags appended after the program name.
    #[serde(default = "defaults::rts_args")]
    pub rts_args: Vec<String>,

    /// Environment variables as `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Route guest stdout/stderr lines to tracing.
    ///
    /// Lines are always captured into the per-call log regardless.
    #[serde(default)]
    pub debug: bool,

    /// Names of the exports the host calls.
    #[serde(default)]
    pub exports: ExportNames,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            program_name: defaults::program_name(),
            rts_args: defaults::rts_args(),
            env: Vec::new(),
            debug: false,
            exports: ExportNames::default(),
        }
    }
}

impl GuestConfig {
    /// The full argument vector, program name first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program_name.clone())
            .chain(self.rts_args.iter().cloned())
            .collect()
    }
}

/// Export names of the module's host-facing entry points.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExportNames {
    /// Runs global constructors (link fixup). `() -> ()`.
    #[serde(default = "defaults::constructors")]
    pub constructors: String,

    /// Initializes the embedded runtime. `(argc_ptr: i32, argv_ptr: i32) -> ()`.
    #[serde(default = "defaults::runtime_init")]
    pub runtime_init: String,

    /// Byte allocator. `(size: i32) -> i32`.
    #[serde(default = "defaults::allocator")]
    pub allocator: String,

    /// Optional matching deallocator. `(ptr: i32) -> ()`.
    ///
    /// Used to release per-call scratch buffers when the module exports it.
    #[serde(default = "defaults::deallocator")]
    pub deallocator: Option<String>,

    /// Conversion entry point. `(args_ptr: i32, args_len: i32) -> i32`.
    #[serde(default = "defaults::entry_point")]
    pub entry_point: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            constructors: defaults::constructors(),
            runtime_init: defaults::runtime_init(),
            allocator: defaults::allocator(),
            deallocator: defaults::deallocator(),
            entry_point: defaults::entry_point(),
        }
    }
}

/// Host-level execution limits.
///
/// Both timeouts are off by default. When one fires the in-flight call is
/// abandoned and the instance is marked permanently faulted.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Timeout for a single conversion call in milliseconds.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Timeout for the whole cold-start sequence in milliseconds.
    #[serde(default)]
    pub bootstrap_timeout_ms: Option<u64>,
}

impl ExecutionConfig {
    /// Get the conversion call timeout as a `Duration`.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Get the bootstrap timeout as a `Duration`.
    pub fn bootstrap_timeout(&self) -> Option<Duration> {
        self.bootstrap_timeout_ms.map(Duration::from_millis)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn cache_compiled_modules() -> bool {
        false
    }

    pub const fn initial_pages() -> u32 {
        256
    }

    pub const fn maximum_pages() -> u32 {
        1024
    }

    pub fn program_name() -> String {
        "pandoc".to_string()
    }

    pub fn rts_args() -> Vec<String> {
        ["+RTS", "-H64m", "-RTS"].iter().map(ToString::to_string).collect()
    }

    pub fn constructors() -> String {
        "__wasm_call_ctors".to_string()
    }

    pub fn runtime_init() -> String {
        "hs_init_with_rtsopts".to_string()
    }

    pub fn allocator() -> String {
        "malloc".to_string()
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn deallocator() -> Option<String> {
        Some("free".to_string())
    }

    pub fn entry_point() -> String {
        "wasm_main".to_string()
    }
}
