//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the host. It is:
//! - Configured for async execution so host-level timeouts can abandon a call
//! - Set up with epoch interruption so long guest computations yield
//! - Optionally backed by wasmtime's on-disk compilation cache
//!
//! [`EpochTicker`] drives the epoch counter from a dedicated OS thread, so
//! epoch progression does not depend on the async executor being scheduled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use wasmtime::{Config, Engine};

use pandoc_unwasm_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// The engine holds no per-instance state and can be cloned cheaply.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: calls are awaited, which lets a timeout drop them
/// - **Epoch Interruption**: guest code yields at every epoch tick
/// - **Cranelift Speed**: the converter module is large and hot
/// - **Compilation Cache**: optional, wasmtime's default cache configuration
///
/// # Example
///
/// ```ignore
/// use pandoc_unwasm_common::EngineConfig;
/// use pandoc_unwasm_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// let ticker = engine.start_epoch_ticker()?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if:
    /// - The Wasmtime configuration is invalid
    /// - The compilation cache cannot be configured
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        if config.cache_compiled_modules {
            wasmtime_config.cache_config_load_default().map_err(|e| {
                RuntimeError::invalid_config(format!("Failed to load wasmtime cache config: {e}"))
            })?;
            debug!("Compilation cache enabled");
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            epoch_interruption = config.epoch_interruption,
            cache_compiled_modules = config.cache_compiled_modules,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if epoch interruption is enabled.
    pub fn is_epoch_enabled(&self) -> bool {
        self.config.epoch_interruption
    }

    /// Start a background ticker for this engine.
    ///
    /// Returns `Ok(None)` when epoch interruption is disabled, since ticks
    /// would have no effect.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if the ticker thread cannot be spawned.
    pub fn start_epoch_ticker(&self) -> Result<Option<EpochTicker>, RuntimeError> {
        if !self.config.epoch_interruption {
            return Ok(None);
        }
        EpochTicker::spawn(self.engine.as_ref().clone(), self.config.epoch_tick()).map(Some)
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("epoch_tick_ms", &self.config.epoch_tick_ms)
            .field("cache_compiled_modules", &self.config.cache_compiled_modules)
            .finish_non_exhaustive()
    }
}

/// Background thread incrementing an engine's epoch at a fixed interval.
///
/// The thread stops when the ticker is dropped.
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, tick: Duration) -> Result<Self, RuntimeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_bg = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("pandoc-unwasm-epoch".to_string())
            .spawn(move || {
                while !stop_bg.load(Ordering::Acquire) {
                    std::thread::park_timeout(tick);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| {
                RuntimeError::invalid_config(format!("Failed to spawn epoch ticker: {e}"))
            })?;

        debug!(tick_ms = tick.as_millis(), "Epoch ticker started");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Epoch ticker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for EpochTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTicker")
            .field("running", &!self.stop.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
