//! The `Pandoc` facade.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──► Bootstrapping ──► Ready(Session) ──► Disposed
//!                        │                  │
//!                        ▼                  ▼
//!                  Failed(error) ◄──── poisoning error
//! ```
//!
//! The whole lifecycle sits behind one async mutex, held for the entire
//! `bootstrap` or `write in → call → read out` sequence. Concurrent first
//! callers queue on it and observe the single bootstrap outcome; concurrent
//! conversions never interleave.
//!
//! A future dropped while holding the lock (caller-side timeout or
//! cancellation) leaves `Bootstrapping` or an in-call session behind. The next
//! caller sees that marker and turns it into a terminal failure, since the
//! module may have been stopped at any instruction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{Span, debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::WasmtimeLoader;
use crate::formats::{INPUT_FORMATS, OUTPUT_FORMATS, PANDOC_VERSION, PandocInfo};
use crate::invoke::{ConversionResult, Session};
use crate::options::ConversionOptions;
use pandoc_unwasm_common::{ExecutionConfig, InitStage, RuntimeConfig, RuntimeError};
use pandoc_unwasm_core::{Bootstrapper, GuestLog, ImageLoader, ModuleSource, WasmEngine};
use pandoc_unwasm_host::EnvironmentBridge;

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing has been loaded yet.
    Uninitialized,
    /// A bootstrap is in progress, or was abandoned mid-way.
    Bootstrapping,
    /// Conversions may run.
    Ready,
    /// A terminal error occurred; every call replays it.
    Failed,
    /// [`Pandoc::dispose`] was called.
    Disposed,
}

enum Lifecycle {
    Uninitialized,
    Bootstrapping,
    Ready(Box<Session>),
    Failed(RuntimeError),
    Disposed,
}

impl Lifecycle {
    fn state(&self) -> LifecycleState {
        match self {
            Lifecycle::Uninitialized => LifecycleState::Uninitialized,
            Lifecycle::Bootstrapping => LifecycleState::Bootstrapping,
            Lifecycle::Ready(_) => LifecycleState::Ready,
            Lifecycle::Failed(_) => LifecycleState::Failed,
            Lifecycle::Disposed => LifecycleState::Disposed,
        }
    }
}

/// A document converter backed by one long-lived module instance.
///
/// Construct it once and reuse it: the first call loads, compiles, and
/// bootstraps the module, which takes seconds for the real converter.
/// There is no shared default instance.
pub struct Pandoc {
    loader: Arc<dyn ImageLoader>,
    bridge: EnvironmentBridge,
    execution: ExecutionConfig,
    instance_id: String,
    lifecycle: Mutex<Lifecycle>,
}

impl Pandoc {
    /// Create a converter for the module at `source`.
    ///
    /// Nothing is loaded until the first call.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if `config` is inconsistent.
    pub fn new(config: RuntimeConfig, source: ModuleSource) -> Result<Self, RuntimeError> {
        config.validate()?;
        let instance_id = Uuid::new_v4().to_string();
        let engine = WasmEngine::new(&config.engine)?;
        let loader = WasmtimeLoader::new(
            engine,
            source,
            config.memory,
            config.guest.exports.clone(),
            instance_id.clone(),
        );
        Ok(Self::assemble(config, Arc::new(loader), instance_id))
    }

    /// Create a converter over a custom backend.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidConfig` if `config` is inconsistent.
    pub fn with_loader(
        config: RuntimeConfig,
        loader: Arc<dyn ImageLoader>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self::assemble(config, loader, Uuid::new_v4().to_string()))
    }

    fn assemble(config: RuntimeConfig, loader: Arc<dyn ImageLoader>, instance_id: String) -> Self {
        Self {
            loader,
            bridge: EnvironmentBridge::new(&config.guest),
            execution: config.execution,
            instance_id,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    /// Identifier used in logs for this converter's instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Load, instantiate, and bootstrap the module if that has not happened.
    ///
    /// # Errors
    ///
    /// Returns the bootstrap failure, which is replayed to every later call.
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.ensure_ready(&mut lifecycle).await.map(|_| ())
    }

    /// Convert `input` and return the output text.
    ///
    /// A non-zero exit code is logged, and whatever the module wrote is
    /// returned; use [`Pandoc::convert_detailed`] to inspect it.
    ///
    /// # Errors
    ///
    /// See [`Pandoc::convert_detailed`].
    pub async fn convert(
        &self,
        input: &str,
        options: &ConversionOptions,
    ) -> Result<String, RuntimeError> {
        Ok(self.convert_detailed(input, options).await?.output)
    }

    /// Convert `input`, returning output, exit code, and console lines.
    ///
    /// # Errors
    ///
    /// - Any bootstrap failure
    /// - `RuntimeError::RuntimeTrap` or `RuntimeError::ExecutionTimeout`;
    ///   both poison the instance
    /// - `RuntimeError::Allocation`, `RuntimeError::OutOfMemory`,
    ///   `RuntimeError::Decode`, or `RuntimeError::Conversion`; the instance
    ///   stays usable
    /// - `RuntimeError::Disposed` after [`Pandoc::dispose`]
    #[instrument(
        skip_all,
        fields(
            instance_id = %self.instance_id,
            call_id = tracing::field::Empty,
            from = %options.from,
            to = %options.to,
        )
    )]
    pub async fn convert_detailed(
        &self,
        input: &str,
        options: &ConversionOptions,
    ) -> Result<ConversionResult, RuntimeError> {
        Span::current().record("call_id", tracing::field::display(Uuid::new_v4()));

        let mut lifecycle = self.lifecycle.lock().await;
        let session = self.ensure_ready(&mut lifecycle).await?;

        let outcome = match self.execution.call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, session.invoke(input, options)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(timeout_error(limit)),
            },
            None => session.invoke(input, options).await,
        };

        match outcome {
            Ok(result) => {
                debug!(
                    exit_code = result.exit_code,
                    output_bytes = result.output.len(),
                    "Conversion finished"
                );
                Ok(result)
            }
            Err(e) if e.is_poisoning() => {
                error!(error = %e, "Instance poisoned");
                *lifecycle = Lifecycle::Failed(e.clone());
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Conversion failed");
                Err(e)
            }
        }
    }

    /// Version of the bundled converter. Does not load the module.
    pub fn version(&self) -> &'static str {
        PANDOC_VERSION
    }

    /// Supported input formats. Does not load the module.
    pub fn input_formats(&self) -> &'static [&'static str] {
        INPUT_FORMATS
    }

    /// Supported output formats. Does not load the module.
    pub fn output_formats(&self) -> &'static [&'static str] {
        OUTPUT_FORMATS
    }

    /// Version and formats together. Does not load the module.
    pub fn info(&self) -> PandocInfo {
        PandocInfo::bundled()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.lock().await.state()
    }

    /// Allocations held in linear memory on the host's behalf, once ready.
    pub async fn allocation_count(&self) -> Option<usize> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Ready(session) => Some(session.allocation_count()),
            _ => None,
        }
    }

    /// Drop the instance. Every later call fails with `RuntimeError::Disposed`.
    pub async fn dispose(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Disposed) {
            info!(instance_id = %self.instance_id, "Converter disposed");
        }
        *lifecycle = Lifecycle::Disposed;
    }

    /// Bring the lifecycle to `Ready` and return the session, or the terminal
    /// error. Must be called with the lock held.
    async fn ensure_ready<'a>(
        &self,
        lifecycle: &'a mut Lifecycle,
    ) -> Result<&'a mut Session, RuntimeError> {
        match lifecycle {
            Lifecycle::Ready(session) if session.was_abandoned() => {
                let e = RuntimeError::RuntimeTrap {
                    message: "a previous call was abandoned mid-run".to_string(),
                    code: Some("abandoned".to_string()),
                    cause: None,
                };
                warn!(instance_id = %self.instance_id, "Abandoned call detected");
                *lifecycle = Lifecycle::Failed(e);
            }
            Lifecycle::Bootstrapping => {
                let e = RuntimeError::initialization(
                    InitStage::Abandoned,
                    RuntimeError::trap("a previous bootstrap was abandoned before completing"),
                );
                warn!(instance_id = %self.instance_id, "Abandoned bootstrap detected");
                *lifecycle = Lifecycle::Failed(e);
            }
            Lifecycle::Uninitialized => {
                *lifecycle = Lifecycle::Bootstrapping;
                let bootstrapped = match self.execution.bootstrap_timeout() {
                    Some(limit) => match tokio::time::timeout(limit, self.bootstrap()).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(RuntimeError::initialization(
                            InitStage::Abandoned,
                            timeout_error(limit),
                        )),
                    },
                    None => self.bootstrap().await,
                };
                *lifecycle = match bootstrapped {
                    Ok(session) => Lifecycle::Ready(Box::new(session)),
                    Err(e) => {
                        error!(instance_id = %self.instance_id, error = %e, "Bootstrap failed");
                        Lifecycle::Failed(e)
                    }
                };
            }
            Lifecycle::Ready(_) | Lifecycle::Failed(_) | Lifecycle::Disposed => {}
        }

        match lifecycle {
            Lifecycle::Ready(session) => Ok(session.as_mut()),
            Lifecycle::Failed(e) => Err(e.clone()),
            Lifecycle::Disposed => Err(RuntimeError::Disposed),
            Lifecycle::Uninitialized | Lifecycle::Bootstrapping => {
                Err(RuntimeError::trap("lifecycle did not settle after bootstrap"))
            }
        }
    }

    #[instrument(skip_all, fields(instance_id = %self.instance_id))]
    async fn bootstrap(&self) -> Result<Session, RuntimeError> {
        let image = self.loader.load().await?;
        debug!(image = %image.describe(), "Module image ready");

        let log = GuestLog::new();
        let environment = self.bridge.build(log.clone(), &self.instance_id);
        let files = environment.files.clone();
        let instance = image.instantiate(environment).await?;

        let bootstrapper = Bootstrapper::new(self.bridge.args().to_vec());
        let mut session = Session::new(instance, bootstrapper, files, log);
        session.bootstrap().await?;
        info!(state = %session.init_state(), "Converter ready");
        Ok(session)
    }
}

impl std::fmt::Debug for Pandoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pandoc")
            .field("instance_id", &self.instance_id)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

fn timeout_error(limit: Duration) -> RuntimeError {
    RuntimeError::ExecutionTimeout {
        duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    }
}
