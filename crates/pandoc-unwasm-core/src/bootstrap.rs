//! Two-phase cold start of the embedded runtime.
//!
//! 1. Run the module's global constructors (link fixup)
//! 2. Marshal the tuning argv and call the runtime-init export
//!
//! Both steps are guarded by flags held here, not by caller convention: the
//! runtime-init export is never called twice on the same instance.

use std::fmt;

use tracing::{debug, info, instrument};

use crate::backend::ModuleInstance;
use crate::marshal::Marshaler;
use pandoc_unwasm_common::{InitStage, RuntimeError};

/// Initialization state of an instance.
///
/// Transitions only move forward, apart from `Failed`, which is terminal.
/// A bootstrapper exists only once an instance does, so the state before any
/// load is tracked by the facade, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Instantiated; global constructors have not run.
    Instantiating,
    /// Global constructors have run.
    ConstructorsRun,
    /// The runtime is bootstrapped and conversions may run.
    Ready,
    /// Initialization failed; the instance is unusable.
    Failed,
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitState::Instantiating => "instantiating",
            InitState::ConstructorsRun => "constructors-run",
            InitState::Ready => "ready",
            InitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs the cold-start sequence exactly once per instance.
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    argv: Vec<String>,
    ctors_run: bool,
    runtime_initialized: bool,
    failure: Option<RuntimeError>,
}

impl Bootstrapper {
    /// Create a bootstrapper that will pass `argv` to the runtime.
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ctors_run: false,
            runtime_initialized: false,
            failure: None,
        }
    }

    /// The argument vector handed to the runtime.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Current state derived from the guards.
    pub fn state(&self) -> InitState {
        if self.failure.is_some() {
            return InitState::Failed;
        }
        match (self.ctors_run, self.runtime_initialized) {
            (_, true) => InitState::Ready,
            (true, false) => InitState::ConstructorsRun,
            (false, false) => InitState::Instantiating,
        }
    }

    /// Whether the runtime has been initialized.
    pub fn is_ready(&self) -> bool {
        self.runtime_initialized && self.failure.is_none()
    }

    /// Run both phases. Completed phases are skipped.
    ///
    /// Once a phase has failed every later call returns the same error.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Initialization` naming the failed stage.
    #[instrument(skip_all, fields(argc = self.argv.len()))]
    pub async fn run(
        &mut self,
        instance: &mut dyn ModuleInstance,
        marshaler: &mut Marshaler,
    ) -> Result<(), RuntimeError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let outcome = match self.run_constructors(instance).await {
            Ok(()) => self.init_runtime(instance, marshaler).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                info!("Embedded runtime ready");
                Ok(())
            }
            Err(e) => {
                self.failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Phase 1: global constructors.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Initialization` with stage `Constructors`.
    pub async fn run_constructors(
        &mut self,
        instance: &mut dyn ModuleInstance,
    ) -> Result<(), RuntimeError> {
        if self.ctors_run {
            return Ok(());
        }
        instance
            .run_constructors()
            .await
            .map_err(|e| RuntimeError::initialization(InitStage::Constructors, e))?;
        self.ctors_run = true;
        debug!("Global constructors run");
        Ok(())
    }

    /// Phase 2: runtime initialization. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Initialization` with stage `RuntimeInit`, or with
    /// stage `Constructors` if phase 1 has not completed.
    pub async fn init_runtime(
        &mut self,
        instance: &mut dyn ModuleInstance,
        marshaler: &mut Marshaler,
    ) -> Result<(), RuntimeError> {
        if self.runtime_initialized {
            return Ok(());
        }
        if !self.ctors_run {
            return Err(RuntimeError::initialization(
                InitStage::Constructors,
                RuntimeError::trap("runtime init attempted before global constructors ran"),
            ));
        }

        let (argc_ptr, argv_ptr) = marshaler
            .write_argv(instance, &self.argv)
            .await
            .map_err(|e| RuntimeError::initialization(InitStage::RuntimeInit, e))?;

        // Set before the call: a trapped init must not be retried either.
        self.runtime_initialized = true;
        instance
            .init_runtime(argc_ptr, argv_ptr)
            .await
            .map_err(|e| RuntimeError::initialization(InitStage::RuntimeInit, e))?;

        debug!(argc_ptr, argv_ptr, "Runtime initialized");
        Ok(())
    }
}
