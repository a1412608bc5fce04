//! Per-call orchestration against the bootstrapped instance.
//!
//! A [`Session`] owns everything a ready instance needs between calls. One
//! call runs:
//! 1. Build the argument string
//! 2. Overwrite `in`, empty `out`, discard stale console lines
//! 3. Marshal the argument string
//! 4. Call the entry point
//! 5. Decode `out` as strict UTF-8
//!
//! A non-zero exit code is part of the result, not an error.

use serde::Serialize;
use tracing::{debug, warn};

use crate::args::build_args;
use crate::options::ConversionOptions;
use pandoc_unwasm_common::RuntimeError;
use pandoc_unwasm_core::{
    AllocationScope, Bootstrapper, GuestFiles, GuestLog, InitState, Marshaler, ModuleInstance,
};

/// Outcome of one conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    /// Decoded contents of `out`.
    pub output: String,

    /// The entry point's return value; `0` is success.
    pub exit_code: i32,

    /// Console lines the module printed during the call.
    pub log: Vec<String>,
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live, bootstrapped instance and its host-side handles.
pub struct Session {
    instance: Box<dyn ModuleInstance>,
    marshaler: Marshaler,
    bootstrap: Bootstrapper,
    files: GuestFiles,
    log: GuestLog,
    in_call: bool,
}

impl Session {
    pub fn new(
        instance: Box<dyn ModuleInstance>,
        bootstrap: Bootstrapper,
        files: GuestFiles,
        log: GuestLog,
    ) -> Self {
        Self {
            instance,
            marshaler: Marshaler::new(),
            bootstrap,
            files,
            log,
            in_call: false,
        }
    }

    /// Run the cold-start sequence. Completed phases are skipped.
    pub async fn bootstrap(&mut self) -> Result<(), RuntimeError> {
        self.bootstrap.run(self.instance.as_mut(), &mut self.marshaler).await
    }

    pub fn init_state(&self) -> InitState {
        self.bootstrap.state()
    }

    /// Whether a call started and never finished, which leaves the module in
    /// an unknown state.
    pub fn was_abandoned(&self) -> bool {
        self.in_call
    }

    /// Live allocations made on the host's behalf.
    pub fn allocation_count(&self) -> usize {
        self.marshaler.record().len()
    }

    /// Run one conversion.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::Conversion` for unrepresentable options
    /// - `RuntimeError::Allocation` / `RuntimeError::OutOfMemory` if the
    ///   argument string cannot be placed in linear memory
    /// - `RuntimeError::RuntimeTrap` if the module traps or exits
    /// - `RuntimeError::Decode` if `out` is not valid UTF-8
    pub async fn invoke(
        &mut self,
        input: &str,
        options: &ConversionOptions,
    ) -> Result<ConversionResult, RuntimeError> {
        let args = build_args(options)?;
        debug!(args = %args, input_bytes = input.len(), "Invoking entry point");

        self.files.input.replace(input.as_bytes());
        self.files.output.clear();
        self.log.drain();

        // Only a dropped future leaves the flag set.
        self.in_call = true;
        let outcome = self.call(&args).await;
        self.in_call = false;
        let exit_code = outcome?;

        let bytes = self.files.output.contents();
        let log: Vec<String> = self.log.drain().into_iter().map(|entry| entry.message).collect();
        let output = String::from_utf8(bytes).map_err(|e| RuntimeError::decode(e.utf8_error()))?;

        if exit_code != 0 {
            warn!(exit_code, log_lines = log.len(), "Module reported failure");
        }
        Ok(ConversionResult {
            output,
            exit_code,
            log,
        })
    }

    async fn call(&mut self, args: &str) -> Result<i32, RuntimeError> {
        let (ptr, len) = self
            .marshaler
            .write_string(self.instance.as_mut(), args, AllocationScope::Scratch)
            .await?;
        let exit_code = self.instance.run_main(ptr, len).await?;
        self.instance.flush_consoles();

        let released = self.marshaler.release_scratch(self.instance.as_mut()).await?;
        debug!(exit_code, released, "Entry point returned");
        Ok(exit_code)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.bootstrap.state())
            .field("allocations", &self.marshaler.record().len())
            .field("in_call", &self.in_call)
            .finish_non_exhaustive()
    }
}
