//! Assembles the synthetic process a guest instance runs in.

use pandoc_unwasm_common::GuestConfig;
use pandoc_unwasm_core::{GuestEnvironment, GuestLog};

use crate::logging::{ConsoleStream, LoggingHost};

/// Builds a [`GuestEnvironment`] from the guest configuration.
#[derive(Debug, Clone)]
pub struct EnvironmentBridge {
    args: Vec<String>,
    env: Vec<(String, String)>,
    debug: bool,
}

impl EnvironmentBridge {
    pub fn new(config: &GuestConfig) -> Self {
        Self {
            args: config.argv(),
            env: config.env.clone(),
            debug: config.debug,
        }
    }

    /// The argument vector the guest will see.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Build the environment: argv and envp from the configuration, consoles
    /// feeding `log`, and a fresh preopened directory holding `in` and `out`.
    pub fn build(&self, log: GuestLog, instance_id: &str) -> GuestEnvironment {
        let console =
            |stream| LoggingHost::console(stream, self.debug, log.clone(), instance_id.into());
        let stdout = console(ConsoleStream::Stdout);
        let stderr = console(ConsoleStream::Stderr);
        GuestEnvironment::new(self.args.clone(), self.env.clone(), stdout, stderr, log)
    }
}
