//! Error types for pandoc-unwasm.
//!
//! This module defines the error taxonomy used across the workspace:
//! - [`RuntimeError`]: every failure a caller of the converter can observe
//! - [`InitStage`]: where in the cold-start sequence a bootstrap failed
//!
//! Errors are `Clone` so that a single bootstrap failure can be handed to every
//! caller waiting on it, and a poisoned instance can replay its terminal error
//! to every later caller. Underlying causes are kept as [`Cause`] so the full
//! chain remains reachable through [`std::error::Error::source`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Shared, type-erased underlying cause of a [`RuntimeError`].
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Wrap any error as a [`Cause`].
pub fn cause<E>(error: E) -> Cause
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    Arc::from(error.into())
}

/// Errors raised while loading, starting, or calling the conversion module.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// The module bytes could not be fetched or are not a valid module.
    #[error("Failed to load module from {origin}: {reason}")]
    Load {
        /// Where the module was being loaded from.
        origin: String,
        /// Description of the failure.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        cause: Option<Cause>,
    },

    /// The module's imports or exports do not match the host.
    ///
    /// This indicates an incompatible module build and is never retryable.
    #[error("Link failed: {reason}")]
    Link {
        /// Description of the mismatch.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        cause: Option<Cause>,
    },

    /// The cold-start sequence failed. The instance is unusable.
    #[error("Initialization failed during {stage}")]
    Initialization {
        /// Which bootstrap step failed.
        stage: InitStage,
        /// Underlying cause.
        #[source]
        cause: Cause,
    },

    /// The module's allocator could not satisfy a request.
    #[error("Allocation of {requested} bytes failed: {reason}")]
    Allocation {
        /// Number of bytes requested.
        requested: usize,
        /// Description of the failure.
        reason: String,
    },

    /// A request would exceed the configured linear memory maximum.
    #[error(
        "Out of memory: {requested} bytes requested, linear memory limited to {limit_bytes} bytes"
    )]
    OutOfMemory {
        /// Number of bytes requested.
        requested: usize,
        /// Configured linear memory maximum in bytes.
        limit_bytes: u64,
    },

    /// The module trapped or aborted during a call. The instance is poisoned.
    #[error("Wasm trap: {message}")]
    RuntimeTrap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
        /// Underlying cause, if any.
        #[source]
        cause: Option<Cause>,
    },

    /// A call did not complete within the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The module produced output that is not valid UTF-8.
    #[error("Output is not valid UTF-8 (valid up to byte {valid_up_to})")]
    Decode {
        /// Length of the longest valid UTF-8 prefix.
        valid_up_to: usize,
        /// Underlying cause.
        #[source]
        cause: std::str::Utf8Error,
    },

    /// Any other failure during a conversion call.
    #[error("Conversion failed: {reason}")]
    Conversion {
        /// Description of the failure.
        reason: String,
        /// Underlying cause, if any.
        #[source]
        cause: Option<Cause>,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// The converter was disposed and accepts no further calls.
    #[error("Converter has been disposed")]
    Disposed,
}

/// Step of the cold-start sequence in which a bootstrap failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// Loading, compiling, or instantiating the module.
    Instantiation,
    /// Running the module's global constructors.
    Constructors,
    /// Initializing the embedded managed runtime.
    RuntimeInit,
    /// A previous bootstrap attempt was abandoned before it finished.
    Abandoned,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStage::Instantiation => write!(f, "instantiation"),
            InitStage::Constructors => write!(f, "global constructors"),
            InitStage::RuntimeInit => write!(f, "runtime bootstrap"),
            InitStage::Abandoned => write!(f, "an abandoned bootstrap"),
        }
    }
}

impl RuntimeError {
    /// Create a new `Load` error.
    pub fn load(
        origin: impl Into<String>,
        reason: impl Into<String>,
        cause: Option<Cause>,
    ) -> Self {
        Self::Load {
            origin: origin.into(),
            reason: reason.into(),
            cause,
        }
    }

    /// Create a new `Link` error.
    pub fn link(reason: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::Link {
            reason: reason.into(),
            cause,
        }
    }

    /// Create a new `Initialization` error wrapping another runtime error.
    pub fn initialization(stage: InitStage, cause: RuntimeError) -> Self {
        Self::Initialization {
            stage,
            cause: Arc::new(cause),
        }
    }

    /// Create a new `Allocation` error.
    pub fn allocation(requested: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            requested,
            reason: reason.into(),
        }
    }

    /// Create a new `RuntimeTrap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::RuntimeTrap {
            message: message.into(),
            code: None,
            cause: None,
        }
    }

    /// Create a new `Decode` error from a UTF-8 validation failure.
    pub fn decode(cause: std::str::Utf8Error) -> Self {
        Self::Decode {
            valid_up_to: cause.valid_up_to(),
            cause,
        }
    }

    /// Create a new `Conversion` error.
    pub fn conversion(reason: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::Conversion {
            reason: reason.into(),
            cause,
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error leaves the instance unusable.
    ///
    /// Once a poisoning error has been observed, the converter rejects every
    /// later call with the same error instead of calling into the module.
    pub fn is_poisoning(&self) -> bool {
        matches!(
            self,
            Self::Load { .. }
                | Self::Link { .. }
                | Self::Initialization { .. }
                | Self::RuntimeTrap { .. }
                | Self::ExecutionTimeout { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. } | Self::OutOfMemory { .. } | Self::ExecutionTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::OutOfMemory {
            requested: 100,
            limit_bytes: 64,
        };
        assert_eq!(
            err.to_string(),
            "Out of memory: 100 bytes requested, linear memory limited to 64 bytes"
        );

        let err = RuntimeError::ExecutionTimeout { duration_ms: 250 };
        assert_eq!(err.to_string(), "Execution timeout after 250ms");

        let err = RuntimeError::Disposed;
        assert_eq!(err.to_string(), "Converter has been disposed");
    }

    #[test]
    fn test_initialization_keeps_cause_chain() {
        let inner = RuntimeError::trap("unreachable executed");
        let err = RuntimeError::initialization(InitStage::RuntimeInit, inner);

        assert_eq!(err.to_string(), "Initialization failed during runtime bootstrap");
        let source = err.source().expect("initialization error has a source");
        assert_eq!(source.to_string(), "Wasm trap: unreachable executed");
    }

    #[test]
    fn test_clone_shares_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = RuntimeError::load("pandoc.wasm", "read failed", Some(cause(io)));
        let copy = err.clone();

        assert_eq!(err.to_string(), copy.to_string());
        assert_eq!(copy.source().map(ToString::to_string).as_deref(), Some("no such file"));
    }

    #[test]
    fn test_is_poisoning() {
        assert!(RuntimeError::trap("boom").is_poisoning());
        assert!(RuntimeError::ExecutionTimeout { duration_ms: 1 }.is_poisoning());
        assert!(RuntimeError::link("missing export", None).is_poisoning());
        assert!(!RuntimeError::allocation(8, "null").is_poisoning());
        assert!(!RuntimeError::Disposed.is_poisoning());
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(RuntimeError::allocation(8, "null").is_resource_limit());
        assert!(
            RuntimeError::OutOfMemory {
                requested: 1,
                limit_bytes: 0
            }
            .is_resource_limit()
        );
        assert!(!RuntimeError::trap("boom").is_resource_limit());
    }

    #[test]
    fn test_decode_records_valid_prefix() {
        let bytes = [b'o', b'k', 0xff];
        let utf8 = std::str::from_utf8(&bytes).unwrap_err();
        let err = RuntimeError::decode(utf8);

        assert!(matches!(err, RuntimeError::Decode { valid_up_to: 2, .. }));
    }
}
