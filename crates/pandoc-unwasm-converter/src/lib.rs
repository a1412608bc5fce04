//! Document conversion on top of the Pandoc WebAssembly module.
//!
//! This crate provides:
//! - [`Pandoc`]: the facade owning one long-lived, lazily bootstrapped instance
//! - [`ConversionOptions`]: what to convert and how, rendered to an argument string
//! - [`ConversionResult`]: output text, exit code, and console lines of one call
//! - [`PandocInfo`]: version and format catalogue of the bundled build
//! - [`WasmtimeLoader`]: the production backend
//!
//! # Example
//!
//! ```no_run
//! use pandoc_unwasm_common::RuntimeConfig;
//! use pandoc_unwasm_converter::{ConversionOptions, ModuleSource, Pandoc};
//!
//! # async fn run() -> Result<(), pandoc_unwasm_common::RuntimeError> {
//! let pandoc = Pandoc::new(RuntimeConfig::default(), ModuleSource::parse("pandoc.wasm"))?;
//! let html = pandoc
//!     .convert("# Hello", &ConversionOptions::new("markdown", "html"))
//!     .await?;
//! assert!(html.contains("<h1"));
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod backend;
pub mod converter;
pub mod formats;
pub mod invoke;
pub mod options;

pub use args::{build_args, build_argv};
pub use backend::{WasmtimeImage, WasmtimeLoader};
pub use converter::{LifecycleState, Pandoc};
pub use formats::{INPUT_FORMATS, OUTPUT_FORMATS, PANDOC_VERSION, PandocInfo};
pub use invoke::{ConversionResult, Session};
pub use options::ConversionOptions;
pub use pandoc_unwasm_core::ModuleSource;
