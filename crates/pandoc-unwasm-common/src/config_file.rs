//! Configuration file structures for pandoc-unwasm.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleEntry`]: Where the converter module is loaded from

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.memory]
/// initial_pages = 256
/// maximum_pages = 1024
///
/// [runtime.guest]
/// rts_args = ["+RTS", "-H128m", "-RTS"]
/// debug = true
///
/// [runtime.execution]
/// call_timeout_ms = 30000
///
/// [module]
/// source = "./assets/bin/pandoc.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, memory, guest and execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Module to load.
    #[serde(default)]
    pub module: ModuleEntry,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Where the converter module comes from.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Filesystem path or http(s) URL of the module.
    ///
    /// `None` leaves the choice to the caller (the CLI falls back to its own default).
    #[serde(default)]
    pub source: Option<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.module.source.is_none());
        assert_eq!(config.runtime.memory.initial_pages, 256);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [module]
            source = "https://example.org/pandoc.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(
            config.module.source.as_deref(),
            Some("https://example.org/pandoc.wasm")
        );
        // Defaults applied
        assert_eq!(config.runtime.memory.maximum_pages, 1024);
        assert_eq!(config.runtime.guest.program_name, "pandoc");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            epoch_interruption = false
            cache_compiled_modules = true

            [runtime.memory]
            initial_pages = 512
            maximum_pages = 4096

            [runtime.guest]
            program_name = "pandoc-wasm"
            rts_args = ["+RTS", "-H128m", "-RTS"]
            env = [["LANG", "C.UTF-8"]]
            debug = true

            [runtime.guest.exports]
            deallocator = "dealloc"

            [runtime.execution]
            call_timeout_ms = 30000
            bootstrap_timeout_ms = 60000

            [module]
            source = "./pandoc.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(!config.runtime.engine.epoch_interruption);
        assert!(config.runtime.engine.cache_compiled_modules);
        assert_eq!(config.runtime.memory.initial_pages, 512);
        assert_eq!(config.runtime.memory.maximum_pages, 4096);
        assert_eq!(config.runtime.guest.argv(), ["pandoc-wasm", "+RTS", "-H128m", "-RTS"]);
        assert_eq!(
            config.runtime.guest.env,
            vec![("LANG".to_string(), "C.UTF-8".to_string())]
        );
        assert!(config.runtime.guest.debug);
        assert_eq!(config.runtime.guest.exports.deallocator.as_deref(), Some("dealloc"));
        assert_eq!(config.runtime.guest.exports.allocator, "malloc");
        assert_eq!(config.runtime.execution.call_timeout_ms, Some(30_000));
        assert_eq!(config.runtime.execution.bootstrap_timeout_ms, Some(60_000));
        assert_eq!(config.module.source.as_deref(), Some("./pandoc.wasm"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
