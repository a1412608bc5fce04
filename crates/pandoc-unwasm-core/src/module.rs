//! WebAssembly module loading and compilation.
//!
//! This module provides:
//! - [`ModuleSource`]: where the module bytes come from (file, URL, memory, WAT)
//! - [`CompiledModule`]: a wrapper around Wasmtime's [`Module`] with a content
//!   hash, serialization, and import/export inspection
//!
//! # Compilation Strategies
//!
//! - **JIT**: Compile from Wasm bytes at load time (slow cold start for a
//!   module the size of the converter)
//! - **AOT**: Load an artifact previously produced by [`CompiledModule::serialize`]
//! - **Cache**: Let wasmtime's compilation cache skip recompiling identical bytes

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use url::Url;
use wasmtime::{Engine, ExternType, Module};

use pandoc_unwasm_common::{RuntimeError, cause};

/// Where the module bytes come from.
#[derive(Clone)]
pub enum ModuleSource {
    /// A `.wasm` file on disk.
    Path(PathBuf),
    /// An http(s) URL fetched with `reqwest`.
    Url(Url),
    /// Bytes already in memory.
    Bytes(Arc<[u8]>),
    /// WebAssembly text, compiled on load. Mostly for tests.
    Wat(String),
    /// An artifact produced by [`CompiledModule::serialize`] with the same
    /// wasmtime version and engine settings.
    Precompiled(PathBuf),
}

impl ModuleSource {
    /// Interpret a user-supplied location.
    ///
    /// `http://` and `https://` become [`ModuleSource::Url`], `file://` URLs
    /// become paths, and everything else is treated as a filesystem path.
    pub fn parse(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Url(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Self::Path(path),
                Err(()) => Self::Path(PathBuf::from(location)),
            },
            _ => Self::Path(PathBuf::from(location)),
        }
    }

    /// Fetch the raw module bytes.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if the file cannot be read, the request
    /// fails, or the server answers with a non-success status.
    pub async fn fetch(&self) -> Result<Arc<[u8]>, RuntimeError> {
        match self {
            Self::Path(path) | Self::Precompiled(path) => tokio::fs::read(path)
                .await
                .map(Arc::from)
                .map_err(|e| RuntimeError::load(self.to_string(), "read failed", Some(cause(e)))),
            Self::Url(url) => {
                let response = reqwest::get(url.clone()).await.map_err(|e| {
                    RuntimeError::load(self.to_string(), "request failed", Some(cause(e)))
                })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(RuntimeError::load(
                        self.to_string(),
                        format!("server responded with {status}"),
                        None,
                    ));
                }
                let bytes = response.bytes().await.map_err(|e| {
                    let reason = "reading response body failed";
                    RuntimeError::load(self.to_string(), reason, Some(cause(e)))
                })?;
                Ok(Arc::from(bytes.as_ref()))
            }
            Self::Bytes(bytes) => Ok(Arc::clone(bytes)),
            Self::Wat(wat) => Ok(Arc::from(wat.as_bytes())),
        }
    }

    /// Fetch and compile the module.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if fetching or compilation fails.
    #[instrument(skip(self, engine), fields(source = %self))]
    pub async fn load(&self, engine: &Engine) -> Result<CompiledModule, RuntimeError> {
        match self {
            Self::Precompiled(path) => {
                let engine = engine.clone();
                let path = path.clone();
                tokio::task::spawn_blocking(move || CompiledModule::from_precompiled(&engine, path))
                    .await
                    .map_err(|e| {
                        RuntimeError::load(self.to_string(), "loader task failed", Some(cause(e)))
                    })?
            }
            Self::Wat(wat) => CompiledModule::from_wat(engine, wat),
            _ => {
                let bytes = self.fetch().await?;
                let origin = self.to_string();
                let engine = engine.clone();
                // Compiling the converter module takes seconds; keep it off the executor.
                tokio::task::spawn_blocking(move || CompiledModule::from_bytes(&engine, &bytes))
                    .await
                    .map_err(|e| {
                        RuntimeError::load(origin.clone(), "compiler task failed", Some(cause(e)))
                    })?
                    .map_err(|e| match e {
                        RuntimeError::Load { reason, cause, .. } => RuntimeError::Load {
                            origin,
                            reason,
                            cause,
                        },
                        other => other,
                    })
            }
        }
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
            Self::Bytes(bytes) => write!(f, "<{} in-memory bytes>", bytes.len()),
            Self::Wat(_) => write!(f, "<inline wat>"),
            Self::Precompiled(path) => write!(f, "{} (precompiled)", path.display()),
        }
    }
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleSource({self})")
    }
}

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across threads.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,

    /// 64-bit hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Arguments
    ///
    /// * `engine` - The Wasmtime engine to use for compilation
    /// * `bytes` - The raw WebAssembly bytes
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if the bytes are not a valid module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::load("<bytes>", format!("compilation failed: {e}"), Some(cause(e)))
        })?;

        let content_hash = compute_hash(bytes);
        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            duration_ms = duration.as_millis(),
            "Module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if the text does not compile.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            let reason = format!("WAT compilation failed: {e}");
            RuntimeError::load("<inline wat>", reason, Some(cause(e)))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Load a pre-compiled module from disk.
    ///
    /// # Safety
    ///
    /// Deserializing runs no code, but the artifact is trusted to be machine
    /// code produced by [`CompiledModule::serialize`] with the same Wasmtime
    /// version. Only load artifacts from your own build pipeline.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if the artifact cannot be loaded or is incompatible.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let start = Instant::now();

        // SAFETY: artifacts come from `serialize` on a matching engine.
        let module = unsafe { Module::deserialize_file(engine, path) }.map_err(|e| {
            RuntimeError::load(
                path.display().to_string(),
                format!("invalid precompiled artifact: {e}"),
                Some(cause(e)),
            )
        })?;

        // Filename convention: {hash}.cwasm
        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        debug!(
            path = %path.display(),
            content_hash = %content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled module loaded"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Serialize the compiled module for AOT loading.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Load` if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>, RuntimeError> {
        self.inner.serialize().map_err(|e| {
            RuntimeError::load(
                self.content_hash.clone(),
                format!("serialization failed: {e}"),
                Some(cause(e)),
            )
        })
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.inner
    }

    /// List `(module, name, kind)` for every import.
    pub fn imports(&self) -> Vec<(String, String, &'static str)> {
        self.inner
            .imports()
            .map(|import| {
                (
                    import.module().to_string(),
                    import.name().to_string(),
                    extern_kind(&import.ty()),
                )
            })
            .collect()
    }

    /// List `(name, kind)` for every export.
    pub fn exports(&self) -> Vec<(String, &'static str)> {
        self.inner
            .exports()
            .map(|export| (export.name().to_string(), extern_kind(&export.ty())))
            .collect()
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::load("<bytes>", "invalid Wasm: file too small", None));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::load("<bytes>", "invalid Wasm: bad magic number", None));
        }

        Ok(())
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "func",
        ExternType::Global(_) => "global",
        ExternType::Table(_) => "table",
        ExternType::Memory(_) => "memory",
        #[allow(unreachable_patterns)]
        _ => "other",
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
