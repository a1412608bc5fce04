//! Wasmtime implementation of the backend seams.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, instrument};

use pandoc_unwasm_common::{ExportNames, MemoryConfig, RuntimeError};
use pandoc_unwasm_core::{
    CompiledModule, GuestEnvironment, HostContext, ImageLoader, Instantiator, ModuleImage,
    ModuleInstance, ModuleSource, WasmEngine,
};
use pandoc_unwasm_host::create_instantiator;

/// Loads a module from a [`ModuleSource`] and compiles it with the engine.
pub struct WasmtimeLoader {
    engine: WasmEngine,
    source: ModuleSource,
    memory: MemoryConfig,
    exports: ExportNames,
    instance_id: String,
}

impl WasmtimeLoader {
    pub fn new(
        engine: WasmEngine,
        source: ModuleSource,
        memory: MemoryConfig,
        exports: ExportNames,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            source,
            memory,
            exports,
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Debug for WasmtimeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeLoader")
            .field("source", &self.source)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ImageLoader for WasmtimeLoader {
    #[instrument(skip(self), fields(source = %self.source))]
    async fn load(&self) -> Result<Arc<dyn ModuleImage>, RuntimeError> {
        let start = Instant::now();
        let module = self.source.load(self.engine.inner()).await?;
        let instantiator = create_instantiator(&self.engine)?;

        info!(
            content_hash = %module.content_hash(),
            duration_ms = start.elapsed().as_millis(),
            "Converter module compiled"
        );

        Ok(Arc::new(WasmtimeImage {
            module,
            instantiator,
            memory: self.memory,
            exports: self.exports.clone(),
            instance_id: self.instance_id.clone(),
        }))
    }
}

/// A compiled module plus a linker with the syscall surface registered.
pub struct WasmtimeImage {
    module: CompiledModule,
    instantiator: Instantiator,
    memory: MemoryConfig,
    exports: ExportNames,
    instance_id: String,
}

#[async_trait]
impl ModuleImage for WasmtimeImage {
    async fn instantiate(
        &self,
        environment: GuestEnvironment,
    ) -> Result<Box<dyn ModuleInstance>, RuntimeError> {
        let context = HostContext::new(environment, &self.memory, self.instance_id.clone());
        let instance = self
            .instantiator
            .instantiate(&self.module, context, &self.memory, &self.exports)
            .await?;
        Ok(Box::new(instance))
    }

    fn describe(&self) -> String {
        format!("module {}", self.module.content_hash())
    }
}
