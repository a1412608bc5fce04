//! Instantiation and the live wasmtime instance.
//!
//! This module provides:
//! - [`Instantiator`]: engine + linker; creates the linear memory, completes
//!   the import table and instantiates a [`CompiledModule`]
//! - [`WasmtimeInstance`]: the running instance with its typed exports,
//!   implementing [`ModuleInstance`]
//!
//! # Import table
//!
//! 1. `env.memory` is a host-created memory with the configured bounds
//! 2. Host functions registered on the linker (the syscall surface)
//! 3. Any remaining function import in a fallback namespace is synthesized from
//!    its declared signature: `wasi_snapshot_preview1` stubs return `ENOSYS`,
//!    `env` stubs return zeros
//!
//! Anything still unresolved fails instantiation with `RuntimeError::Link`.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};
use wasmtime::{
    Engine, ExternType, FuncType, Linker, Memory, MemoryType, Store, Trap, TypedFunc, Val, ValType,
};
use wasmtime_wasi::I32Exit;

use crate::backend::ModuleInstance;
use crate::engine::{EpochTicker, WasmEngine};
use crate::module::CompiledModule;
use crate::store::{HostContext, create_store};
use crate::vfs::Descriptor;
use pandoc_unwasm_common::{ExportNames, MemoryConfig, RuntimeError, cause};

/// Namespace of the WASI preview1 syscall surface.
pub const WASI_NAMESPACE: &str = "wasi_snapshot_preview1";

/// Namespace of the raw memory and runtime stubs.
pub const ENV_NAMESPACE: &str = "env";

/// `ENOSYS` in the WASI preview1 errno numbering.
const ERRNO_NOSYS: i32 = 52;

/// Links and instantiates modules against the host.
///
/// Host functions are registered once on the inner linker through
/// [`Instantiator::linker_mut`]; each instantiation works on a clone so the
/// per-instance memory can be defined without touching the shared linker.
pub struct Instantiator {
    engine: WasmEngine,
    linker: Linker<HostContext>,
    fallback_namespaces: Vec<String>,
}

impl Instantiator {
    /// Create an instantiator with `wasi_snapshot_preview1` and `env` as
    /// fallback namespaces.
    pub fn new(engine: &WasmEngine) -> Self {
        Self {
            engine: engine.clone(),
            linker: Linker::new(engine.inner()),
            fallback_namespaces: vec![WASI_NAMESPACE.to_string(), ENV_NAMESPACE.to_string()],
        }
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<HostContext> {
        &mut self.linker
    }

    /// Replace the namespaces whose unknown function imports are stubbed.
    #[must_use]
    pub fn with_fallback_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.fallback_namespaces = namespaces;
        self
    }

    /// Get the engine reference.
    pub fn engine(&self) -> &Engine {
        self.engine.inner()
    }

    /// Instantiate `module` with a fresh store owning `context`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Link` if:
    /// - The linear memory cannot be created with the configured bounds
    /// - An import cannot be satisfied
    /// - A required export is missing or has the wrong signature
    #[instrument(
        skip_all,
        fields(instance_id = %context.instance_id, module = %module.content_hash())
    )]
    pub async fn instantiate(
        &self,
        module: &CompiledModule,
        context: HostContext,
        memory_config: &MemoryConfig,
        exports: &ExportNames,
    ) -> Result<WasmtimeInstance, RuntimeError> {
        let start = Instant::now();
        let mut store = create_store(&self.engine, context);

        let memory_type =
            MemoryType::new(memory_config.initial_pages, Some(memory_config.maximum_pages));
        let memory = Memory::new_async(&mut store, memory_type).await.map_err(|e| {
            RuntimeError::link(format!("cannot create linear memory: {e}"), Some(cause(e)))
        })?;
        store.data_mut().memory = Some(memory);

        let mut linker = self.linker.clone();
        linker
            .define(&store, ENV_NAMESPACE, "memory", memory)
            .map_err(|e| {
                RuntimeError::link(format!("cannot define env.memory: {e}"), Some(cause(e)))
            })?;

        let stubbed = self.synthesize_missing(&mut linker, &mut store, module)?;

        let instance = linker
            .instantiate_async(&mut store, module.module())
            .await
            .map_err(|e| RuntimeError::link(format!("instantiation failed: {e}"), Some(cause(e))))?;

        let constructors = typed_export::<(), ()>(&instance, &mut store, &exports.constructors)?;
        let runtime_init =
            typed_export::<(i32, i32), ()>(&instance, &mut store, &exports.runtime_init)?;
        let allocator = typed_export::<i32, i32>(&instance, &mut store, &exports.allocator)?;
        let entry_point =
            typed_export::<(i32, i32), i32>(&instance, &mut store, &exports.entry_point)?;
        let deallocator = match &exports.deallocator {
            Some(name) if instance.get_func(&mut store, name).is_some() => {
                Some(typed_export::<i32, ()>(&instance, &mut store, name)?)
            }
            _ => None,
        };

        let ticker = self.engine.start_epoch_ticker()?;

        info!(
            stubbed_imports = stubbed,
            has_deallocator = deallocator.is_some(),
            initial_pages = memory_config.initial_pages,
            maximum_pages = memory_config.maximum_pages,
            duration_ms = start.elapsed().as_millis(),
            "Module instantiated"
        );

        Ok(WasmtimeInstance {
            store,
            memory,
            memory_limit: memory_config.max_bytes(),
            constructors,
            runtime_init,
            allocator,
            deallocator,
            entry_point,
            _ticker: ticker,
        })
    }

    /// Define stubs for unresolved function imports in fallback namespaces.
    fn synthesize_missing(
        &self,
        linker: &mut Linker<HostContext>,
        store: &mut Store<HostContext>,
        module: &CompiledModule,
    ) -> Result<usize, RuntimeError> {
        let mut stubbed = 0;
        for import in module.module().imports() {
            let namespace = import.module();
            if !self.fallback_namespaces.iter().any(|ns| ns == namespace) {
                continue;
            }
            let ExternType::Func(ty) = import.ty() else {
                continue;
            };
            if linker.get(&mut *store, namespace, import.name()).is_some() {
                continue;
            }

            debug!(namespace, name = import.name(), "Stubbing unsupported import");
            let errno_result = namespace == WASI_NAMESPACE;
            let name = format!("{namespace}.{}", import.name());
            let result_types: Vec<ValType> = ty.results().collect();
            linker
                .func_new(namespace, import.name(), ty.clone(), move |_caller, _params, results| {
                    fill_stub_results(&name, errno_result, &result_types, results)
                })
                .map_err(|e| {
                    RuntimeError::link(format!("cannot stub {namespace}: {e}"), Some(cause(e)))
                })?;
            stubbed += 1;
        }
        Ok(stubbed)
    }
}

impl std::fmt::Debug for Instantiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instantiator")
            .field("fallback_namespaces", &self.fallback_namespaces)
            .finish_non_exhaustive()
    }
}

fn fill_stub_results(
    name: &str,
    errno_result: bool,
    result_types: &[ValType],
    results: &mut [Val],
) -> wasmtime::Result<()> {
    for (index, (slot, ty)) in results.iter_mut().zip(result_types).enumerate() {
        *slot = match ty {
            ValType::I32 if errno_result && index == 0 => Val::I32(ERRNO_NOSYS),
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            _ => {
                return Err(wasmtime::Error::msg(format!(
                    "stub for {name} cannot produce a non-numeric result"
                )));
            }
        };
    }
    Ok(())
}

fn typed_export<Params, Results>(
    instance: &wasmtime::Instance,
    store: &mut Store<HostContext>,
    name: &str,
) -> Result<TypedFunc<Params, Results>, RuntimeError>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| RuntimeError::link(format!("required export '{name}' not found"), None))?;
    func.typed::<Params, Results>(&*store).map_err(|e| {
        let actual: FuncType = func.ty(&*store);
        RuntimeError::link(
            format!("export '{name}' has unexpected signature {actual:?}"),
            Some(cause(e)),
        )
    })
}

/// The live converter instance.
pub struct WasmtimeInstance {
    store: Store<HostContext>,
    memory: Memory,
    memory_limit: u64,
    constructors: TypedFunc<(), ()>,
    runtime_init: TypedFunc<(i32, i32), ()>,
    allocator: TypedFunc<i32, i32>,
    deallocator: Option<TypedFunc<i32, ()>>,
    entry_point: TypedFunc<(i32, i32), i32>,
    _ticker: Option<EpochTicker>,
}

impl WasmtimeInstance {
    /// Get the store data.
    pub fn context(&self) -> &HostContext {
        self.store.data()
    }

    /// Whether the module exports a deallocator.
    pub fn has_deallocator(&self) -> bool {
        self.deallocator.is_some()
    }
}

impl std::fmt::Debug for WasmtimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeInstance")
            .field("instance_id", &self.store.data().instance_id)
            .field("memory_size", &self.memory.data_size(&self.store))
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ModuleInstance for WasmtimeInstance {
    async fn run_constructors(&mut self) -> Result<(), RuntimeError> {
        self.constructors
            .call_async(&mut self.store, ())
            .await
            .map_err(|e| classify_fault("constructors", e))
    }

    async fn init_runtime(&mut self, argc_ptr: u32, argv_ptr: u32) -> Result<(), RuntimeError> {
        self.runtime_init
            .call_async(&mut self.store, (as_i32(argc_ptr), as_i32(argv_ptr)))
            .await
            .map_err(|e| classify_fault("runtime init", e))
    }

    async fn allocate(&mut self, size: u32) -> Result<u32, RuntimeError> {
        let offset = self
            .allocator
            .call_async(&mut self.store, as_i32(size))
            .await
            .map_err(|e| classify_fault("allocator", e))?;
        Ok(as_u32(offset))
    }

    async fn deallocate(&mut self, offset: u32) -> Result<bool, RuntimeError> {
        let Some(free) = &self.deallocator else {
            return Ok(false);
        };
        free.call_async(&mut self.store, as_i32(offset))
            .await
            .map_err(|e| classify_fault("deallocator", e))?;
        Ok(true)
    }

    async fn run_main(&mut self, args_ptr: u32, args_len: u32) -> Result<i32, RuntimeError> {
        self.entry_point
            .call_async(&mut self.store, (as_i32(args_ptr), as_i32(args_len)))
            .await
            .map_err(|e| classify_fault("entry point", e))
    }

    fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(|e| {
                RuntimeError::conversion(
                    format!("write of {} bytes at {offset} is out of bounds", bytes.len()),
                    Some(cause(e)),
                )
            })
    }

    fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        let mut buf = vec![0; len as usize];
        self.memory
            .read(&self.store, offset as usize, &mut buf)
            .map_err(|e| {
                RuntimeError::conversion(
                    format!("read of {len} bytes at {offset} is out of bounds"),
                    Some(cause(e)),
                )
            })?;
        Ok(buf)
    }

    fn memory_size(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }

    fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    fn flush_consoles(&mut self) {
        for fd in [1, 2] {
            if let Some(Descriptor::Console(sink)) = self.store.data().env.fds.get(fd) {
                sink.flush();
            }
        }
    }
}

/// Reinterpret a linear-memory offset as the `i32` wasm passes around.
#[allow(clippy::cast_possible_wrap)]
fn as_i32(value: u32) -> i32 {
    value as i32
}

#[allow(clippy::cast_sign_loss)]
fn as_u32(value: i32) -> u32 {
    value as u32
}

/// Map a fault raised while calling into the guest.
///
/// Guest exits, traps, and host function errors all poison the instance.
fn classify_fault(export: &str, error: wasmtime::Error) -> RuntimeError {
    let (message, code) = if let Some(exit) = error.downcast_ref::<I32Exit>() {
        (
            format!("{export} exited the process with status {}", exit.0),
            Some("exit".to_string()),
        )
    } else {
        extract_trap_info(&error)
    };

    if code.as_deref() == Some("exit") {
        warn!(export, %message, "Guest exited during call");
    } else {
        error!(export, %message, trap_code = ?code, "Guest trapped");
    }

    RuntimeError::RuntimeTrap {
        message,
        code,
        cause: Some(cause(error)),
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = error.to_string();
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));
    (message, code)
}
