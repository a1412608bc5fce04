//! Lifecycle tests for the `Pandoc` facade over a scripted backend.
//!
//! The stub module copies `args|input` to `out` and reacts to a few magic
//! inputs:
//! - `trap`: the entry point traps
//! - `fail`: writes partial output and exits with status 2
//! - `binary`: writes bytes that are not UTF-8
//! - `slow`: sleeps before answering

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use pandoc_unwasm_common::{InitStage, RuntimeConfig, RuntimeError};
use pandoc_unwasm_converter::{ConversionOptions, LifecycleState, Pandoc, build_args};
use pandoc_unwasm_core::{GuestEnvironment, ImageLoader, LogLevel, ModuleImage, ModuleInstance};

const MEMORY: usize = 65_536;

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    instances: AtomicUsize,
    ctors: AtomicUsize,
    inits: AtomicUsize,
    mains: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct Script {
    load_delay: Option<Duration>,
    main_delay: Option<Duration>,
    fail_init: bool,
}

struct StubLoader {
    counters: Arc<Counters>,
    script: Script,
}

#[async_trait]
impl ImageLoader for StubLoader {
    async fn load(&self) -> Result<Arc<dyn ModuleImage>, RuntimeError> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.load_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(StubImage {
            counters: self.counters.clone(),
            script: self.script.clone(),
        }))
    }
}

struct StubImage {
    counters: Arc<Counters>,
    script: Script,
}

#[async_trait]
impl ModuleImage for StubImage {
    async fn instantiate(
        &self,
        environment: GuestEnvironment,
    ) -> Result<Box<dyn ModuleInstance>, RuntimeError> {
        self.counters.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubInstance {
            counters: self.counters.clone(),
            script: self.script.clone(),
            environment,
            memory: vec![0; MEMORY],
            next: 8,
        }))
    }
}

struct StubInstance {
    counters: Arc<Counters>,
    script: Script,
    environment: GuestEnvironment,
    memory: Vec<u8>,
    next: u32,
}

#[async_trait]
impl ModuleInstance for StubInstance {
    async fn run_constructors(&mut self) -> Result<(), RuntimeError> {
        self.counters.ctors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn init_runtime(&mut self, _: u32, _: u32) -> Result<(), RuntimeError> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_init {
            return Err(RuntimeError::trap("hs_init failed"));
        }
        Ok(())
    }

    async fn allocate(&mut self, size: u32) -> Result<u32, RuntimeError> {
        let offset = self.next;
        if (offset + size) as usize > self.memory.len() {
            return Ok(0);
        }
        self.next += size;
        Ok(offset)
    }

    async fn deallocate(&mut self, _: u32) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn run_main(&mut self, ptr: u32, len: u32) -> Result<i32, RuntimeError> {
        self.counters.mains.fetch_add(1, Ordering::SeqCst);
        let running = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let args = String::from_utf8(self.read_memory(ptr, len)?).unwrap();
        let input = String::from_utf8(self.environment.files.input.contents()).unwrap();
        let output = &self.environment.files.output;

        if let Some(delay) = self.script.main_delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = match input.as_str() {
            "trap" => Err(RuntimeError::trap("wasm trap: unreachable")),
            "fail" => {
                output.replace(b"partial");
                self.environment.log.push(LogLevel::Warn, "unknown reader");
                Ok(2)
            }
            "binary" => {
                output.replace(&[0xff, 0xfe, 0x41]);
                Ok(0)
            }
            "slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(0)
            }
            _ => {
                output.replace(format!("{args}|{input}").as_bytes());
                self.environment.log.push(LogLevel::Info, "converted");
                Ok(0)
            }
        };

        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        let at = offset as usize;
        self.memory[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        Ok(self.memory[offset as usize..(offset + len) as usize].to_vec())
    }

    fn memory_size(&self) -> u64 {
        MEMORY as u64
    }

    fn memory_limit(&self) -> u64 {
        MEMORY as u64
    }
}

fn converter_with(config: RuntimeConfig, script: Script) -> (Pandoc, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let loader = StubLoader {
        counters: counters.clone(),
        script,
    };
    let pandoc = Pandoc::with_loader(config, Arc::new(loader)).unwrap();
    (pandoc, counters)
}

fn converter(script: Script) -> (Pandoc, Arc<Counters>) {
    converter_with(RuntimeConfig::default(), script)
}

fn md_to_html() -> ConversionOptions {
    ConversionOptions::new("markdown", "html")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_bootstrap_once() {
    let (pandoc, counters) = converter(Script {
        load_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let pandoc = Arc::new(pandoc);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pandoc = pandoc.clone();
            tokio::spawn(async move { pandoc.convert(&format!("doc {i}"), &md_to_html()).await })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output, format!("-f markdown -t html|doc {i}"));
    }

    assert_eq!(Counters::get(&counters.loads), 1);
    assert_eq!(Counters::get(&counters.instances), 1);
    assert_eq!(Counters::get(&counters.ctors), 1);
    assert_eq!(Counters::get(&counters.inits), 1);
    assert_eq!(Counters::get(&counters.mains), 8);
    assert_eq!(pandoc.state().await, LifecycleState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_share_one_failure() {
    let (pandoc, counters) = converter(Script {
        load_delay: Some(Duration::from_millis(50)),
        fail_init: true,
        ..Default::default()
    });
    let pandoc = Arc::new(pandoc);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pandoc = pandoc.clone();
            tokio::spawn(async move { pandoc.convert(&format!("doc {i}"), &md_to_html()).await })
        })
        .collect();

    let mut errors = Vec::new();
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Initialization {
                stage: InitStage::RuntimeInit,
                ..
            }
        ));
        errors.push(err.to_string());
    }
    errors.dedup();

    assert_eq!(errors.len(), 1);
    assert_eq!(Counters::get(&counters.loads), 1);
    assert_eq!(Counters::get(&counters.instances), 1);
    assert_eq!(Counters::get(&counters.inits), 1);
    assert_eq!(Counters::get(&counters.mains), 0);
    assert_eq!(pandoc.state().await, LifecycleState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_never_overlap() {
    let (pandoc, counters) = converter(Script {
        main_delay: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    let pandoc = Arc::new(pandoc);

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let pandoc = pandoc.clone();
            tokio::spawn(async move { pandoc.convert(&format!("{i}"), &md_to_html()).await })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        // Each caller reads its own output, never a neighbour's.
        assert!(handle.await.unwrap().unwrap().ends_with(&format!("|{i}")));
    }

    assert_eq!(Counters::get(&counters.max_in_flight), 1);
}

#[tokio::test]
async fn test_arguments_are_deterministic() {
    let (pandoc, _) = converter(Script::default());
    let options = md_to_html()
        .standalone(true)
        .option("toc-depth", 2)
        .filter("f1")
        .metadata("title", "x");

    let first = pandoc.convert("body", &options).await.unwrap();
    let second = pandoc.convert("body", &options).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, format!("{}|body", build_args(&options).unwrap()));
    assert_eq!(
        first,
        "-f markdown -t html --standalone --toc-depth 2 --filter f1 --metadata title:x|body"
    );
}

#[tokio::test]
async fn test_multibyte_text_round_trips() {
    let (pandoc, _) = converter(Script::default());
    let input = "Grüße, 世界 🎉\n";

    let output = pandoc.convert(input, &md_to_html()).await.unwrap();

    assert_eq!(output, format!("-f markdown -t html|{input}"));
}

#[tokio::test]
async fn test_result_carries_console_lines_of_that_call_only() {
    let (pandoc, _) = converter(Script::default());

    pandoc.convert("first", &md_to_html()).await.unwrap();
    let result = pandoc.convert_detailed("second", &md_to_html()).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.log, ["converted"]);
}

#[tokio::test]
async fn test_trap_poisons_instance() {
    let (pandoc, counters) = converter(Script::default());

    let err = pandoc.convert("trap", &md_to_html()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::RuntimeTrap { .. }));
    assert_eq!(pandoc.state().await, LifecycleState::Failed);

    let again = pandoc.convert("hello", &md_to_html()).await.unwrap_err();
    assert_eq!(again.to_string(), err.to_string());
    assert_eq!(Counters::get(&counters.mains), 1);
}

#[tokio::test]
async fn test_init_failure_is_terminal() {
    let (pandoc, counters) = converter(Script {
        fail_init: true,
        ..Default::default()
    });

    let err = pandoc.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Initialization {
            stage: InitStage::RuntimeInit,
            ..
        }
    ));

    let again = pandoc.convert("hello", &md_to_html()).await.unwrap_err();
    assert!(matches!(again, RuntimeError::Initialization { .. }));
    assert_eq!(Counters::get(&counters.loads), 1);
    assert_eq!(Counters::get(&counters.inits), 1);
    assert_eq!(Counters::get(&counters.mains), 0);
}

#[tokio::test]
async fn test_out_of_memory_keeps_instance_usable() {
    let (pandoc, _) = converter(Script::default());
    pandoc.initialize().await.unwrap();
    let baseline = pandoc.allocation_count().await.unwrap();

    let huge = md_to_html().option("title", "x".repeat(MEMORY + 1));
    let err = pandoc.convert("hello", &huge).await.unwrap_err();
    assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
    assert_eq!(pandoc.state().await, LifecycleState::Ready);

    assert_eq!(
        pandoc.convert("hello", &md_to_html()).await.unwrap(),
        "-f markdown -t html|hello"
    );
    assert_eq!(pandoc.allocation_count().await, Some(baseline));
}

#[tokio::test]
async fn test_nonzero_exit_is_returned() {
    let (pandoc, _) = converter(Script::default());

    let result = pandoc.convert_detailed("fail", &md_to_html()).await.unwrap();

    assert_eq!(result.exit_code, 2);
    assert!(!result.is_success());
    assert_eq!(result.output, "partial");
    assert_eq!(result.log, ["unknown reader"]);
    assert_eq!(pandoc.convert("fail", &md_to_html()).await.unwrap(), "partial");
    assert_eq!(pandoc.state().await, LifecycleState::Ready);
}

#[tokio::test]
async fn test_invalid_output_is_decode_error() {
    let (pandoc, _) = converter(Script::default());

    let err = pandoc.convert("binary", &md_to_html()).await.unwrap_err();

    assert!(matches!(err, RuntimeError::Decode { .. }));
    assert!(!err.is_poisoning());
    assert!(pandoc.convert("ok", &md_to_html()).await.is_ok());
}

#[tokio::test]
async fn test_unrepresentable_options_fail_before_calling() {
    let (pandoc, counters) = converter(Script::default());
    let nested = md_to_html().option("bad", serde_json::json!({ "k": 1 }));

    let err = pandoc.convert("hello", &nested).await.unwrap_err();

    assert!(matches!(err, RuntimeError::Conversion { .. }));
    assert_eq!(Counters::get(&counters.mains), 0);
    assert_eq!(pandoc.state().await, LifecycleState::Ready);
}

#[tokio::test]
async fn test_call_timeout_poisons_instance() {
    let mut config = RuntimeConfig::default();
    config.execution.call_timeout_ms = Some(50);
    let (pandoc, counters) = converter_with(config, Script::default());

    let err = pandoc.convert("slow", &md_to_html()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ExecutionTimeout { duration_ms: 50 }));

    let again = pandoc.convert("hello", &md_to_html()).await.unwrap_err();
    assert!(matches!(again, RuntimeError::ExecutionTimeout { .. }));
    assert_eq!(Counters::get(&counters.mains), 1);
}

#[tokio::test]
async fn test_abandoned_call_is_detected() {
    let (pandoc, counters) = converter(Script::default());
    pandoc.initialize().await.unwrap();

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        pandoc.convert("slow", &md_to_html()),
    )
    .await;
    assert!(dropped.is_err());

    let err = pandoc.convert("hello", &md_to_html()).await.unwrap_err();
    match err {
        RuntimeError::RuntimeTrap { code, .. } => assert_eq!(code.as_deref(), Some("abandoned")),
        other => panic!("expected abandoned trap, got {other}"),
    }
    assert_eq!(pandoc.state().await, LifecycleState::Failed);
    assert_eq!(Counters::get(&counters.mains), 1);
}

#[tokio::test]
async fn test_abandoned_bootstrap_is_detected() {
    let (pandoc, _) = converter(Script {
        load_delay: Some(Duration::from_millis(500)),
        ..Default::default()
    });

    let dropped = tokio::time::timeout(Duration::from_millis(50), pandoc.initialize()).await;
    assert!(dropped.is_err());
    assert_eq!(pandoc.state().await, LifecycleState::Bootstrapping);

    let err = pandoc.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Initialization {
            stage: InitStage::Abandoned,
            ..
        }
    ));
}

#[tokio::test]
async fn test_bootstrap_timeout() {
    let mut config = RuntimeConfig::default();
    config.execution.bootstrap_timeout_ms = Some(20);
    let (pandoc, _) = converter_with(
        config,
        Script {
            load_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );

    let err = pandoc.convert("hello", &md_to_html()).await.unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::Initialization {
            stage: InitStage::Abandoned,
            ..
        }
    ));
    assert_eq!(pandoc.state().await, LifecycleState::Failed);
}

#[tokio::test]
async fn test_dispose() {
    let (pandoc, _) = converter(Script::default());
    pandoc.convert("hello", &md_to_html()).await.unwrap();

    pandoc.dispose().await;
    pandoc.dispose().await;

    assert_eq!(pandoc.state().await, LifecycleState::Disposed);
    assert!(matches!(
        pandoc.convert("hello", &md_to_html()).await,
        Err(RuntimeError::Disposed)
    ));
    assert_eq!(pandoc.allocation_count().await, None);
}

#[test]
fn test_info_does_not_load() {
    let (pandoc, counters) = converter(Script::default());

    assert_eq!(pandoc.version(), "3.1.9");
    assert!(pandoc.input_formats().contains(&"markdown"));
    assert!(pandoc.output_formats().contains(&"html"));
    assert_eq!(pandoc.info().version, pandoc.version());

    assert_eq!(Counters::get(&counters.loads), 0);
    assert_eq!(tokio_test::block_on(pandoc.state()), LifecycleState::Uninitialized);
}
