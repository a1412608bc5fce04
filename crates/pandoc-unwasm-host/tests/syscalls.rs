//! Integration tests for pandoc-unwasm-host.
//!
//! These tests link WAT guests against the real syscall surface:
//! - Reading `in` and writing `out` through the preopened directory
//! - Console capture into the guest log
//! - Path confinement and the read-only input
//! - `proc_exit` surfacing as an exit trap

use pandoc_unwasm_common::{EngineConfig, GuestConfig, MemoryConfig, RuntimeError};
use pandoc_unwasm_core::{
    AllocationScope, CompiledModule, GuestFiles, GuestLog, HostContext, LogLevel, Marshaler,
    ModuleInstance, WasmEngine, WasmtimeInstance,
};
use pandoc_unwasm_host::{EnvironmentBridge, create_instantiator};

/// Common prelude: memory import, bump allocator, no-op runtime exports.
fn guest(imports: &str, body: &str) -> String {
    format!(
        r#"
        (module
            {imports}
            (import "env" "memory" (memory 2))
            (global $next (mut i32) (i32.const 65536))
            (data (i32.const 16) "in")
            (data (i32.const 24) "out")
            (data (i32.const 32) "converted\n")

            (func (export "__wasm_call_ctors"))
            (func (export "hs_init_with_rtsopts") (param i32 i32))
            (func (export "malloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $next))
                (global.set $next (i32.add (local.get $ptr) (local.get $size)))
                (local.get $ptr))

            {body}
        )
    "#
    )
}

/// Copies the argument string and the input file to `out`, then prints a
/// line on stderr. Failures return 100/200/300 plus the errno.
fn echo_guest() -> String {
    guest(
        r#"
        (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "fd_close"
            (func $fd_close (param i32) (result i32)))
        "#,
        r#"
        (func $write_all (param $fd i32) (param $ptr i32) (param $len i32) (result i32)
            (i32.store (i32.const 80) (local.get $ptr))
            (i32.store (i32.const 84) (local.get $len))
            (call $fd_write (local.get $fd) (i32.const 80) (i32.const 1) (i32.const 72)))

        (func (export "wasm_main") (param $ptr i32) (param $len i32) (result i32)
            (local $in i32) (local $out i32) (local $n i32) (local $err i32)

            (local.set $err (call $path_open (i32.const 3) (i32.const 0) (i32.const 16) (i32.const 2)
                (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 64)))
            (if (local.get $err) (then (return (i32.add (i32.const 100) (local.get $err)))))
            (local.set $in (i32.load (i32.const 64)))

            (i32.store (i32.const 80) (i32.const 4096))
            (i32.store (i32.const 84) (i32.const 8192))
            (local.set $err (call $fd_read (local.get $in) (i32.const 80) (i32.const 1) (i32.const 72)))
            (if (local.get $err) (then (return (i32.add (i32.const 200) (local.get $err)))))
            (local.set $n (i32.load (i32.const 72)))
            (drop (call $fd_close (local.get $in)))

            (local.set $err (call $path_open (i32.const 3) (i32.const 0) (i32.const 24) (i32.const 3)
                (i32.const 9) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 64)))
            (if (local.get $err) (then (return (i32.add (i32.const 300) (local.get $err)))))
            (local.set $out (i32.load (i32.const 64)))

            (drop (call $write_all (local.get $out) (local.get $ptr) (local.get $len)))
            (drop (call $write_all (local.get $out) (i32.const 41) (i32.const 1)))
            (drop (call $write_all (local.get $out) (i32.const 4096) (local.get $n)))
            (drop (call $fd_close (local.get $out)))

            (drop (call $write_all (i32.const 2) (i32.const 32) (i32.const 10)))
            (i32.const 0))
        "#,
    )
}

struct Harness {
    instance: WasmtimeInstance,
    files: GuestFiles,
    log: GuestLog,
    marshaler: Marshaler,
}

impl Harness {
    async fn new(wat: &str) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let instantiator = create_instantiator(&engine)?;
        let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
        let memory = MemoryConfig {
            initial_pages: 2,
            maximum_pages: 16,
        };

        let log = GuestLog::new();
        let env = EnvironmentBridge::new(&GuestConfig::default()).build(log.clone(), "syscalls");
        let files = env.files.clone();
        let context = HostContext::new(env, &memory, "syscalls".into());
        let config = GuestConfig::default();
        let instance = instantiator
            .instantiate(&module, context, &memory, &config.exports)
            .await?;

        Ok(Self {
            instance,
            files,
            log,
            marshaler: Marshaler::new(),
        })
    }

    async fn main(&mut self, args: &str) -> Result<i32, RuntimeError> {
        let (ptr, len) = self
            .marshaler
            .write_string(&mut self.instance, args, AllocationScope::Scratch)
            .await?;
        self.instance.run_main(ptr, len).await
    }
}

#[tokio::test]
async fn test_echo_through_virtual_files() {
    let mut harness = Harness::new(&echo_guest()).await.unwrap();
    harness.files.input.replace("# Héllo".as_bytes());

    let code = harness.main("-f markdown -t html").await.unwrap();

    assert_eq!(code, 0);
    assert_eq!(
        String::from_utf8(harness.files.output.contents()).unwrap(),
        "-f markdown -t html\n# Héllo"
    );
    let entries = harness.log.drain();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, LogLevel::Warn);
    assert_eq!(entries[0].message, "converted");
}

#[tokio::test]
async fn test_repeated_calls_reuse_descriptors() {
    let mut harness = Harness::new(&echo_guest()).await.unwrap();

    harness.files.input.replace(b"a much longer first document");
    assert_eq!(harness.main("one").await.unwrap(), 0);

    harness.files.input.replace(b"short");
    assert_eq!(harness.main("two").await.unwrap(), 0);

    // `out` was truncated on open, so nothing of the first call survives.
    assert_eq!(harness.files.output.contents(), b"two\nshort");
    assert_eq!(harness.instance.context().env.fds.len(), 4);
    assert_eq!(harness.log.len(), 2);
}

#[tokio::test]
async fn test_path_confinement() {
    // wasm_main(ptr, len) opens the path it is given for writing and returns the errno.
    let wat = guest(
        r#"
        (import "wasi_snapshot_preview1" "path_open"
            (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
        "#,
        r#"
        (func (export "wasm_main") (param $ptr i32) (param $len i32) (result i32)
            (call $path_open (i32.const 3) (i32.const 0) (local.get $ptr) (local.get $len)
                (i32.const 0) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 64)))
        "#,
    );
    let mut harness = Harness::new(&wat).await.unwrap();

    assert_eq!(harness.main("../etc/passwd").await.unwrap(), 76);
    assert_eq!(harness.main("/tmp/../../x").await.unwrap(), 76);
    assert_eq!(harness.main("in").await.unwrap(), 63);
    assert_eq!(harness.main("missing").await.unwrap(), 44);
    assert_eq!(harness.main("/out").await.unwrap(), 0);
}

#[tokio::test]
async fn test_proc_exit_is_exit_trap() {
    let wat = guest(
        r#"(import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))"#,
        r#"
        (func (export "wasm_main") (param i32 i32) (result i32)
            (call $exit (i32.const 3))
            (i32.const 0))
        "#,
    );
    let mut harness = Harness::new(&wat).await.unwrap();

    match harness.main("").await {
        Err(RuntimeError::RuntimeTrap { code, message, .. }) => {
            assert_eq!(code.as_deref(), Some("exit"));
            assert!(message.contains("status 3"), "{message}");
        }
        other => panic!("expected exit trap, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mismatched_syscall_signature_is_link_error() {
    let wat = guest(
        r#"(import "wasi_snapshot_preview1" "fd_write" (func (param i32) (result i32)))"#,
        r#"(func (export "wasm_main") (param i32 i32) (result i32) (i32.const 0))"#,
    );

    let result = Harness::new(&wat).await;
    assert!(matches!(result, Err(RuntimeError::Link { .. })));
}
