//! Wasmtime-backed [`Sandbox`] implementation.
//!
//! [`WasmSandbox`] handles the complete lifecycle of one guest execution:
//!
//! 1. Build a fresh WASI context: request JSON on stdin, bounded in-memory
//!    stdout/stderr, runtime-specific argv, the endpoint's environment
//! 2. Create a new store with fuel, memory limiter and epoch yielding
//! 3. Instantiate the shared compiled module and call `_start`
//! 4. Map the outcome (exit status, trap, exhaustion, timeout) and hand back
//!    the captured streams
//!
//! The execution itself runs on its own tokio task. A timeout, or dropping the
//! `run` future, aborts that task, which drops the store and everything the
//! guest allocated. The store's own epoch deadline traps the guest shortly
//! after the timeout in case the task is still being polled.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use wasmtime::{Linker, Module, Store, Trap};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};

use edge_gateway_common::{
    ExecutionConfig, ExecutionError, GatewayError, RequestRecord, Runtime,
};

use crate::module::CompiledModule;
use crate::sandbox::{DeployArtifact, GuestModule, RawOutput, Sandbox};
use crate::store::{WorkerContext, calculate_fuel_consumed, create_store, get_remaining_fuel};
use crate::WasmEngine;

/// Guest entry point exported by WASI command modules.
const ENTRY_POINT: &str = "_start";

/// Longest guest diagnostic carried in a [`ExecutionError::Trap`].
const MAX_GUEST_MESSAGE_LEN: usize = 1024;

/// Runs compiled guests inside fresh Wasmtime stores.
///
/// # Thread Safety
///
/// `WasmSandbox` is thread-safe and meant to be shared behind an `Arc`. The
/// engine, linker and interpreter module are immutable after construction;
/// each execution owns its [`Store`].
pub struct WasmSandbox {
    engine: WasmEngine,
    linker: Arc<Linker<WorkerContext>>,
    js_interpreter: Option<Module>,
}

impl WasmSandbox {
    /// Create a sandbox exposing only WASI preview1 to guests.
    ///
    /// # Errors
    ///
    /// Returns an error if the WASI imports cannot be linked.
    pub fn new(engine: WasmEngine) -> Result<Self, GatewayError> {
        Self::with_host_functions(engine, |_| Ok(()))
    }

    /// Create a sandbox with WASI preview1 plus extra host functions.
    ///
    /// `register` receives the linker after WASI has been added to it.
    ///
    /// # Errors
    ///
    /// Returns an error if WASI or the extra host functions cannot be linked.
    pub fn with_host_functions<F>(engine: WasmEngine, register: F) -> Result<Self, GatewayError>
    where
        F: FnOnce(&mut Linker<WorkerContext>) -> Result<(), GatewayError>,
    {
        let mut linker = Linker::new(engine.inner());

        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, WorkerContext::wasi_mut)
            .map_err(|e| GatewayError::invalid_config(format!("Failed to link WASI: {e}")))?;

        register(&mut linker)?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            js_interpreter: None,
        })
    }

    /// Compile the shared JavaScript interpreter used by `js` deploys.
    ///
    /// # Errors
    ///
    /// Returns an error if the interpreter is not a valid module.
    pub fn with_js_interpreter(mut self, bytes: &[u8]) -> Result<Self, GatewayError> {
        let start = Instant::now();
        let module = Module::new(self.engine.inner(), bytes).map_err(|e| {
            GatewayError::invalid_config(format!("Failed to compile JS interpreter: {e}"))
        })?;

        info!(
            duration_ms = start.elapsed().as_millis(),
            "JavaScript interpreter compiled"
        );

        self.js_interpreter = Some(module);
        Ok(self)
    }

    /// Get the engine this sandbox compiles and runs with.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Check whether `js` deploys can be compiled.
    pub fn has_js_interpreter(&self) -> bool {
        self.js_interpreter.is_some()
    }

    fn build_context(
        request: &RequestRecord,
        module: &CompiledModule,
        limits: &ExecutionConfig,
        stdout: &MemoryOutputPipe,
        stderr: &MemoryOutputPipe,
    ) -> Result<WorkerContext, ExecutionError> {
        let stdin = request
            .to_json()
            .map_err(|e| ExecutionError::host(format!("Failed to encode request: {e}")))?;

        let args = guest_args(module, request);

        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(MemoryInputPipe::new(stdin))
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .args(args.as_slice());

        for (key, value) in &request.env {
            builder.env(key, value);
        }

        Ok(WorkerContext::new(
            request.invocation_id.clone(),
            builder.build_p1(),
            limits.max_memory_bytes(),
            limits.max_diagnostic_bytes,
        ))
    }
}

#[async_trait]
impl Sandbox for WasmSandbox {
    type Module = CompiledModule;

    fn compile(&self, artifact: &DeployArtifact) -> Result<CompiledModule, GatewayError> {
        let module = match artifact.runtime {
            Runtime::Go => CompiledModule::from_bytes(
                self.engine.inner(),
                artifact.deploy_id.clone(),
                &artifact.bytes,
            )?,
            Runtime::Js => {
                let interpreter = self.js_interpreter.clone().ok_or_else(|| {
                    GatewayError::compile_failed("No JavaScript interpreter is configured")
                })?;
                CompiledModule::script(interpreter, artifact.deploy_id.clone(), &artifact.bytes)?
            }
        };

        // Surface unknown imports now rather than on every invocation
        self.linker
            .instantiate_pre(module.wasm_module())
            .map_err(|e| GatewayError::compile_failed(format!("Unresolvable imports: {e}")))?;

        Ok(module)
    }

    #[instrument(
        skip(self, module, request, limits),
        fields(
            invocation_id = %request.invocation_id,
            deploy_id = %request.active_deploy_id,
            runtime = %request.runtime,
        )
    )]
    async fn run(
        &self,
        module: Arc<CompiledModule>,
        request: &RequestRecord,
        limits: &ExecutionConfig,
    ) -> Result<RawOutput, ExecutionError> {
        if module.deploy_id() != &request.active_deploy_id {
            return Err(ExecutionError::host(format!(
                "Module for deploy {} cannot serve deploy {}",
                module.deploy_id(),
                request.active_deploy_id
            )));
        }

        let start = Instant::now();
        // One byte of headroom tells "exactly at the ceiling" from "past it"
        let stdout = MemoryOutputPipe::new(limits.max_output_bytes.saturating_add(1));
        let stderr = MemoryOutputPipe::new(limits.max_diagnostic_bytes);

        let context = Self::build_context(request, &module, limits, &stdout, &stderr)?;
        let store = create_store(&self.engine, limits, context)?;
        let linker = Arc::clone(&self.linker);

        let mut task = AbortOnDrop(tokio::spawn(execute(linker, module, store)));

        let finished = match tokio::time::timeout(limits.timeout(), &mut task.0).await {
            Ok(Ok(finished)) => finished,
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "Execution task panicked"
                } else {
                    "Execution task was cancelled"
                };
                warn!(error = %join_error, "{reason}");
                return Err(ExecutionError::host(reason));
            }
            Err(_) => {
                task.0.abort();
                warn!(
                    timeout_ms = limits.timeout_ms,
                    "Execution timed out, sandbox torn down"
                );
                return Err(ExecutionError::Timeout {
                    duration_ms: limits.timeout_ms,
                });
            }
        };

        let stderr = stderr.contents();
        log_guest_stderr(&stderr);

        let duration = start.elapsed();

        if let Err(failure) = finished.outcome {
            let error = match failure.classify(finished.memory_exhausted, last_line(&stderr)) {
                ExecutionError::Timeout { .. } => ExecutionError::Timeout {
                    duration_ms: limits.timeout_ms,
                },
                other => other,
            };
            warn!(
                kind = error.kind(),
                error = %error,
                duration_ms = duration.as_millis(),
                fuel_consumed = finished.fuel_consumed,
                "Execution failed"
            );
            return Err(error);
        }

        let stdout = stdout.contents();

        // Anything past the ceiling means writes were cut short, even if the
        // guest ignored the errno
        if stdout.len() > limits.max_output_bytes {
            warn!(
                stdout_bytes = stdout.len(),
                max_output_bytes = limits.max_output_bytes,
                "Guest output hit the ceiling"
            );
            return Err(ExecutionError::resource_exhausted("output"));
        }

        debug!(
            duration_ms = duration.as_millis(),
            fuel_consumed = finished.fuel_consumed,
            memory_peak_bytes = finished.memory_peak_bytes,
            guest_logs = finished.guest_logs,
            stdout_bytes = stdout.len(),
            "Execution completed"
        );

        Ok(RawOutput {
            stdout,
            stderr,
            duration,
            fuel_consumed: finished.fuel_consumed,
        })
    }
}

/// Argument vector for the guest, per runtime ABI.
fn guest_args(module: &CompiledModule, request: &RequestRecord) -> Vec<String> {
    match module.script_source() {
        Some(source) => vec![String::new(), "-e".to_string(), source.to_string()],
        None => vec![request.active_deploy_id.to_string()],
    }
}

/// Aborts the execution task when the caller stops waiting for it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What happened inside the execution task.
struct Finished {
    outcome: Result<(), Failure>,
    memory_exhausted: bool,
    memory_peak_bytes: usize,
    guest_logs: usize,
    fuel_consumed: u64,
}

enum Failure {
    Instantiate(wasmtime::Error),
    MissingEntry,
    Run(wasmtime::Error),
}

async fn execute(
    linker: Arc<Linker<WorkerContext>>,
    module: Arc<CompiledModule>,
    mut store: Store<WorkerContext>,
) -> Finished {
    let initial_fuel = get_remaining_fuel(&store).unwrap_or(0);

    let outcome = run_entry_point(&linker, &module, &mut store).await;

    let fuel_consumed = calculate_fuel_consumed(initial_fuel, &store);
    let ctx = store.data_mut();
    ctx.metrics.fuel_consumed = fuel_consumed;
    ctx.finalize_metrics();

    Finished {
        outcome,
        memory_exhausted: ctx.limits.memory_exhausted(),
        memory_peak_bytes: ctx.metrics.memory_peak_bytes,
        guest_logs: ctx.logs().len(),
        fuel_consumed,
    }
}

async fn run_entry_point(
    linker: &Linker<WorkerContext>,
    module: &CompiledModule,
    store: &mut Store<WorkerContext>,
) -> Result<(), Failure> {
    let instance = linker
        .instantiate_async(&mut *store, module.wasm_module())
        .await
        .map_err(Failure::Instantiate)?;

    let func = instance
        .get_typed_func::<(), ()>(&mut *store, ENTRY_POINT)
        .map_err(|_| Failure::MissingEntry)?;

    match func.call_async(&mut *store, ()).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
            Some(exit) if exit.0 == 0 => Ok(()),
            _ => Err(Failure::Run(e)),
        },
    }
}

impl Failure {
    fn classify(self, memory_exhausted: bool, guest_message: Option<String>) -> ExecutionError {
        match self {
            Failure::MissingEntry => ExecutionError::Trap {
                message: format!("Entry point '{ENTRY_POINT}' not found"),
                guest_message,
            },
            Failure::Instantiate(_) if memory_exhausted => {
                ExecutionError::resource_exhausted("memory")
            }
            Failure::Instantiate(e) => ExecutionError::Trap {
                message: format!("Instantiation failed: {e}"),
                guest_message,
            },
            Failure::Run(e) => classify_run_error(&e, memory_exhausted, guest_message),
        }
    }
}

fn classify_run_error(
    error: &wasmtime::Error,
    memory_exhausted: bool,
    guest_message: Option<String>,
) -> ExecutionError {
    if let Some(exit) = error.downcast_ref::<wasmtime_wasi::I32Exit>() {
        return ExecutionError::Trap {
            message: format!("Guest exited with status {}", exit.0),
            guest_message,
        };
    }

    // Raised by host functions, e.g. a guest logging past its budget
    if let Some(host_limit) = error.downcast_ref::<ExecutionError>() {
        return host_limit.clone();
    }

    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => return ExecutionError::resource_exhausted("fuel"),
        Some(Trap::Interrupt) => return ExecutionError::Timeout { duration_ms: 0 },
        _ => {}
    }

    if memory_exhausted {
        return ExecutionError::resource_exhausted("memory");
    }

    // MemoryOutputPipe reports overflow as a trap with this text
    if format!("{error:?}").contains("write beyond capacity") {
        return ExecutionError::resource_exhausted("output");
    }

    ExecutionError::Trap {
        message: error.to_string(),
        guest_message,
    }
}

fn log_guest_stderr(stderr: &Bytes) {
    for line in String::from_utf8_lossy(stderr).lines() {
        if !line.trim().is_empty() {
            debug!(guest_log = true, stream = "stderr", "{line}");
        }
    }
}

fn last_line(stderr: &Bytes) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let line = text.lines().rev().find(|line| !line.trim().is_empty())?;
    Some(line.trim_end().chars().take(MAX_GUEST_MESSAGE_LEN).collect())
}

impl std::fmt::Debug for WasmSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSandbox")
            .field("engine", &self.engine)
            .field("js_interpreter", &self.js_interpreter.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_line() {
        assert_eq!(last_line(&Bytes::from_static(b"")), None);
        assert_eq!(
            last_line(&Bytes::from_static(b"first\npanic: boom\n\n")),
            Some("panic: boom".to_string())
        );
        assert_eq!(
            last_line(&Bytes::from_static(b"only line")),
            Some("only line".to_string())
        );
    }

    #[test]
    fn test_last_line_is_truncated() {
        let long = "x".repeat(MAX_GUEST_MESSAGE_LEN * 2);
        let line = last_line(&Bytes::from(long)).unwrap();
        assert_eq!(line.len(), MAX_GUEST_MESSAGE_LEN);
    }

    #[test]
    fn test_classify_exit_code() {
        let err = wasmtime::Error::new(wasmtime_wasi::I32Exit(3));
        let classified = classify_run_error(&err, false, Some("bad input".into()));

        assert_eq!(
            classified,
            ExecutionError::Trap {
                message: "Guest exited with status 3".into(),
                guest_message: Some("bad input".into()),
            }
        );
    }

    #[test]
    fn test_classify_fuel_and_memory() {
        let fuel = wasmtime::Error::new(Trap::OutOfFuel);
        assert_eq!(
            classify_run_error(&fuel, false, None),
            ExecutionError::resource_exhausted("fuel")
        );

        let unreachable = wasmtime::Error::new(Trap::UnreachableCodeReached);
        assert_eq!(
            classify_run_error(&unreachable, true, None),
            ExecutionError::resource_exhausted("memory")
        );
        assert!(matches!(
            classify_run_error(&unreachable, false, None),
            ExecutionError::Trap { .. }
        ));
    }

    #[test]
    fn test_classify_host_function_error() {
        let err = wasmtime::Error::new(ExecutionError::resource_exhausted("logs"));
        assert_eq!(
            classify_run_error(&err, false, None),
            ExecutionError::resource_exhausted("logs")
        );
    }

    #[test]
    fn test_classify_interrupt_is_timeout() {
        let err = wasmtime::Error::new(Trap::Interrupt);
        assert!(matches!(
            classify_run_error(&err, false, None),
            ExecutionError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_abort_on_drop_cancels_task() {
        let held = Arc::new(());
        let in_task = Arc::clone(&held);
        let task = AbortOnDrop(tokio::spawn(async move {
            let _held = in_task;
            std::future::pending::<()>().await;
        }));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&held), 2);

        drop(task);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn test_classify_output_overflow() {
        let err = wasmtime::Error::msg("write beyond capacity of MemoryOutputPipe");
        assert_eq!(
            classify_run_error(&err, false, None),
            ExecutionError::resource_exhausted("output")
        );
    }
}
