//! Per-invocation execution context and store management.
//!
//! This module provides:
//! - [`WorkerContext`]: Per-invocation state accessible from host functions
//! - [`GuestLimits`]: Resource limiter that remembers when a ceiling was hit
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Performance metrics for each execution

use std::time::{Duration, Instant};

use wasmtime::{ResourceLimiter, Store, StoreLimits, StoreLimitsBuilder, Trap, UpdateDeadline};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use edge_gateway_common::{ExecutionConfig, ExecutionError, InvocationId};

/// Per-invocation execution context.
///
/// One `WorkerContext` is built for every execution and dropped together with
/// its [`Store`] when the execution ends, so nothing a guest does can leak
/// into the next invocation.
///
/// Host functions can access this context through the [`wasmtime::Caller`] API.
pub struct WorkerContext {
    /// WASI preview1 context (stdio pipes, argv, environment).
    wasi: WasiP1Ctx,

    /// Memory and table ceilings.
    pub limits: GuestLimits,

    /// Invocation this context belongs to.
    pub invocation_id: InvocationId,

    /// Logs collected from `env.log` host calls, bounded by `max_log_bytes`.
    logs: Vec<LogEntry>,
    log_bytes: usize,
    max_log_bytes: usize,
    logs_exhausted: bool,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during execution.
    pub fuel_consumed: u64,

    /// Largest linear memory size requested, in bytes.
    pub memory_peak_bytes: usize,
}

/// Resource limiter for one execution.
///
/// Wraps Wasmtime's [`StoreLimits`] and records whether a growth request was
/// refused, so a trap that follows a failed `memory.grow` can be reported as
/// memory exhaustion rather than a generic guest fault.
pub struct GuestLimits {
    inner: StoreLimits,
    memory_exhausted: bool,
    memory_peak_bytes: usize,
}

impl GuestLimits {
    /// Create a limiter with the given linear memory ceiling.
    pub fn new(max_memory_bytes: usize) -> Self {
        let inner = StoreLimitsBuilder::new()
            .memory_size(max_memory_bytes)
            .build();

        Self {
            inner,
            memory_exhausted: false,
            memory_peak_bytes: 0,
        }
    }

    /// Returns `true` once any growth request has been refused.
    pub fn memory_exhausted(&self) -> bool {
        self.memory_exhausted
    }

    /// Largest memory size requested so far.
    pub fn memory_peak_bytes(&self) -> usize {
        self.memory_peak_bytes
    }
}

impl ResourceLimiter for GuestLimits {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        self.memory_peak_bytes = self.memory_peak_bytes.max(desired);
        let allowed = self.inner.memory_growing(current, desired, maximum)?;
        if !allowed {
            self.memory_exhausted = true;
        }
        Ok(allowed)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let allowed = self.inner.table_growing(current, desired, maximum)?;
        if !allowed {
            self.memory_exhausted = true;
        }
        Ok(allowed)
    }
}

impl WorkerContext {
    /// Create a new worker context around a prepared WASI context.
    ///
    /// `max_log_bytes` bounds the total size of messages kept from `env.log`.
    pub fn new(
        invocation_id: InvocationId,
        wasi: WasiP1Ctx,
        max_memory_bytes: usize,
        max_log_bytes: usize,
    ) -> Self {
        Self {
            wasi,
            limits: GuestLimits::new(max_memory_bytes),
            invocation_id,
            logs: Vec::new(),
            log_bytes: 0,
            max_log_bytes,
            logs_exhausted: false,
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Access the WASI context; used by the preview1 linker bindings.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Add a log entry.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::ResourceExhausted`] once the stored messages
    /// would exceed the log budget; the entry is not kept.
    pub fn log(&mut self, level: LogLevel, message: String) -> Result<(), ExecutionError> {
        let total = self.log_bytes.saturating_add(message.len());
        if self.logs_exhausted || total > self.max_log_bytes {
            self.logs_exhausted = true;
            return Err(ExecutionError::resource_exhausted("logs"));
        }

        self.log_bytes = total;
        self.logs.push(LogEntry { level, message });
        Ok(())
    }

    /// Logs kept so far, oldest first.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Returns `true` once a guest has run past its log budget.
    pub fn logs_exhausted(&self) -> bool {
        self.logs_exhausted
    }

    /// Finalize metrics after execution.
    pub fn finalize_metrics(&mut self) {
        self.metrics.memory_peak_bytes = self.limits.memory_peak_bytes();
    }
}

/// Slack past the execution timeout before a running guest traps on its own.
///
/// The caller's timer normally fires first and aborts the execution; the
/// in-store deadline only matters for an execution nobody is waiting on.
pub const HARD_DEADLINE_GRACE: Duration = Duration::from_millis(100);

/// Create a new Wasmtime store for one execution.
///
/// The store gets the fuel budget (or an effectively unlimited one when
/// metering is off) and the memory limiter. When the engine uses epochs the
/// guest yields to the async executor on every tick, and traps with
/// [`Trap::Interrupt`] on the first tick after `timeout + HARD_DEADLINE_GRACE`.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    context: WorkerContext,
) -> Result<Store<WorkerContext>, ExecutionError> {
    let mut store = Store::new(engine.inner(), context);

    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| ExecutionError::host(format!("Failed to set fuel: {e}")))?;

    store.limiter(|ctx| &mut ctx.limits);

    if engine.is_epoch_enabled() {
        let hard_deadline = Instant::now() + config.timeout() + HARD_DEADLINE_GRACE;
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| {
            if Instant::now() >= hard_deadline {
                Err(Trap::Interrupt.into())
            } else {
                Ok(UpdateDeadline::Yield(1))
            }
        });
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<WorkerContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<WorkerContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
