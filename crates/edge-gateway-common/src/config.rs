//! Configuration structures for the edge-gateway.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs)
//! - [`ExecutionConfig`]: Per-invocation limits (timeout, memory, fuel, output)
//! - [`CacheConfig`]: Compiled module retention and compile fast-fail policy
//! - [`GuestConfig`]: Shared guest runtime artifacts (JS interpreter)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// Passed by value into the gateway at construction time; nothing in the
/// core reads process-wide mutable configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-invocation execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Module cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Guest runtime configuration.
    #[serde(default)]
    pub guests: GuestConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including memory allocation strategy and interruption.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instances,
    /// reducing instantiation time from ~1ms to ~10µs.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// Running guests yield back to the async executor on every epoch tick,
    /// which is what lets a wall-clock timeout fire on a spinning guest.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-invocation execution configuration.
///
/// These settings bound every single sandboxed execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Execution timeout in milliseconds.
    ///
    /// This is a hard wall-clock limit; the sandbox is torn down when it fires.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Enable fuel metering.
    ///
    /// When enabled, CPU usage is tracked and limited by the `max_fuel` setting.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Maximum fuel (CPU instructions) per invocation.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Capacity of the captured stdout buffer in bytes.
    #[serde(default = "defaults::max_output_bytes")]
    pub max_output_bytes: usize,

    /// Capacity of the captured stderr buffer in bytes.
    #[serde(default = "defaults::max_diagnostic_bytes")]
    pub max_diagnostic_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
            max_fuel: defaults::max_fuel(),
            max_output_bytes: defaults::max_output_bytes(),
            max_diagnostic_bytes: defaults::max_diagnostic_bytes(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the memory ceiling in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Module cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum number of compiled modules retained; `0` means unbounded.
    ///
    /// When the cap is exceeded the least recently used module is evicted.
    #[serde(default = "defaults::max_modules")]
    pub max_modules: usize,

    /// Consecutive compile failures after which a deploy is marked unhealthy.
    ///
    /// `0` disables the fast-fail policy.
    #[serde(default = "defaults::compile_failure_threshold")]
    pub compile_failure_threshold: u32,

    /// How long an unhealthy deploy fails fast before compilation is retried.
    #[serde(default = "defaults::compile_cooldown_secs")]
    pub compile_cooldown_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_modules: defaults::max_modules(),
            compile_failure_threshold: defaults::compile_failure_threshold(),
            compile_cooldown_secs: defaults::compile_cooldown_secs(),
        }
    }
}

impl CacheConfig {
    /// Get the compile cool-down as a `Duration`.
    pub fn compile_cooldown(&self) -> Duration {
        Duration::from_secs(self.compile_cooldown_secs)
    }
}

/// Guest runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Path to the WASI JavaScript interpreter module used by `js` deploys.
    ///
    /// `js` deploys fail to compile when this is unset.
    #[serde(default)]
    pub js_interpreter: Option<String>,
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn timeout_ms() -> u64 {
        5_000
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        10_000_000_000
    }

    pub const fn max_output_bytes() -> usize {
        4 * 1024 * 1024
    }

    pub const fn max_diagnostic_bytes() -> usize {
        256 * 1024
    }

    pub const fn max_modules() -> usize {
        256
    }

    pub const fn compile_failure_threshold() -> u32 {
        3
    }

    pub const fn compile_cooldown_secs() -> u64 {
        30
    }
}
