//! Host function registration for Wasmtime linkers.

use edge_gateway_common::GatewayError;
use edge_gateway_core::store::WorkerContext;
use tracing::warn;
use wasmtime::{Caller, Extern, Linker};

use crate::logging::{LoggingHost, level_from_i32};

/// Register every gateway host function.
///
/// Currently this is `env::log`. The signature matches what
/// [`edge_gateway_core::WasmSandbox::with_host_functions`] expects.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<WorkerContext>) -> Result<(), GatewayError> {
    register_logging(linker)?;
    Ok(())
}

/// Register `env::log(level: i32, ptr: i32, len: i32)`.
///
/// The message is `len` bytes of UTF-8 at `ptr` in the guest's exported
/// `memory`. Calls with an out-of-range slice are dropped with a warning
/// rather than trapping the guest. Logging past the invocation's budget traps
/// with [`edge_gateway_common::ExecutionError::ResourceExhausted`].
pub fn register_logging(linker: &mut Linker<WorkerContext>) -> Result<(), GatewayError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, WorkerContext>, level: i32, ptr: i32, len: i32| {
                let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
                    warn!(ptr, len, "Guest log call with negative pointer or length");
                    return Ok(());
                };

                let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory)
                else {
                    warn!("Guest log call without an exported memory");
                    return Ok(());
                };

                let message = {
                    let data = memory.data(&caller);
                    let Some(bytes) = start
                        .checked_add(len)
                        .and_then(|end| data.get(start..end))
                    else {
                        warn!(
                            start,
                            len,
                            memory_size = data.len(),
                            "Guest log call out of bounds"
                        );
                        return Ok(());
                    };
                    String::from_utf8_lossy(bytes).into_owned()
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message)
                    .map_err(wasmtime::Error::new)
            },
        )
        .map_err(|e| {
            GatewayError::invalid_config(format!("Failed to register env.log: {e}"))
        })?;

    Ok(())
}
