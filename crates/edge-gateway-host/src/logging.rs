//! Guest logging.
//!
//! Messages a guest sends through `env.log` are re-emitted as `tracing`
//! events tagged `guest_log = true`, next to the host's own logs for the same
//! invocation, and kept on its [`WorkerContext`] up to the diagnostic budget.
//! A guest that logs past the budget is stopped.

use edge_gateway_common::ExecutionError;
use edge_gateway_core::store::{LogLevel, WorkerContext};
use tracing::{debug, error, info, warn};

/// Longest message accepted from a guest; longer ones are truncated.
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024;

/// Host side of the guest logging import.
pub struct LoggingHost;

impl LoggingHost {
    /// Record a guest message and emit it through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::ResourceExhausted`] once the invocation has
    /// logged more than its budget; nothing further is emitted.
    pub fn log(
        ctx: &mut WorkerContext,
        level: LogLevel,
        message: &str,
    ) -> Result<(), ExecutionError> {
        if ctx.logs_exhausted() {
            return Err(ExecutionError::resource_exhausted("logs"));
        }

        let message = truncate(message, MAX_MESSAGE_BYTES);
        let invocation_id = ctx.invocation_id.as_str();

        match level {
            LogLevel::Debug => debug!(invocation_id, guest_log = true, "{message}"),
            LogLevel::Info => info!(invocation_id, guest_log = true, "{message}"),
            LogLevel::Warn => warn!(invocation_id, guest_log = true, "{message}"),
            LogLevel::Error => error!(invocation_id, guest_log = true, "{message}"),
        }

        ctx.log(level, message.to_string())
    }
}

/// Map the numeric level used on the wire to a [`LogLevel`].
///
/// `0` debug, `1` info, `2` warn, `3` error; anything else is info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn truncate(message: &str, max: usize) -> &str {
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}
