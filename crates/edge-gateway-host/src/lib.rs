//! Host functions for edge-gateway guests.
//!
//! Guests get WASI preview1 from the sandbox itself. This crate adds the
//! gateway-specific imports on top:
//!
//! - [`logging`]: `env.log(level, ptr, len)`, structured logging from guest code
//!
//! Register them with [`linker::register_all`], typically through
//! [`edge_gateway_core::WasmSandbox::with_host_functions`].

pub mod linker;
pub mod logging;

pub use linker::{register_all, register_logging};
pub use logging::LoggingHost;
