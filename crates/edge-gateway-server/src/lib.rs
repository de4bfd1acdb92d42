//! HTTP server for edge-gateway.
//!
//! This crate exposes endpoints over HTTP. It handles:
//!
//! - Invocation routing (`/functions/:endpoint_id[/*path]`)
//! - Request/response conversion around the invoker
//! - The admin API for endpoints and deploys
//! - Health and readiness checks
//!
//! # Quick Start
//!
//! ```ignore
//! use edge_gateway_server::{GatewayServer, ServerConfig};
//! use edge_gateway_common::RuntimeConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = GatewayServer::new(&RuntimeConfig::default(), ServerConfig::default())?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use router::{AdminRouterConfig, RouterLimits};
pub use server::{GatewayServer, ServerConfig, TestHandle};
pub use state::AppState;
