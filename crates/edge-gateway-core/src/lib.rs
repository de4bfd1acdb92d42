//! Sandboxed invocation bridge for edge-gateway.
//!
//! This crate turns an HTTP-shaped request into a guest execution and back:
//! - [`WasmEngine`]: Configured Wasmtime engine with pooling allocator and epoch ticker
//! - [`ModuleCache`]: One compiled module per deploy, single-flight compilation
//! - [`WasmSandbox`]: Fresh store per invocation, captured stdio, hard limits
//! - [`decoder`]: Recovers `<body>|<status>` from guest stdout
//! - [`Invoker`]: Resolve → compile → execute → decode
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Invoker                           │
//! │  - EndpointDirectory snapshot (active deploy, env)      │
//! │  - Compile health (fast-fail unhealthy deploys)         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ModuleCache                         │
//! │  (Shared across all requests, one slot per deploy)      │
//! │  - Single-flight compilation                            │
//! │  - LRU cap, explicit eviction                           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Sandbox: Store<WorkerContext> + Instance       │
//! │  (Per-request, isolated)                                │
//! │  - Request JSON on stdin, stdout/stderr captured        │
//! │  - Timeout, memory, fuel and output ceilings            │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//!                  decoder::decode(stdout)
//! ```

pub mod cache;
pub mod decoder;
pub mod directory;
pub mod engine;
pub mod executor;
pub mod invoker;
pub mod module;
pub mod sandbox;
pub mod store;

pub use cache::ModuleCache;
pub use decoder::{DecodedOutput, decode};
pub use directory::{
    Deploy, Endpoint, EndpointDirectory, EndpointSnapshot, InMemoryDirectory, NewEndpoint,
};
pub use engine::WasmEngine;
pub use executor::WasmSandbox;
pub use invoker::{
    InvocationOutcome, InvocationRequest, InvocationStage, Invoker, ResponseOrigin, status_for,
};
pub use module::CompiledModule;
pub use sandbox::{DeployArtifact, GuestModule, RawOutput, Sandbox};
pub use store::{ExecutionMetrics, LogEntry, LogLevel, WorkerContext};
