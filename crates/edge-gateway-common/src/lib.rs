//! Common types, errors, and utilities for edge-gateway.
//!
//! This crate provides shared functionality used across the edge-gateway workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings and the TOML config file
//! - Identifier newtypes and the host/guest wire contract

pub mod config;
pub mod config_file;
pub mod error;
pub mod ids;
pub mod wire;

pub use config::{CacheConfig, EngineConfig, ExecutionConfig, GuestConfig, RuntimeConfig};
pub use config_file::{AdminConfig, ConfigFile, ConfigFileError, EndpointEntry, ServerConfigFile};
pub use error::{ExecutionError, GatewayError, ProtocolError};
pub use ids::{DeployId, EndpointId, InvocationId};
pub use wire::{HeaderMap, HeaderValueList, RequestRecord, ResponseRecord, Runtime};
