//! Error types for the edge-gateway.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`GatewayError`]: Top-level errors for one invocation or control-plane call
//! - [`ExecutionError`]: Failures while a guest runs inside its sandbox
//! - [`ProtocolError`]: Guest output that does not end in a well-formed trailer

use std::io;

use thiserror::Error;

/// Top-level gateway errors.
///
/// Every stage of the invocation pipeline (resolve, compile, execute, decode)
/// reports its failure through one of these variants. The server maps them to
/// host-generated HTTP responses; guest internals never reach the client.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The endpoint does not exist or has no active deploy.
    #[error("Endpoint not found: {endpoint_id}")]
    EndpointNotFound {
        /// The identifier that failed to resolve.
        endpoint_id: String,
    },

    /// The deploy or its artifact does not exist.
    #[error("Deploy not found: {deploy_id}")]
    DeployNotFound {
        /// The identifier that failed to resolve.
        deploy_id: String,
    },

    /// The deploy artifact is not a valid guest binary.
    #[error("Compilation failed: {reason}")]
    CompileFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The guest failed while running.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The guest finished but its output could not be decoded.
    #[error("Malformed guest output: {0}")]
    Protocol(#[from] ProtocolError),

    /// A control-plane request was rejected.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of a single sandboxed execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The guest terminated abnormally (trap, panic, non-zero exit).
    #[error("Guest trapped: {message}")]
    Trap {
        /// Description of the trap as seen by the host.
        message: String,
        /// Last diagnostic line the guest wrote before terminating, if any.
        guest_message: Option<String>,
    },

    /// The execution exceeded its wall-clock budget.
    #[error("Execution timeout after {duration_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The guest hit a resource ceiling.
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted {
        /// Which resource ran out (memory, fuel, output, logs).
        resource: String,
    },

    /// The host failed to set up or drive the execution.
    #[error("Host error: {reason}")]
    HostError {
        /// Description of the host-side failure.
        reason: String,
    },
}

/// Violations of the guest output trailer format `<body>|<statusCode>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The output has no line terminated by a newline.
    #[error("expected at least one terminated line, found {lines} segment(s)")]
    TooFewLines {
        /// Number of segments after splitting on line terminators.
        lines: usize,
    },

    /// The trailer line has no `|` separator.
    #[error("trailer line has no '|' separator")]
    MissingSeparator,

    /// The status field is not a base-10 integer.
    #[error("status field is not an integer")]
    InvalidStatus,

    /// The status field is an integer outside the HTTP status range.
    #[error("status code {status} is outside 100..=999")]
    StatusOutOfRange {
        /// The parsed value.
        status: i64,
    },
}

impl GatewayError {
    /// Create a new `EndpointNotFound` error.
    pub fn endpoint_not_found(endpoint_id: impl Into<String>) -> Self {
        Self::EndpointNotFound {
            endpoint_id: endpoint_id.into(),
        }
    }

    /// Create a new `DeployNotFound` error.
    pub fn deploy_not_found(deploy_id: impl Into<String>) -> Self {
        Self::DeployNotFound {
            deploy_id: deploy_id.into(),
        }
    }

    /// Create a new `CompileFailed` error.
    pub fn compile_failed(reason: impl Into<String>) -> Self {
        Self::CompileFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidRequest` error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates an unknown endpoint or deploy.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EndpointNotFound { .. } | Self::DeployNotFound { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::Execution(e) if e.is_resource_limit())
    }
}

impl ExecutionError {
    /// Create a new `Trap` error without a guest message.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
            guest_message: None,
        }
    }

    /// Create a new `ResourceExhausted` error.
    pub fn resource_exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a new `HostError` error.
    pub fn host(reason: impl Into<String>) -> Self {
        Self::HostError {
            reason: reason.into(),
        }
    }

    /// Returns `true` for timeouts and exhausted resources.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ResourceExhausted { .. }
        )
    }

    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trap { .. } => "trap",
            Self::Timeout { .. } => "timeout",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::HostError { .. } => "host_error",
        }
    }
}
