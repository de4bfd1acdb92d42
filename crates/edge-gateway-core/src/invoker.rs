//! Invocation orchestration.
//!
//! [`Invoker::handle`] runs one request through the pipeline
//!
//! ```text
//! Resolving ─▶ Compiling ─▶ Executing ─▶ Decoding ─▶ Emitted
//!     │            │            │            │
//!     ▼            ▼            ▼            ▼
//!    404          500       500 / 504       502
//! ```
//!
//! and always produces a [`ResponseRecord`]. A guest's status and body are
//! passed through verbatim only after its trailer decoded cleanly; every
//! other outcome becomes a small host-generated JSON error that never
//! contains guest output.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{Span, debug, error, info, instrument};

use edge_gateway_common::{
    DeployId, EndpointId, ExecutionConfig, ExecutionError, GatewayError, HeaderMap,
    InvocationId, RequestRecord, ResponseRecord, RuntimeConfig,
};

use crate::cache::ModuleCache;
use crate::decoder::{DecodedOutput, decode};
use crate::directory::{EndpointDirectory, EndpointSnapshot};
use crate::sandbox::{DeployArtifact, Sandbox};

/// Slack on top of the sandbox's own timeout before the invoker gives up.
const EXECUTION_GRACE: Duration = Duration::from_millis(250);

/// An inbound HTTP request, reduced to what the guest sees.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub endpoint_id: EndpointId,
    pub method: String,
    /// Path and query as received.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Pipeline stage, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStage {
    Resolving,
    Compiling,
    Executing,
    Decoding,
}

impl fmt::Display for InvocationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvocationStage::Resolving => "resolving",
            InvocationStage::Compiling => "compiling",
            InvocationStage::Executing => "executing",
            InvocationStage::Decoding => "decoding",
        })
    }
}

/// Who produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// Status and body come from the guest's trailer.
    Guest,
    /// The gateway generated an error response at this stage.
    Host(InvocationStage),
}

/// Result of one invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub response: ResponseRecord,
    pub origin: ResponseOrigin,
}

impl InvocationOutcome {
    /// Check if the response was generated by the gateway.
    pub fn is_host_error(&self) -> bool {
        matches!(self.origin, ResponseOrigin::Host(_))
    }
}

struct StageError {
    stage: InvocationStage,
    error: GatewayError,
}

trait AtStage<T> {
    fn at(self, stage: InvocationStage) -> Result<T, StageError>;
}

impl<T, E: Into<GatewayError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: InvocationStage) -> Result<T, StageError> {
        self.map_err(|e| StageError {
            stage,
            error: e.into(),
        })
    }
}

/// The invocation orchestrator.
///
/// Holds no per-request state; share it behind an `Arc` and call
/// [`Invoker::handle`] from as many tasks as needed.
pub struct Invoker<S: Sandbox> {
    directory: Arc<dyn EndpointDirectory>,
    cache: ModuleCache<S>,
    limits: ExecutionConfig,
}

impl<S: Sandbox> Invoker<S> {
    /// Create an invoker over a directory and a sandbox.
    pub fn new(
        directory: Arc<dyn EndpointDirectory>,
        sandbox: Arc<S>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            directory,
            cache: ModuleCache::new(sandbox, &config.cache),
            limits: config.execution.clone(),
        }
    }

    /// Get the module cache.
    pub fn cache(&self) -> &ModuleCache<S> {
        &self.cache
    }

    /// Get the per-execution limits.
    pub fn limits(&self) -> &ExecutionConfig {
        &self.limits
    }

    /// Drop everything cached for a deploy (module and compile health).
    pub fn evict(&self, deploy_id: &DeployId) -> bool {
        self.cache.evict(deploy_id)
    }

    /// Run one invocation end to end.
    #[instrument(
        skip(self, request),
        fields(
            endpoint_id = %request.endpoint_id,
            method = %request.method,
            invocation_id = tracing::field::Empty,
        )
    )]
    pub async fn handle(&self, request: InvocationRequest) -> InvocationOutcome {
        let invocation_id = InvocationId::generate();
        Span::current().record("invocation_id", invocation_id.as_str());
        let start = Instant::now();

        match self.invoke(&invocation_id, request).await {
            Ok(decoded) => {
                for line in &decoded.log_lines {
                    debug!(guest_log = true, stream = "stdout", "{line}");
                }
                info!(
                    status = decoded.status_code,
                    duration_ms = start.elapsed().as_millis(),
                    "Invocation completed"
                );
                InvocationOutcome {
                    response: ResponseRecord {
                        body: decoded.body,
                        status_code: decoded.status_code,
                        invocation_id,
                    },
                    origin: ResponseOrigin::Guest,
                }
            }
            Err(StageError { stage, error }) => {
                let status = status_for(&error);
                if status >= 500 {
                    error!(
                        stage = %stage,
                        status,
                        error = %error,
                        duration_ms = start.elapsed().as_millis(),
                        "Invocation failed"
                    );
                } else {
                    info!(stage = %stage, status, error = %error, "Invocation rejected");
                }
                InvocationOutcome {
                    response: error_response(&invocation_id, status, &error),
                    origin: ResponseOrigin::Host(stage),
                }
            }
        }
    }

    async fn invoke(
        &self,
        invocation_id: &InvocationId,
        request: InvocationRequest,
    ) -> Result<DecodedOutput, StageError> {
        let snapshot = self
            .directory
            .resolve_active_deploy(&request.endpoint_id)
            .await
            .at(InvocationStage::Resolving)?;

        let record = build_record(invocation_id, request, &snapshot);

        let module = self
            .load_module(&snapshot)
            .await
            .at(InvocationStage::Compiling)?;

        let output = match tokio::time::timeout(
            self.limits.timeout() + EXECUTION_GRACE,
            self.cache.sandbox().run(module, &record, &self.limits),
        )
        .await
        {
            Ok(result) => result.at(InvocationStage::Executing)?,
            Err(_) => {
                return Err(StageError {
                    stage: InvocationStage::Executing,
                    error: ExecutionError::Timeout {
                        duration_ms: self.limits.timeout_ms,
                    }
                    .into(),
                });
            }
        };

        decode(&output.stdout).at(InvocationStage::Decoding)
    }

    async fn load_module(
        &self,
        snapshot: &EndpointSnapshot,
    ) -> Result<Arc<S::Module>, GatewayError> {
        let deploy_id = &snapshot.active_deploy_id;
        if let Some(module) = self.cache.get(deploy_id) {
            return Ok(module);
        }

        // Skip fetching the artifact while the deploy is cooling down
        self.cache.check_health(deploy_id)?;

        let bytes = self.directory.get_deploy_artifact(deploy_id).await?;
        let artifact = DeployArtifact {
            deploy_id: deploy_id.clone(),
            runtime: snapshot.runtime,
            bytes,
        };

        self.cache.get_or_compile(artifact).await
    }
}

fn build_record(
    invocation_id: &InvocationId,
    request: InvocationRequest,
    snapshot: &EndpointSnapshot,
) -> RequestRecord {
    RequestRecord {
        body: request.body.to_vec(),
        method: request.method,
        url: request.url,
        endpoint_id: snapshot.endpoint_id.clone(),
        invocation_id: invocation_id.clone(),
        headers: request.headers,
        runtime: snapshot.runtime,
        active_deploy_id: snapshot.active_deploy_id.clone(),
        env: snapshot.environment.clone(),
    }
}

/// HTTP status for a failed invocation.
pub fn status_for(error: &GatewayError) -> u16 {
    match error {
        GatewayError::EndpointNotFound { .. } | GatewayError::DeployNotFound { .. } => 404,
        GatewayError::InvalidRequest { .. } => 400,
        GatewayError::Execution(ExecutionError::Timeout { .. }) => 504,
        GatewayError::Protocol(_) => 502,
        GatewayError::CompileFailed { .. }
        | GatewayError::Execution(_)
        | GatewayError::InvalidConfig { .. }
        | GatewayError::Io(_) => 500,
    }
}

/// Client-facing description of a failure. Never includes guest output.
fn public_message(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::EndpointNotFound { .. } | GatewayError::DeployNotFound { .. } => {
            "endpoint not found"
        }
        GatewayError::InvalidRequest { .. } => "invalid request",
        GatewayError::CompileFailed { .. } => "function failed to compile",
        GatewayError::Execution(ExecutionError::Timeout { .. }) => "function timed out",
        GatewayError::Execution(ExecutionError::ResourceExhausted { .. }) => {
            "function exceeded its resource limits"
        }
        GatewayError::Execution(_) => "function execution failed",
        GatewayError::Protocol(_) => "function returned a malformed response",
        GatewayError::InvalidConfig { .. } | GatewayError::Io(_) => "internal error",
    }
}

fn error_response(invocation_id: &InvocationId, status: u16, error: &GatewayError) -> ResponseRecord {
    let body = serde_json::to_vec(&BTreeMap::from([
        ("error", public_message(error)),
        ("invocation_id", invocation_id.as_str()),
    ]))
    .unwrap_or_default();

    ResponseRecord {
        body,
        status_code: status,
        invocation_id: invocation_id.clone(),
    }
}

impl<S: Sandbox> fmt::Debug for Invoker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("cache", &self.cache)
            .field("timeout_ms", &self.limits.timeout_ms)
            .finish_non_exhaustive()
    }
}
