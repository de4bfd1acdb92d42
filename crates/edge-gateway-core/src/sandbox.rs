//! The isolation seam.
//!
//! Everything above this trait (cache, invoker, server) is independent of how
//! guests are isolated. [`crate::WasmSandbox`] is the production
//! implementation; tests plug in stubs to count compilations or delay runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use edge_gateway_common::{
    DeployId, ExecutionConfig, ExecutionError, GatewayError, RequestRecord, Runtime,
};

/// A deploy's raw artifact, as handed to the compiler.
#[derive(Debug, Clone)]
pub struct DeployArtifact {
    /// Deploy the bytes belong to.
    pub deploy_id: DeployId,
    /// Guest ABI of the artifact.
    pub runtime: Runtime,
    /// Module bytes (`go`) or script source (`js`).
    pub bytes: Bytes,
}

/// Captured output of one finished execution.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    /// Everything the guest wrote to stdout.
    pub stdout: Bytes,
    /// Everything the guest wrote to stderr. Logged, never returned to clients.
    pub stderr: Bytes,
    /// Wall-clock time spent inside the sandbox.
    pub duration: Duration,
    /// Fuel consumed, when metering is on.
    pub fuel_consumed: u64,
}

/// A compiled guest, shareable across concurrent executions.
pub trait GuestModule: Send + Sync + 'static {
    /// The deploy this module was compiled from.
    fn deploy_id(&self) -> &DeployId;
}

/// Compile-once / run-many isolation technology.
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    /// Compiled form of one deploy.
    type Module: GuestModule;

    /// Compile an artifact. Blocking; callers run it off the async threads.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CompileFailed`] for artifacts that are not
    /// valid guests.
    fn compile(&self, artifact: &DeployArtifact) -> Result<Self::Module, GatewayError>;

    /// Run one request in a fresh isolated context and capture its output.
    ///
    /// The context is destroyed when the call returns or its future is
    /// dropped; only `module` outlives it.
    async fn run(
        &self,
        module: Arc<Self::Module>,
        request: &RequestRecord,
        limits: &ExecutionConfig,
    ) -> Result<RawOutput, ExecutionError>;
}
