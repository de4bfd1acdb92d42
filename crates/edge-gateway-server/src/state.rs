//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across all HTTP request handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use edge_gateway_common::{EndpointId, GatewayError, Runtime, RuntimeConfig};
use edge_gateway_core::{
    Deploy, Endpoint, InMemoryDirectory, Invoker, NewEndpoint, WasmEngine, WasmSandbox,
};
use edge_gateway_host::register_all;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// Endpoints and deploys.
    directory: Arc<InMemoryDirectory>,

    /// Resolve → compile → execute → decode pipeline.
    invoker: Arc<Invoker<WasmSandbox>>,
}

impl AppState {
    /// Create new application state.
    ///
    /// Builds the engine, registers host functions and, when configured,
    /// loads the JavaScript interpreter module from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if engine creation fails or the interpreter cannot
    /// be read or compiled.
    pub fn new(config: &RuntimeConfig) -> Result<Self, GatewayError> {
        let engine = WasmEngine::new(&config.engine)?;
        let mut sandbox = WasmSandbox::with_host_functions(engine, register_all)?;

        if let Some(path) = &config.guests.js_interpreter {
            let bytes = std::fs::read(path)?;
            sandbox = sandbox.with_js_interpreter(&bytes)?;
            info!(path = %path, "JavaScript interpreter loaded");
        }

        Ok(Self::with_sandbox(config, sandbox))
    }

    /// Create state around an already configured sandbox.
    pub fn with_sandbox(config: &RuntimeConfig, sandbox: WasmSandbox) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let invoker = Arc::new(Invoker::new(
            directory.clone(),
            Arc::new(sandbox),
            config,
        ));

        Self { directory, invoker }
    }

    /// Get the endpoint directory.
    pub fn directory(&self) -> &InMemoryDirectory {
        &self.directory
    }

    /// Get the invoker.
    pub fn invoker(&self) -> &Invoker<WasmSandbox> {
        &self.invoker
    }

    /// Get the Wasmtime engine.
    pub fn engine(&self) -> &WasmEngine {
        self.invoker.cache().sandbox().engine()
    }

    /// Create an endpoint whose id is its name and deploy `artifact` to it.
    ///
    /// Used to provision endpoints from the config file and for local runs.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint already exists or the artifact is empty.
    pub fn provision(
        &self,
        name: &str,
        runtime: Runtime,
        environment: BTreeMap<String, String>,
        artifact: Bytes,
    ) -> Result<(Endpoint, Deploy), GatewayError> {
        let endpoint = self.directory.create_endpoint(NewEndpoint {
            id: Some(EndpointId::new(name)),
            name: name.to_string(),
            runtime,
            environment,
        })?;
        let deploy = self.directory.create_deploy(&endpoint.id, artifact)?;

        Ok((endpoint, deploy))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("invoker", &self.invoker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_gateway_common::{EngineConfig, GuestConfig};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_app_state_creation() {
        let state = AppState::new(&config()).unwrap();
        assert!(state.directory().list_endpoints().is_empty());
        assert!(state.invoker().cache().is_empty());
    }

    #[test]
    fn test_provision() {
        let state = AppState::new(&config()).unwrap();
        let wasm = wat::parse_str(r#"(module (func (export "_start")))"#).unwrap();

        let (endpoint, deploy) = state
            .provision("hello", Runtime::Go, BTreeMap::new(), Bytes::from(wasm))
            .unwrap();

        assert_eq!(endpoint.id.as_str(), "hello");
        let stored = state.directory().get_endpoint(&endpoint.id).unwrap();
        assert_eq!(stored.active_deploy_id, Some(deploy.id));
    }

    #[test]
    fn test_missing_interpreter_file() {
        let mut config = config();
        config.guests = GuestConfig {
            js_interpreter: Some("/nonexistent/interpreter.wasm".into()),
        };

        let err = AppState::new(&config).unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
