//! HTTP server implementation.
//!
//! This module provides the main [`GatewayServer`] struct for running
//! the gateway HTTP server.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use edge_gateway_common::{EndpointId, GatewayError, RuntimeConfig, ServerConfigFile};

use crate::router::{AdminRouterConfig, RouterLimits, build_local_router, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with custom bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn limits(&self) -> RouterLimits {
        RouterLimits {
            request_timeout: self.request_timeout(),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl TryFrom<&ServerConfigFile> for ServerConfig {
    type Error = GatewayError;

    fn try_from(file: &ServerConfigFile) -> Result<Self, Self::Error> {
        let bind_addr = file.bind_addr.parse().map_err(|e| {
            GatewayError::invalid_config(format!("Invalid bind_addr '{}': {e}", file.bind_addr))
        })?;

        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            max_body_bytes: file.max_body_bytes,
            graceful_shutdown: file.graceful_shutdown,
        })
    }
}

/// What the server routes requests to.
enum Mode {
    /// `/functions/:endpoint_id` plus the optional admin API.
    Gateway(Option<AdminRouterConfig>),
    /// Every path goes to one endpoint.
    Local(EndpointId),
}

/// Edge gateway HTTP server.
///
/// # Example
///
/// ```ignore
/// use edge_gateway_server::{GatewayServer, ServerConfig};
/// use edge_gateway_common::RuntimeConfig;
///
/// let server = GatewayServer::new(&RuntimeConfig::default(), ServerConfig::default())?;
/// server.state().provision("hello", Runtime::Go, BTreeMap::new(), wasm_bytes)?;
/// server.run().await?;
/// ```
pub struct GatewayServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
    mode: Mode,
}

impl GatewayServer {
    /// Create a new server instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be initialized.
    pub fn new(
        runtime_config: &RuntimeConfig,
        server_config: ServerConfig,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            state: AppState::new(runtime_config)?,
            config: server_config,
            mode: Mode::Gateway(None),
        })
    }

    /// Mount the admin API.
    #[must_use]
    pub fn with_admin(mut self, admin: AdminRouterConfig) -> Self {
        self.mode = Mode::Gateway(Some(admin));
        self
    }

    /// Route every request to a single endpoint.
    #[must_use]
    pub fn local(mut self, endpoint_id: EndpointId) -> Self {
        self.mode = Mode::Local(endpoint_id);
        self
    }

    /// Get a reference to the application state.
    ///
    /// Use this to provision endpoints before starting the server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn into_router(self) -> (Router, ServerConfig) {
        let limits = self.config.limits();
        let router = match self.mode {
            Mode::Gateway(admin) => build_router_with_admin(self.state, limits, admin),
            Mode::Local(endpoint_id) => build_local_router(self.state, limits, endpoint_id),
        };
        (router, self.config)
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), GatewayError> {
        let (app, config) = self.into_router();

        let listener = TcpListener::bind(&config.bind_addr).await?;

        info!(addr = %config.bind_addr, "Starting HTTP server");

        if config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        } else {
            axum::serve(listener, app).await?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server on an ephemeral port and return a handle for testing.
    ///
    /// The bind address in the config is ignored; the server listens on
    /// `127.0.0.1:0`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_test(self) -> Result<TestHandle, GatewayError> {
        let state = self.state.clone();
        let (app, _) = self.into_router();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state (for provisioning endpoints).
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// If a handler cannot be installed, that signal is never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
