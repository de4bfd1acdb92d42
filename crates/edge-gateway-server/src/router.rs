//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::routing::{any, get};
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use edge_gateway_common::EndpointId;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::{
    LocalEndpoint, health_check, invoke_function, invoke_local, list_modules, readiness_check,
};
use crate::state::AppState;

/// Admin API configuration for router.
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/admin").
    pub prefix: String,
    /// Admin authentication token.
    pub token: String,
}

/// Limits applied to every route.
#[derive(Debug, Clone, Copy)]
pub struct RouterLimits {
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for RouterLimits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Build the main application router.
///
/// Routes:
/// - `ANY /functions/:endpoint_id` - Invoke an endpoint
/// - `ANY /functions/:endpoint_id/*path` - Invoke an endpoint with a sub-path
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - `GET /modules` - List cached modules
pub fn build_router(state: AppState, limits: RouterLimits) -> Router {
    build_router_with_admin(state, limits, None)
}

/// Build the main application router with optional Admin API.
pub fn build_router_with_admin(
    state: AppState,
    limits: RouterLimits,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let function_routes = Router::new()
        .route("/functions/:endpoint_id", any(invoke_function))
        .route("/functions/:endpoint_id/*path", any(invoke_function));

    let mut router = Router::new()
        .merge(function_routes)
        .merge(health_routes());

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token,
        };
        router = router.nest(&config.prefix, build_admin_router(admin_state));
    }

    with_layers(router, limits).with_state(state)
}

/// Build the router for a local run: every path invokes `endpoint_id`,
/// except the health routes and `/favicon.ico`.
pub fn build_local_router(state: AppState, limits: RouterLimits, endpoint_id: EndpointId) -> Router {
    let router = Router::new()
        .merge(health_routes())
        .fallback(invoke_local)
        .layer(Extension(LocalEndpoint(endpoint_id)));

    with_layers(router, limits).with_state(state)
}

fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/modules", get(list_modules))
}

fn with_layers(router: Router<AppState>, limits: RouterLimits) -> Router<AppState> {
    router
        .layer(RequestBodyLimitLayer::new(limits.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(limits.request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use edge_gateway_common::{EngineConfig, RuntimeConfig};
    use tower::util::ServiceExt;

    fn state() -> AppState {
        let config = RuntimeConfig {
            engine: EngineConfig {
                pooling_allocator: false,
                ..Default::default()
            },
            ..Default::default()
        };
        AppState::new(&config).unwrap()
    }

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = build_router(state(), RouterLimits::default());
        assert_eq!(status_of(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let app = build_router(state(), RouterLimits::default());
        assert_eq!(status_of(app, "/ready").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_modules_empty() {
        let app = build_router(state(), RouterLimits::default());
        assert_eq!(status_of(app, "/modules").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_function_not_found() {
        let app = build_router(state(), RouterLimits::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/functions/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-invocation-id"));
    }

    #[tokio::test]
    async fn test_function_sub_path_not_found() {
        let app = build_router(state(), RouterLimits::default());
        assert_eq!(
            status_of(app, "/functions/nonexistent/a/b").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_admin_routes_absent_without_config() {
        let app = build_router(state(), RouterLimits::default());
        assert_eq!(status_of(app, "/admin/endpoints").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_local_router_ignores_favicon() {
        let app = build_local_router(
            state(),
            RouterLimits::default(),
            EndpointId::new("local"),
        );
        assert_eq!(status_of(app, "/favicon.ico").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_local_router_keeps_health() {
        let app = build_local_router(
            state(),
            RouterLimits::default(),
            EndpointId::new("local"),
        );
        assert_eq!(status_of(app, "/health").await, StatusCode::OK);
    }
}
