//! Request handlers for guest invocation.
//!
//! This module provides HTTP handlers for invoking endpoints and
//! inspecting the gateway.

use axum::Extension;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use edge_gateway_common::EndpointId;

use crate::request::invocation_from_parts;
use crate::response::{GatewayResponse, json_error};
use crate::state::AppState;

/// Path parameters of the invocation routes.
///
/// The optional `*path` suffix is not needed here; the guest sees it
/// through the full request URL.
#[derive(Debug, Deserialize)]
pub struct FunctionPath {
    pub endpoint_id: String,
}

/// Endpoint that every request is routed to in local run mode.
#[derive(Debug, Clone)]
pub struct LocalEndpoint(pub EndpointId);

/// Invoke an endpoint for an HTTP request.
///
/// This handler:
/// 1. Reads the request body
/// 2. Converts the request into an invocation
/// 3. Runs it through the invoker
/// 4. Returns the guest's (or the gateway's) response
#[instrument(skip_all, fields(endpoint_id = %path.endpoint_id))]
pub async fn invoke_function(
    State(state): State<AppState>,
    Path(path): Path<FunctionPath>,
    request: Request,
) -> Response<Body> {
    invoke(&state, EndpointId::new(path.endpoint_id), request).await
}

/// Local run mode: route any request to the single configured endpoint.
pub async fn invoke_local(
    State(state): State<AppState>,
    Extension(LocalEndpoint(endpoint_id)): Extension<LocalEndpoint>,
    request: Request,
) -> Response<Body> {
    if request.uri().path() == "/favicon.ico" {
        return StatusCode::NOT_FOUND.into_response();
    }
    invoke(&state, endpoint_id, request).await
}

async fn invoke(state: &AppState, endpoint_id: EndpointId, request: Request) -> Response<Body> {
    let (parts, body) = request.into_parts();

    // Size is capped by the router's body limit layer
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            warn!(endpoint_id = %endpoint_id, error = %e, "Failed to read request body");
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let invocation = invocation_from_parts(endpoint_id, &parts, body);
    let outcome = state.invoker().handle(invocation).await;

    info!(
        invocation_id = %outcome.response.invocation_id,
        status = outcome.response.status_code,
        host_error = outcome.is_host_error(),
        "Request completed"
    );

    GatewayResponse::from(outcome).into_response()
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK if the server is ready to accept requests.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Ticking the epoch proves the engine is reachable
    state.engine().increment_epoch();

    let body = serde_json::json!({
        "status": "ready",
        "endpoints": state.directory().list_endpoints().len(),
        "modules_cached": state.invoker().cache().len(),
    });

    (StatusCode::OK, axum::Json(body))
}

/// List deploys with a compiled module in the cache.
pub async fn list_modules(State(state): State<AppState>) -> impl IntoResponse {
    let modules = state.invoker().cache().cached_ids();
    axum::Json(serde_json::json!({
        "count": modules.len(),
        "modules": modules,
    }))
}
