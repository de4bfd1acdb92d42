//! Admin API handlers for the endpoint directory.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token.
//!
//! # Endpoints
//!
//! - `POST /admin/endpoints` - Create an endpoint
//! - `GET /admin/endpoints` - List endpoints
//! - `GET /admin/endpoints/:id` - Get one endpoint
//! - `POST /admin/endpoints/:id/deploys` - Upload a deploy (multipart)
//! - `POST /admin/endpoints/:id/rollback` - Re-activate an earlier deploy
//! - `DELETE /admin/deploys/:id` - Delete an inactive deploy

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path},
    http::{HeaderMap, Response, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
};
use axum_extra::extract::Multipart;
use bytes::Bytes;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use edge_gateway_common::{DeployId, EndpointId, GatewayError};
use edge_gateway_core::{NewEndpoint, status_for};

use crate::response::json_error;
use crate::state::AppState;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    /// Application state (directory, invoker).
    pub app_state: AppState,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

/// Body of a rollback request.
#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub deploy_id: DeployId,
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
/// Upload size is bounded by the outer router's body limit.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/endpoints", post(create_endpoint).get(list_endpoints))
        .route("/endpoints/:id", get(get_endpoint))
        .route("/endpoints/:id/deploys", post(upload_deploy))
        .route("/endpoints/:id/rollback", post(rollback))
        .route("/deploys/:id", delete(delete_deploy))
        .layer(DefaultBodyLimit::disable())
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
///
/// The comparison runs in constant time.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), Response<Body>> {
    let Some(token) = headers.get(ADMIN_TOKEN_HEADER) else {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "Missing X-Admin-Token header",
        ));
    };

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        warn!("Rejected admin request with invalid token");
        Err(json_error(StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

fn error_response(error: &GatewayError) -> Response<Body> {
    let status =
        StatusCode::from_u16(status_for(error)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_error(status, &error.to_string())
}

/// Create an endpoint.
///
/// # Request
///
/// `POST /admin/endpoints`
///
/// ```json
/// { "name": "hello", "runtime": "go", "environment": { "GREETING": "hi" } }
/// ```
///
/// `id` is optional; a random one is generated when it is absent.
#[instrument(skip_all)]
pub async fn create_endpoint(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Json(params): Json<NewEndpoint>,
) -> Response<Body> {
    if let Err(response) = verify_token(&headers, &admin_state.admin_token) {
        return response;
    }

    match admin_state.app_state.directory().create_endpoint(params) {
        Ok(endpoint) => (StatusCode::CREATED, Json(endpoint)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// List all endpoints.
#[instrument(skip_all)]
pub async fn list_endpoints(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> Response<Body> {
    if let Err(response) = verify_token(&headers, &admin_state.admin_token) {
        return response;
    }

    let endpoints = admin_state.app_state.directory().list_endpoints();
    Json(serde_json::json!({
        "count": endpoints.len(),
        "endpoints": endpoints,
    }))
    .into_response()
}

/// Get one endpoint, including its deploy history.
#[instrument(skip(admin_state, headers))]
pub async fn get_endpoint(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(endpoint_id): Path<String>,
) -> Response<Body> {
    if let Err(response) = verify_token(&headers, &admin_state.admin_token) {
        return response;
    }

    match admin_state
        .app_state
        .directory()
        .get_endpoint(&EndpointId::new(endpoint_id))
    {
        Ok(endpoint) => Json(endpoint).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Upload a deploy; it becomes the endpoint's active deploy.
///
/// # Request
///
/// `POST /admin/endpoints/:id/deploys`
///
/// Content-Type: `multipart/form-data` with the artifact in a `file`,
/// `artifact` or `wasm` field.
#[instrument(skip(admin_state, headers, multipart))]
pub async fn upload_deploy(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(endpoint_id): Path<String>,
    multipart: Multipart,
) -> Response<Body> {
    if let Err(response) = verify_token(&headers, &admin_state.admin_token) {
        return response;
    }

    let artifact = match extract_artifact(multipart).await {
        Ok(artifact) => artifact,
        Err(msg) => {
            warn!(error = msg, "Failed to extract artifact from request");
            return json_error(StatusCode::BAD_REQUEST, msg);
        }
    };

    match admin_state
        .app_state
        .directory()
        .create_deploy(&EndpointId::new(endpoint_id), artifact)
    {
        Ok(deploy) => (StatusCode::CREATED, Json(deploy)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Point an endpoint back at an earlier deploy.
///
/// Invocations already resolved keep running the deploy they resolved.
#[instrument(skip(admin_state, headers, request))]
pub async fn rollback(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(endpoint_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Response<Body> {
    if let Err(response) = verify_token(&headers, &admin_state.admin_token) {
        return response;
    }

    match admin_state
        .app_state
        .directory()
        .rollback(&EndpointId::new(endpoint_id), &request.deploy_id)
    {
        Ok(endpoint) => Json(endpoint).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Delete a deploy that is not active anywhere and evict its module.
#[instrument(skip(admin_state, headers))]
pub async fn delete_deploy(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(deploy_id): Path<String>,
) -> Response<Body> {
    if let Err(response) = verify_token(&headers, &admin_state.admin_token) {
        return response;
    }

    let deploy_id = DeployId::new(deploy_id);
    match admin_state.app_state.directory().delete_deploy(&deploy_id) {
        Ok(deploy) => {
            let evicted = admin_state.app_state.invoker().evict(&deploy_id);
            info!(deploy_id = %deploy_id, evicted, "Deploy deleted");
            Json(deploy).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Extract the artifact bytes from multipart form data.
async fn extract_artifact(mut multipart: Multipart) -> Result<Bytes, &'static str> {
    while let Ok(Some(field)) = multipart.next_field().await {
        if matches!(field.name(), Some("file" | "artifact" | "wasm")) {
            let bytes = field.bytes().await.map_err(|_| "Failed to read artifact")?;
            if bytes.is_empty() {
                return Err("Artifact is empty");
            }
            return Ok(bytes);
        }
    }
    Err("Missing artifact field")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, "secret".parse().unwrap());

        assert!(verify_token(&headers, "secret").is_ok());
    }

    #[test]
    fn test_verify_token_invalid() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, "wrong".parse().unwrap());

        let response = verify_token(&headers, "secret").unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_verify_token_prefix_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, "secre".parse().unwrap());

        assert!(verify_token(&headers, "secret").is_err());
    }

    #[test]
    fn test_verify_token_missing() {
        let headers = HeaderMap::new();

        let response = verify_token(&headers, "secret").unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&GatewayError::endpoint_not_found("nope"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = error_response(&GatewayError::invalid_request("active"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
