//! HTTP response conversion from invocation outcomes.
//!
//! Guest responses carry exactly the body and status the guest produced.
//! Gateway-generated errors are JSON. Both carry `x-invocation-id`.

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;

use edge_gateway_core::InvocationOutcome;

/// Header carrying the invocation id on every invocation response.
pub const INVOCATION_ID_HEADER: &str = "x-invocation-id";

/// HTTP response for one invocation.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
    /// Invocation id, echoed back to the client.
    pub invocation_id: String,
    /// The gateway produced this response, not the guest.
    pub host_error: bool,
}

impl From<InvocationOutcome> for GatewayResponse {
    fn from(outcome: InvocationOutcome) -> Self {
        let host_error = outcome.is_host_error();
        Self {
            status: outcome.response.status_code,
            body: outcome.response.body,
            invocation_id: outcome.response.invocation_id.to_string(),
            host_error,
        }
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response<Body> {
        // The decoder admits 100..=999; anything http cannot represent is a 502
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::try_from(self.invocation_id) {
            headers.insert(INVOCATION_ID_HEADER, value);
        }
        if self.host_error {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

/// JSON error response for requests that never reach the invoker.
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    (
        status,
        axum::Json(serde_json::json!({
            "error": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_gateway_common::{InvocationId, ResponseRecord};
    use edge_gateway_core::{InvocationStage, ResponseOrigin};

    fn outcome(status_code: u16, body: &[u8], origin: ResponseOrigin) -> InvocationOutcome {
        InvocationOutcome {
            response: ResponseRecord {
                body: body.to_vec(),
                status_code,
                invocation_id: InvocationId::new("inv-1"),
            },
            origin,
        }
    }

    #[test]
    fn test_guest_response() {
        let response =
            GatewayResponse::from(outcome(201, b"created", ResponseOrigin::Guest)).into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[INVOCATION_ID_HEADER], "inv-1");
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_host_error_is_json() {
        let response = GatewayResponse::from(outcome(
            404,
            br#"{"error":"endpoint not found"}"#,
            ResponseOrigin::Host(InvocationStage::Resolving),
        ))
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[test]
    fn test_unrepresentable_status_is_bad_gateway() {
        let response =
            GatewayResponse::from(outcome(1000, b"", ResponseOrigin::Guest)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_json_error() {
        let response = json_error(StatusCode::UNAUTHORIZED, "Invalid admin token");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
