//! HTTP request conversion for guest invocation.
//!
//! Reduces an inbound axum request to an [`InvocationRequest`]: method,
//! path and query, every header (repeated names kept in order) and the
//! raw body.

use axum::http::request::Parts;
use bytes::Bytes;

use edge_gateway_common::wire::append_header;
use edge_gateway_common::{EndpointId, HeaderMap};
use edge_gateway_core::InvocationRequest;

/// Build an invocation for `endpoint_id` from request parts and body.
pub fn invocation_from_parts(endpoint_id: EndpointId, parts: &Parts, body: Bytes) -> InvocationRequest {
    let url = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);

    InvocationRequest {
        endpoint_id,
        method: parts.method.to_string(),
        url,
        headers: convert_headers(&parts.headers),
        body,
    }
}

/// Copy HTTP headers into the wire representation.
///
/// Names are lowercased. Values that are not valid UTF-8 are converted
/// lossily rather than dropped.
pub fn convert_headers(headers: &axum::http::HeaderMap) -> HeaderMap {
    let mut converted = HeaderMap::new();
    for (name, value) in headers {
        append_header(
            &mut converted,
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()),
        );
    }
    converted
}
