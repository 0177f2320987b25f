//! The reverse-proxy primitive: rewrite the request onto the upstream base,
//! strip sensitive headers, stream the body both directions, and propagate
//! the response (including SSE framing) byte-for-byte.

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use futures::StreamExt;

use crate::error::ProxyError;

/// Hop-by-hop headers that must never be forwarded, per RFC 7230 §6.1, plus
/// the proxy's own client-auth headers which §4.1 requires stripping before
/// the request reaches the backend.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Strips `Authorization`, hop-by-hop headers, and every header named in
/// `sensitive_headers` (case-insensitive) before the request is forwarded.
pub fn forwardable_headers(
    req: &HttpRequest,
    sensitive_headers: &[String],
) -> Vec<(HeaderName, HeaderValue)> {
    req.headers()
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !is_hop_by_hop(name)
                && !name.eq_ignore_ascii_case("authorization")
                && !sensitive_headers.iter().any(|s| s.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Forwards `body` to `upstream_base` + the original request's path/query,
/// copying the method, the filtered headers, and streaming the response body
/// back unmodified. The caller is responsible for ensuring the target
/// Process is `Ready` before calling this; this function only knows how to
/// move bytes.
pub async fn forward(
    client: &reqwest::Client,
    upstream_base: &str,
    req: &HttpRequest,
    sensitive_headers: &[String],
    body: Bytes,
) -> Result<HttpResponse, ProxyError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(req.path());
    let url = format!("{}{}", upstream_base.trim_end_matches('/'), path_and_query);

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    let mut builder = client.request(method, &url);
    for (name, value) in forwardable_headers(req, sensitive_headers) {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder = builder.body(body);

    let upstream_response = builder.send().await.map_err(|source| ProxyError::UpstreamUnreachable {
        model_id: String::new(),
        source,
    })?;

    let status = actix_web::http::StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);

    let mut response_builder = HttpResponse::build(status);
    for (name, value) in upstream_response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            response_builder.insert_header((name.as_str(), value_str));
        }
    }

    // Streaming the body (rather than buffering it) is what preserves SSE
    // framing and keep-alive behavior for long-running chat completions.
    let stream = upstream_response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| actix_web::error::PayloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))));

    Ok(response_builder.streaming(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection_is_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[actix_web::test]
    async fn forwardable_headers_strip_auth_and_sensitive_headers() {
        let req = actix_web::test::TestRequest::default()
            .insert_header(("Authorization", "Bearer secret"))
            .insert_header(("X-Internal-Token", "also-secret"))
            .insert_header(("Content-Type", "application/json"))
            .to_http_request();
        let sensitive = vec!["X-Internal-Token".to_string()];
        let headers = forwardable_headers(&req, &sensitive);
        assert!(headers.iter().all(|(name, _)| !name.as_str().eq_ignore_ascii_case("authorization")));
        assert!(headers
            .iter()
            .all(|(name, _)| !name.as_str().eq_ignore_ascii_case("x-internal-token")));
        assert!(headers.iter().any(|(name, _)| name.as_str().eq_ignore_ascii_case("content-type")));
    }
}
