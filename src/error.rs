//! Error kinds for the proxy core and their mapping onto HTTP responses.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// The error kinds named by the proxy's error-handling design. Variant names
/// spell out the `k`-prefixed kinds directly so a match on this enum reads
/// like the design's own vocabulary.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("illegal state transition for model '{model_id}': expected {expected}, found {found}")]
    IllegalTransition {
        model_id: String,
        expected: String,
        found: String,
    },

    #[error("failed to start backend for model '{model_id}': {source}")]
    StartFailed {
        model_id: String,
        #[source]
        source: StartFailure,
    },

    #[error("backend for model '{model_id}' did not become healthy within {timeout_secs}s")]
    HealthTimeout { model_id: String, timeout_secs: u64 },

    #[error("upstream unreachable for model '{model_id}': {source}")]
    UpstreamUnreachable {
        model_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("model '{model_id}' is stopping")]
    Stopping { model_id: String },

    #[error("model '{model_id}' has shut down")]
    Shutdown { model_id: String },

    #[error("model '{model_name}' not found")]
    NotFound { model_name: String },

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("request body of {actual} bytes exceeds the {limit} byte cap")]
    PayloadTooLarge { actual: usize, limit: usize },

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum StartFailure {
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("child exited early with status {0}")]
    EarlyExit(String),
}

impl ProxyError {
    pub fn model_id(&self) -> Option<&str> {
        match self {
            ProxyError::IllegalTransition { model_id, .. }
            | ProxyError::StartFailed { model_id, .. }
            | ProxyError::HealthTimeout { model_id, .. }
            | ProxyError::UpstreamUnreachable { model_id, .. }
            | ProxyError::Stopping { model_id }
            | ProxyError::Shutdown { model_id } => Some(model_id),
            _ => None,
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::IllegalTransition { .. } | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::StartFailed { .. } | ProxyError::UpstreamUnreachable { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::HealthTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Stopping { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Shutdown { .. } => StatusCode::GONE,
            ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let ProxyError::Stopping { .. } = self {
            builder.insert_header(("Retry-After", "1"));
        }
        if let ProxyError::IllegalTransition { model_id, .. } = self {
            tracing::error!(model_id = %model_id, error = %self, "illegal state transition attempted");
        } else {
            tracing::warn!(model_id = ?self.model_id(), error = %self, "request failed");
        }
        builder.json(serde_json::json!({ "error": { "message": self.to_string() } }))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_error_design() {
        assert_eq!(
            ProxyError::IllegalTransition {
                model_id: "m".into(),
                expected: "Stopped".into(),
                found: "Ready".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::HealthTimeout {
                model_id: "m".into(),
                timeout_secs: 15
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Stopping { model_id: "m".into() }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::Shutdown { model_id: "m".into() }.status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            ProxyError::NotFound { model_name: "m".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ProxyError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::PayloadTooLarge { actual: 2, limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
