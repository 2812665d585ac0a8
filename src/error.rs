//! Error types for the gateway.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors that can occur while handling a gateway request.
///
/// Every variant has a client-visible HTTP status via [`GatewayError::status`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// The request could not be parsed (bad host, bad body).
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// No tenant matches the request's subdomain or supplied identifier.
    #[error("unknown tenant")]
    UnknownTenant,

    /// No active route matches the request.
    #[error("no route found for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Authentication failed (missing, invalid, expired, or inactive credential).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The credential is valid but not permitted for this request.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The request was rejected by a rate limiter.
    #[error("rate limit exceeded")]
    RateLimited { remaining: u64 },

    /// No origin is available to serve the request.
    #[error("no healthy origin available")]
    NoHealthyOrigin,

    /// The upstream could not be reached after exhausting retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream did not respond within the request timeout.
    #[error("upstream timed out after {duration_ms}ms")]
    UpstreamTimeout { duration_ms: u64 },

    /// An entity lookup missed.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The configuration store failed on the critical path.
    #[error("repository error: {0}")]
    Repository(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Failure while constructing an HTTP message.
    #[error("http build error: {0}")]
    HttpBuild(#[from] http::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Maps this error to the status code returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownTenant => StatusCode::BAD_REQUEST,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoHealthyOrigin => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Repository(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body sent to the client for this error.
    pub fn body(&self) -> String {
        match self {
            GatewayError::UnknownTenant => r#"{"error":"Invalid tenant"}"#.to_string(),
            other => format!(r#"{{"error":{}}}"#, serde_json::json!(other.to_string())),
        }
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::UnknownTenant.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::RouteNotFound {
                method: "GET".into(),
                path: "/x".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RateLimited { remaining: 0 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::NoHealthyOrigin.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamTimeout { duration_ms: 30000 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Repository("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unknown_tenant_body() {
        assert_eq!(
            GatewayError::UnknownTenant.body(),
            r#"{"error":"Invalid tenant"}"#
        );
    }

    #[test]
    fn test_error_body_is_json() {
        let body = GatewayError::AuthFailed("bad key".into()).body();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("bad key"));
    }
}
