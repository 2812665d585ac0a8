//! Admin endpoints for health checks and observability exports.

use crate::observability::Metrics;
use http::{Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Admin service for liveness and metrics endpoints.
///
/// Serves:
/// - `/health` - liveness probe returning 200 OK
/// - `/metrics` - Prometheus text exposition
/// - `/stats` - JSON snapshot of the aggregate counters
#[derive(Clone)]
pub struct AdminService {
    metrics: Arc<Metrics>,
}

impl AdminService {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    async fn handle_request(
        metrics: Arc<Metrics>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        let path = req.uri().path();

        match path {
            "/health" => {
                debug!("health check requested");
                Ok(Self::text_response(StatusCode::OK, "healthy".to_string()))
            }
            "/metrics" => match metrics.encode() {
                Ok(encoded) => Ok(Self::metrics_response(encoded)),
                Err(e) => {
                    warn!("failed to encode metrics: {}", e);
                    Ok(Self::text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics".to_string(),
                    ))
                }
            },
            "/stats" => match serde_json::to_string(&metrics.snapshot()) {
                Ok(body) => Ok(Self::json_response(body)),
                Err(e) => {
                    warn!("failed to serialize stats: {}", e);
                    Ok(Self::text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to serialize stats".to_string(),
                    ))
                }
            },
            _ => Ok(Self::text_response(
                StatusCode::NOT_FOUND,
                "Not Found".to_string(),
            )),
        }
    }

    fn body(content: String) -> BoxBody<Bytes, hyper::Error> {
        Full::new(Bytes::from(content))
            .map_err(|never| match never {})
            .boxed()
    }

    fn fallback() -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::new(Self::body(String::new()))
    }

    fn text_response(status: StatusCode, message: String) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(status)
            .body(Self::body(message))
            .unwrap_or_else(|_| Self::fallback())
    }

    fn metrics_response(metrics: String) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Self::body(metrics))
            .unwrap_or_else(|_| Self::fallback())
    }

    fn json_response(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Self::body(body))
            .unwrap_or_else(|_| Self::fallback())
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(Self::handle_request(Arc::clone(&self.metrics), req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response() {
        let response = AdminService::text_response(StatusCode::OK, "healthy".to_string());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_metrics_response_content_type() {
        let response = AdminService::metrics_response("gateway_requests_total 1".to_string());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn test_json_response_content_type() {
        let response = AdminService::json_response("{}".to_string());
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
