//! Reverse proxying to origins.
//!
//! Builds the outbound request (path rewrite, hop-by-hop hygiene, forwarding
//! headers), sends it through a shared pooled client, and hands the response
//! body back for streaming. Retry orchestration lives in the pipeline, which
//! re-selects an origin per attempt.

use crate::balancer::InFlightGuard;
use crate::error::{GatewayError, Result};
use crate::model::{Origin, PathRewrite, Route};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Response, Uri};
use http_body_util::Full;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Headers meaningful only for a single transport hop, stripped from both
/// the proxied request and the proxied response.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Hard ceiling on any single proxied request.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Applies a route's rewrite rule to a request path.
///
/// Every occurrence of the pattern is replaced; without a rule the path is
/// forwarded verbatim.
pub fn rewrite_path(path: &str, rewrite: Option<&PathRewrite>) -> String {
    match rewrite {
        Some(rule) if !rule.pattern.is_empty() => path.replace(&rule.pattern, &rule.target),
        _ => path.to_string(),
    }
}

/// Removes hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Builds the outbound header map: inbound headers minus hop-by-hop and
/// Host, plus the route's request transforms and `X-Forwarded-*`.
pub fn build_request_headers(
    inbound: &HeaderMap,
    route: &Route,
    client_ip: IpAddr,
    original_host: Option<&str>,
) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    // The client derives Host from the target URI.
    headers.remove(http::header::HOST);

    for (name, value) in &route.request_headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid request header transform"),
        }
    }

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::try_from(forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = original_host {
        if let Ok(value) = HeaderValue::try_from(host) {
            headers.insert("x-forwarded-host", value);
        }
    }

    headers
}

/// Assembles the target URI from the origin base URL and the (possibly
/// rewritten) path and query.
pub fn build_target_uri(origin_url: &str, path: &str, query: Option<&str>) -> Result<Uri> {
    let mut target = String::with_capacity(origin_url.len() + path.len() + 16);
    target.push_str(origin_url.trim_end_matches('/'));
    target.push_str(path);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target
        .parse()
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("invalid upstream url: {}", e)))
}

/// HTTP reverse proxy with a shared, pooled upstream client.
pub struct ReverseProxy {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl ReverseProxy {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build_http();
        Self { client }
    }

    /// Forwards one attempt to an origin.
    ///
    /// The effective timeout is the smaller of the route timeout and the
    /// gateway-wide ceiling. The returned body has not been read; callers
    /// stream or buffer it as the route dictates.
    pub async fn forward(
        &self,
        parts: &Parts,
        body: Bytes,
        origin: &Origin,
        route: &Route,
        client_ip: IpAddr,
        original_host: Option<&str>,
    ) -> Result<Response<Incoming>> {
        let path = rewrite_path(parts.uri.path(), route.path_rewrite.as_ref());
        let uri = build_target_uri(&origin.url, &path, parts.uri.query())?;

        let mut request = http::Request::builder()
            .method(parts.method.clone())
            .uri(uri.clone())
            .body(Full::new(body))?;
        *request.headers_mut() =
            build_request_headers(&parts.headers, route, client_ip, original_host);

        let deadline = route.timeout().min(MAX_REQUEST_TIMEOUT);
        debug!(target = %uri, timeout_ms = deadline.as_millis() as u64, "forwarding to origin");

        let mut response = match timeout(deadline, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(GatewayError::UpstreamUnavailable(e.to_string())),
            Err(_) => {
                return Err(GatewayError::UpstreamTimeout {
                    duration_ms: deadline.as_millis() as u64,
                })
            }
        };

        strip_hop_by_hop(response.headers_mut());
        for (name, value) in &route.response_headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid response header transform"),
            }
        }

        Ok(response)
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Response body wrapper that releases an in-flight slot once the body has
/// been fully consumed, failed, or been dropped mid-stream.
pub struct GuardedBody<B> {
    inner: B,
    guard: Option<InFlightGuard>,
}

impl<B> GuardedBody<B> {
    pub fn new(inner: B, guard: InFlightGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<B> Body for GuardedBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(&result, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard.take();
        }
        result
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
