//! The per-request pipeline.
//!
//! Composes tenant resolution, route matching, authentication, rate
//! limiting, the response cache, origin selection, and proxying. Failure at
//! any stage short-circuits to the error response for that stage; every
//! stage is timed in the request trace.

use crate::auth::{ApiKeyValidator, AuthContext, JwtVerifier};
use crate::balancer::{self, Balancer, InFlightGuard};
use crate::cache::{self, CachedResponse, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::health::HealthChecker;
use crate::matcher::{self, RouteCache};
use crate::model::{AuthMode, KeyStrategy, Origin, RateLimitPolicy, RequestLog, Route, Tenant};
use crate::observability::{self, Metrics, RequestLogWriter, Span, Trace, TRACE_HEADER};
use crate::proxy::{GuardedBody, ReverseProxy};
use crate::ratelimit::LimiterRegistry;
use crate::repository::Repositories;
use chrono::Utc;
use dashmap::DashMap;
use http::{HeaderValue, Request, Response};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Service;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Everything a request handler needs, shared across connections.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub repos: Repositories,
    pub health: Arc<HealthChecker>,
    pub cache: Arc<ResponseCache>,
    pub limiters: LimiterRegistry,
    pub route_cache: RouteCache,
    pub metrics: Arc<Metrics>,
    pub log_writer: RequestLogWriter,
    pub validator: ApiKeyValidator,
    jwt_verifier: Option<Arc<dyn JwtVerifier>>,
    proxy: ReverseProxy,
    /// One balancer per route so counters cannot skew across routes.
    balancers: DashMap<Uuid, Arc<dyn Balancer>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, repos: Repositories) -> Arc<Self> {
        Self::build(config, repos, None)
    }

    /// Like [`GatewayState::new`], with the external JWT collaborator
    /// installed. Routes with JWT auth reject every request until one is.
    pub fn with_jwt_verifier(
        config: GatewayConfig,
        repos: Repositories,
        verifier: Arc<dyn JwtVerifier>,
    ) -> Arc<Self> {
        Self::build(config, repos, Some(verifier))
    }

    fn build(
        config: GatewayConfig,
        repos: Repositories,
        jwt_verifier: Option<Arc<dyn JwtVerifier>>,
    ) -> Arc<Self> {
        let health = Arc::new(HealthChecker::new(
            config.health_check_interval,
            config.health_check_timeout,
        ));
        let cache = Arc::new(ResponseCache::new(config.cache_max_bytes));
        let limiters = LimiterRegistry::new(config.rate_limiter_capacity);
        let route_cache = RouteCache::new(config.route_cache_ttl);
        let (log_writer, _) = RequestLogWriter::spawn(Arc::clone(&repos.request_logs), 1024);
        let validator = ApiKeyValidator::new(Arc::clone(&repos.api_keys));

        Arc::new(Self {
            config,
            repos,
            health,
            cache,
            limiters,
            route_cache,
            metrics: Arc::new(Metrics::new()),
            log_writer,
            validator,
            jwt_verifier,
            proxy: ReverseProxy::new(),
            balancers: DashMap::new(),
        })
    }

    /// Starts the health checker and cache sweeper.
    pub async fn start_background(&self) -> Result<()> {
        let origins = self.repos.origins.list().await?;
        self.health.start(origins);
        Arc::clone(&self.cache).start_sweeper();
        Ok(())
    }

    /// Stops background tasks, joining each with a bounded deadline.
    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.cache.stop().await;
    }

    /// Resolves an explicitly supplied tenant identifier: a parseable UUID
    /// looks up by id, anything else goes through the external-id index.
    pub async fn resolve_tenant_id(&self, supplied: &str) -> Result<Tenant> {
        match Uuid::parse_str(supplied) {
            Ok(id) => self.repos.tenants.get_by_id(id).await,
            Err(_) => self.repos.tenants.get_by_external_id(supplied).await,
        }
    }

    fn balancer_for(&self, route_id: Uuid) -> Arc<dyn Balancer> {
        self.balancers
            .entry(route_id)
            .or_insert_with(|| balancer::build(self.config.lb_strategy))
            .clone()
    }
}

/// Mutable context accumulated while a request moves through the stages,
/// used afterwards for metrics and the request log.
struct RequestRecord {
    method: http::Method,
    path: String,
    query: Option<String>,
    tenant_id: Option<Uuid>,
    route_id: Option<Uuid>,
    origin_id: Option<Uuid>,
    origin_url: Option<String>,
    cache_hit: bool,
    rate_limited: bool,
    auth_method: Option<&'static str>,
}

impl RequestRecord {
    fn new(req: &Request<Incoming>) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(|q| q.to_string()),
            tenant_id: None,
            route_id: None,
            origin_id: None,
            origin_url: None,
            cache_hit: false,
            rate_limited: false,
            auth_method: None,
        }
    }
}

/// Runs one pipeline stage under a span.
async fn staged<T, F>(trace: &mut Trace, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let mut span = Span::begin(operation);
    let result = fut.await;
    match &result {
        Ok(_) => span.end_ok(),
        Err(_) => span.end_error(),
    }
    trace.record(span);
    result
}

/// Extracts the tenant from the Host header's first DNS label.
async fn resolve_tenant(state: &GatewayState, host: Option<&str>) -> Result<Tenant> {
    let host = host.ok_or(GatewayError::UnknownTenant)?;
    let host = host.split(':').next().unwrap_or(host);

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || labels[0].is_empty() {
        return Err(GatewayError::UnknownTenant);
    }

    let subdomain = labels[0].to_ascii_lowercase();
    state.repos.tenants.get_by_subdomain(&subdomain).await
}

/// Runs the route's auth mode against the request.
async fn authenticate(
    state: &GatewayState,
    headers: &http::HeaderMap,
    route: &Route,
    tenant: &Tenant,
) -> Result<AuthContext> {
    match route.auth_mode {
        AuthMode::None => Ok(AuthContext::default()),
        AuthMode::ApiKey => {
            let presented = headers
                .get("x-api-key")
                .or_else(|| headers.get(http::header::AUTHORIZATION))
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| GatewayError::AuthFailed("missing api key".to_string()))?;

            let key = state.validator.validate(presented, Utc::now()).await?;
            if key.tenant_id != tenant.id {
                return Err(GatewayError::AccessDenied(
                    "api key belongs to another tenant".to_string(),
                ));
            }

            Ok(AuthContext {
                api_key_id: Some(key.id),
                user_id: key.user_id,
                method: Some("api_key"),
            })
        }
        AuthMode::Jwt => {
            let token = headers
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or_else(|| GatewayError::AuthFailed("missing bearer token".to_string()))?;

            let verifier = state
                .jwt_verifier
                .as_ref()
                .ok_or_else(|| GatewayError::AuthFailed("jwt verification unavailable".to_string()))?;
            let claims = verifier.verify(token)?;

            if claims.tenant_id.is_some_and(|id| id != tenant.id) {
                return Err(GatewayError::AccessDenied(
                    "token belongs to another tenant".to_string(),
                ));
            }

            Ok(AuthContext {
                api_key_id: None,
                user_id: claims.user_id,
                method: Some("jwt"),
            })
        }
    }
}

/// Route policy with gateway defaults filled in where the route left zeros.
fn effective_rate_limit(config: &GatewayConfig, policy: &RateLimitPolicy) -> RateLimitPolicy {
    let mut effective = policy.clone();
    if effective.requests_per_second == 0 {
        effective.requests_per_second = config.rate_limit_default_rps;
    }
    if effective.burst == 0 {
        effective.burst = config.rate_limit_default_burst;
    }
    effective
}

/// Derives the rate-limit key for a request. Strategies without their
/// attribute (anonymous routes, no user claim) fall back to the client IP.
fn derive_limit_key(
    strategy: KeyStrategy,
    client_ip: std::net::IpAddr,
    auth: &AuthContext,
    tenant: &Tenant,
) -> String {
    match strategy {
        KeyStrategy::Ip => client_ip.to_string(),
        KeyStrategy::ApiKey => auth
            .api_key_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| client_ip.to_string()),
        KeyStrategy::User => auth
            .user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| client_ip.to_string()),
        KeyStrategy::Tenant => tenant.id.to_string(),
    }
}

/// Whether a request may be replayed against a fresh origin.
///
/// Non-idempotent methods only retry when the caller declared idempotency.
fn is_retry_safe(method: &http::Method, headers: &http::HeaderMap) -> bool {
    matches!(
        *method,
        http::Method::GET | http::Method::HEAD | http::Method::OPTIONS | http::Method::DELETE
    ) || headers.contains_key("idempotency-key")
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Builds the client-facing response for a pipeline error.
fn error_response(err: &GatewayError, trace_id: &str) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(err.status())
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Ok(value) = HeaderValue::try_from(trace_id) {
        builder = builder.header(TRACE_HEADER, value);
    }
    if let GatewayError::RateLimited { remaining } = err {
        builder = builder.header("x-ratelimit-remaining", remaining.to_string());
    }
    builder
        .body(full_body(Bytes::from(err.body())))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Rebuilds a response from a cache entry.
fn cached_response(hit: CachedResponse, trace_id: &str) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(hit.status);
    for (name, value) in &hit.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Ok(value) = HeaderValue::try_from(trace_id) {
        builder = builder.header(TRACE_HEADER, value);
    }
    builder
        .body(full_body(hit.body))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Handles one request end to end and never fails: pipeline errors become
/// their mapped HTTP responses.
pub async fn handle(
    state: Arc<GatewayState>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let trace_id = observability::extract_trace_id(req.headers());
    let mut trace = Trace::new(trace_id.clone());
    let mut record = RequestRecord::new(&req);

    state.metrics.inc_in_flight();
    let outcome = process(&state, peer, req, &mut trace, &mut record).await;
    state.metrics.dec_in_flight();

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            match err.status().as_u16() {
                500..=599 => warn!(trace_id = %trace_id, error = %err, "request failed"),
                _ => debug!(trace_id = %trace_id, error = %err, "request rejected"),
            }
            error_response(&err, &trace_id)
        }
    };

    let status = response.status().as_u16();
    state.metrics.record_request(
        &record.method,
        status,
        latency_ms,
        record.cache_hit,
        record.origin_id,
    );

    if let Some(tenant_id) = record.tenant_id {
        state.log_writer.record(RequestLog {
            id: Uuid::new_v4(),
            tenant_id,
            route_id: record.route_id,
            method: record.method.to_string(),
            path: record.path.clone(),
            query: record.query.clone(),
            status,
            latency_ms,
            cache_hit: record.cache_hit,
            rate_limited: record.rate_limited,
            auth_method: record.auth_method.map(|m| m.to_string()),
            origin_url: record.origin_url.clone(),
            trace_id: trace.id.clone(),
            created_at: Utc::now(),
        });
    }

    info!(
        method = %record.method,
        path = %record.path,
        status,
        latency_ms = format!("{:.1}", latency_ms),
        cache_hit = record.cache_hit,
        spans = trace.spans().len(),
        trace_id = %trace.id,
        "request completed"
    );

    response
}

async fn process(
    state: &Arc<GatewayState>,
    peer: SocketAddr,
    req: Request<Incoming>,
    trace: &mut Trace,
    record: &mut RequestRecord,
) -> Result<Response<ProxyBody>> {
    let (parts, body) = req.into_parts();
    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    // 1. Tenant resolution.
    let tenant = staged(trace, "resolve_tenant", resolve_tenant(state, host.as_deref())).await?;
    record.tenant_id = Some(tenant.id);

    // 2. Route match, through the per-tenant table cache. When the best
    // match's origin is probed unhealthy, the next-ranked match with a
    // healthy origin serves instead; the best match is kept as the
    // degraded fallback if every candidate is down.
    let (route, origin) = staged(trace, "match_route", async {
        let routes = match state.route_cache.get(tenant.id) {
            Some(routes) => routes,
            None => {
                let fetched = state.repos.routes.list_by_tenant(tenant.id).await?;
                state.route_cache.insert(tenant.id, fetched)
            }
        };

        let ranked = matcher::rank_routes(&routes, parts.uri.path(), &parts.method);
        if ranked.is_empty() {
            return Err(GatewayError::RouteNotFound {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
            });
        }

        let mut degraded: Option<(Route, Origin)> = None;
        for candidate in ranked {
            let Ok(origin) = state.repos.origins.get_by_id(candidate.origin_id).await else {
                continue;
            };
            if origin.health_check_path.is_none() || state.health.is_healthy(origin.id) {
                return Ok((candidate.clone(), origin));
            }
            if degraded.is_none() {
                degraded = Some((candidate.clone(), origin));
            }
        }
        degraded.ok_or(GatewayError::NoHealthyOrigin)
    })
    .await?;
    record.route_id = Some(route.id);

    // 3. Authentication.
    let auth = staged(
        trace,
        "authenticate",
        authenticate(state, &parts.headers, &route, &tenant),
    )
    .await?;
    record.auth_method = auth.method;

    // 4. Rate limiting.
    if state.config.rate_limit_enabled && route.rate_limit.enabled {
        let policy = effective_rate_limit(&state.config, &route.rate_limit);
        let key = derive_limit_key(policy.key_strategy, peer.ip(), &auth, &tenant);
        let limiter = state.limiters.acquire(route.id, key, &policy);
        if !limiter.admit(1) {
            record.rate_limited = true;
            debug!(route = %route.name, "rate limit exceeded");
            return Err(GatewayError::RateLimited {
                remaining: limiter.remaining(),
            });
        }
    }

    // 5. Cache lookup.
    let cache_eligible = state.config.cache_enabled
        && route.cache.enabled
        && (parts.method == http::Method::GET || parts.method == http::Method::HEAD)
        && !cache::should_bypass(&route.cache.bypass_rules, &parts.headers);
    let cache_key = cache_eligible.then(|| {
        cache::build_key(
            &route.cache.key_pattern,
            &parts.method,
            parts.uri.path(),
            parts.uri.query(),
            &parts.headers,
        )
    });
    if let Some(key) = &cache_key {
        if let Some(hit) = state.cache.get(key) {
            record.cache_hit = true;
            debug!(key = %key, "cache hit");
            return Ok(cached_response(hit, &trace.id));
        }
    }

    // 6. Origin selection over the healthy subset.
    let candidates = state.health.healthy_subset(std::slice::from_ref(&origin));
    let balancer = state.balancer_for(route.id);
    let lb_key = peer.ip().to_string();

    // The request body is buffered so retries can replay it; responses
    // stream back unbuffered.
    let body_bytes = body.collect().await?.to_bytes();

    // 7. Proxy, re-selecting an origin per attempt.
    let mut span = Span::begin("proxy");
    span.tag("route", route.name.clone());
    let result = proxy_with_retries(
        state, &parts, body_bytes, &candidates, &balancer, &lb_key, &route, peer, &host, record,
    )
    .await;
    match &result {
        Ok(_) => span.end_ok(),
        Err(_) => span.end_error(),
    }
    trace.record(span);
    let (response, guard) = result?;

    // 8. Respond, with cache write-through when eligible.
    let status = response.status();
    let (mut resp_parts, resp_body) = response.into_parts();
    if let Ok(value) = HeaderValue::try_from(trace.id.as_str()) {
        resp_parts.headers.insert(TRACE_HEADER, value);
    }

    if let Some(key) = cache_key.filter(|_| cache::is_cacheable(&parts.method, status)) {
        let collected = resp_body.collect().await?.to_bytes();
        guard.complete();
        state.cache.insert(
            key,
            CachedResponse {
                status: status.as_u16(),
                headers: resp_parts
                    .headers
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), v.to_string()))
                    })
                    .collect(),
                body: collected.clone(),
            },
            route.cache.ttl(),
        );
        return Ok(Response::from_parts(resp_parts, full_body(collected)));
    }

    let streamed = GuardedBody::new(resp_body.boxed(), guard).boxed();
    Ok(Response::from_parts(resp_parts, streamed))
}

#[allow(clippy::too_many_arguments)]
async fn proxy_with_retries(
    state: &Arc<GatewayState>,
    parts: &http::request::Parts,
    body_bytes: Bytes,
    candidates: &[Origin],
    balancer: &Arc<dyn Balancer>,
    lb_key: &str,
    route: &Route,
    peer: SocketAddr,
    host: &Option<String>,
    record: &mut RequestRecord,
) -> Result<(Response<Incoming>, InFlightGuard)> {
    let retry_budget = route.retry_attempts;
    let retry_safe = is_retry_safe(&parts.method, &parts.headers);
    let mut attempt = 0u32;

    loop {
        let origin = balancer.select(Some(lb_key), candidates)?;
        record.origin_id = Some(origin.id);
        record.origin_url = Some(origin.url.clone());
        let guard = InFlightGuard::new(Arc::clone(balancer), origin.id);

        let outcome = state
            .proxy
            .forward(
                parts,
                body_bytes.clone(),
                &origin,
                route,
                peer.ip(),
                host.as_deref(),
            )
            .await;

        match outcome {
            Ok(response) if response.status().is_server_error() => {
                drop(response);
                drop(guard);
                if retry_safe && attempt < retry_budget {
                    attempt += 1;
                    debug!(attempt, origin = %origin.name, "retrying after upstream 5xx");
                    continue;
                }
                return Err(GatewayError::UpstreamUnavailable(format!(
                    "origin answered a server error after {} attempt(s)",
                    attempt + 1
                )));
            }
            Ok(response) => return Ok((response, guard)),
            Err(GatewayError::UpstreamUnavailable(reason)) => {
                drop(guard);
                if retry_safe && attempt < retry_budget {
                    attempt += 1;
                    warn!(attempt, origin = %origin.name, error = %reason, "retrying after upstream error");
                    continue;
                }
                return Err(GatewayError::UpstreamUnavailable(reason));
            }
            // Timeouts are not replayed: the origin may have executed the request.
            Err(other) => {
                drop(guard);
                return Err(other);
            }
        }
    }
}

/// Hyper/tower service handling data-plane requests for one connection.
#[derive(Clone)]
pub struct GatewayService {
    state: Arc<GatewayState>,
    peer: SocketAddr,
}

impl GatewayService {
    pub fn new(state: Arc<GatewayState>, peer: SocketAddr) -> Self {
        Self { state, peer }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let state = Arc::clone(&self.state);
        let peer = self.peer;
        Box::pin(async move { Ok(handle(state, peer, req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::net::{IpAddr, Ipv4Addr};

    fn state() -> Arc<GatewayState> {
        GatewayState::new(GatewayConfig::default(), Repositories::in_memory())
    }

    #[tokio::test]
    async fn test_resolve_tenant_from_host() {
        let state = state();
        let tenant = state
            .repos
            .tenants
            .create(Tenant::new("Acme", "acme"))
            .await
            .unwrap();

        let found = resolve_tenant(&state, Some("acme.example.com"))
            .await
            .unwrap();
        assert_eq!(found.id, tenant.id);

        // Port suffix and mixed case are tolerated.
        let found = resolve_tenant(&state, Some("ACME.example.com:8000"))
            .await
            .unwrap();
        assert_eq!(found.id, tenant.id);
    }

    #[tokio::test]
    async fn test_resolve_tenant_rejects_bad_hosts() {
        let state = state();
        assert!(resolve_tenant(&state, None).await.is_err());
        assert!(resolve_tenant(&state, Some("localhost")).await.is_err());
        assert!(resolve_tenant(&state, Some(".example.com")).await.is_err());
        assert!(matches!(
            resolve_tenant(&state, Some("ghost.example.com")).await,
            Err(GatewayError::UnknownTenant)
        ));
    }

    #[tokio::test]
    async fn test_resolve_tenant_id_uuid_and_external() {
        let state = state();
        let tenant = state
            .repos
            .tenants
            .create(Tenant::new("Acme", "acme").with_external_org_id("org_42"))
            .await
            .unwrap();

        let by_uuid = state.resolve_tenant_id(&tenant.id.to_string()).await.unwrap();
        assert_eq!(by_uuid.id, tenant.id);

        let by_external = state.resolve_tenant_id("org_42").await.unwrap();
        assert_eq!(by_external.id, tenant.id);

        assert!(state.resolve_tenant_id("org_unknown").await.is_err());
    }

    #[test]
    fn test_effective_rate_limit_fills_defaults() {
        let config = GatewayConfig::default();
        let policy = RateLimitPolicy {
            enabled: true,
            ..Default::default()
        };
        let effective = effective_rate_limit(&config, &policy);
        assert_eq!(effective.requests_per_second, config.rate_limit_default_rps);
        assert_eq!(effective.burst, config.rate_limit_default_burst);

        let explicit = RateLimitPolicy {
            enabled: true,
            requests_per_second: 5,
            burst: 7,
            ..Default::default()
        };
        let effective = effective_rate_limit(&config, &explicit);
        assert_eq!(effective.requests_per_second, 5);
        assert_eq!(effective.burst, 7);
    }

    #[test]
    fn test_derive_limit_key_strategies() {
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let tenant = Tenant::new("Acme", "acme");
        let key_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let auth = AuthContext {
            api_key_id: Some(key_id),
            user_id: Some(user_id),
            method: Some("api_key"),
        };

        assert_eq!(derive_limit_key(KeyStrategy::Ip, ip, &auth, &tenant), "1.2.3.4");
        assert_eq!(
            derive_limit_key(KeyStrategy::ApiKey, ip, &auth, &tenant),
            key_id.to_string()
        );
        assert_eq!(
            derive_limit_key(KeyStrategy::User, ip, &auth, &tenant),
            user_id.to_string()
        );
        assert_eq!(
            derive_limit_key(KeyStrategy::Tenant, ip, &auth, &tenant),
            tenant.id.to_string()
        );

        // Anonymous requests fall back to the client IP.
        let anon = AuthContext::default();
        assert_eq!(
            derive_limit_key(KeyStrategy::ApiKey, ip, &anon, &tenant),
            "1.2.3.4"
        );
    }

    #[test]
    fn test_retry_safety() {
        let empty = http::HeaderMap::new();
        assert!(is_retry_safe(&http::Method::GET, &empty));
        assert!(is_retry_safe(&http::Method::DELETE, &empty));
        assert!(!is_retry_safe(&http::Method::POST, &empty));

        let mut with_key = http::HeaderMap::new();
        with_key.insert("idempotency-key", HeaderValue::from_static("abc"));
        assert!(is_retry_safe(&http::Method::POST, &with_key));
    }

    #[test]
    fn test_error_response_shape() {
        let err = GatewayError::RateLimited { remaining: 0 };
        let response = error_response(&err, "trace-1");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(response.headers().get(TRACE_HEADER).unwrap(), "trace-1");

        let err = GatewayError::UnknownTenant;
        let response = error_response(&err, "trace-2");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authenticate_api_key_tenant_scoping() {
        let state = state();
        let tenant = state
            .repos
            .tenants
            .create(Tenant::new("Acme", "acme"))
            .await
            .unwrap();
        let other = state
            .repos
            .tenants
            .create(Tenant::new("Rival", "rival"))
            .await
            .unwrap();

        let (_, plaintext) =
            crate::auth::issue_key(&state.repos.api_keys, tenant.id, "ci", vec!["*".into()])
                .await
                .unwrap();

        let origin = Origin::new(tenant.id, "api", "http://127.0.0.1:1");
        let route = Route::new(tenant.id, origin.id, "r", "/%").with_auth_mode(AuthMode::ApiKey);

        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", plaintext.parse().unwrap());

        let auth = authenticate(&state, &headers, &route, &tenant).await.unwrap();
        assert_eq!(auth.method, Some("api_key"));

        // The same key presented against another tenant is denied.
        let denied = authenticate(&state, &headers, &route, &other).await;
        assert!(matches!(denied, Err(GatewayError::AccessDenied(_))));

        // No credential at all fails authentication.
        let missing = authenticate(&state, &http::HeaderMap::new(), &route, &tenant).await;
        assert!(matches!(missing, Err(GatewayError::AuthFailed(_))));
    }
}
