//! Domain entities shared by the data plane and the configuration store.
//!
//! Entities reference each other by id only; in-memory caches hold their own
//! copies so an entry never dangles after a configuration change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

fn new_id() -> Uuid {
    Uuid::new_v4()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

/// An isolated customer domain of configuration and traffic.
///
/// The `subdomain` (first DNS label of the request Host) is the routing
/// identity; `external_org_id` links the tenant to an external organization
/// directory when one is in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    #[serde(default = "new_id")]
    pub id: Uuid,
    pub name: String,
    /// Lowercase DNS label, unique across tenants.
    pub subdomain: String,
    #[serde(default)]
    pub external_org_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, subdomain: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            subdomain: subdomain.into().to_lowercase(),
            external_org_id: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_external_org_id(mut self, external_org_id: impl Into<String>) -> Self {
        self.external_org_id = Some(external_org_id.into());
        self
    }
}

/// A backend HTTP endpoint owned by a tenant.
///
/// `is_healthy` and `last_check` are runtime state written only by the
/// health checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default = "new_id")]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Absolute base URL, e.g. `http://10.0.1.5:8080`.
    pub url: String,
    /// Probe path; `None` means the origin is implicitly healthy.
    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default = "Origin::default_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "Origin::default_probe_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "Origin::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Origin {
    fn default_interval_secs() -> u64 {
        10
    }

    fn default_probe_timeout_secs() -> u64 {
        5
    }

    fn default_timeout_secs() -> u64 {
        30
    }

    pub fn new(tenant_id: Uuid, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            url: url.into(),
            health_check_path: None,
            health_check_interval_secs: Self::default_interval_secs(),
            health_check_timeout_secs: Self::default_probe_timeout_secs(),
            timeout_secs: Self::default_timeout_secs(),
            max_retries: 0,
            weight: 1,
            is_healthy: true,
            last_check: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = Some(path.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Per-request timeout for traffic proxied to this origin.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How a route authenticates callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    ApiKey,
    Jwt,
}

/// Which request attribute identifies a rate-limit bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Ip,
    ApiKey,
    User,
    Tenant,
}

/// Rate-limit algorithm applied to a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// Per-route rate-limit policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub requests_per_second: u32,
    #[serde(default)]
    pub burst: u32,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
}

/// A request attribute pattern that forces a cache miss when matched.
///
/// `header` names a request header (cookies arrive as the `cookie` header);
/// `pattern` uses the same wildcard syntax as route path patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBypassRule {
    pub header: String,
    pub pattern: String,
}

/// Per-route response-cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "CachePolicy::default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "CachePolicy::default_key_pattern")]
    pub key_pattern: String,
    #[serde(default)]
    pub bypass_rules: Vec<CacheBypassRule>,
}

impl CachePolicy {
    fn default_ttl_secs() -> u64 {
        300
    }

    fn default_key_pattern() -> String {
        "{method}:{path}:{query}".to_string()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: Self::default_ttl_secs(),
            key_pattern: Self::default_key_pattern(),
            bypass_rules: Vec::new(),
        }
    }
}

/// Path rewrite applied before proxying: every occurrence of `pattern` in
/// the request path is replaced with `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRewrite {
    pub pattern: String,
    pub target: String,
}

/// A routing rule for a tenant.
///
/// `path_pattern` uses SQL-LIKE wildcards: `_` matches any single character,
/// `%` matches any run of characters (including none), everything else is
/// literal, and the pattern is anchored at both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    #[serde(default = "new_id")]
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// The origin requests are forwarded to. Must belong to the same tenant.
    pub origin_id: Uuid,
    pub name: String,
    pub path_pattern: String,
    /// Allowed HTTP methods, uppercase.
    pub methods: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub cache: CachePolicy,
    /// Headers added to the proxied request.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Headers added to the proxied response.
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub path_rewrite: Option<PathRewrite>,
    #[serde(default = "Route::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Route {
    fn default_timeout_secs() -> u64 {
        30
    }

    pub fn new(
        tenant_id: Uuid,
        origin_id: Uuid,
        name: impl Into<String>,
        path_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            origin_id,
            name: name.into(),
            path_pattern: path_pattern.into(),
            methods: vec!["GET".to_string()],
            priority: 0,
            auth_mode: AuthMode::None,
            is_active: true,
            rate_limit: RateLimitPolicy::default(),
            cache: CachePolicy::default(),
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            path_rewrite: None,
            timeout_secs: Self::default_timeout_secs(),
            retry_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_uppercase()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rewrite(mut self, pattern: impl Into<String>, target: impl Into<String>) -> Self {
        self.path_rewrite = Some(PathRewrite {
            pattern: pattern.into(),
            target: target.into(),
        });
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Checks whether the route's method set contains `method`.
    pub fn allows_method(&self, method: &http::Method) -> bool {
        self.methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Per-request timeout for this route.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A tenant-scoped credential.
///
/// Only the hex-encoded SHA-256 of the plaintext is ever stored; the
/// plaintext is shown once at creation and discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default = "new_id")]
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub name: String,
    /// First characters of the plaintext, for display.
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// Granted scopes; `*` grants everything.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Checks whether the key grants `scope` (directly or via `*`).
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp < at)
    }
}

/// An immutable observation of one handled request. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub route_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub status: u16,
    pub latency_ms: f64,
    pub cache_hit: bool,
    pub rate_limited: bool,
    pub auth_method: Option<String>,
    pub origin_url: Option<String>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_allows_method() {
        let route = Route::new(Uuid::new_v4(), Uuid::new_v4(), "api", "/api/%")
            .with_methods(&["GET", "POST"]);

        assert!(route.allows_method(&http::Method::GET));
        assert!(route.allows_method(&http::Method::POST));
        assert!(!route.allows_method(&http::Method::DELETE));
    }

    #[test]
    fn test_api_key_scopes() {
        let mut key = ApiKey {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            user_id: None,
            name: "test".into(),
            key_prefix: "ve_live_ab".into(),
            key_hash: String::new(),
            scopes: vec!["read".into()],
            expires_at: None,
            last_used_at: None,
            usage_count: 0,
            is_active: true,
            created_at: Utc::now(),
        };

        assert!(key.has_scope("read"));
        assert!(!key.has_scope("write"));

        key.scopes = vec!["*".into()];
        assert!(key.has_scope("write"));
    }

    #[test]
    fn test_api_key_expiry() {
        let mut key = ApiKey {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            user_id: None,
            name: "test".into(),
            key_prefix: String::new(),
            key_hash: String::new(),
            scopes: Vec::new(),
            expires_at: None,
            last_used_at: None,
            usage_count: 0,
            is_active: true,
            created_at: Utc::now(),
        };

        assert!(!key.is_expired(Utc::now()));

        key.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(key.is_expired(Utc::now()));
    }

    #[test]
    fn test_origin_weight_floor() {
        let origin = Origin::new(Uuid::new_v4(), "api", "http://10.0.0.1:8080").with_weight(0);
        assert_eq!(origin.weight, 1);
    }

    #[test]
    fn test_route_deserializes_with_defaults() {
        let toml = r#"
            tenant_id = "6f1c8ef4-51f1-4f44-9da7-12f19e1a9f9e"
            origin_id = "5b6a2f0f-1111-4f44-9da7-12f19e1a9f9e"
            name = "users"
            path_pattern = "/api/users"
            methods = ["GET"]
        "#;

        let route: Route = toml::from_str(toml).unwrap();
        assert!(route.is_active);
        assert_eq!(route.auth_mode, AuthMode::None);
        assert!(!route.rate_limit.enabled);
        assert_eq!(route.cache.key_pattern, "{method}:{path}:{query}");
    }
}
