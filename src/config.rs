//! Gateway configuration.
//!
//! Runtime settings come from environment variables; a static bootstrap file
//! can seed tenants, origins, and routes for standalone operation.

use crate::balancer::LbStrategy;
use crate::error::{GatewayError, Result};
use crate::model::{Origin, Route, Tenant};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Gateway configuration loaded at startup.
///
/// Immutable after initialization and shared across tasks via `Arc`.
///
/// # Environment Variables
///
/// * `GATEWAY_ADDR` - Listen address (default: "0.0.0.0"), combined with `GATEWAY_PORT` (default: 8000)
/// * `ADMIN_ADDR` - Admin endpoint address (default: "127.0.0.1:9090")
/// * `LB_STRATEGY` - round_robin | least_conn | consistent_hash (default: round_robin)
/// * `LB_HEALTH_CHECK_INTERVAL` / `LB_HEALTH_CHECK_TIMEOUT` - probe cadence (defaults: 10s / 5s)
/// * `RATE_LIMIT_ENABLED`, `RATE_LIMIT_DEFAULT_RPS`, `RATE_LIMIT_DEFAULT_BURST`
/// * `CACHE_ENABLED`, `CACHE_DEFAULT_TTL`, `CACHE_MAX_SIZE_MB`
/// * `ROUTE_CACHE_TTL` - per-tenant route table cache TTL (default: 10s)
/// * `BOOTSTRAP_FILE` - optional TOML file seeding the in-memory store
///
/// Durations accept `ms`, `s`, `m`, `h` suffixes (a bare integer is seconds);
/// booleans accept true/false/1/0.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub admin_addr: String,
    pub lb_strategy: LbStrategy,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub rate_limit_enabled: bool,
    pub rate_limit_default_rps: u32,
    pub rate_limit_default_burst: u32,
    /// Upper bound on distinct keyed rate limiters held in memory.
    pub rate_limiter_capacity: usize,
    pub cache_enabled: bool,
    pub cache_default_ttl: Duration,
    pub cache_max_bytes: usize,
    pub route_cache_ttl: Duration,
    pub bootstrap_file: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            lb_strategy: LbStrategy::RoundRobin,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(5),
            rate_limit_enabled: true,
            rate_limit_default_rps: 100,
            rate_limit_default_burst: 200,
            rate_limiter_capacity: 10_000,
            cache_enabled: true,
            cache_default_ttl: Duration::from_secs(300),
            cache_max_bytes: 512 * 1024 * 1024,
            route_cache_ttl: Duration::from_secs(10),
            bootstrap_file: None,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = env_str("GATEWAY_ADDR", "0.0.0.0");
        let port = env_u32("GATEWAY_PORT", 8000);

        let lb_strategy = match env::var("LB_STRATEGY") {
            Ok(raw) => raw
                .parse::<LbStrategy>()
                .map_err(GatewayError::InvalidConfig)?,
            Err(_) => LbStrategy::RoundRobin,
        };

        Ok(Self {
            listen_addr: format!("{}:{}", host, port),
            admin_addr: env_str("ADMIN_ADDR", &defaults.admin_addr),
            lb_strategy,
            health_check_interval: env_duration(
                "LB_HEALTH_CHECK_INTERVAL",
                defaults.health_check_interval,
            ),
            health_check_timeout: env_duration(
                "LB_HEALTH_CHECK_TIMEOUT",
                defaults.health_check_timeout,
            ),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_default_rps: env_u32("RATE_LIMIT_DEFAULT_RPS", 100),
            rate_limit_default_burst: env_u32("RATE_LIMIT_DEFAULT_BURST", 200),
            rate_limiter_capacity: env_u32("RATE_LIMIT_MAX_KEYS", 10_000) as usize,
            cache_enabled: env_bool("CACHE_ENABLED", true),
            cache_default_ttl: env_duration("CACHE_DEFAULT_TTL", defaults.cache_default_ttl),
            cache_max_bytes: env_u32("CACHE_MAX_SIZE_MB", 512) as usize * 1024 * 1024,
            route_cache_ttl: env_duration("ROUTE_CACHE_TTL", defaults.route_cache_ttl),
            bootstrap_file: env::var("BOOTSTRAP_FILE").ok(),
        })
    }
}

/// Parses a duration string with `ms`, `s`, `m`, or `h` suffix.
///
/// A bare integer is interpreted as seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let value: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim() {
            "1" => true,
            "0" => false,
            other => other.parse().unwrap_or(default),
        },
        Err(_) => default,
    }
}

fn env_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| parse_duration(&s))
        .unwrap_or(default)
}

/// Static configuration seeding the in-memory store for standalone runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub origins: Vec<Origin>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl BootstrapConfig {
    /// Loads bootstrap configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GatewayError::InvalidConfig(e.to_string()))
    }

    /// Loads bootstrap configuration from a file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.lb_strategy, LbStrategy::RoundRobin);
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert!(config.cache_enabled);
    }

    #[test]
    fn test_bootstrap_from_toml() {
        let content = r#"
            [[tenants]]
            name = "Acme"
            subdomain = "acme"

            [[origins]]
            tenant_id = "00000000-0000-0000-0000-000000000001"
            name = "api"
            url = "http://127.0.0.1:8080"

            [[routes]]
            tenant_id = "00000000-0000-0000-0000-000000000001"
            origin_id = "00000000-0000-0000-0000-000000000002"
            name = "catch-all"
            path_pattern = "/%"
            methods = ["GET", "POST"]
        "#;

        let bootstrap = BootstrapConfig::from_toml(content).unwrap();
        assert_eq!(bootstrap.tenants.len(), 1);
        assert_eq!(bootstrap.tenants[0].subdomain, "acme");
        assert_eq!(bootstrap.origins.len(), 1);
        assert_eq!(bootstrap.routes.len(), 1);
        assert!(bootstrap.routes[0].is_active);
    }
}
