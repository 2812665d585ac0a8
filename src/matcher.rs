//! Route matching.
//!
//! Path patterns use SQL-LIKE wildcards: `_` matches any single character,
//! `%` matches any run (including empty), everything else is literal, and
//! patterns are anchored at both ends. Patterns are translated to regexes
//! once and cached.

use crate::model::Route;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Global pattern cache to avoid recompiling on every request.
static PATTERN_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Translates a LIKE pattern into an anchored regex.
fn translate_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn get_or_compile(pattern: &str) -> Option<Arc<Regex>> {
    {
        let cache = PATTERN_CACHE.read();
        if let Some(regex) = cache.get(pattern) {
            return Some(Arc::clone(regex));
        }
    }

    match Regex::new(&translate_pattern(pattern)) {
        Ok(regex) => {
            let regex = Arc::new(regex);
            let mut cache = PATTERN_CACHE.write();
            cache.insert(pattern.to_string(), Arc::clone(&regex));
            Some(regex)
        }
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid path pattern");
            None
        }
    }
}

/// Checks whether `text` matches the LIKE `pattern`.
pub fn like_match(pattern: &str, text: &str) -> bool {
    get_or_compile(pattern).is_some_and(|regex| regex.is_match(text))
}

/// All active routes matching (path, method), best first.
///
/// Ordering: highest priority, ties broken by earliest `created_at`, then
/// by id, so ranking is stable under re-ordering of the input.
pub fn rank_routes<'a>(
    routes: &'a [Route],
    path: &str,
    method: &http::Method,
) -> Vec<&'a Route> {
    let mut matched: Vec<&Route> = routes
        .iter()
        .filter(|route| {
            route.is_active
                && route.allows_method(method)
                && like_match(&route.path_pattern, path)
        })
        .collect();

    matched.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    matched
}

/// Selects the best route for (path, method) from a tenant's route table.
pub fn select_route<'a>(
    routes: &'a [Route],
    path: &str,
    method: &http::Method,
) -> Option<&'a Route> {
    let best = rank_routes(routes, path, method).into_iter().next();
    if let Some(route) = best {
        debug!(route = %route.name, priority = route.priority, "matched route");
    }
    best
}

struct CachedTable {
    routes: Arc<Vec<Route>>,
    fetched_at: Instant,
}

/// Per-tenant route table cache with a bounded TTL.
///
/// Entries hold owned copies of the routes; an explicit invalidation hook
/// serves configuration-change notifications.
pub struct RouteCache {
    ttl: Duration,
    tables: RwLock<HashMap<Uuid, CachedTable>>,
}

impl RouteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached table for a tenant if still fresh.
    pub fn get(&self, tenant_id: Uuid) -> Option<Arc<Vec<Route>>> {
        let tables = self.tables.read();
        tables.get(&tenant_id).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(Arc::clone(&entry.routes))
            } else {
                None
            }
        })
    }

    pub fn insert(&self, tenant_id: Uuid, routes: Vec<Route>) -> Arc<Vec<Route>> {
        let routes = Arc::new(routes);
        let mut tables = self.tables.write();
        tables.insert(
            tenant_id,
            CachedTable {
                routes: Arc::clone(&routes),
                fetched_at: Instant::now(),
            },
        );
        routes
    }

    /// Drops the cached table for one tenant.
    pub fn invalidate(&self, tenant_id: Uuid) {
        self.tables.write().remove(&tenant_id);
    }

    /// Drops every cached table.
    pub fn invalidate_all(&self) {
        self.tables.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    #[test]
    fn test_like_match_literal() {
        assert!(like_match("/api/users", "/api/users"));
        assert!(!like_match("/api/users", "/api/users/1"));
        assert!(!like_match("/api/users", "/api"));
    }

    #[test]
    fn test_like_match_percent() {
        assert!(like_match("/api/%", "/api/users"));
        assert!(like_match("/api/%", "/api/"));
        assert!(like_match("%", "/anything/at/all"));
        assert!(!like_match("/api/%", "/v2/api/users"));
    }

    #[test]
    fn test_like_match_underscore() {
        assert!(like_match("/api/v_", "/api/v1"));
        assert!(like_match("/api/v_", "/api/v2"));
        assert!(!like_match("/api/v_", "/api/v10"));
    }

    #[test]
    fn test_like_match_escapes_regex_metacharacters() {
        assert!(like_match("/api/users.json", "/api/users.json"));
        assert!(!like_match("/api/users.json", "/api/usersXjson"));
        assert!(like_match("/a+b", "/a+b"));
        assert!(!like_match("/a+b", "/aab"));
    }

    fn route(pattern: &str, methods: &[&str], priority: i32) -> Route {
        Route::new(Uuid::nil(), Uuid::nil(), pattern, pattern)
            .with_methods(methods)
            .with_priority(priority)
    }

    #[test]
    fn test_select_route_priority() {
        let routes = vec![
            route("/api/%", &["GET", "POST"], 10),
            route("/api/users", &["GET"], 20),
        ];

        let found = select_route(&routes, "/api/users", &http::Method::GET).unwrap();
        assert_eq!(found.path_pattern, "/api/users");

        // POST only matches the wildcard route.
        let found = select_route(&routes, "/api/users", &http::Method::POST).unwrap();
        assert_eq!(found.path_pattern, "/api/%");
    }

    #[test]
    fn test_select_route_method_filter() {
        let routes = vec![route("/api/%", &["GET"], 10)];
        assert!(select_route(&routes, "/api/users", &http::Method::DELETE).is_none());
    }

    #[test]
    fn test_select_route_skips_inactive() {
        let mut inactive = route("/api/users", &["GET"], 50);
        inactive.is_active = false;
        let routes = vec![inactive, route("/api/%", &["GET"], 10)];

        let found = select_route(&routes, "/api/users", &http::Method::GET).unwrap();
        assert_eq!(found.path_pattern, "/api/%");
    }

    #[test]
    fn test_select_route_tie_breaks_by_created_at() {
        let mut older = route("/api/%", &["GET"], 10);
        older.created_at = Utc::now() - ChronoDuration::hours(1);
        let newer = route("/api/_%", &["GET"], 10);

        let routes = vec![newer.clone(), older.clone()];
        let found = select_route(&routes, "/api/users", &http::Method::GET).unwrap();
        assert_eq!(found.id, older.id);
    }

    #[test]
    fn test_rank_routes_orders_best_first() {
        let wide = route("/api/%", &["GET"], 10);
        let narrow = route("/api/users", &["GET"], 20);
        let routes = vec![wide.clone(), narrow.clone()];

        let ranked = rank_routes(&routes, "/api/users", &http::Method::GET);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, narrow.id);
        assert_eq!(ranked[1].id, wide.id);
    }

    #[test]
    fn test_select_route_no_match() {
        let routes = vec![route("/api/%", &["GET"], 10)];
        assert!(select_route(&routes, "/other", &http::Method::GET).is_none());
    }

    #[test]
    fn test_route_cache_ttl() {
        let cache = RouteCache::new(Duration::from_millis(50));
        let tenant_id = Uuid::new_v4();

        assert!(cache.get(tenant_id).is_none());

        cache.insert(tenant_id, vec![route("/api/%", &["GET"], 1)]);
        assert!(cache.get(tenant_id).is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(tenant_id).is_none());
    }

    #[test]
    fn test_route_cache_invalidate() {
        let cache = RouteCache::new(Duration::from_secs(60));
        let tenant_id = Uuid::new_v4();

        cache.insert(tenant_id, Vec::new());
        assert!(cache.get(tenant_id).is_some());

        cache.invalidate(tenant_id);
        assert!(cache.get(tenant_id).is_none());
    }
}
