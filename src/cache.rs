//! Response caching with per-entry TTL.
//!
//! Entries store the full (status, headers, body) of a past response and
//! expire lazily on read; a background sweeper reclaims memory for entries
//! nobody asks for again. Total size is byte-bounded with
//! least-recently-used eviction.

use crate::matcher::like_match;
use crate::model::CacheBypassRule;
use hyper::body::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Sweep cadence for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait for the sweeper to wind down at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// A serialized response held by the cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
    size: usize,
    last_access: Mutex<Instant>,
}

/// In-memory response cache.
///
/// Reads take the shared lock and verify expiry inline, so a stale entry is
/// never served even before the sweeper gets to it.
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_bytes: usize,
    current_bytes: AtomicUsize,
    stop_tx: broadcast::Sender<()>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResponseCache {
    pub fn new(max_bytes: usize) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            entries: RwLock::new(HashMap::new()),
            max_bytes: max_bytes.max(1),
            current_bytes: AtomicUsize::new(0),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Returns the cached response for `key` if present and unexpired.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        *entry.last_access.lock() = Instant::now();
        Some(entry.response.clone())
    }

    /// Stores a response under `key` for `ttl`.
    pub fn insert(&self, key: String, response: CachedResponse, ttl: Duration) {
        let size = response.size();
        if size > self.max_bytes {
            debug!(key = %key, size, "response larger than cache, not stored");
            return;
        }

        let mut entries = self.entries.write();
        if let Some(previous) = entries.remove(&key) {
            self.current_bytes.fetch_sub(previous.size, Ordering::Relaxed);
        }
        entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: Instant::now() + ttl,
                size,
                last_access: Mutex::new(Instant::now()),
            },
        );
        self.current_bytes.fetch_add(size, Ordering::Relaxed);

        while self.current_bytes.load(Ordering::Relaxed) > self.max_bytes {
            let lru_key = entries
                .iter()
                .min_by_key(|(_, e)| *e.last_access.lock())
                .map(|(k, _)| k.clone());
            let Some(lru_key) = lru_key else { break };
            if let Some(evicted) = entries.remove(&lru_key) {
                self.current_bytes.fetch_sub(evicted.size, Ordering::Relaxed);
                debug!(key = %lru_key, "evicted cache entry over byte budget");
            }
        }
    }

    /// Removes a single entry.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.remove(key) {
            self.current_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        }
    }

    /// Number of live entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bytes currently held.
    pub fn size_bytes(&self) -> usize {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Spawns the periodic expiry sweeper.
    pub fn start_sweeper(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let cache = Arc::clone(&self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => cache.sweep(),
                }
            }
            debug!("cache sweeper stopped");
        });

        *self.handle.lock() = Some(handle);
    }

    /// Signals the sweeper and joins it, abandoning after a deadline.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
                warn!("cache sweeper did not stop within deadline, abandoning");
            }
        }
    }

    /// Evicts every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut freed = 0usize;
        entries.retain(|_, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                freed += entry.size;
            }
            keep
        });
        if freed > 0 {
            self.current_bytes.fetch_sub(freed, Ordering::Relaxed);
            debug!(evicted = before - entries.len(), "swept expired cache entries");
        }
    }
}

/// Builds a cache key from a route's key pattern.
///
/// Placeholders: `{method}`, `{path}`, `{query}`, and `{header:Name}` for
/// any request header (empty string when absent).
pub fn build_key(
    pattern: &str,
    method: &http::Method,
    path: &str,
    query: Option<&str>,
    headers: &http::HeaderMap,
) -> String {
    let mut key = pattern
        .replace("{method}", method.as_str())
        .replace("{path}", path)
        .replace("{query}", query.unwrap_or(""));

    while let Some(start) = key.find("{header:") {
        let Some(rel_end) = key[start..].find('}') else {
            break;
        };
        let end = start + rel_end;
        let name = &key[start + "{header:".len()..end];
        let value = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        key.replace_range(start..=end, value);
    }

    key
}

/// Checks whether any bypass rule matches the request headers.
pub fn should_bypass(rules: &[CacheBypassRule], headers: &http::HeaderMap) -> bool {
    rules.iter().any(|rule| {
        headers
            .get(&rule.header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|value| like_match(&rule.pattern, value))
    })
}

/// Whether a response is eligible for caching: 2xx to an idempotent read.
pub fn is_cacheable(method: &http::Method, status: http::StatusCode) -> bool {
    (method == http::Method::GET || method == http::Method::HEAD) && status.is_success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(body: &'static [u8]) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_cache_round_trip() {
        let cache = ResponseCache::new(1024 * 1024);
        cache.insert("k".into(), response(b"hello"), Duration::from_secs(5));

        let hit = cache.get("k").unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(&hit.body[..], b"hello");

        assert!(cache.get("other").is_none());
    }

    #[test]
    fn test_cache_expires_lazily() {
        let cache = ResponseCache::new(1024 * 1024);
        cache.insert("k".into(), response(b"hello"), Duration::from_millis(20));

        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(30));
        // Expired entry is refused on read even before any sweep.
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 1);

        cache.sweep();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_cache_byte_bound_evicts_lru() {
        let cache = ResponseCache::new(100);

        let big = CachedResponse {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from(vec![0u8; 60]),
        };
        cache.insert("a".into(), big.clone(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), big.clone(), Duration::from_secs(60));

        // "a" is least recently used and must have been evicted.
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.size_bytes() <= 100);
    }

    #[test]
    fn test_cache_rejects_oversized_response() {
        let cache = ResponseCache::new(10);
        let big = CachedResponse {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from(vec![0u8; 100]),
        };
        cache.insert("a".into(), big, Duration::from_secs(60));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_build_key_placeholders() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-version", HeaderValue::from_static("v2"));

        let key = build_key(
            "{method}:{path}:{query}:{header:X-Api-Version}",
            &http::Method::GET,
            "/api/users",
            Some("page=2"),
            &headers,
        );
        assert_eq!(key, "GET:/api/users:page=2:v2");
    }

    #[test]
    fn test_build_key_missing_parts_are_empty() {
        let headers = http::HeaderMap::new();
        let key = build_key(
            "{method}:{path}:{query}:{header:X-Missing}",
            &http::Method::GET,
            "/x",
            None,
            &headers,
        );
        assert_eq!(key, "GET:/x::");
    }

    #[test]
    fn test_bypass_rules() {
        let rules = vec![CacheBypassRule {
            header: "cache-control".into(),
            pattern: "%no-cache%".into(),
        }];

        let mut headers = http::HeaderMap::new();
        assert!(!should_bypass(&rules, &headers));

        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        assert!(should_bypass(&rules, &headers));
    }

    #[test]
    fn test_cacheability() {
        assert!(is_cacheable(&http::Method::GET, http::StatusCode::OK));
        assert!(is_cacheable(&http::Method::HEAD, http::StatusCode::NO_CONTENT));
        assert!(!is_cacheable(&http::Method::POST, http::StatusCode::OK));
        assert!(!is_cacheable(&http::Method::GET, http::StatusCode::NOT_FOUND));
        assert!(!is_cacheable(
            &http::Method::GET,
            http::StatusCode::INTERNAL_SERVER_ERROR
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweeper_lifecycle() {
        let cache = Arc::new(ResponseCache::new(1024));
        Arc::clone(&cache).start_sweeper();
        cache.stop().await;
    }
}
