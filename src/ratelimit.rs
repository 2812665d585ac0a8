//! Rate limiting.
//!
//! Two admission algorithms behind one capability: a token bucket (rate plus
//! burst) and a sliding window (hard per-window ceiling). The pipeline keys
//! limiters by (route, derived key) and holds them in a bounded registry
//! with least-recently-used eviction.

use crate::model::{RateLimitAlgorithm, RateLimitPolicy};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Admission decision capability shared by all limiter variants.
///
/// `remaining` reports the budget left after the most recent decision and
/// feeds the `X-RateLimit-Remaining` response header.
pub trait RateLimiter: Send + Sync {
    fn admit(&self, n: u32) -> bool;
    fn remaining(&self) -> u64;
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: capacity C, refilled at R tokens per second.
///
/// Time arithmetic uses the monotonic clock; the token count never goes
/// negative and never exceeds capacity.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

impl RateLimiter for TokenBucket {
    fn admit(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as u64
    }
}

/// Sliding window: at most `max_requests` admissions in any window.
///
/// Keeps the timestamps of admitted requests and prunes those older than
/// the window on every query, so memory stays O(max_requests).
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    admissions: Mutex<Vec<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            admissions: Mutex::new(Vec::with_capacity(max_requests)),
        }
    }

    fn prune(&self, admissions: &mut Vec<Instant>) {
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            admissions.retain(|t| *t > cutoff);
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn admit(&self, n: u32) -> bool {
        let mut admissions = self.admissions.lock();
        self.prune(&mut admissions);
        if admissions.len() + n as usize <= self.max_requests {
            let now = Instant::now();
            for _ in 0..n {
                admissions.push(now);
            }
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u64 {
        let mut admissions = self.admissions.lock();
        self.prune(&mut admissions);
        (self.max_requests - admissions.len()) as u64
    }
}

/// Builds the limiter a route's policy asks for.
///
/// For the token bucket, burst is the capacity and requests-per-second the
/// refill rate; for the sliding window, requests-per-second bounds a
/// one-second window.
pub fn build(policy: &RateLimitPolicy) -> Arc<dyn RateLimiter> {
    match policy.algorithm {
        RateLimitAlgorithm::TokenBucket => Arc::new(TokenBucket::new(
            policy.burst.max(1) as f64,
            policy.requests_per_second.max(1) as f64,
        )),
        RateLimitAlgorithm::SlidingWindow => Arc::new(SlidingWindow::new(
            policy.requests_per_second.max(1) as usize,
            Duration::from_secs(1),
        )),
    }
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct LimiterId {
    route_id: Uuid,
    key: String,
}

struct LimiterEntry {
    limiter: Arc<dyn RateLimiter>,
    last_access: Mutex<Instant>,
}

/// Bounded registry of keyed limiters.
///
/// Entries are created on first sight of a (route, key) pair and evicted
/// least-recently-used once the registry exceeds its capacity.
pub struct LimiterRegistry {
    entries: DashMap<LimiterId, Arc<LimiterEntry>>,
    capacity: usize,
}

impl LimiterRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Looks up or creates the limiter for (route, key).
    pub fn acquire(
        &self,
        route_id: Uuid,
        key: String,
        policy: &RateLimitPolicy,
    ) -> Arc<dyn RateLimiter> {
        let id = LimiterId { route_id, key };
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| {
                Arc::new(LimiterEntry {
                    limiter: build(policy),
                    last_access: Mutex::new(Instant::now()),
                })
            })
            .clone();
        *entry.last_access.lock() = Instant::now();

        if self.entries.len() > self.capacity {
            self.evict_lru();
        }

        Arc::clone(&entry.limiter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| *e.value().last_access.lock())
                .map(|e| e.key().clone());
            let Some(oldest) = oldest else { break };
            self.entries.remove(&oldest);
            debug!("evicted least-recently-used rate limiter");
        }
    }
}
