//! Metrics, tracing, and the request-log writer.
//!
//! The metrics aggregator is injected through the pipeline rather than held
//! as ambient state, so tests stay deterministic. It keeps a JSON-friendly
//! snapshot alongside a Prometheus registry exposed on the admin listener.

use crate::model::RequestLog;
use crate::repository::RequestLogRepository;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Labels for HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
}

struct LatencyStats {
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    count: u64,
}

/// Request metrics aggregator.
///
/// Counters are monotonic; latency keeps a rolling min/max/avg. `snapshot`
/// returns an owned copy and `encode` renders the Prometheus mirror.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    errors_total: Family<RequestLabels, Counter>,
    cache_hits_total: Counter,
    cache_misses_total: Counter,
    requests_in_flight: Gauge<i64, AtomicI64>,

    total_requests: AtomicU64,
    total_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    status_codes: DashMap<u16, u64>,
    origin_requests: DashMap<Uuid, u64>,
    origin_errors: DashMap<Uuid, u64>,
    latency: Mutex<LatencyStats>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gateway_requests_total",
            "Total number of handled requests",
            requests_total.clone(),
        );

        let errors_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gateway_errors_total",
            "Total number of error responses (4xx and 5xx)",
            errors_total.clone(),
        );

        let cache_hits_total = Counter::default();
        registry.register(
            "gateway_cache_hits_total",
            "Responses served from the cache",
            cache_hits_total.clone(),
        );

        let cache_misses_total = Counter::default();
        registry.register(
            "gateway_cache_misses_total",
            "Requests that missed the cache",
            cache_misses_total.clone(),
        );

        let requests_in_flight = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "gateway_requests_in_flight",
            "Requests currently being handled",
            requests_in_flight.clone(),
        );

        Self {
            registry,
            requests_total,
            errors_total,
            cache_hits_total,
            cache_misses_total,
            requests_in_flight,
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            status_codes: DashMap::new(),
            origin_requests: DashMap::new(),
            origin_errors: DashMap::new(),
            latency: Mutex::new(LatencyStats {
                min_ms: f64::INFINITY,
                max_ms: 0.0,
                sum_ms: 0.0,
                count: 0,
            }),
        }
    }

    /// Records one handled request.
    pub fn record_request(
        &self,
        method: &http::Method,
        status: u16,
        latency_ms: f64,
        cache_hit: bool,
        origin_id: Option<Uuid>,
    ) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
        };
        self.requests_total.get_or_create(&labels).inc();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        *self.status_codes.entry(status).or_insert(0) += 1;

        if status >= 400 {
            self.errors_total.get_or_create(&labels).inc();
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            if let Some(origin_id) = origin_id {
                *self.origin_errors.entry(origin_id).or_insert(0) += 1;
            }
        }

        if let Some(origin_id) = origin_id {
            *self.origin_requests.entry(origin_id).or_insert(0) += 1;
        }

        if cache_hit {
            self.cache_hits_total.inc();
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses_total.inc();
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut latency = self.latency.lock();
        latency.min_ms = latency.min_ms.min(latency_ms);
        latency.max_ms = latency.max_ms.max(latency_ms);
        latency.sum_ms += latency_ms;
        latency.count += 1;
    }

    pub fn inc_in_flight(&self) {
        self.requests_in_flight.inc();
    }

    pub fn dec_in_flight(&self) {
        self.requests_in_flight.dec();
    }

    /// Owned copy of the aggregate counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency.lock();
        let (min_ms, avg_ms) = if latency.count == 0 {
            (None, 0.0)
        } else {
            (Some(latency.min_ms), latency.sum_ms / latency.count as f64)
        };

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            min_latency_ms: min_ms,
            max_latency_ms: latency.max_ms,
            avg_latency_ms: avg_ms,
            status_codes: self
                .status_codes
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            origin_requests: self
                .origin_requests
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            origin_errors: self
                .origin_errors
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
        }
    }

    /// Encodes the Prometheus mirror in text exposition format.
    pub fn encode(&self) -> Result<String, io::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time export of the aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub status_codes: HashMap<u16, u64>,
    pub origin_requests: HashMap<Uuid, u64>,
    pub origin_errors: HashMap<Uuid, u64>,
}

/// Header carrying the trace id across hops.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Trace id from the inbound request, or a fresh one.
pub fn extract_trace_id(headers: &http::HeaderMap) -> String {
    headers
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Outcome of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Running,
    Ok,
    Error,
}

/// One timed stage of a request.
#[derive(Debug)]
pub struct Span {
    pub operation: &'static str,
    start: Instant,
    end: Option<Instant>,
    pub status: SpanStatus,
    tags: HashMap<&'static str, String>,
}

impl Span {
    pub fn begin(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
            end: None,
            status: SpanStatus::Running,
            tags: HashMap::new(),
        }
    }

    pub fn tag(&mut self, key: &'static str, value: impl Into<String>) {
        self.tags.insert(key, value.into());
    }

    pub fn tags(&self) -> &HashMap<&'static str, String> {
        &self.tags
    }

    pub fn end_ok(&mut self) {
        self.end = Some(Instant::now());
        self.status = SpanStatus::Ok;
    }

    pub fn end_error(&mut self) {
        self.end = Some(Instant::now());
        self.status = SpanStatus::Error;
    }

    /// Span duration; before `end` the current time stands in.
    pub fn duration(&self) -> Duration {
        self.end.unwrap_or_else(Instant::now) - self.start
    }
}

/// The spans of one request, keyed by its trace id.
#[derive(Debug)]
pub struct Trace {
    pub id: String,
    spans: Vec<Span>,
}

impl Trace {
    pub fn new(id: String) -> Self {
        Self {
            id,
            spans: Vec::new(),
        }
    }

    pub fn record(&mut self, span: Span) {
        self.spans.push(span);
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }
}

/// Non-blocking writer feeding the request-log store.
///
/// Entries go through a bounded queue; when the sink cannot keep up, new
/// entries are dropped with a warning rather than stalling the data plane.
#[derive(Clone)]
pub struct RequestLogWriter {
    tx: mpsc::Sender<RequestLog>,
}

impl RequestLogWriter {
    /// Spawns the drain task and returns the writer plus its join handle.
    pub fn spawn(
        repo: Arc<dyn RequestLogRepository>,
        capacity: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                if let Err(e) = repo.create(log).await {
                    warn!(error = %e, "failed to persist request log");
                }
            }
            debug!("request log writer drained");
        });
        (Self { tx }, handle)
    }

    /// Enqueues a log entry; drops it if the queue is full.
    pub fn record(&self, log: RequestLog) {
        if self.tx.try_send(log).is_err() {
            warn!("request log queue full, dropping entry");
        }
    }
}
