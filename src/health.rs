//! Background health checking of origins.
//!
//! A single checker task probes every origin that declares a health-check
//! path and maintains an origin-id → liveness map. Origins without a probe
//! path are implicitly healthy, and unknown origins are treated as healthy
//! so a cold start never blackholes traffic.

use crate::model::Origin;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long to wait for background tasks to wind down at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Periodic health prober with synchronous liveness queries.
///
/// `start` spawns the probe loop; `stop` signals it and joins with a bounded
/// deadline. A probe is healthy iff the origin answers 2xx within the probe
/// timeout. Transitions are logged exactly on change.
pub struct HealthChecker {
    statuses: Arc<RwLock<HashMap<Uuid, bool>>>,
    client: Client<HttpConnector, Empty<Bytes>>,
    interval: Duration,
    probe_timeout: Duration,
    stop_tx: broadcast::Sender<()>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(interval: Duration, probe_timeout: Duration) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            statuses: Arc::new(RwLock::new(HashMap::new())),
            client: Client::builder(TokioExecutor::new()).build_http(),
            interval,
            probe_timeout,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the probe loop over the given origins.
    ///
    /// An initial pass runs immediately; afterwards every origin with a
    /// health-check path is probed once per interval.
    pub fn start(&self, origins: Vec<Origin>) {
        let statuses = Arc::clone(&self.statuses);
        let client = self.client.clone();
        let interval = self.interval;
        let probe_timeout = self.probe_timeout;
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = probe_all(&client, &statuses, &origins, probe_timeout) => {}
                }
            }
            debug!("health checker stopped");
        });

        *self.handle.lock() = Some(handle);
    }

    /// Signals the probe loop and joins it, abandoning after a deadline.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
                warn!("health checker did not stop within deadline, abandoning");
            }
        }
    }

    /// Current liveness of an origin. Unknown origins count as healthy.
    pub fn is_healthy(&self, origin_id: Uuid) -> bool {
        self.statuses.read().get(&origin_id).copied().unwrap_or(true)
    }

    /// Filters a candidate set down to its healthy members.
    ///
    /// Origins without a health-check path always pass. An empty result
    /// falls back to the full set: degraded service beats a hard failure.
    pub fn healthy_subset(&self, origins: &[Origin]) -> Vec<Origin> {
        let statuses = self.statuses.read();
        let healthy: Vec<Origin> = origins
            .iter()
            .filter(|o| {
                o.health_check_path.is_none()
                    || statuses.get(&o.id).copied().unwrap_or(true)
            })
            .cloned()
            .collect();
        drop(statuses);

        if healthy.is_empty() {
            origins.to_vec()
        } else {
            healthy
        }
    }

    /// Overrides the recorded state of one origin. Test hook.
    #[doc(hidden)]
    pub fn set_status(&self, origin_id: Uuid, healthy: bool) {
        self.statuses.write().insert(origin_id, healthy);
    }
}

/// Runs one probe pass over all origins concurrently and applies results.
async fn probe_all(
    client: &Client<HttpConnector, Empty<Bytes>>,
    statuses: &RwLock<HashMap<Uuid, bool>>,
    origins: &[Origin],
    probe_timeout: Duration,
) {
    let mut probes = JoinSet::new();
    for origin in origins {
        let Some(path) = origin.health_check_path.clone() else {
            continue;
        };
        let client = client.clone();
        let url = format!("{}{}", origin.url, path);
        let id = origin.id;
        let name = origin.name.clone();
        probes.spawn(async move {
            let healthy = probe(&client, &url, probe_timeout).await;
            (id, name, healthy)
        });
    }

    while let Some(result) = probes.join_next().await {
        let Ok((id, name, healthy)) = result else {
            continue;
        };
        let mut statuses = statuses.write();
        let previous = statuses.insert(id, healthy);
        if previous != Some(healthy) {
            if healthy {
                info!(origin = %name, origin_id = %id, "origin became healthy");
            } else {
                warn!(origin = %name, origin_id = %id, "origin became unhealthy");
            }
        }
    }
}

/// Issues a single GET probe. Healthy iff the response status is 2xx.
async fn probe(
    client: &Client<HttpConnector, Empty<Bytes>>,
    url: &str,
    probe_timeout: Duration,
) -> bool {
    let Ok(uri) = url.parse::<http::Uri>() else {
        warn!(url = %url, "invalid health check url");
        return false;
    };

    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(Empty::<Bytes>::new());
    let Ok(request) = request else {
        return false;
    };

    match tokio::time::timeout(probe_timeout, client.request(request)).await {
        Ok(Ok(response)) => response.status().is_success(),
        Ok(Err(e)) => {
            debug!(url = %url, error = %e, "health probe failed");
            false
        }
        Err(_) => {
            debug!(url = %url, "health probe timed out");
            false
        }
    }
}
