//! Load balancing across origins.
//!
//! A balancer picks one origin from a candidate set. The pipeline passes the
//! healthy subset (falling back to the full set when it is empty) and calls
//! [`Balancer::on_complete`] once the response has been fully consumed, so
//! connection-aware strategies can keep accurate in-flight counts.

use crate::error::{GatewayError, Result};
use crate::model::Origin;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Number of virtual ring positions per origin in consistent hashing.
const RING_REPLICAS: usize = 3;

/// Load balancing strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    RoundRobin,
    LeastConn,
    ConsistentHash,
}

impl FromStr for LbStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(LbStrategy::RoundRobin),
            "least_conn" => Ok(LbStrategy::LeastConn),
            "consistent_hash" => Ok(LbStrategy::ConsistentHash),
            other => Err(format!("unknown load balancing strategy: {}", other)),
        }
    }
}

/// Capability shared by all balancing strategies.
///
/// `select` returns an owned copy of the chosen origin; strategies that
/// track in-flight work increment on selection and decrement in
/// `on_complete`. `key` carries the request attribute hashed by
/// key-affine strategies and is ignored by the others.
pub trait Balancer: Send + Sync {
    fn select(&self, key: Option<&str>, candidates: &[Origin]) -> Result<Origin>;
    fn on_complete(&self, origin_id: Uuid);
}

/// Builds the balancer for a strategy. One instance per route.
pub fn build(strategy: LbStrategy) -> Arc<dyn Balancer> {
    match strategy {
        LbStrategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LbStrategy::LeastConn => Arc::new(LeastConnBalancer::new()),
        LbStrategy::ConsistentHash => Arc::new(ConsistentHashBalancer::new()),
    }
}

/// Rotates through the candidate set with a monotonic counter.
///
/// The counter is per-instance (one instance per route) so differently
/// shaped candidate sets cannot skew each other. Wraparound is harmless
/// since selection is modulo the candidate count.
pub struct RoundRobinBalancer {
    counter: Mutex<u64>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RoundRobinBalancer {
    fn select(&self, _key: Option<&str>, candidates: &[Origin]) -> Result<Origin> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyOrigin);
        }

        let mut counter = self.counter.lock();
        let selected = &candidates[(*counter % candidates.len() as u64) as usize];
        *counter = counter.wrapping_add(1);
        Ok(selected.clone())
    }

    fn on_complete(&self, _origin_id: Uuid) {}
}

/// Picks the origin with the fewest in-flight requests.
///
/// Ties break by encounter order. Decrements at zero are ignored so a
/// restart with stale completions cannot drive a count negative.
pub struct LeastConnBalancer {
    connections: DashMap<Uuid, u64>,
}

impl LeastConnBalancer {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Current in-flight count for an origin.
    pub fn connection_count(&self, origin_id: Uuid) -> u64 {
        self.connections.get(&origin_id).map(|c| *c).unwrap_or(0)
    }
}

impl Default for LeastConnBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for LeastConnBalancer {
    fn select(&self, _key: Option<&str>, candidates: &[Origin]) -> Result<Origin> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyOrigin);
        }

        let mut selected = &candidates[0];
        let mut min_conns = u64::MAX;
        for origin in candidates {
            let conns = self.connection_count(origin.id);
            if conns < min_conns {
                min_conns = conns;
                selected = origin;
            }
        }

        *self.connections.entry(selected.id).or_insert(0) += 1;
        Ok(selected.clone())
    }

    fn on_complete(&self, origin_id: Uuid) {
        if let Some(mut count) = self.connections.get_mut(&origin_id) {
            if *count > 0 {
                *count -= 1;
            }
        }
    }
}

struct Ring {
    /// hash -> origin id.
    points: HashMap<u32, Uuid>,
    /// Sorted ring positions.
    keys: Vec<u32>,
    /// Origins currently on the ring.
    members: HashMap<Uuid, usize>,
}

impl Ring {
    fn new() -> Self {
        Self {
            points: HashMap::new(),
            keys: Vec::new(),
            members: HashMap::new(),
        }
    }

    fn add(&mut self, origin_id: Uuid) {
        self.members.insert(origin_id, RING_REPLICAS);
        for i in 0..RING_REPLICAS {
            let hash = crc32fast::hash(format!("{}-{}", origin_id, i).as_bytes());
            self.points.insert(hash, origin_id);
            self.keys.push(hash);
        }
        self.keys.sort_unstable();
    }

    fn remove(&mut self, origin_id: Uuid) {
        let Some(replicas) = self.members.remove(&origin_id) else {
            return;
        };
        for i in 0..replicas {
            let hash = crc32fast::hash(format!("{}-{}", origin_id, i).as_bytes());
            self.points.remove(&hash);
        }
        self.keys = self.points.keys().copied().collect();
        self.keys.sort_unstable();
    }
}

/// Hash ring with virtual replicas for key-affine selection.
///
/// Hot-path reads take the shared side of the lock and binary-search the
/// sorted ring; membership changes rebuild it under the exclusive side.
pub struct ConsistentHashBalancer {
    ring: RwLock<Ring>,
}

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(Ring::new()),
        }
    }

    pub fn add_origin(&self, origin_id: Uuid) {
        let mut ring = self.ring.write();
        if !ring.members.contains_key(&origin_id) {
            ring.add(origin_id);
        }
    }

    pub fn remove_origin(&self, origin_id: Uuid) {
        self.ring.write().remove(origin_id);
    }

    /// Reconciles ring membership with the candidate set.
    ///
    /// Cheap when nothing changed: membership is compared under the shared
    /// lock and the exclusive side is only taken on drift.
    pub fn sync_origins(&self, candidates: &[Origin]) {
        {
            let ring = self.ring.read();
            if ring.members.len() == candidates.len()
                && candidates.iter().all(|o| ring.members.contains_key(&o.id))
            {
                return;
            }
        }

        let mut ring = self.ring.write();
        let stale: Vec<Uuid> = ring
            .members
            .keys()
            .filter(|id| !candidates.iter().any(|o| o.id == **id))
            .copied()
            .collect();
        for id in stale {
            ring.remove(id);
        }
        for origin in candidates {
            if !ring.members.contains_key(&origin.id) {
                ring.add(origin.id);
            }
        }
        debug!(members = ring.members.len(), "hash ring rebuilt");
    }

    /// Number of points currently on the ring.
    pub fn ring_len(&self) -> usize {
        self.ring.read().keys.len()
    }

    fn select_by_key(&self, key: &str, candidates: &[Origin]) -> Origin {
        let ring = self.ring.read();
        if ring.keys.is_empty() {
            return candidates[0].clone();
        }

        let hash = crc32fast::hash(key.as_bytes());
        let idx = ring.keys.partition_point(|k| *k < hash);
        let idx = if idx == ring.keys.len() { 0 } else { idx };
        let origin_id = ring.points[&ring.keys[idx]];

        candidates
            .iter()
            .find(|o| o.id == origin_id)
            .unwrap_or(&candidates[0])
            .clone()
    }
}

impl Default for ConsistentHashBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for ConsistentHashBalancer {
    fn select(&self, key: Option<&str>, candidates: &[Origin]) -> Result<Origin> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyOrigin);
        }
        self.sync_origins(candidates);
        Ok(self.select_by_key(key.unwrap_or(""), candidates))
    }

    fn on_complete(&self, _origin_id: Uuid) {}
}

/// Balances the in-flight count of a selection: decrements exactly once,
/// on drop or when explicitly disarmed.
pub struct InFlightGuard {
    balancer: Arc<dyn Balancer>,
    origin_id: Uuid,
    armed: bool,
}

impl InFlightGuard {
    pub fn new(balancer: Arc<dyn Balancer>, origin_id: Uuid) -> Self {
        Self {
            balancer,
            origin_id,
            armed: true,
        }
    }

    /// Releases the in-flight slot now instead of at drop.
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.armed {
            self.armed = false;
            self.balancer.on_complete(self.origin_id);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn origins(n: usize) -> Vec<Origin> {
        (0..n)
            .map(|i| Origin::new(Uuid::nil(), format!("o{}", i), format!("http://10.0.0.{}:80", i)))
            .collect()
    }

    #[test]
    fn test_round_robin_fairness() {
        let balancer = RoundRobinBalancer::new();
        let candidates = origins(3);

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for _ in 0..9 {
            let selected = balancer.select(None, &candidates).unwrap();
            *counts.entry(selected.id).or_insert(0) += 1;
        }

        for origin in &candidates {
            assert_eq!(counts[&origin.id], 3);
        }
    }

    #[test]
    fn test_round_robin_uneven_count() {
        let balancer = RoundRobinBalancer::new();
        let candidates = origins(3);

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for _ in 0..10 {
            let selected = balancer.select(None, &candidates).unwrap();
            *counts.entry(selected.id).or_insert(0) += 1;
        }

        // 10 selections over 3 origins: every origin picked 3 or 4 times.
        for origin in &candidates {
            let count = counts[&origin.id];
            assert!((3..=4).contains(&count), "unfair count: {}", count);
        }
    }

    #[test]
    fn test_round_robin_empty_set() {
        let balancer = RoundRobinBalancer::new();
        assert!(matches!(
            balancer.select(None, &[]),
            Err(GatewayError::NoHealthyOrigin)
        ));
    }

    #[test]
    fn test_least_conn_prefers_idle() {
        let balancer = LeastConnBalancer::new();
        let candidates = origins(2);

        // First selection takes the first origin and holds it in flight.
        let first = balancer.select(None, &candidates).unwrap();
        assert_eq!(first.id, candidates[0].id);

        // Second selection goes to the idle origin.
        let second = balancer.select(None, &candidates).unwrap();
        assert_eq!(second.id, candidates[1].id);
    }

    #[test]
    fn test_least_conn_counters_balance() {
        let balancer = LeastConnBalancer::new();
        let candidates = origins(3);

        let mut selected = Vec::new();
        for _ in 0..12 {
            selected.push(balancer.select(None, &candidates).unwrap());
        }
        for origin in &selected {
            balancer.on_complete(origin.id);
        }

        for origin in &candidates {
            assert_eq!(balancer.connection_count(origin.id), 0);
        }
    }

    #[test]
    fn test_least_conn_decrement_at_zero_is_noop() {
        let balancer = LeastConnBalancer::new();
        let candidates = origins(1);

        balancer.on_complete(candidates[0].id);
        assert_eq!(balancer.connection_count(candidates[0].id), 0);

        let selected = balancer.select(None, &candidates).unwrap();
        assert_eq!(balancer.connection_count(selected.id), 1);
    }

    #[test]
    fn test_consistent_hash_sticky() {
        let balancer = ConsistentHashBalancer::new();
        let candidates = origins(4);

        let first = balancer.select(Some("client-a"), &candidates).unwrap();
        for _ in 0..20 {
            let again = balancer.select(Some("client-a"), &candidates).unwrap();
            assert_eq!(again.id, first.id);
        }
    }

    #[test]
    fn test_consistent_hash_ring_replicas() {
        let balancer = ConsistentHashBalancer::new();
        let candidates = origins(4);
        balancer.select(Some("k"), &candidates).unwrap();
        assert_eq!(balancer.ring_len(), 4 * RING_REPLICAS);
    }

    #[test]
    fn test_consistent_hash_minimal_reshuffle() {
        let balancer = ConsistentHashBalancer::new();
        let candidates = origins(5);

        let keys: Vec<String> = (0..200).map(|i| format!("key-{}", i)).collect();
        let before: Vec<Uuid> = keys
            .iter()
            .map(|k| balancer.select(Some(k), &candidates).unwrap().id)
            .collect();

        // Remove one origin; membership re-syncs on the next selection.
        let remaining: Vec<Origin> = candidates[1..].to_vec();
        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(k, prev)| balancer.select(Some(k), &remaining).unwrap().id != **prev)
            .count();

        // Keys previously owned by the removed origin must move; with K=3
        // replicas per origin the spill beyond ~1/5 of keys stays modest.
        assert!(moved > 0);
        assert!(
            moved <= keys.len() / 2,
            "removing 1 of 5 origins moved {} of {} keys",
            moved,
            keys.len()
        );
    }

    #[test]
    fn test_consistent_hash_empty_ring_falls_back() {
        let balancer = ConsistentHashBalancer::new();
        let candidates = origins(2);
        // Selection without a key still lands on a candidate.
        let selected = balancer.select(None, &candidates).unwrap();
        assert!(candidates.iter().any(|o| o.id == selected.id));
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let balancer: Arc<LeastConnBalancer> = Arc::new(LeastConnBalancer::new());
        let candidates = origins(1);

        let selected = balancer.select(None, &candidates).unwrap();
        assert_eq!(balancer.connection_count(selected.id), 1);

        {
            let _guard = InFlightGuard::new(balancer.clone(), selected.id);
        }
        assert_eq!(balancer.connection_count(selected.id), 0);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("round_robin".parse(), Ok(LbStrategy::RoundRobin));
        assert_eq!("least_conn".parse(), Ok(LbStrategy::LeastConn));
        assert_eq!("consistent_hash".parse(), Ok(LbStrategy::ConsistentHash));
        assert!("random".parse::<LbStrategy>().is_err());
    }
}
