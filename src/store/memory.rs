//! # In-Process Sharded Bucket Store
//!
//! The local backend and bucket registry in one structure: a set of
//! independent shards, each a mutex-guarded map from key to bucket.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        MemoryStore                             │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │   hash(key) ──► shard index                                    │
//! │                                                                │
//! │   ┌─ Shard 0 ─────────┐  ┌─ Shard 1 ─────────┐                 │
//! │   │ Mutex<HashMap>    │  │ Mutex<HashMap>    │   ... 2^k       │
//! │   │  "user:1" → 🪣     │  │  "api:checkout"→🪣 │                 │
//! │   │  "ip:10.0.0.7"→🪣  │  │  "user:9" → 🪣     │                 │
//! │   └───────────────────┘  └───────────────────┘                 │
//! │                                                                │
//! │   lock shard → fetch-or-create bucket → algorithm step →       │
//! │   stamp last access → unlock                                   │
//! │                                                                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A lock is held for exactly one algorithm step, O(1) for token, fixed
//! and leaky buckets and O(capacity) worst case for the sliding log, so per
//! key operations serialize and different shards never contend.
//!
//! Creation is race-free: the shard mutex makes fetch-or-create atomic, so
//! at most one bucket per key ever exists and racing creators all observe
//! the winner's bucket. A bucket created under one config fingerprint is
//! replaced atomically when the effective config changes.
//!
//! The idle sweeper visits each shard on its own tick and drops buckets
//! whose last access is older than the idle threshold; memory stays
//! proportional to the live key population.

use crate::algorithms::Bucket;
use crate::limits::RateLimitConfig;
use crate::store::ApplyOutcome;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Default idle threshold before the sweeper evicts a bucket: 10 minutes.
pub const DEFAULT_IDLE_THRESHOLD_NS: u64 = 600 * 1_000_000_000;

struct BucketEntry {
    bucket: Bucket,
    fingerprint: u64,
    last_access_ns: u64,
}

impl BucketEntry {
    fn new(config: &RateLimitConfig, now_ns: u64) -> Self {
        Self {
            bucket: Bucket::for_config(config, now_ns),
            fingerprint: config.fingerprint(),
            last_access_ns: now_ns,
        }
    }
}

/// Sharded key → bucket map with per-shard locking.
pub struct MemoryStore {
    shards: Vec<Mutex<HashMap<String, BucketEntry>>>,
    idle_threshold_ns: u64,
}

impl MemoryStore {
    /// Creates a store with one shard per core, rounded up to a power of
    /// two so the shard index is a mask.
    pub fn new(idle_threshold_ns: u64) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(cores.next_power_of_two(), idle_threshold_ns)
    }

    pub fn with_shards(shard_count: usize, idle_threshold_ns: u64) -> Self {
        let shard_count = shard_count.next_power_of_two().max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            idle_threshold_ns,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, BucketEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) & (self.shards.len() - 1);
        &self.shards[index]
    }

    pub fn apply(&self, key: &str, config: &RateLimitConfig, n: u64, now_ns: u64) -> ApplyOutcome {
        let fingerprint = config.fingerprint();
        let mut shard = self.shard(key).lock();
        let entry = shard
            .entry(key.to_string())
            .or_insert_with(|| BucketEntry::new(config, now_ns));
        if entry.fingerprint != fingerprint {
            // effective config changed: rebuild the bucket atomically
            *entry = BucketEntry::new(config, now_ns);
        }
        let decision = entry.bucket.try_consume(n, now_ns);
        entry.last_access_ns = now_ns;
        ApplyOutcome::from_decision(decision, entry.bucket.snapshot())
    }

    /// Dry run. A missing bucket is judged as the fresh bucket the config
    /// would build, without creating it.
    pub fn check(&self, key: &str, config: &RateLimitConfig, n: u64, now_ns: u64) -> ApplyOutcome {
        let fingerprint = config.fingerprint();
        let shard = self.shard(key).lock();
        match shard.get(key) {
            Some(entry) if entry.fingerprint == fingerprint => {
                ApplyOutcome::from_decision(entry.bucket.check(n, now_ns), entry.bucket.snapshot())
            }
            _ => {
                let fresh = Bucket::for_config(config, now_ns);
                ApplyOutcome::from_decision(fresh.check(n, now_ns), fresh.snapshot())
            }
        }
    }

    pub fn credit(&self, key: &str, config: &RateLimitConfig, n: u64, now_ns: u64) {
        let fingerprint = config.fingerprint();
        let mut shard = self.shard(key).lock();
        if let Some(entry) = shard.get_mut(key) {
            if entry.fingerprint == fingerprint {
                entry.bucket.credit(n);
                entry.last_access_ns = now_ns;
            }
        }
    }

    pub fn evict(&self, key: &str) {
        self.shard(key).lock().remove(key);
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.lock().keys().cloned());
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// One sweeper pass: evicts buckets idle past the threshold. Each shard
    /// is locked on its own, so a pass never stalls the whole map.
    pub fn sweep_idle(&self, now_ns: u64) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, entry| {
                now_ns.saturating_sub(entry.last_access_ns) <= self.idle_threshold_ns
            });
            evicted += before - map.len();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "idle bucket sweep");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Algorithm;

    const SEC: u64 = 1_000_000_000;

    fn token_config(capacity: u64, rate: u64) -> RateLimitConfig {
        RateLimitConfig::new(capacity, rate, Algorithm::TokenBucket)
    }

    #[test]
    fn test_creates_bucket_on_first_access() {
        let store = MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS);
        let config = token_config(5, 1);
        let outcome = store.apply("user:1", &config, 1, 0);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 4);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS);
        let config = token_config(1, 1);
        assert!(store.apply("a", &config, 1, 0).allowed);
        assert!(!store.apply("a", &config, 1, 0).allowed);
        assert!(store.apply("b", &config, 1, 0).allowed);
    }

    #[test]
    fn test_config_change_rebuilds_bucket() {
        let store = MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS);
        let small = token_config(2, 1);
        store.apply("k", &small, 2, 0);
        assert!(!store.apply("k", &small, 1, 0).allowed);

        // a larger limit replaces the exhausted bucket
        let large = token_config(10, 1);
        let outcome = store.apply("k", &large, 1, 0);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 9);
    }

    #[test]
    fn test_check_does_not_create_state() {
        let store = MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS);
        let config = token_config(5, 1);
        let outcome = store.check("ghost", &config, 2, 0);
        assert!(outcome.allowed);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_credit_restores_tokens() {
        let store = MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS);
        let config = token_config(5, 1);
        store.apply("k", &config, 3, 0);
        store.credit("k", &config, 2, 0);
        let outcome = store.check("k", &config, 0, 0);
        assert_eq!(outcome.remaining, 4);
    }

    #[test]
    fn test_evict_then_rebuild() {
        let store = MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS);
        let config = token_config(2, 1);
        store.apply("k", &config, 2, 0);
        store.evict("k");
        assert!(store.apply("k", &config, 2, 0).allowed);
    }

    #[test]
    fn test_sweep_evicts_only_idle() {
        let store = MemoryStore::with_shards(4, 10 * SEC);
        let config = token_config(5, 1);
        store.apply("old", &config, 1, 0);
        store.apply("fresh", &config, 1, 15 * SEC);
        let evicted = store.sweep_idle(15 * SEC);
        assert_eq!(evicted, 1);
        let keys = store.active_keys();
        assert_eq!(keys, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_concurrent_applies_serialize_per_key() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::with_shards(4, DEFAULT_IDLE_THRESHOLD_NS));
        let config = token_config(100, 1);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let config = config.clone();
            handles.push(std::thread::spawn(move || {
                let mut allowed = 0;
                for _ in 0..50 {
                    if store.apply("shared", &config, 1, 0).allowed {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 400 attempts against 100 tokens and no refill: exactly 100 win
        assert_eq!(total, 100);
    }

    #[test]
    fn test_shard_count_rounds_to_power_of_two() {
        let store = MemoryStore::with_shards(6, DEFAULT_IDLE_THRESHOLD_NS);
        assert_eq!(store.shard_count(), 8);
    }
}
