//! Bucket storage backends.
//!
//! Two interchangeable implementations sit behind one contract:
//!
//! | Backend  | Use case                        | State persistence |
//! |----------|---------------------------------|-------------------|
//! | Memory   | Development, single instance    | In-process shards |
//! | Redis    | Production, fleet of replicas   | Redis scripts     |
//!
//! The contract: `apply` is atomic per key; no interleaved `apply` on the
//! same key ever observes an intermediate state. The memory backend gets
//! this from a per-shard mutex, the Redis backend from running the whole
//! algorithm step inside one server-side script. Across different keys no
//! ordering is promised. Switching backends at startup changes durability
//! and cross-replica sharing, nothing else observable.
//!
//! `check` is the non-mutating twin of `apply` and `credit` restores
//! previously consumed tokens; together they give the composite limiter its
//! two-phase, no-net-effect-on-denial behavior.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::algorithms::{BucketSnapshot, Decision};
use crate::error::Result;
use crate::limits::RateLimitConfig;
use serde::{Deserialize, Serialize};

/// Result of one `apply` (or `check`) against a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
    pub snapshot: BucketSnapshot,
}

impl ApplyOutcome {
    pub fn from_decision(decision: Decision, snapshot: BucketSnapshot) -> Self {
        Self {
            allowed: decision.allowed,
            remaining: decision.remaining,
            retry_after_ms: decision.retry_after_ms,
            snapshot,
        }
    }
}

/// The configured backend. One of these exists per service instance,
/// selected by a startup flag.
pub enum Store {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl Store {
    /// Runs the algorithm step for `key` under `config`, consuming `n`
    /// tokens if allowed. Atomic per key.
    pub async fn apply(
        &self,
        key: &str,
        config: &RateLimitConfig,
        n: u64,
        now_ns: u64,
    ) -> Result<ApplyOutcome> {
        match self {
            Store::Memory(s) => Ok(s.apply(key, config, n, now_ns)),
            Store::Redis(s) => s.apply(key, config, n).await,
        }
    }

    /// Dry run: the decision `apply` would return right now, with no state
    /// created or mutated.
    pub async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
        n: u64,
        now_ns: u64,
    ) -> Result<ApplyOutcome> {
        match self {
            Store::Memory(s) => Ok(s.check(key, config, n, now_ns)),
            Store::Redis(s) => s.check(key, config, n).await,
        }
    }

    /// Restores `n` tokens consumed by an earlier `apply`. Compensation
    /// path for composite commits that lost a race.
    pub async fn credit(
        &self,
        key: &str,
        config: &RateLimitConfig,
        n: u64,
        now_ns: u64,
    ) -> Result<()> {
        match self {
            Store::Memory(s) => {
                s.credit(key, config, n, now_ns);
                Ok(())
            }
            Store::Redis(s) => s.credit(key, config, n).await,
        }
    }

    /// Drops the bucket for `key`; the next `apply` rebuilds it from the
    /// effective config.
    pub async fn evict(&self, key: &str, config: &RateLimitConfig) -> Result<()> {
        match self {
            Store::Memory(s) => {
                s.evict(key);
                Ok(())
            }
            Store::Redis(s) => s.evict(key, config).await,
        }
    }

    /// Snapshot of live keys. The Redis backend does not enumerate its
    /// keyspace (SCAN on the hot path is off the table); callers fall back
    /// to the metrics registry there.
    pub fn active_keys(&self) -> Option<Vec<String>> {
        match self {
            Store::Memory(s) => Some(s.active_keys()),
            Store::Redis(_) => None,
        }
    }

    /// Live bucket count for memory accounting, where knowable.
    pub fn bucket_count(&self) -> Option<usize> {
        match self {
            Store::Memory(s) => Some(s.len()),
            Store::Redis(_) => None,
        }
    }

    pub async fn healthy(&self) -> bool {
        match self {
            Store::Memory(_) => true,
            Store::Redis(s) => s.ping().await.is_ok(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Store::Redis(_))
    }
}
