//! # Redis Backend for Distributed Rate Limiting
//!
//! This backend stores bucket state in Redis so that every replica in a
//! fleet answers from the same counters.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     Distributed Rate Limiting                        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐           │
//! │   │  Replica 1   │    │  Replica 2   │    │  Replica N   │           │
//! │   └──────┬───────┘    └──────┬───────┘    └──────┬───────┘           │
//! │          │                   │                   │                   │
//! │          └───────────────────┼───────────────────┘                   │
//! │                              ▼                                       │
//! │                     ┌─────────────────┐                              │
//! │                     │  Redis Server   │                              │
//! │                     │                 │                              │
//! │                     │ rl:token_bucket:user:1   ← bucket hash         │
//! │                     │ rl:fixed_window:api:pay  ← bucket hash         │
//! │                     │ rl:sliding_window:ip:…   ← timestamp zset      │
//! │                     └─────────────────┘                              │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Atomicity
//!
//! The entire algorithm step (load state, refill/expire, decide, write
//! back) runs as one server-side Lua script, so concurrent replicas can
//! never interleave a read-modify-write:
//!
//! ```text
//! Without a script (race condition):       With a script (atomic):
//! ┌────────────┐  ┌────────────┐           ┌────────────┐  ┌────────────┐
//! │ Replica A  │  │ Replica B  │           │ Replica A  │  │ Replica B  │
//! ├────────────┤  ├────────────┤           ├────────────┤  ├────────────┤
//! │ GET: 10    │  │ GET: 10    │           │ EVALSHA    │  │   wait...  │
//! │ tokens -= 1│  │ tokens -= 1│           │ (atomic)   │  │            │
//! │ SET: 9     │  │ SET: 9  ⚠️ │           │            │  │ EVALSHA    │
//! └────────────┘  └────────────┘           └────────────┘  └────────────┘
//!                 (Lost update!)                           (Both correct)
//! ```
//!
//! Scripts are referenced by digest (EVALSHA); a digest cache miss is
//! re-uploaded and retried transparently. Scripts read the Redis server's
//! own clock (`TIME`), so replicas with skewed clocks still agree.
//!
//! ## Connection pool
//!
//! A fixed pool of multiplexed connections, gated by a semaphore. A caller
//! waits at most `max_wait` for a slot; exhaustion inside the deadline is
//! retried exactly once and then surfaces as `Unavailable`, at which point
//! the fail-open/fail-closed policy upstream decides the request's fate.

use crate::algorithms::BucketSnapshot;
use crate::error::{Error, Result};
use crate::limits::{Algorithm, RateLimitConfig};
use crate::store::ApplyOutcome;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Minimum number of pooled connections; smaller requests are rounded up.
pub const MIN_POOL_SIZE: usize = 10;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local n = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local commit = tonumber(ARGV[5])
local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last = now_ms
end

local elapsed = now_ms - last
if elapsed > 0 then
  local earned = math.floor(elapsed * rate / 1000)
  if earned > 0 then
    if tokens + earned >= capacity then
      tokens = capacity
      last = now_ms
    else
      tokens = tokens + earned
      last = last + math.floor(earned * 1000 / rate)
    end
  end
end

local allowed = 0
local retry_ms = 0
local remaining = tokens
if n <= tokens then
  allowed = 1
  remaining = tokens - n
  if commit == 1 then tokens = remaining end
else
  retry_ms = math.ceil((n - tokens) * 1000 / rate)
end

if commit == 1 then
  redis.call('HMSET', KEYS[1], 'tokens', tokens, 'last_refill_ms', last)
  redis.call('PEXPIRE', KEYS[1], ttl_ms)
end
return {allowed, remaining, retry_ms, tokens, last}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local n = tonumber(ARGV[3])
local commit = tonumber(ARGV[4])
local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)
local cutoff = now_ms - window_ms

local live
if commit == 1 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
  live = redis.call('ZCARD', KEYS[1])
else
  live = redis.call('ZCOUNT', KEYS[1], '(' .. cutoff, '+inf')
end

local allowed = 0
local retry_ms = 0
local remaining
if live + n <= capacity then
  allowed = 1
  if commit == 1 then
    for i = 1, n do
      local seq = redis.call('INCR', KEYS[2])
      redis.call('ZADD', KEYS[1], now_ms, now_ms .. '-' .. seq)
    end
    live = live + n
    remaining = capacity - live
  else
    remaining = capacity - live - n
  end
else
  remaining = capacity - live
  if n > capacity then
    retry_ms = window_ms
  else
    local zcard = redis.call('ZCARD', KEYS[1])
    local idx = (zcard - live) + (live + n - capacity) - 1
    local oldest = redis.call('ZRANGE', KEYS[1], idx, idx, 'WITHSCORES')
    if oldest[2] then
      retry_ms = tonumber(oldest[2]) + window_ms - now_ms
      if retry_ms < 0 then retry_ms = 0 end
    else
      retry_ms = window_ms
    end
  end
end

if commit == 1 then
  redis.call('PEXPIRE', KEYS[1], window_ms + 60000)
  redis.call('PEXPIRE', KEYS[2], window_ms + 60000)
end
return {allowed, remaining, retry_ms, live, 0}
"#;

const FIXED_WINDOW_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local n = tonumber(ARGV[3])
local commit = tonumber(ARGV[4])
local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)

local state = redis.call('HMGET', KEYS[1], 'window_start_ms', 'count')
local ws = tonumber(state[1])
local count = tonumber(state[2])
local current = math.floor(now_ms / window_ms) * window_ms
if ws == nil or ws ~= current then
  ws = current
  count = 0
end

local allowed = 0
local retry_ms = 0
if count + n <= capacity then
  allowed = 1
  count = count + n
else
  retry_ms = ws + window_ms - now_ms
end

if commit == 1 and allowed == 1 then
  redis.call('HMSET', KEYS[1], 'window_start_ms', ws, 'count', count)
  redis.call('PEXPIRE', KEYS[1], window_ms * 2)
end
return {allowed, capacity - count, retry_ms, ws, count}
"#;

const LEAKY_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local n = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local commit = tonumber(ARGV[5])
local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)

local state = redis.call('HMGET', KEYS[1], 'level', 'last_leak_ms')
local level = tonumber(state[1])
local last = tonumber(state[2])
if level == nil then
  level = 0
  last = now_ms
end

local elapsed = now_ms - last
if elapsed > 0 then
  local drained = math.floor(elapsed * rate / 1000)
  if drained > 0 then
    if drained >= level then
      level = 0
      last = now_ms
    else
      level = level - drained
      last = last + math.floor(drained * 1000 / rate)
    end
  end
end

local allowed = 0
local retry_ms = 0
local remaining
if level + n <= capacity then
  allowed = 1
  retry_ms = math.floor(level * 1000 / rate)
  level = level + n
  remaining = capacity - level
  if commit == 0 then level = level - n end
else
  remaining = capacity - level
  retry_ms = math.ceil((level + n - capacity) * 1000 / rate)
end

if commit == 1 then
  redis.call('HMSET', KEYS[1], 'level', level, 'last_leak_ms', last)
  redis.call('PEXPIRE', KEYS[1], ttl_ms)
end
return {allowed, remaining, retry_ms, level, last}
"#;

/// Re-adds tokens to a token bucket hash, capped at capacity.
const CREDIT_TOKENS_SCRIPT: &str = r#"
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens'))
if tokens == nil then return 0 end
local capacity = tonumber(ARGV[1])
local n = tonumber(ARGV[2])
tokens = math.min(capacity, tokens + n)
redis.call('HSET', KEYS[1], 'tokens', tokens)
return tokens
"#;

/// Decrements a counter field (fixed-window count, leaky level), floored at 0.
const CREDIT_COUNTER_SCRIPT: &str = r#"
local field = ARGV[1]
local n = tonumber(ARGV[2])
local value = tonumber(redis.call('HGET', KEYS[1], field))
if value == nil then return 0 end
value = math.max(0, value - n)
redis.call('HSET', KEYS[1], field, value)
return value
"#;

/// Removes the n most recent sliding-window entries.
const CREDIT_ZSET_SCRIPT: &str = r#"
local n = tonumber(ARGV[1])
redis.call('ZREMRANGEBYRANK', KEYS[1], -n, -1)
return redis.call('ZCARD', KEYS[1])
"#;

/// Redis-backed bucket store shared by all replicas.
pub struct RedisStore {
    conns: Vec<MultiplexedConnection>,
    next: AtomicUsize,
    permits: Semaphore,
    max_wait: Duration,
    token_bucket: Script,
    sliding_window: Script,
    fixed_window: Script,
    leaky_bucket: Script,
    credit_tokens: Script,
    credit_counter: Script,
    credit_zset: Script,
}

impl RedisStore {
    /// Connects a pool of multiplexed connections to `url`.
    pub async fn connect(url: &str, pool_size: usize, max_wait: Duration) -> Result<Self> {
        let pool_size = pool_size.max(MIN_POOL_SIZE);
        let client = redis::Client::open(url)
            .map_err(|e| Error::Unavailable(format!("bad redis url: {}", e)))?;

        let mut conns = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = client.get_multiplexed_tokio_connection().await?;
            conns.push(conn);
        }
        tracing::info!(pool_size, "redis pool connected");

        Ok(Self {
            conns,
            next: AtomicUsize::new(0),
            permits: Semaphore::new(pool_size),
            max_wait,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            leaky_bucket: Script::new(LEAKY_BUCKET_SCRIPT),
            credit_tokens: Script::new(CREDIT_TOKENS_SCRIPT),
            credit_counter: Script::new(CREDIT_COUNTER_SCRIPT),
            credit_zset: Script::new(CREDIT_ZSET_SCRIPT),
        })
    }

    fn bucket_key(config: &RateLimitConfig, key: &str) -> String {
        format!("rl:{}:{}", config.algorithm.as_str(), key)
    }

    fn connection(&self) -> MultiplexedConnection {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[index].clone()
    }

    /// Idle TTL for refill-style buckets: twice the time a full drain takes
    /// to come back, floored at a minute.
    fn idle_ttl_ms(config: &RateLimitConfig) -> u64 {
        (config.capacity.saturating_mul(1000) / config.refill_rate.max(1))
            .saturating_mul(2)
            .max(60_000)
    }

    pub async fn apply(&self, key: &str, config: &RateLimitConfig, n: u64) -> Result<ApplyOutcome> {
        match self.run(key, config, n, true).await {
            Err(Error::TransientInternal(msg)) => {
                tracing::warn!(key = %key, %msg, "transient redis failure, retrying once");
                self.run(key, config, n, true)
                    .await
                    .map_err(|e| Error::Unavailable(e.to_string()))
            }
            other => other,
        }
    }

    pub async fn check(&self, key: &str, config: &RateLimitConfig, n: u64) -> Result<ApplyOutcome> {
        match self.run(key, config, n, false).await {
            Err(Error::TransientInternal(msg)) => {
                tracing::warn!(key = %key, %msg, "transient redis failure, retrying once");
                self.run(key, config, n, false)
                    .await
                    .map_err(|e| Error::Unavailable(e.to_string()))
            }
            other => other,
        }
    }

    async fn run(
        &self,
        key: &str,
        config: &RateLimitConfig,
        n: u64,
        commit: bool,
    ) -> Result<ApplyOutcome> {
        let _permit = tokio::time::timeout(self.max_wait, self.permits.acquire())
            .await
            .map_err(|_| Error::TransientInternal("connection pool wait timed out".to_string()))?
            .map_err(|_| Error::Internal("connection pool closed".to_string()))?;

        let mut conn = self.connection();
        let bucket_key = Self::bucket_key(config, key);
        let commit_flag = if commit { 1u8 } else { 0u8 };

        let invocation = async {
            let values: Vec<i64> = match config.algorithm {
                Algorithm::TokenBucket => {
                    self.token_bucket
                        .key(&bucket_key)
                        .arg(config.capacity)
                        .arg(config.refill_rate)
                        .arg(n)
                        .arg(Self::idle_ttl_ms(config))
                        .arg(commit_flag)
                        .invoke_async(&mut conn)
                        .await?
                }
                Algorithm::SlidingWindow => {
                    self.sliding_window
                        .key(&bucket_key)
                        .key(format!("{}:seq", bucket_key))
                        .arg(config.capacity)
                        .arg(config.window_ms_or_default())
                        .arg(n)
                        .arg(commit_flag)
                        .invoke_async(&mut conn)
                        .await?
                }
                Algorithm::FixedWindow => {
                    self.fixed_window
                        .key(&bucket_key)
                        .arg(config.capacity)
                        .arg(config.window_ms_or_default())
                        .arg(n)
                        .arg(commit_flag)
                        .invoke_async(&mut conn)
                        .await?
                }
                Algorithm::LeakyBucket => {
                    self.leaky_bucket
                        .key(&bucket_key)
                        .arg(config.capacity)
                        .arg(config.refill_rate)
                        .arg(n)
                        .arg(Self::idle_ttl_ms(config))
                        .arg(commit_flag)
                        .invoke_async(&mut conn)
                        .await?
                }
            };
            Ok::<_, Error>(values)
        };

        let values = tokio::time::timeout(self.max_wait, invocation)
            .await
            .map_err(|_| Error::Unavailable("redis script execution timed out".to_string()))??;

        if values.len() != 5 {
            return Err(Error::Internal(format!(
                "unexpected script reply of {} values",
                values.len()
            )));
        }

        let snapshot = Self::snapshot_from_reply(config.algorithm, &values);
        Ok(ApplyOutcome {
            allowed: values[0] == 1,
            remaining: values[1].max(0) as u64,
            retry_after_ms: values[2].max(0) as u64,
            snapshot,
        })
    }

    fn snapshot_from_reply(algorithm: Algorithm, values: &[i64]) -> BucketSnapshot {
        const NANOS_PER_MS: u64 = 1_000_000;
        match algorithm {
            Algorithm::TokenBucket => BucketSnapshot::TokenBucket {
                tokens: values[3].max(0) as u64,
                last_refill_ns: (values[4].max(0) as u64).saturating_mul(NANOS_PER_MS),
            },
            Algorithm::SlidingWindow => BucketSnapshot::SlidingWindow {
                in_window: values[3].max(0) as u64,
                oldest_ns: None,
            },
            Algorithm::FixedWindow => BucketSnapshot::FixedWindow {
                window_start_ms: values[3].max(0) as u64,
                count: values[4].max(0) as u64,
            },
            Algorithm::LeakyBucket => BucketSnapshot::LeakyBucket {
                queued: values[3].max(0) as u64,
                last_leak_ns: (values[4].max(0) as u64).saturating_mul(NANOS_PER_MS),
            },
        }
    }

    pub async fn credit(&self, key: &str, config: &RateLimitConfig, n: u64) -> Result<()> {
        let _permit = tokio::time::timeout(self.max_wait, self.permits.acquire())
            .await
            .map_err(|_| Error::Unavailable("connection pool wait timed out".to_string()))?
            .map_err(|_| Error::Internal("connection pool closed".to_string()))?;

        let mut conn = self.connection();
        let bucket_key = Self::bucket_key(config, key);
        match config.algorithm {
            Algorithm::TokenBucket => {
                let _: i64 = self
                    .credit_tokens
                    .key(&bucket_key)
                    .arg(config.capacity)
                    .arg(n)
                    .invoke_async(&mut conn)
                    .await?;
            }
            Algorithm::SlidingWindow => {
                let _: i64 = self
                    .credit_zset
                    .key(&bucket_key)
                    .arg(n)
                    .invoke_async(&mut conn)
                    .await?;
            }
            Algorithm::FixedWindow => {
                let _: i64 = self
                    .credit_counter
                    .key(&bucket_key)
                    .arg("count")
                    .arg(n)
                    .invoke_async(&mut conn)
                    .await?;
            }
            Algorithm::LeakyBucket => {
                let _: i64 = self
                    .credit_counter
                    .key(&bucket_key)
                    .arg("level")
                    .arg(n)
                    .invoke_async(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn evict(&self, key: &str, config: &RateLimitConfig) -> Result<()> {
        let mut conn = self.connection();
        let bucket_key = Self::bucket_key(config, key);
        let _: () = redis::cmd("DEL")
            .arg(&bucket_key)
            .arg(format!("{}:seq", bucket_key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.connection();
        let pong: String = tokio::time::timeout(
            self.max_wait,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Unavailable("redis ping timed out".to_string()))??;
        Ok(pong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Algorithm;

    #[test]
    fn test_bucket_key_namespace() {
        let config = RateLimitConfig::new(10, 2, Algorithm::TokenBucket);
        assert_eq!(
            RedisStore::bucket_key(&config, "user:1"),
            "rl:token_bucket:user:1"
        );
        let config = RateLimitConfig::new(10, 2, Algorithm::SlidingWindow);
        assert_eq!(
            RedisStore::bucket_key(&config, "api:pay"),
            "rl:sliding_window:api:pay"
        );
    }

    #[test]
    fn test_idle_ttl_scales_with_drain_time() {
        // 100 tokens at 2/sec: 50s to refill, doubled
        let config = RateLimitConfig::new(100, 2, Algorithm::TokenBucket);
        assert_eq!(RedisStore::idle_ttl_ms(&config), 100_000);
        // tiny buckets still get the floor
        let config = RateLimitConfig::new(2, 10, Algorithm::TokenBucket);
        assert_eq!(RedisStore::idle_ttl_ms(&config), 60_000);
    }

    #[test]
    fn test_snapshot_from_token_bucket_reply() {
        let snapshot =
            RedisStore::snapshot_from_reply(Algorithm::TokenBucket, &[1, 9, 0, 9, 1000]);
        match snapshot {
            BucketSnapshot::TokenBucket {
                tokens,
                last_refill_ns,
            } => {
                assert_eq!(tokens, 9);
                assert_eq!(last_refill_ns, 1000 * 1_000_000);
            }
            other => panic!("wrong snapshot: {:?}", other),
        }
    }
}
