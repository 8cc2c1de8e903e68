//! Token bucket throttling for outbound calls to upstream indexers.
//!
//! Each logical key owns a bucket of `capacity` tokens refilled at
//! `refill_rate` tokens per second. `consume` grants up to the requested
//! amount and never blocks; callers decide what to do with a partial grant.
//! Two backends: a process-local map, and Redis for fleets, where the
//! refill/deduct/expire sequence runs as one server-side script so
//! concurrent gateways cannot double-spend a bucket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate limiter store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        LimiterError::Store(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u64,
    /// Tokens added per second, applied lazily at consume time.
    pub refill_rate: f64,
}

/// A token bucket keyed by caller-chosen strings.
#[async_trait]
pub trait TokenBucket: Send + Sync {
    /// Atomically refills the bucket for `key` and deducts up to `tokens`,
    /// returning how many were actually granted.
    async fn consume(&self, key: &str, tokens: u64) -> Result<u64, LimiterError>;
}

//==============================================================================
// In-memory implementation
//------------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Single-process token bucket. Buckets materialize full on first touch.
pub struct InMemoryTokenBucket {
    config: TokenBucketConfig,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl InMemoryTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenBucket for InMemoryTokenBucket {
    async fn consume(&self, key: &str, tokens: u64) -> Result<u64, LimiterError> {
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: self.config.capacity as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.refill_rate)
            .min(self.config.capacity as f64);
        state.last_refill = now;

        let granted = (tokens as f64).min(state.tokens).floor() as u64;
        state.tokens -= granted as f64;
        Ok(granted)
    }
}

//==============================================================================
// Redis implementation
//------------------------------------------------------------------------------

/// Refill, deduct and expire in one atomic server-side script. KEYS[1] is
/// the bucket; ARGV: capacity, refill rate, requested tokens, now
/// (milliseconds), TTL (seconds).
const CONSUME_SCRIPT: &str = r#"
local bucket = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', bucket, 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_refill_ms = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last_refill_ms = now_ms
end

local elapsed = math.max(0, now_ms - last_refill_ms) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local granted = math.min(requested, math.floor(tokens))
tokens = tokens - granted

redis.call('HSET', bucket, 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('EXPIRE', bucket, ttl)
return granted
"#;

/// Shared token bucket over Redis. Buckets idle longer than `ttl` expire
/// and rematerialize full.
pub struct RedisTokenBucket {
    client: redis::Client,
    config: TokenBucketConfig,
    key_prefix: String,
    ttl: Duration,
    script: redis::Script,
}

impl RedisTokenBucket {
    pub fn new(
        client: redis::Client,
        config: TokenBucketConfig,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            config,
            key_prefix: key_prefix.into(),
            ttl: Duration::from_secs(3600),
            script: redis::Script::new(CONSUME_SCRIPT),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl TokenBucket for RedisTokenBucket {
    async fn consume(&self, key: &str, tokens: u64) -> Result<u64, LimiterError> {
        let mut connection = self.client.get_async_connection().await?;
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| LimiterError::Store(e.to_string()))?
            .as_millis() as u64;

        let granted: u64 = self
            .script
            .key(format!("{}:{}", self.key_prefix, key))
            .arg(self.config.capacity)
            .arg(self.config.refill_rate)
            .arg(tokens)
            .arg(now_ms)
            .arg(self.ttl.as_secs())
            .invoke_async(&mut connection)
            .await?;
        Ok(granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: u64, refill_rate: f64) -> InMemoryTokenBucket {
        InMemoryTokenBucket::new(TokenBucketConfig {
            capacity,
            refill_rate,
        })
    }

    #[tokio::test]
    async fn fresh_buckets_start_full() {
        let limiter = bucket(10, 1.0);
        assert_eq!(limiter.consume("indexer", 4).await.unwrap(), 4);
        assert_eq!(limiter.consume("indexer", 10).await.unwrap(), 6);
        assert_eq!(limiter.consume("indexer", 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_key() {
        let limiter = bucket(5, 1.0);
        assert_eq!(limiter.consume("a", 5).await.unwrap(), 5);
        assert_eq!(limiter.consume("b", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = bucket(100, 1000.0);
        assert_eq!(limiter.consume("key", 100).await.unwrap(), 100);
        assert_eq!(limiter.consume("key", 1).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // ~50 tokens refilled at 1000/s.
        let granted = limiter.consume("key", 100).await.unwrap();
        assert!(granted > 0);
        assert!(granted <= 100);
    }

    #[tokio::test]
    async fn refill_never_exceeds_capacity() {
        let limiter = bucket(10, 10_000.0);
        limiter.consume("key", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.consume("key", 1_000).await.unwrap(), 10);
    }
}
