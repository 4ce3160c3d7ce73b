// Rate Limiting Module
// Token bucket admission gate keyed by client, consulted per connection and per mux stream

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {key}")]
    Throttled { key: String },

    #[error("too many active keys (max: {0})")]
    TooManyKeys(usize),

    #[error("invalid rate limiter config: {0}")]
    InvalidConfig(String),
}

/// Admission gate consulted before a connection or stream is handled
///
/// `acquire` never waits: it either admits the request or returns
/// [`RateLimitError::Throttled`] and leaves the decision to the caller.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take `permits` units (connections or bytes) for `key`
    async fn acquire(&self, key: &str, permits: u32) -> Result<(), RateLimitError>;
}

/// Token bucket for rate limiting
#[derive(Debug, Clone)]
struct TokenBucket {
    /// Number of tokens currently available
    tokens: f64,

    /// Maximum number of tokens (burst size)
    capacity: f64,

    /// Tokens added per second
    refill_rate: f64,

    /// Last time bucket was refilled
    last_refill: Instant,

    /// When this bucket expires (for cleanup)
    expires_at: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, requests_per_minute: u32, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate: requests_per_minute as f64 / 60.0,
            last_refill: now,
            expires_at: now + ttl,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Try to consume `permits` tokens at once
    fn try_consume(&mut self, permits: u32) -> bool {
        self.refill();

        let permits = permits as f64;
        if self.tokens >= permits {
            self.tokens -= permits;
            true
        } else {
            false
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    fn reset_expiry(&mut self, ttl: Duration) {
        self.expires_at = Instant::now() + ttl;
    }
}

/// Rate limiter configuration, as stored in the config list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Registry name
    pub name: String,

    /// Sustained requests per minute per key
    pub requests_per_minute: u32,

    /// Maximum burst size (tokens in bucket)
    pub burst_size: u32,

    /// Time-to-live for inactive buckets (seconds)
    #[serde(default = "default_bucket_ttl")]
    pub bucket_ttl_seconds: u64,

    /// Maximum number of buckets to track
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
}

fn default_bucket_ttl() -> u64 {
    300
}

fn default_max_buckets() -> usize {
    10_000
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.name.trim().is_empty() {
            return Err(RateLimitError::InvalidConfig("name is required".to_string()));
        }
        if self.burst_size == 0 {
            return Err(RateLimitError::InvalidConfig(
                "burst_size must be greater than 0".to_string(),
            ));
        }
        if self.max_buckets == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_buckets must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Buckets {
    entries: LruCache<String, TokenBucket>,
    /// Next time expired buckets are swept out
    next_sweep: Instant,
}

/// Per-key token bucket limiter with LRU-bounded state
///
/// Expired buckets are swept at most once per bucket TTL, on the next
/// `acquire` after the TTL has passed.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<Buckets>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_buckets)
            .ok_or_else(|| RateLimitError::InvalidConfig("max_buckets is zero".to_string()))?;

        let ttl = Duration::from_secs(config.bucket_ttl_seconds);
        Ok(Self {
            config,
            buckets: Mutex::new(Buckets {
                entries: LruCache::new(capacity),
                next_sweep: Instant::now() + ttl,
            }),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.bucket_ttl_seconds)
    }

    fn new_bucket(&self) -> TokenBucket {
        TokenBucket::new(
            self.config.burst_size,
            self.config.requests_per_minute,
            self.ttl(),
        )
    }

    /// Number of tracked keys
    pub async fn active_keys(&self) -> usize {
        self.buckets.lock().await.entries.len()
    }
}

fn purge_expired(buckets: &mut LruCache<String, TokenBucket>) -> usize {
    let expired: Vec<String> = buckets
        .iter()
        .filter(|(_, bucket)| bucket.is_expired())
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        buckets.pop(key);
    }
    expired.len()
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self, key: &str, permits: u32) -> Result<(), RateLimitError> {
        let mut table = self.buckets.lock().await;
        let now = Instant::now();
        if table.next_sweep <= now {
            table.next_sweep = now + self.ttl();
            let removed = purge_expired(&mut table.entries);
            if removed > 0 {
                debug!(limiter = %self.config.name, removed, "Cleaned up expired buckets");
            }
        }
        let buckets = &mut table.entries;

        if let Some(bucket) = buckets.get_mut(key) {
            if bucket.is_expired() {
                debug!(key = %key, "Token bucket expired, starting fresh");
                *bucket = self.new_bucket();
            } else {
                bucket.reset_expiry(self.ttl());
            }

            if bucket.try_consume(permits) {
                return Ok(());
            }

            warn!(
                limiter = %self.config.name,
                key = %key,
                burst = self.config.burst_size,
                per_minute = self.config.requests_per_minute,
                "Rate limit exceeded"
            );
            return Err(RateLimitError::Throttled {
                key: key.to_string(),
            });
        }

        if buckets.len() >= self.config.max_buckets {
            let removed = purge_expired(buckets);
            if removed > 0 {
                debug!(removed, "Cleaned up expired buckets to free space");
            }
            if buckets.len() >= self.config.max_buckets {
                warn!(
                    limiter = %self.config.name,
                    max = self.config.max_buckets,
                    "Max buckets reached, rejecting new key"
                );
                return Err(RateLimitError::TooManyKeys(self.config.max_buckets));
            }
        }

        let mut bucket = self.new_bucket();
        let admitted = bucket.try_consume(permits);
        buckets.put(key.to_string(), bucket);

        if admitted {
            Ok(())
        } else {
            Err(RateLimitError::Throttled {
                key: key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(burst: u32, per_minute: u32, ttl: u64, max: usize) -> RateLimiterConfig {
        RateLimiterConfig {
            name: "test".to_string(),
            requests_per_minute: per_minute,
            burst_size: burst,
            bucket_ttl_seconds: ttl,
            max_buckets: max,
        }
    }

    #[test]
    fn test_token_bucket_consume() {
        let mut bucket = TokenBucket::new(2, 60, Duration::from_secs(300));

        assert!(bucket.try_consume(1));
        assert!(bucket.try_consume(1));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn test_invalid_config() {
        assert!(TokenBucketLimiter::new(config(0, 60, 300, 10)).is_err());
        assert!(TokenBucketLimiter::new(config(5, 60, 300, 0)).is_err());

        let mut unnamed = config(5, 60, 300, 10);
        unnamed.name = " ".to_string();
        assert!(matches!(
            TokenBucketLimiter::new(unnamed),
            Err(RateLimitError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_burst_then_throttled() {
        let limiter = TokenBucketLimiter::new(config(5, 60, 300, 100)).unwrap();

        for i in 0..5 {
            assert!(limiter.acquire("client", 1).await.is_ok(), "request {i}");
        }
        assert_eq!(
            limiter.acquire("client", 1).await,
            Err(RateLimitError::Throttled {
                key: "client".to_string()
            })
        );
        assert!(limiter.acquire("other", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_multi_permit_acquire() {
        let limiter = TokenBucketLimiter::new(config(10, 60, 300, 100)).unwrap();

        assert!(limiter.acquire("k", 8).await.is_ok());
        assert!(limiter.acquire("k", 4).await.is_err());
        assert!(limiter.acquire("k", 2).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = TokenBucketLimiter::new(config(2, 120, 300, 100)).unwrap();

        assert!(limiter.acquire("k", 1).await.is_ok());
        assert!(limiter.acquire("k", 1).await.is_ok());
        assert!(limiter.acquire("k", 1).await.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(limiter.acquire("k", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_too_many_keys() {
        let limiter = TokenBucketLimiter::new(config(5, 60, 300, 3)).unwrap();

        for key in ["a", "b", "c"] {
            assert!(limiter.acquire(key, 1).await.is_ok());
        }
        assert_eq!(
            limiter.acquire("d", 1).await,
            Err(RateLimitError::TooManyKeys(3))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_buckets_free_space() {
        let limiter = TokenBucketLimiter::new(config(5, 60, 1, 3)).unwrap();

        for key in ["a", "b", "c"] {
            assert!(limiter.acquire(key, 1).await.is_ok());
        }

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(limiter.acquire("d", 1).await.is_ok());
        assert_eq!(limiter.active_keys().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_keys_are_swept_after_ttl() {
        let limiter = TokenBucketLimiter::new(config(5, 60, 1, 100)).unwrap();
        limiter.acquire("a", 1).await.unwrap();
        limiter.acquire("b", 1).await.unwrap();
        assert_eq!(limiter.active_keys().await, 2);

        tokio::time::sleep(Duration::from_secs(2)).await;

        limiter.acquire("c", 1).await.unwrap();
        assert_eq!(limiter.active_keys().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let limiter = Arc::new(TokenBucketLimiter::new(config(100, 600, 300, 100)).unwrap());

        let handles: Vec<_> = (0..10)
            .map(|task| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let key = format!("key_{task}");
                    let mut admitted = 0;
                    for _ in 0..10 {
                        if limiter.acquire(&key, 1).await.is_ok() {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }

        assert_eq!(total, 100);
        assert_eq!(limiter.active_keys().await, 10);
    }
}
