//! Token-bucket rate limiting.
//!
//! Every connection draws from two buckets per direction: its aggregate
//! group (incoming or outgoing, shared by all connections of that
//! direction) and an optional per-connection override. Bytes move only when
//! both have tokens. Buckets may go negative after a large read; the next
//! transfer then waits until they refill.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Rate and burst limits in bytes per second and bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained read rate.
    pub max_read_rate: u64,
    /// Read burst size.
    pub max_burst_read: u64,
    /// Sustained write rate.
    pub max_write_rate: u64,
    /// Write burst size.
    pub max_burst_write: u64,
}

impl RateLimit {
    /// No limit in either direction.
    pub const UNLIMITED: RateLimit = RateLimit {
        max_read_rate: u64::MAX,
        max_burst_read: u64::MAX,
        max_write_rate: u64::MAX,
        max_burst_write: u64::MAX,
    };

    /// Create a limit.
    pub fn new(max_read_rate: u64, max_burst_read: u64, max_write_rate: u64, max_burst_write: u64) -> Self {
        Self {
            max_read_rate,
            max_burst_read,
            max_write_rate,
            max_burst_write,
        }
    }

    /// Same rate and burst in both directions.
    pub fn symmetric(rate: u64, burst: u64) -> Self {
        Self::new(rate, burst, rate, burst)
    }

    /// Check if neither direction is limited.
    pub fn is_unlimited(&self) -> bool {
        self.max_read_rate == u64::MAX && self.max_write_rate == u64::MAX
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// A single token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Bytes added per second.
    rate: u64,
    /// Maximum tokens.
    burst: u64,
    /// Current tokens. Negative after an overdraw.
    tokens: i64,
    /// Last refill time.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate,
            burst,
            tokens: clamp_i64(burst),
            last_refill: Instant::now(),
        }
    }

    /// Add tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.rate as f64) as i64;
        if added > 0 {
            self.tokens = self.tokens.saturating_add(added).min(clamp_i64(self.burst));
            self.last_refill = now;
        }
    }

    /// Tokens available now.
    pub fn available(&self) -> i64 {
        self.tokens
    }

    /// Take `bytes` tokens, possibly overdrawing.
    pub fn consume(&mut self, bytes: u64) {
        self.tokens = self.tokens.saturating_sub(clamp_i64(bytes));
    }

    /// Time until at least one token is available.
    pub fn delay(&self) -> Duration {
        if self.tokens > 0 || self.rate == 0 {
            return Duration::ZERO;
        }
        let missing = (1 - self.tokens) as f64;
        Duration::from_secs_f64(missing / self.rate as f64)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Read and write buckets. `None` means unlimited.
#[derive(Debug, Clone, Default)]
struct BucketPair {
    read: Option<TokenBucket>,
    write: Option<TokenBucket>,
}

impl BucketPair {
    fn from_limit(limit: &RateLimit) -> Self {
        let bucket = |rate: u64, burst: u64| {
            if rate == u64::MAX {
                None
            } else {
                Some(TokenBucket::new(rate, burst))
            }
        };
        Self {
            read: bucket(limit.max_read_rate, limit.max_burst_read),
            write: bucket(limit.max_write_rate, limit.max_burst_write),
        }
    }

    fn bucket(&mut self, dir: IoDirection) -> Option<&mut TokenBucket> {
        match dir {
            IoDirection::Read => self.read.as_mut(),
            IoDirection::Write => self.write.as_mut(),
        }
    }

    /// Allowed bytes now, or how long to wait.
    fn allowance(&mut self, dir: IoDirection, now: Instant) -> Result<u64, Duration> {
        match self.bucket(dir) {
            None => Ok(u64::MAX),
            Some(bucket) => {
                bucket.refill(now);
                if bucket.available() > 0 {
                    Ok(bucket.available() as u64)
                } else {
                    Err(bucket.delay())
                }
            }
        }
    }

    fn consume(&mut self, dir: IoDirection, bytes: u64) {
        if let Some(bucket) = self.bucket(dir) {
            bucket.consume(bytes);
        }
    }
}

/// An aggregate limit shared by every connection of one direction.
#[derive(Debug, Default)]
pub struct RateGroup {
    buckets: Mutex<BucketPair>,
}

impl RateGroup {
    /// Create a group with the given limit.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            buckets: Mutex::new(BucketPair::from_limit(&limit)),
        }
    }

    /// Replace the group limit. Buckets restart full.
    pub fn set_limit(&self, limit: RateLimit) {
        *self.buckets.lock() = BucketPair::from_limit(&limit);
    }
}

/// The buckets one connection draws from.
#[derive(Debug)]
pub struct ConnLimiter {
    group: Arc<RateGroup>,
    own: Mutex<BucketPair>,
}

impl ConnLimiter {
    /// Create a limiter in `group` without an override.
    pub fn new(group: Arc<RateGroup>) -> Self {
        Self {
            group,
            own: Mutex::new(BucketPair::default()),
        }
    }

    /// Install a per-connection limit on top of the group.
    pub fn set_override(&self, limit: RateLimit) {
        *self.own.lock() = BucketPair::from_limit(&limit);
    }

    /// Bytes that may move now, or the wait before trying again.
    pub fn allowance(&self, dir: IoDirection) -> Result<u64, Duration> {
        let now = Instant::now();
        let group = self.group.buckets.lock().allowance(dir, now);
        let own = self.own.lock().allowance(dir, now);
        match (group, own) {
            (Ok(a), Ok(b)) => Ok(a.min(b)),
            (Err(a), Err(b)) => Err(a.max(b)),
            (Err(d), _) | (_, Err(d)) => Err(d),
        }
    }

    /// Record `bytes` moved in `dir`.
    pub fn consume(&self, dir: IoDirection, bytes: u64) {
        self.group.buckets.lock().consume(dir, bytes);
        self.own.lock().consume(dir, bytes);
    }

    /// Wait until some bytes may move and return how many, capped at `want`.
    pub async fn ready(&self, dir: IoDirection, want: usize) -> usize {
        loop {
            match self.allowance(dir) {
                Ok(allowed) => return usize::try_from(allowed).unwrap_or(usize::MAX).min(want),
                Err(delay) => tokio::time::sleep(delay.max(Duration::from_millis(1))).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_refill_and_cap() {
        let mut bucket = TokenBucket::new(1000, 500);
        assert_eq!(bucket.available(), 500);

        bucket.consume(800);
        assert_eq!(bucket.available(), -300);
        assert!(bucket.delay() > Duration::from_millis(250));

        let later = bucket.last_refill + Duration::from_secs(10);
        bucket.refill(later);
        assert_eq!(bucket.available(), 500);
        assert_eq!(bucket.delay(), Duration::ZERO);
    }

    #[test]
    fn test_unlimited_by_default() {
        let limiter = ConnLimiter::new(Arc::new(RateGroup::default()));
        assert_eq!(limiter.allowance(IoDirection::Read), Ok(u64::MAX));
        limiter.consume(IoDirection::Read, 1 << 40);
        assert_eq!(limiter.allowance(IoDirection::Read), Ok(u64::MAX));
    }

    #[test]
    fn test_override_and_group_combine() {
        let group = Arc::new(RateGroup::new(RateLimit::symmetric(1000, 400)));
        let limiter = ConnLimiter::new(group.clone());
        assert_eq!(limiter.allowance(IoDirection::Write), Ok(400));

        limiter.set_override(RateLimit::new(u64::MAX, u64::MAX, 1000, 100));
        assert_eq!(limiter.allowance(IoDirection::Write), Ok(100));
        assert_eq!(limiter.allowance(IoDirection::Read), Ok(400));

        limiter.consume(IoDirection::Write, 150);
        assert!(limiter.allowance(IoDirection::Write).is_err());

        // A new group limit applies to every member
        group.set_limit(RateLimit::UNLIMITED);
        limiter.set_override(RateLimit::UNLIMITED);
        assert_eq!(limiter.allowance(IoDirection::Write), Ok(u64::MAX));
    }

    #[tokio::test]
    async fn test_ready_caps_at_want() {
        let limiter = ConnLimiter::new(Arc::new(RateGroup::new(RateLimit::symmetric(10_000, 64))));
        assert_eq!(limiter.ready(IoDirection::Read, 16).await, 16);
        assert_eq!(limiter.ready(IoDirection::Read, 1024).await, 64);
    }

    #[test]
    fn test_rate_limit_unlimited() {
        assert!(RateLimit::default().is_unlimited());
        assert!(!RateLimit::symmetric(1, 1).is_unlimited());
    }
}
