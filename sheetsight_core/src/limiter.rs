//! Token-bucket rate limiting for the source-sheet API.
//!
//! The external API enforces two overlapping quotas (reads per minute and
//! requests per rolling 100 seconds), so the limiter composes two buckets
//! and a caller must clear both before a request goes out.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Error, Result};

/// Reads per minute allowed by the upstream quota.
const READS_PER_MINUTE: f64 = 300.0;
/// Requests per rolling 100-second window.
const REQUESTS_PER_100S: f64 = 100.0;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket with blocking, FIFO-fair acquisition.
///
/// Tokens refill continuously at `refill_rate` per second up to `capacity`.
/// `acquire` holds the bucket lock while waiting, so concurrent acquirers
/// are served strictly in arrival order.
#[derive(Debug)]
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

    /// Current token count after refill. Mostly useful for diagnostics.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    /// Acquire `n` tokens, sleeping until the bucket has refilled enough.
    ///
    /// Never returns before the bucket holds at least `n` tokens. Requests
    /// larger than the bucket capacity can never be satisfied and are
    /// rejected outright.
    pub async fn acquire(&self, n: u32) -> Result<()> {
        let needed = f64::from(n);
        if needed > self.capacity {
            return Err(Error::validation(
                crate::error::codes::BAD_LIMIT,
                format!("cannot acquire {n} tokens, bucket capacity is {}", self.capacity),
            ));
        }

        let mut state = self.state.lock().await;
        loop {
            self.refill(&mut state);
            if state.tokens >= needed {
                state.tokens -= needed;
                return Ok(());
            }
            let wait = (needed - state.tokens) / self.refill_rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Acquire without blocking. Returns false when short on tokens.
    pub async fn try_acquire(&self, n: u32) -> bool {
        let needed = f64::from(n);
        if needed > self.capacity {
            return false;
        }
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }
}

/// Composite limiter over the upstream's dual quota.
///
/// The safety factor scales both capacities and refill rates once at
/// construction; it also absorbs the over-provisioning that comes from
/// running one limiter per worker process instead of a shared one.
#[derive(Debug)]
pub struct SheetsRateLimiter {
    reads_per_minute: TokenBucket,
    requests_per_100s: TokenBucket,
}

impl SheetsRateLimiter {
    pub fn new(safety_factor: f64) -> Self {
        Self {
            reads_per_minute: TokenBucket::new(
                READS_PER_MINUTE * safety_factor,
                (READS_PER_MINUTE / 60.0) * safety_factor,
            ),
            requests_per_100s: TokenBucket::new(
                REQUESTS_PER_100S * safety_factor,
                (REQUESTS_PER_100S / 100.0) * safety_factor,
            ),
        }
    }

    /// Acquire from both buckets. Blocks until both limits are satisfied.
    pub async fn acquire(&self, request_count: u32) -> Result<()> {
        self.reads_per_minute.acquire(request_count).await?;
        self.requests_per_100s.acquire(request_count).await?;
        Ok(())
    }
}

impl Default for SheetsRateLimiter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RATE_SAFETY_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_refills_at_rate() {
        let bucket = TokenBucket::new(10.0, 2.0);
        bucket.acquire(10).await.unwrap();
        assert!(bucket.available().await < 1e-9);

        tokio::time::advance(Duration::from_secs(3)).await;
        let available = bucket.available().await;
        assert!((available - 6.0).abs() < 1e-6, "got {available}");

        // Refill is capped at capacity.
        tokio::time::advance(Duration::from_secs(60)).await;
        let available = bucket.available().await;
        assert!((available - 10.0).abs() < 1e-6, "got {available}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_enough_tokens() {
        let bucket = std::sync::Arc::new(TokenBucket::new(4.0, 1.0));
        bucket.acquire(4).await.unwrap();

        let b = bucket.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { b.acquire(2).await });
        // Paused clock: the spawned acquire computes a 2 s wait and the
        // runtime auto-advances through it.
        handle.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn refilled_tokens_acquire_without_blocking() {
        let bucket = TokenBucket::new(5.0, 1.0);
        bucket.acquire(5).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(bucket.try_acquire(3).await);
    }

    #[tokio::test]
    async fn oversized_acquire_is_rejected() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.acquire(3).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn composite_limiter_observes_both_buckets() {
        // With a safety factor of 1.0 the second bucket holds 100 tokens and
        // refills at 1/s, so a burst of 101 requests must wait on it even
        // though the per-minute bucket still has room.
        let limiter = SheetsRateLimiter::new(1.0);
        limiter.acquire(100).await.unwrap();
        let started = Instant::now();
        limiter.acquire(1).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
