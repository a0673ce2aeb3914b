//! Pacing for sequential collection loops. Limiters only decide how long to
//! wait; the injected [`Clock`] does the waiting, so tests run without real
//! delays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when slept on. Every sleep is recorded.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed_nanos: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub async fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().await.clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().await.push(duration);
        self.advance(duration);
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until the next request may proceed.
    async fn acquire(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self) {}
}

/// At most one acquisition per `interval`; the first one is immediate.
pub struct FixedIntervalLimiter<C: Clock> {
    interval: Duration,
    clock: C,
    next_slot: Mutex<Option<Instant>>,
}

impl<C: Clock> FixedIntervalLimiter<C> {
    pub fn new(interval: Duration, clock: C) -> Self {
        Self {
            interval,
            clock,
            next_slot: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<C: Clock> RateLimiter for FixedIntervalLimiter<C> {
    async fn acquire(&self) {
        let wait = {
            let mut next_slot = self.next_slot.lock().await;
            let now = self.clock.now();
            let ready_at = next_slot.map_or(now, |slot| slot.max(now));
            *next_slot = Some(ready_at + self.interval);
            ready_at - now
        };
        if !wait.is_zero() {
            self.clock.sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Burst-tolerant limiter: `capacity` tokens, one regained per `refill_every`.
pub struct SimpleTokenBucket<C: Clock> {
    capacity: u32,
    refill_every: Duration,
    clock: C,
    state: Mutex<TokenBucketState>,
}

impl<C: Clock> SimpleTokenBucket<C> {
    pub fn new(capacity: u32, refill_every: Duration, clock: C) -> Self {
        let last_refill = clock.now();
        Self {
            capacity,
            refill_every,
            clock,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill,
            }),
        }
    }
}

#[async_trait]
impl<C: Clock> RateLimiter for SimpleTokenBucket<C> {
    async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos()).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                // Keep the unspent remainder toward the next token.
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            self.clock.sleep(self.refill_every).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_interval_first_acquire_is_immediate_then_paced() {
        let clock = Arc::new(ManualClock::new());
        let limiter = FixedIntervalLimiter::new(Duration::from_millis(500), clock.clone());

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert_eq!(
            clock.sleeps().await,
            vec![Duration::from_millis(500), Duration::from_millis(500)]
        );
    }

    #[tokio::test]
    async fn fixed_interval_credits_time_spent_elsewhere() {
        let clock = Arc::new(ManualClock::new());
        let limiter = FixedIntervalLimiter::new(Duration::from_millis(1000), clock.clone());

        limiter.acquire().await;
        clock.advance(Duration::from_millis(700));
        limiter.acquire().await;
        clock.advance(Duration::from_secs(5));
        limiter.acquire().await;

        assert_eq!(clock.sleeps().await, vec![Duration::from_millis(300)]);
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_then_waits_for_refill() {
        let clock = Arc::new(ManualClock::new());
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(250), clock.clone());

        bucket.acquire().await;
        bucket.acquire().await;
        assert!(clock.sleeps().await.is_empty());

        bucket.acquire().await;
        assert_eq!(clock.sleeps().await, vec![Duration::from_millis(250)]);
    }

    #[tokio::test]
    async fn token_bucket_keeps_partial_refill_progress() {
        let clock = Arc::new(ManualClock::new());
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(100), clock.clone());

        bucket.acquire().await;
        clock.advance(Duration::from_millis(150));
        bucket.acquire().await;
        clock.advance(Duration::from_millis(50));
        bucket.acquire().await;

        assert!(clock.sleeps().await.is_empty());
    }

    #[tokio::test]
    async fn unlimited_never_sleeps() {
        Unlimited.acquire().await;
    }
}
