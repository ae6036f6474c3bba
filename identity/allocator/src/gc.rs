//! Periodic garbage collection of unreferenced identities and stale locks.
//!
//! Neither collector requires a single runner for correctness; deletions
//! happen under the per-key distributed lock and only after two
//! observations of the same unreferenced state at the same modification
//! revision. The stale maps carried between cycles are the only state, and
//! losing them merely costs one extra cycle.

use crate::{
    backend::{Backend, GcStats, StaleKeys, StaleLocks},
    metrics::GcMetrics,
    Result,
};
use cordon_identity_core::{AllocatorKey, Id};
use parking_lot::Mutex;
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Token-bucket pacing for destructive store operations.
pub struct RateLimiter {
    period: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

// === impl RateLimiter ===

impl RateLimiter {
    /// One token per `period`, up to `burst` accumulated. A zero period
    /// disables pacing.
    pub fn new(period: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            period,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        if self.period.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill);
                if elapsed >= self.period {
                    let periods = elapsed.as_nanos() / self.period.as_nanos();
                    if periods >= u128::from(self.burst) {
                        bucket.tokens = self.burst;
                        bucket.last_refill = now;
                    } else {
                        bucket.tokens = bucket.tokens.saturating_add(periods as u32).min(self.burst);
                        bucket.last_refill += self.period * periods as u32;
                    }
                }
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                self.period
                    .checked_sub(now.duration_since(bucket.last_refill))
                    .unwrap_or_default()
            };
            time::sleep(wait).await;
        }
    }
}

/// Drives both collectors, carrying their stale maps between cycles.
pub struct GcRunner<K, B> {
    backend: Arc<B>,
    limiter: RateLimiter,
    min: Id,
    max: Id,
    stale: StaleKeys,
    stale_locks: StaleLocks,
    metrics: Option<GcMetrics>,
    _key: PhantomData<fn() -> K>,
}

// === impl GcRunner ===

impl<K: AllocatorKey, B: Backend<K>> GcRunner<K, B> {
    pub fn new(backend: Arc<B>, min: Id, max: Id, limiter: RateLimiter) -> Self {
        Self {
            backend,
            limiter,
            min,
            max,
            stale: StaleKeys::default(),
            stale_locks: StaleLocks::default(),
            metrics: None,
            _key: PhantomData,
        }
    }

    pub fn with_metrics(mut self, metrics: GcMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One identity collection cycle.
    pub async fn run_identity_cycle(&mut self) -> Result<GcStats> {
        let (stale, stats) = self
            .backend
            .run_gc(&self.limiter, &self.stale, self.min, self.max)
            .await?;
        self.stale = stale;
        if let Some(metrics) = &self.metrics {
            metrics.record(stats);
        }
        debug!(
            alive = stats.alive,
            deleted = stats.deleted,
            "identity garbage collection cycle complete"
        );
        Ok(stats)
    }

    /// One lock collection round.
    pub async fn run_locks_cycle(&mut self) -> Result<()> {
        self.stale_locks = self.backend.run_locks_gc(&self.stale_locks).await?;
        debug!(
            held = self.stale_locks.len(),
            "lock garbage collection round complete"
        );
        Ok(())
    }

    /// Runs both collectors every `period` until drained.
    pub async fn run(mut self, period: Duration, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = interval.tick() => {}
            }
            if let Err(error) = self.run_identity_cycle().await {
                warn!(%error, "identity garbage collection failed");
            }
            if let Err(error) = self.run_locks_cycle().await {
                warn!(%error, "lock garbage collection failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_paces() {
        let limiter = RateLimiter::new(Duration::from_millis(100), 2);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(80), "burst is free");
        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(80),
            "third acquisition must wait for a refill"
        );
    }

    #[tokio::test]
    async fn zero_period_disables_pacing() {
        let limiter = RateLimiter::new(Duration::ZERO, 1);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
