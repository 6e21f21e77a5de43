use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{Semaphore, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{RateSpec, TickUnit};
use internals::*;

/// How often the governor converts elapsed time into permits.
pub const REFILL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limiter '{0}' was closed")]
pub struct RateLimiterClosed(pub String);

/// Awaitable pacing gate.
///
/// Share one instance (behind an `Arc`) between motors for activity-scoped pacing, or
/// give each motor its own for thread-scoped pacing. Construction spawns the governor
/// task, so it must happen inside a Tokio runtime. The governor stops when the limiter is
/// closed or dropped.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    pools: watch::Sender<Arc<Pools>>,
    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, spec: RateSpec) -> Self {
        let name = name.into();
        let (pools, rx) = watch::channel(Arc::new(Pools::new(spec, Instant::now())));
        let shutdown = CancellationToken::new();

        tracing::debug!(limiter = %name, %spec, "spawning rate governor");
        tokio::spawn(governor_task(
            name.clone(),
            rx,
            shutdown.clone(),
            REFILL_INTERVAL,
        ));

        Self {
            name,
            pools,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> RateSpec {
        self.pools.borrow().spec
    }

    /// Waits until one op worth of time is available, then consumes it.
    ///
    /// Returns the scheduling delay at the moment of the grant: how far the consumers are
    /// behind the target schedule.
    pub async fn acquire(&self) -> Result<Duration, RateLimiterClosed> {
        loop {
            let pools = self.pools.borrow().clone();
            match pools.active.acquire_many(pools.ticks_per_op).await {
                Ok(permit) => {
                    // Time is only ever added by the governor.
                    permit.forget();
                    return Ok(pools.scheduling_delay());
                }
                Err(_) if self.shutdown.is_cancelled() => {
                    return Err(RateLimiterClosed(self.name.clone()));
                }
                // The pools were replaced by a new spec; retry against the new ones.
                Err(_) => continue,
            }
        }
    }

    /// Replaces the spec. Takes effect for every pending and future `acquire`.
    ///
    /// On a closed limiter the spec is recorded but its pools stay closed.
    pub fn apply_rate_spec(&self, spec: RateSpec) {
        let previous = self
            .pools
            .send_replace(Arc::new(Pools::new(spec, Instant::now())));
        previous.active.close();
        // Checked after the swap so a concurrent close() cannot leave fresh pools open.
        if self.shutdown.is_cancelled() {
            self.pools.borrow().active.close();
            tracing::debug!(limiter = %self.name, "rate update on closed limiter");
            return;
        }
        tracing::info!(limiter = %self.name, from = %previous.spec, to = %spec, "applied rate spec");
    }

    /// Current accumulated scheduling delay.
    pub fn scheduling_delay(&self) -> Duration {
        self.pools.borrow().scheduling_delay()
    }

    /// Stops the governor and fails every pending and future `acquire`. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.pools.borrow().active.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn governor_task(
    name: String,
    pools: watch::Receiver<Arc<Pools>>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let main_task = async {
        let mut next_tick = Instant::now();
        loop {
            next_tick += interval;
            tokio::time::sleep_until(next_tick).await;
            let current = pools.borrow().clone();
            current.refill(Instant::now());
        }
    };

    tokio::select! {
        _ = main_task => {}
        _ = shutdown.cancelled() => {
            tracing::debug!(limiter = %name, "rate governor received shutdown signal");
        }
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Pool arithmetic for the governor.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// Capacity limits derived from a [`RateSpec`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolCaps {
        /// One second of ticks, or one op if that is larger.
        pub max_active: u64,
        /// Ceiling for the active pool while recovering from a backlog.
        pub max_over_active: u64,
        /// `max_over_active - max_active`.
        pub burst_pool: u64,
    }

    impl PoolCaps {
        pub fn for_spec(spec: &RateSpec) -> Self {
            let max_active = spec
                .unit()
                .ticks_per_second()
                .max(spec.ticks_per_op() as u64)
                .min(Semaphore::MAX_PERMITS as u64);
            let max_over_active = ((max_active as f64 * spec.burst()) as u64)
                .clamp(max_active, Semaphore::MAX_PERMITS as u64);
            Self {
                max_active,
                max_over_active,
                burst_pool: max_over_active - max_active,
            }
        }
    }

    /// What one governor tick does to the pools.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Refill {
        /// Permits to release into the active pool, recovered ticks included.
        pub permits: u64,
        /// New size of the waiting pool.
        pub waiting: u64,
        /// Ticks moved from the waiting pool back to the active pool.
        pub recovered: u64,
    }

    /// Pure function planning a refill of `new_ticks` given the current pool levels.
    pub fn plan_refill(new_ticks: u64, available: u64, waiting: u64, caps: PoolCaps) -> Refill {
        let needed = caps.max_active.saturating_sub(available);
        let direct = new_ticks.min(needed);
        let mut waiting = waiting.saturating_add(new_ticks - direct);
        let available = available + direct;

        let refill_factor = (new_ticks as f64 / caps.max_active as f64).min(1.0);
        let recoverable = ((refill_factor * caps.burst_pool as f64) as u64)
            .min(caps.max_over_active.saturating_sub(available));
        let recovered = recoverable.min(waiting);
        waiting -= recovered;

        Refill {
            permits: direct + recovered,
            waiting,
            recovered,
        }
    }

    /// One generation of limiter state, bound to a single spec.
    #[derive(Debug)]
    pub(super) struct Pools {
        pub(super) spec: RateSpec,
        unit: TickUnit,
        pub(super) ticks_per_op: u32,
        caps: PoolCaps,
        pub(super) active: Semaphore,
        waiting: AtomicU64,
        last_refill: Mutex<Instant>,
    }

    impl Pools {
        pub(super) fn new(spec: RateSpec, now: Instant) -> Self {
            let ticks_per_op = spec.ticks_per_op();
            Self {
                spec,
                unit: spec.unit(),
                ticks_per_op,
                caps: PoolCaps::for_spec(&spec),
                // The first op after (re)configuration goes through immediately.
                active: Semaphore::new(ticks_per_op as usize),
                waiting: AtomicU64::new(0),
                last_refill: Mutex::new(now),
            }
        }

        pub(super) fn scheduling_delay(&self) -> Duration {
            Duration::from_nanos(self.unit.ticks_to_nanos(self.waiting.load(Ordering::Acquire)))
        }

        pub(super) fn refill(&self, now: Instant) {
            let mut last = self.last_refill.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = now.saturating_duration_since(*last).as_nanos();
            let new_ticks = self
                .unit
                .nanos_to_ticks(u64::try_from(elapsed).unwrap_or(u64::MAX));
            if new_ticks == 0 {
                return;
            }
            // Carry the sub-tick remainder into the next refill.
            *last += Duration::from_nanos(self.unit.ticks_to_nanos(new_ticks));

            let refill = plan_refill(
                new_ticks,
                self.active.available_permits() as u64,
                self.waiting.load(Ordering::Acquire),
                self.caps,
            );
            self.waiting.store(refill.waiting, Ordering::Release);
            if refill.permits > 0 {
                self.active.add_permits(refill.permits as usize);
            }
            if refill.recovered > 0 {
                tracing::trace!(recovered = refill.recovered, waiting = refill.waiting, "burst recovery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep_until;

    async fn count_grants(limiter: &RateLimiter, window: Duration) -> u64 {
        let deadline = Instant::now() + window;
        let mut count = 0;
        loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => break,
                grant = limiter.acquire() => {
                    grant.unwrap();
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_target_rate() {
        let limiter = RateLimiter::new("accuracy", RateSpec::new(100.0).unwrap());
        let count = count_grants(&limiter, Duration::from_secs(10)).await;
        assert!((950..=1050).contains(&count), "got {count}");
    }

    #[tokio::test(start_paused = true)]
    async fn doubling_the_rate_doubles_throughput() {
        let limiter = RateLimiter::new("update", RateSpec::new(100.0).unwrap());
        let before = count_grants(&limiter, Duration::from_secs(5)).await;

        limiter.apply_rate_spec(RateSpec::new(200.0).unwrap());
        let after = count_grants(&limiter, Duration::from_secs(5)).await;

        let ratio = after as f64 / before as f64;
        assert!((1.8..=2.2).contains(&ratio), "{before} -> {after}");
        assert_eq!(limiter.spec().ops_per_sec(), 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_limiter_caps_aggregate_rate() {
        let limiter = Arc::new(RateLimiter::new("shared", RateSpec::new(50.0).unwrap()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { count_grants(&limiter, Duration::from_secs(4)).await })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert!((185..=215).contains(&total), "got {total}");
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_and_future_acquires() {
        let limiter = Arc::new(RateLimiter::new("closing", RateSpec::new(0.5).unwrap()));
        limiter.acquire().await.unwrap();

        let pending = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        limiter.close();
        limiter.close();

        assert_eq!(pending.await.unwrap(), Err(RateLimiterClosed("closing".into())));
        assert!(limiter.acquire().await.is_err());
        assert!(limiter.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn spec_applied_after_close_keeps_acquire_failing() {
        let limiter = RateLimiter::new("late", RateSpec::new(100.0).unwrap());
        limiter.close();
        limiter.apply_rate_spec(RateSpec::new(1_000.0).unwrap());

        assert_eq!(
            limiter.acquire().await,
            Err(RateLimiterClosed("late".into()))
        );
        assert!(limiter.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_acquire_survives_spec_swap() {
        let limiter = Arc::new(RateLimiter::new("swap", RateSpec::new(0.01).unwrap()));
        limiter.acquire().await.unwrap();

        let pending = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        limiter.apply_rate_spec(RateSpec::new(1000.0).unwrap());

        let delay = tokio::time::timeout(Duration::from_millis(50), pending)
            .await
            .expect("acquire should complete against the new pools")
            .unwrap();
        assert!(delay.is_ok());
    }

    mod plan_refill {
        use super::*;

        const CAPS: PoolCaps = PoolCaps {
            max_active: 1_000,
            max_over_active: 1_500,
            burst_pool: 500,
        };

        #[test]
        fn fills_active_pool_first() {
            let refill = plan_refill(100, 0, 0, CAPS);
            assert_eq!(
                refill,
                Refill {
                    permits: 100,
                    waiting: 0,
                    recovered: 0
                }
            );
        }

        #[test]
        fn overflow_goes_to_waiting_then_partly_recovers() {
            // 100 fit directly, 200 overflow; refill factor 0.3 allows 150 back.
            let refill = plan_refill(300, 900, 0, CAPS);
            assert_eq!(
                refill,
                Refill {
                    permits: 250,
                    waiting: 50,
                    recovered: 150
                }
            );
        }

        #[test]
        fn recovery_is_bounded_by_burst_ceiling() {
            let refill = plan_refill(100, 1_500, 10_000, CAPS);
            assert_eq!(
                refill,
                Refill {
                    permits: 0,
                    waiting: 10_100,
                    recovered: 0
                }
            );
        }

        #[test]
        fn refill_factor_saturates_at_one() {
            let refill = plan_refill(5_000, 0, 0, CAPS);
            assert_eq!(
                refill,
                Refill {
                    permits: 1_500,
                    waiting: 3_500,
                    recovered: 500
                }
            );
        }

        #[test]
        fn caps_follow_spec() {
            let spec = RateSpec::new(100.0).unwrap().with_burst(1.5).unwrap();
            let caps = PoolCaps::for_spec(&spec);
            assert_eq!(caps.max_active, 1_000_000_000);
            assert_eq!(caps.max_over_active, 1_500_000_000);
            assert_eq!(caps.burst_pool, 500_000_000);
        }
    }
}
