//! Admission control for lookup workers.
//!
//! The gate bounds how many workers run at once through a semaphore, and optionally how many
//! lookups are issued per interval through a token bucket.
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time;

use governor::{
    clock::{self, Clock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    NegativeMultiDecision, Quota, RateLimiter,
};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// A token bucket budget: `requests` per `interval`, with bursts of up to `burst` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: NonZeroU32,
    pub interval: time::Duration,
    pub burst: NonZeroU32,
}

impl RateLimit {
    /// A budget of `requests` per `interval` allowing a full interval's worth of burst.
    pub fn new(requests: NonZeroU32, interval: time::Duration) -> Self {
        Self {
            requests,
            interval,
            burst: requests,
        }
    }

    fn quota(&self) -> Option<Quota> {
        Quota::with_period(self.interval / self.requests.get())
            .map(|quota| quota.allow_burst(self.burst))
    }
}

/// A governor clock reading tokio's clock, so a paused test runtime also drives the rate limiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl clock::Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type DirectRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// Lookups are paid for a whole burst at a time: a burst opens once the bucket has refilled
/// completely, and its slots are then handed out until spent.
///
/// The bucket starts empty, so the first burst opens after `burst` refills. With the default
/// burst of `requests`, the n-th lookup is issued no earlier than `ceil(n / requests)` intervals
/// after the gate was built.
struct RateBudget {
    limiter: DirectRateLimiter,
    burst: NonZeroU32,
    remaining: Mutex<u32>,
}

impl RateBudget {
    fn new(quota: Quota, burst: NonZeroU32, clock: &TokioClock) -> Self {
        let limiter = RateLimiter::direct_with_clock(quota, clock);
        if limiter.check_n(burst).is_err() {
            warn!("rate limiter did not start drained, the first burst is immediate");
        }

        Self {
            limiter,
            burst,
            remaining: Mutex::new(0),
        }
    }

    async fn take(&self, clock: &TokioClock) {
        let mut remaining = self.remaining.lock().await;

        if *remaining == 0 {
            loop {
                match self.limiter.check_n(self.burst) {
                    Ok(()) => break,
                    Err(NegativeMultiDecision::BatchNonConforming(_, not_until)) => {
                        tokio::time::sleep(not_until.wait_time_from(clock.now())).await;
                    }
                    Err(NegativeMultiDecision::InsufficientCapacity(_)) => {
                        unreachable!("a burst never exceeds the bucket it was sized from")
                    }
                }
            }
            *remaining = self.burst.get();
        }

        *remaining -= 1;
    }
}

/// Held by a worker for as long as it is active.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    budget: Option<RateBudget>,
    clock: TokioClock,
}

impl AdmissionGate {
    /// Build a gate admitting `capacity` concurrent workers, pacing lookups by `rate_limit` if given.
    ///
    /// A rate limit whose per-request period rounds down to zero is treated as unlimited.
    pub fn new(capacity: NonZeroUsize, rate_limit: Option<RateLimit>) -> Self {
        let clock = TokioClock;
        let budget = rate_limit.and_then(|rate_limit| {
            rate_limit
                .quota()
                .map(|quota| RateBudget::new(quota, rate_limit.burst, &clock))
        });

        Self {
            permits: Arc::new(Semaphore::new(capacity.get())),
            capacity: capacity.get(),
            budget,
            clock,
        }
    }

    /// Wait until fewer than `capacity` tokens are outstanding and take one.
    pub async fn acquire(&self) -> AdmissionToken {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("admission semaphore is never closed");

        metrics::gauge!("pincode_admission_saturation_percent").set(
            1f64 - self.permits.available_permits() as f64 / self.capacity as f64,
        );

        AdmissionToken { _permit: permit }
    }

    /// Hand a token back, admitting the next waiting worker.
    pub fn release(&self, token: AdmissionToken) {
        drop(token);
    }

    /// Wait until the rate budget allows one more lookup. Returns immediately when unlimited.
    pub async fn throttle(&self) {
        if let Some(budget) = &self.budget {
            budget.take(&self.clock).await;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently held.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}
