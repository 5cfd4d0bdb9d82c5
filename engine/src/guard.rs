use common::model::config::LimiterConfig;
use log::{debug, info, warn};
use metrics::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use utils::backoff;
use utils::rate_limit::FixedWindowRateLimiter;

/// A held slot against the external API. Concurrency is released on drop;
/// the window limiter slot is consumed for the rest of the window.
pub struct GuardPermit {
    _permit: OwnedSemaphorePermit,
}

/// Backpressure guard in front of the rate-limited enrichment API.
///
/// Three mechanisms stack:
/// - a semaphore caps concurrent in-flight calls at `max_concurrency`;
/// - a fixed-window limiter matches the API's published requests/minute;
/// - on throttle signals the effective concurrency shrinks additively
///   (permits are stashed, not released) and recovers one permit per
///   `increase_after_successes` consecutive successes.
///
/// The guard never drops a message. A throttled call is simply not acked by
/// the worker, and the broker's normal redelivery path retries it; the
/// worker backs off before its next lease using `consume_backoff`.
pub struct RateGuard {
    semaphore: Arc<Semaphore>,
    limiter: FixedWindowRateLimiter,
    max_concurrency: usize,
    min_concurrency: usize,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
    increase_after_successes: u32,
    /// Permits withheld from the semaphore by additive decrease.
    stashed: Mutex<Vec<OwnedSemaphorePermit>>,
    backoff_pending: AtomicBool,
    throttle_streak: AtomicU32,
    success_streak: AtomicU32,
    throttle_total: AtomicU64,
}

impl RateGuard {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            limiter: FixedWindowRateLimiter::per_minute(config.requests_per_minute),
            max_concurrency: config.max_concurrency,
            min_concurrency: config.min_concurrency,
            backoff_base_ms: config.backoff_base_ms,
            backoff_cap_ms: config.backoff_cap_ms,
            increase_after_successes: config.increase_after_successes,
            stashed: Mutex::new(Vec::new()),
            backoff_pending: AtomicBool::new(false),
            throttle_streak: AtomicU32::new(0),
            success_streak: AtomicU32::new(0),
            throttle_total: AtomicU64::new(0),
        }
    }

    /// Wait for a concurrency slot and a requests/minute slot. In-flight
    /// calls can never exceed the configured cap while the returned permit
    /// is held.
    pub async fn acquire(&self) -> GuardPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("guard semaphore closed");
        self.limiter.acquire().await;
        GuardPermit { _permit: permit }
    }

    /// Record a throttle signal (HTTP 429 or equivalent) and additively
    /// lower the effective concurrency cap.
    pub async fn note_throttle(&self) {
        self.backoff_pending.store(true, Ordering::SeqCst);
        self.throttle_streak.fetch_add(1, Ordering::SeqCst);
        self.success_streak.store(0, Ordering::SeqCst);
        self.throttle_total.fetch_add(1, Ordering::SeqCst);
        counter!("pipeline_throttled_total").increment(1);

        let mut stashed = self.stashed.lock().await;
        let effective = self.max_concurrency - stashed.len();
        if effective > self.min_concurrency {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                stashed.push(permit);
                warn!(
                    "throttled by enrichment API, lowering concurrency to {}",
                    effective - 1
                );
            }
            // All permits busy: the decrease lands when one frees up and the
            // next throttle stashes it.
        }
    }

    /// Record a successful call. After enough consecutive successes one
    /// stashed permit is returned, slowly restoring the cap toward its
    /// configured maximum.
    pub async fn note_success(&self) {
        self.throttle_streak.store(0, Ordering::SeqCst);
        let streak = self.success_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak >= self.increase_after_successes {
            self.success_streak.store(0, Ordering::SeqCst);
            let mut stashed = self.stashed.lock().await;
            if stashed.pop().is_some() {
                let effective = self.max_concurrency - stashed.len();
                info!("restoring enrichment concurrency to {effective}");
            }
        }
    }

    /// One-shot backoff hint for the worker that hit the throttle: how long
    /// to sleep before the next lease attempt. Exponential in the current
    /// throttle streak, with jitter. `None` when no throttle is pending.
    pub fn consume_backoff(&self) -> Option<Duration> {
        if !self.backoff_pending.swap(false, Ordering::SeqCst) {
            return None;
        }
        let streak = self.throttle_streak.load(Ordering::SeqCst);
        let delay = backoff::with_jitter(self.backoff_base_ms, self.backoff_cap_ms, streak);
        debug!("throttle backoff before next lease: {delay:?}");
        Some(delay)
    }

    /// Lifetime count of throttle signals; the health monitor samples this
    /// to raise the sustained-throttle alarm.
    pub fn throttle_total(&self) -> u64 {
        self.throttle_total.load(Ordering::SeqCst)
    }

    /// Concurrency cap currently in effect.
    pub async fn effective_concurrency(&self) -> usize {
        self.max_concurrency - self.stashed.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(max: usize) -> LimiterConfig {
        LimiterConfig {
            max_concurrency: max,
            min_concurrency: 1,
            requests_per_minute: 100_000,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            increase_after_successes: 2,
        }
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_cap() {
        let guard = Arc::new(RateGuard::new(&config(3)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let guard = guard.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = guard.acquire().await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_additive_decrease_and_slow_recovery() {
        let guard = RateGuard::new(&config(4));
        assert_eq!(guard.effective_concurrency().await, 4);

        guard.note_throttle().await;
        assert_eq!(guard.effective_concurrency().await, 3);
        guard.note_throttle().await;
        assert_eq!(guard.effective_concurrency().await, 2);

        // One success is not enough with increase_after_successes = 2.
        guard.note_success().await;
        assert_eq!(guard.effective_concurrency().await, 2);
        guard.note_success().await;
        assert_eq!(guard.effective_concurrency().await, 3);

        guard.note_success().await;
        guard.note_success().await;
        assert_eq!(guard.effective_concurrency().await, 4);

        // Fully restored; further successes never exceed the configured cap.
        guard.note_success().await;
        guard.note_success().await;
        assert_eq!(guard.effective_concurrency().await, 4);
    }

    #[tokio::test]
    async fn test_decrease_respects_floor() {
        let guard = RateGuard::new(&config(2));
        guard.note_throttle().await;
        assert_eq!(guard.effective_concurrency().await, 1);
        guard.note_throttle().await;
        assert_eq!(guard.effective_concurrency().await, 1);
    }

    #[tokio::test]
    async fn test_backoff_hint_is_one_shot_and_grows() {
        let guard = RateGuard::new(&config(2));
        assert!(guard.consume_backoff().is_none());

        guard.note_throttle().await;
        let first = guard.consume_backoff().expect("hint after throttle");
        assert!(first >= Duration::from_millis(10));
        assert!(guard.consume_backoff().is_none());

        guard.note_throttle().await;
        guard.note_throttle().await;
        let later = guard.consume_backoff().unwrap();
        assert!(later >= Duration::from_millis(40));
        assert_eq!(guard.throttle_total(), 3);
    }
}
