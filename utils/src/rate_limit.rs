use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window size (default one minute, matching per-minute published rates)
    pub window_size: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_size: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_size: Duration::from_secs(60),
        }
    }

    pub fn with_window_size(mut self, window_size: Duration) -> Self {
        self.window_size = window_size;
        self
    }
}

#[derive(Debug)]
struct WindowState {
    started: Instant,
    count: u32,
}

/// Fixed-window rate limiter matching an external API's published rate.
/// All consumers of the guarded API share one instance; the window rolls
/// over as a whole rather than sliding per request.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

impl FixedWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(RateLimitConfig::per_minute(max_requests))
    }

    /// Check whether a request would be admitted right now, without
    /// recording it.
    ///
    /// # Returns
    /// * `Ok(())` - below the limit
    /// * `Err(ms)` - over the limit; milliseconds until the window rolls over
    pub async fn verify(&self) -> Result<(), u64> {
        let state = self.state.lock().await;
        self.check(&state)
    }

    /// Verify and record in one step. The wait hint on `Err` is how long the
    /// caller should sleep before trying again.
    pub async fn try_acquire(&self) -> Result<(), u64> {
        let mut state = self.state.lock().await;

        if state.started.elapsed() >= self.config.window_size {
            state.started = Instant::now();
            state.count = 0;
        }

        match self.check(&state) {
            Ok(()) => {
                state.count += 1;
                Ok(())
            }
            Err(wait) => Err(wait),
        }
    }

    /// Acquire a slot, sleeping on the wait hint until one opens.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(wait_ms) => {
                    tokio::time::sleep(Duration::from_millis(wait_ms.max(1))).await;
                }
            }
        }
    }

    fn check(&self, state: &WindowState) -> Result<(), u64> {
        let elapsed = state.started.elapsed();
        if elapsed >= self.config.window_size {
            return Ok(());
        }
        if state.count < self.config.max_requests {
            return Ok(());
        }
        let remaining = self.config.window_size - elapsed;
        // +1 so the next check lands after the rollover
        Err(remaining.as_millis() as u64 + 1)
    }

    /// Requests recorded in the current window.
    pub async fn current_count(&self) -> u32 {
        let state = self.state.lock().await;
        if state.started.elapsed() >= self.config.window_size {
            0
        } else {
            state.count
        }
    }

    /// Reset the window.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.started = Instant::now();
        state.count = 0;
    }
}
