//! Sliding-window admission control for tool invocations.
//!
//! Each orchestration session owns one [`RateLimiter`]. [`admit`](RateLimiter::admit) never
//! fails: when the window is full it suspends the caller until the oldest timestamp leaves
//! the window (plus a safety margin), then records the new invocation.
//!
//! The timestamp buffer sits behind an async mutex held for the whole admission, so
//! concurrent callers are admitted strictly in arrival order.
//!
//! Time is read through the [`Clock`] trait so the blocking contract can be exercised
//! without real sleeps:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use toolrelay::rate_limiter::{ManualClock, RateLimiter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let clock = Arc::new(ManualClock::new());
//! let limiter = RateLimiter::with_clock(2, Duration::from_secs(60), Duration::from_secs(1), clock.clone());
//!
//! limiter.admit().await;
//! limiter.admit().await;
//! let waited = limiter.admit().await;
//! assert_eq!(waited, Duration::from_secs(61));
//! # }
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default ceiling of tool invocations per window.
pub const DEFAULT_MAX_CALLS: usize = 10;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Extra wait added once the oldest call leaves the window.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Source of time for the limiter.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `tokio::time`.
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

/// A clock that only moves when told to. `sleep` advances it instantly and records the
/// requested duration.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = self.elapsed.lock().map(|e| *e).unwrap_or_default();
        self.origin + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
    }
}

/// Per-session sliding-window limiter.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    safety_margin: Duration,
    timestamps: tokio::sync::Mutex<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Limiter on the wall clock.
    pub fn new(max_calls: usize, window: Duration, safety_margin: Duration) -> Self {
        Self::with_clock(max_calls, window, safety_margin, Arc::new(TokioClock))
    }

    /// Limiter reading time from `clock`. A ceiling of zero is treated as one.
    pub fn with_clock(
        max_calls: usize,
        window: Duration,
        safety_margin: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            safety_margin,
            timestamps: tokio::sync::Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// Block until a new invocation fits in the window, then record it.
    ///
    /// Returns how long the caller was suspended.
    pub async fn admit(&self) -> Duration {
        let mut timestamps = self.timestamps.lock().await;
        self.prune(&mut timestamps, self.clock.now());

        let mut waited = Duration::ZERO;
        if timestamps.len() >= self.max_calls {
            if let Some(&oldest) = timestamps.front() {
                let age = self.clock.now().saturating_duration_since(oldest);
                waited = self.window.saturating_sub(age) + self.safety_margin;
                log::info!(
                    "Rate limit of {} calls per {:?} reached, waiting {:?}",
                    self.max_calls,
                    self.window,
                    waited
                );
                self.clock.sleep(waited).await;
                self.prune(&mut timestamps, self.clock.now());
            }
        }

        timestamps.push_back(self.clock.now());
        waited
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Invocations currently inside the window.
    pub async fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        self.prune(&mut timestamps, self.clock.now());
        timestamps.len()
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS, DEFAULT_WINDOW, DEFAULT_SAFETY_MARGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::with_clock(10, DEFAULT_WINDOW, DEFAULT_SAFETY_MARGIN, clock)
    }

    #[tokio::test]
    async fn test_under_ceiling_never_waits() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone());
        for _ in 0..10 {
            assert_eq!(limiter.admit().await, Duration::ZERO);
            clock.advance(Duration::from_secs(1));
        }
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_eleventh_call_waits_for_window() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone());
        for _ in 0..10 {
            limiter.admit().await;
        }
        let elapsed = Duration::from_secs(12);
        clock.advance(elapsed);

        let waited = limiter.admit().await;
        assert!(waited >= DEFAULT_WINDOW - elapsed);
        assert_eq!(waited, Duration::from_secs(49));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(49)]);
        // the first ten have left the window, only the new call remains
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test]
    async fn test_old_calls_are_pruned() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone());
        for _ in 0..10 {
            limiter.admit().await;
        }
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.admit().await, Duration::ZERO);
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test]
    async fn test_staggered_calls_wait_for_oldest_only() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            2,
            Duration::from_secs(10),
            Duration::from_secs(1),
            clock.clone(),
        );
        limiter.admit().await;
        clock.advance(Duration::from_secs(4));
        limiter.admit().await;
        clock.advance(Duration::from_secs(2));
        // oldest is 6s old: wait 4s + 1s margin
        assert_eq!(limiter.admit().await, Duration::from_secs(5));
        assert_eq!(limiter.in_window().await, 2);
    }
}
