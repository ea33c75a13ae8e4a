//! Leaky-bucket style speed limiter.
//!
//! Bytes are counted over ~100 ms windows. Once a window closes, the
//! limiter compares the bytes moved against the configured rate and asks
//! the caller to pause just long enough to bring the window average back
//! to the target, then opens a new window.

use std::time::{Duration, Instant};

/// Length of one measurement window.
pub const WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Bytes per second; 0 disables throttling.
    limit: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl RateLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Change the rate; the current window restarts.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
        self.reset(Instant::now());
    }

    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.window_bytes = 0;
    }

    /// Record `bytes` moved. Returns how long to pause, if at all.
    pub fn consume(&mut self, bytes: u64) -> Option<Duration> {
        self.consume_at(bytes, Instant::now())
    }

    /// Same as [`consume`](Self::consume) with an explicit clock reading.
    pub fn consume_at(&mut self, bytes: u64, now: Instant) -> Option<Duration> {
        if self.limit == 0 {
            return None;
        }
        self.window_bytes = self.window_bytes.saturating_add(bytes);

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < WINDOW {
            return None;
        }

        let expected = Duration::from_secs_f64(self.window_bytes as f64 / self.limit as f64);
        let pause = expected.checked_sub(elapsed).filter(|d| !d.is_zero());
        // The next window starts once the pause is over.
        self.reset(now + pause.unwrap_or_default());
        pause
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_pauses() {
        let mut rl = RateLimiter::unlimited();
        let t0 = Instant::now();
        assert_eq!(rl.consume_at(10_000_000, t0 + Duration::from_secs(1)), None);
    }

    #[test]
    fn no_pause_inside_open_window() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(1000);
        rl.reset(start);
        assert_eq!(rl.consume_at(5000, start + Duration::from_millis(50)), None);
    }

    #[test]
    fn pauses_to_bring_window_back_to_rate() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(1000);
        rl.reset(start);
        // 500 bytes at 1000 B/s should take 500 ms; 100 ms elapsed.
        let pause = rl
            .consume_at(500, start + Duration::from_millis(100))
            .expect("pause");
        assert_eq!(pause, Duration::from_millis(400));
    }

    #[test]
    fn slow_window_resets_without_pause() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(1_000_000);
        rl.reset(start);
        assert_eq!(rl.consume_at(10, start + Duration::from_millis(150)), None);
        // Counting restarted: a small follow-up within the new window is free.
        assert_eq!(rl.consume_at(10, start + Duration::from_millis(200)), None);
    }
}
