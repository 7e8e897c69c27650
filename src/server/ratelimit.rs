//! Per-connection message rate limiting.
//!
//! A fixed one-second window with a message budget. Excess messages are
//! answered with an error frame and dropped; the connection is never
//! closed for rate violations.

use std::time::{Duration, Instant};

/// Messages allowed per window per client.
pub const DEFAULT_MESSAGES_PER_SECOND: u32 = 10;

/// Fixed-window message counter.
#[derive(Debug)]
pub struct MessageRateLimiter {
    limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl MessageRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Record one inbound message. Returns false when the message exceeds
    /// this window's budget and must be dropped.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

impl Default for MessageRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGES_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_exact_within_window() {
        let mut limiter = MessageRateLimiter::new(10);
        let allowed = (0..12).filter(|_| limiter.allow()).count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn window_reset_restores_budget() {
        let mut limiter = MessageRateLimiter::new(2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        limiter.window_start = Instant::now() - Duration::from_secs(2);
        assert!(limiter.allow());
    }
}
