//! Time sources for call timestamps.

use tokio::time::Instant;

/// Milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Wall time derived from the tokio clock, starting at a fixed origin.
///
/// Follows `tokio::time::pause`/`advance`, so timestamps line up with
/// timer expiry in tests.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin_ms: i64,
    started: Instant,
}

impl MonotonicClock {
    pub fn starting_at(origin_ms: i64) -> Self {
        Self {
            origin_ms,
            started: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> i64 {
        self.origin_ms + self.started.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_paused_time() {
        let clock = MonotonicClock::starting_at(1000);
        assert_eq!(clock.now_millis(), 1000);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now_millis(), 31_000);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
