use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Time source for retry pauses and phase timing.
///
/// Production code sleeps on the tokio timer; tests substitute a clock that
/// records the requested pauses and returns immediately.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;

    /// Timestamp recorded in persisted identity records.
    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}
