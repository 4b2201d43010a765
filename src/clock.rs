// Clock abstraction so polling loops can be driven without real sleeps
use std::time::{Duration, Instant};

/// Source of time for everything that polls a container or daemon
pub trait Clock: Send + Sync {
    /// Get the current instant
    fn now(&self) -> Instant;

    /// Block the calling thread for the given duration
    fn sleep(&self, duration: Duration);

    /// Time elapsed since `start` according to this clock
    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

/// Wall clock backed by `Instant` and `thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
