// Polling with a deadline
//
// Containers and the daemon are eventually consistent: an image disappears a
// moment after `compose down`, a broker registers a moment after its log says
// it started. `Await` retries a probe until it succeeds or the deadline passes.

use crate::clock::{Clock, SystemClock};
use crate::errors::{Result, RigError};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Retry a probe until it succeeds or `timeout` elapses
#[derive(Clone)]
pub struct Await {
    timeout: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Await {
    /// Wait for at most `timeout`
    pub fn at_most(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `probe` until it returns `Ok`
    ///
    /// The probe always runs at least once, even with a zero timeout. On
    /// timeout the last probe error is carried in `RigError::Timeout`.
    pub fn until_asserted<T, F>(&self, what: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let start = self.clock.now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last_error = match probe() {
                Ok(value) => {
                    tracing::debug!(what, attempts, "condition met");
                    return Ok(value);
                }
                Err(e) => e.to_string(),
            };

            let elapsed = self.clock.elapsed_since(start);
            if elapsed >= self.timeout {
                tracing::debug!(what, attempts, ?elapsed, "gave up waiting");
                return Err(RigError::Timeout {
                    what: what.to_string(),
                    elapsed,
                    last_error: Some(last_error),
                });
            }

            let remaining = self.timeout - elapsed;
            self.clock.sleep(self.poll_interval.min(remaining));
        }
    }

    /// Call `probe` until it returns `Ok(true)`
    pub fn until<F>(&self, what: &str, mut probe: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        self.until_asserted(what, || {
            if probe()? {
                Ok(())
            } else {
                Err(RigError::NotReady(what.to_string()))
            }
        })
    }
}
