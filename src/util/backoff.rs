//! Failure backoff for delivery workers.
//!
//! Each worker owns one [`Backoff`]. After a failed send the worker waits for
//! the current delay, which then grows towards `max`; the first success
//! snaps it back to `base`. Delays are tied to the remote call timeout so a
//! slow broker is not hammered with retries.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::trace;

use crate::core::shutdown::Shutdown;

/// How the delay grows between consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Growth {
    /// `base, 2*base, 3*base, ...`
    Linear,
    /// `base, 2*base, 4*base, ...`
    #[default]
    Exponential,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    growth: Growth,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, growth: Growth) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            growth,
        }
    }

    /// `base = timeout`, `max = max_factor * timeout`.
    pub fn from_timeout(timeout: Duration, max_factor: u32, growth: Growth) -> Self {
        Self::new(timeout, timeout.saturating_mul(max_factor.max(1)), growth)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay the next failure will wait for.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Records a failure and returns the delay that applies to it.
    ///
    /// With `wait` set the caller is suspended for that delay. A shutdown
    /// signal cuts the wait short; that is not reported as an error.
    pub async fn on_failure(&mut self, wait: bool, shutdown: &mut Shutdown) -> Duration {
        let delay = self.advance();
        if wait && !delay.is_zero() && !shutdown.is_shutdown() {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    trace!(target: "producer::backoff", ?delay, "backoff interrupted by shutdown");
                }
            }
        }
        delay
    }

    pub fn on_success(&mut self) {
        self.current = self.base;
    }

    fn advance(&mut self) -> Duration {
        let delay = self.current;
        let next = match self.growth {
            Growth::Linear => delay.saturating_add(self.base),
            Growth::Exponential => delay.saturating_mul(2),
        };
        self.current = next.min(self.max);
        delay
    }
}
