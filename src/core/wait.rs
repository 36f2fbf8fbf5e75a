//! Polling primitives for cross-process waits.
//!
//! Independent processes share no blocking OS primitive here, so every wait
//! is a poll over filesystem or transport state. A [`WaitStrategy`] decides
//! how a poll backs off between checks and a [`Deadline`] bounds how long it
//! may keep going.

use std::time::{Duration, Instant};

use crate::core::Result;

const DEFAULT_SPINS: u32 = 64;
const DEFAULT_SLEEP: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Re-check immediately, yielding the core between checks.
    BusySpin,
    /// Spin for `spins` checks, then sleep `sleep` between later checks.
    SpinThenSleep { spins: u32, sleep: Duration },
    /// Sleep a fixed duration between every check.
    Sleep(Duration),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::SpinThenSleep {
            spins: DEFAULT_SPINS,
            sleep: DEFAULT_SLEEP,
        }
    }
}

impl WaitStrategy {
    /// Back off before poll number `attempt`, never sleeping past `cap`.
    pub fn pause(&self, attempt: u32, cap: Option<Duration>) {
        let sleep = match *self {
            WaitStrategy::BusySpin => None,
            WaitStrategy::SpinThenSleep { spins, sleep } => (attempt >= spins).then_some(sleep),
            WaitStrategy::Sleep(sleep) => Some(sleep),
        };
        match sleep {
            Some(sleep) => {
                let sleep = cap.map_or(sleep, |cap| sleep.min(cap));
                if sleep.is_zero() {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(sleep);
                }
            }
            None => {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }
}

/// Upper bound on a single wait. `None` limit waits forever.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn after(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn never() -> Self {
        Self::after(None)
    }

    pub fn is_bounded(&self) -> bool {
        self.limit.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.start.elapsed()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// The tighter of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.remaining(), other.remaining()) {
            (None, _) => other,
            (_, None) => self,
            (Some(a), Some(b)) => {
                if a <= b {
                    self
                } else {
                    other
                }
            }
        }
    }
}

/// Poll `ready` until it reports true or `deadline` expires.
///
/// Returns `Ok(false)` on expiry. `ready` is always checked at least once,
/// so a zero deadline is a single non-blocking probe.
pub fn poll_until<F>(strategy: &WaitStrategy, deadline: Deadline, mut ready: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let mut attempt: u32 = 0;
    loop {
        if ready()? {
            return Ok(true);
        }
        if deadline.expired() {
            return Ok(false);
        }
        log::trace!("poll attempt {attempt} not ready");
        strategy.pause(attempt, deadline.remaining());
        attempt = attempt.saturating_add(1);
    }
}
