use std::time::{SystemTime, UNIX_EPOCH};

/// A source of timestamps for timers.
///
/// Timers only ever subtract two readings, so implementations must be
/// monotonic but may pick any origin.
pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds since this clock's origin.
    fn now(&self) -> u64;

    /// Seconds elapsed between two readings of this clock.
    fn seconds_between(&self, start: u64, stop: u64) -> f64 {
        stop.saturating_sub(start) as f64 / 1e9
    }
}

/// Nanoseconds since the UNIX epoch from `std::time::SystemTime`.
///
/// Susceptible to NTP adjustments; prefer [`QuantaClock`] for timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default()
    }
}

/// Timer clock backed by the `quanta` crate.
///
/// Readings count nanoseconds from the moment the clock was built rather
/// than from the epoch. Timers only subtract a start reading from a stop
/// reading, so the origin never leaks into `<timingdir>/<name>.bp`. Every
/// [`crate::timer::Timers`] built by [`crate::Coupling::init`] starts with
/// one of these. Use [`SystemClock`] when readings have to line up with
/// other processes' wall time.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    ticks: quanta::Clock,
    origin: quanta::Instant,
}

impl QuantaClock {
    pub fn new() -> Self {
        let ticks = quanta::Clock::new();
        let origin = ticks.now();
        Self { ticks, origin }
    }
}

impl Default for QuantaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let elapsed = self.ticks.now().duration_since(self.origin);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }
}
