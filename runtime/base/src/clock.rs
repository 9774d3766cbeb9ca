//! Clock - Monotonic time source with frequency conversion
//!
//! A clock counts ticks at a fixed frequency from the moment it was created.
//! The motherboard shares one clock among all virtual devices; the timer
//! service uses one as the time base of the deadlines its clients program.

use std::time::{Duration, Instant};

/// Time value in ticks of some clock frequency
pub type TimeValue = u64;

/// Nanoseconds per second, the resolution of the underlying host counter
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Monotonic tick source
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    frequency: u64,
    origin: Instant,
}

impl Clock {
    /// Create a clock ticking at `frequency` Hz, starting at zero now
    ///
    /// # Panics
    /// Panics if `frequency` is zero
    pub fn new(frequency: u64) -> Self {
        assert!(frequency > 0, "clock frequency must be non-zero");
        Self {
            frequency,
            origin: Instant::now(),
        }
    }

    /// Ticks per second
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Current time in ticks of this clock
    pub fn time(&self) -> TimeValue {
        self.time_in(self.frequency)
    }

    /// Current time in ticks of `frequency`
    pub fn time_in(&self, frequency: u64) -> TimeValue {
        let nanos = self.origin.elapsed().as_nanos();
        scale(nanos, NANOS_PER_SEC, frequency)
    }

    /// Absolute time (in ticks of this clock) `delta` ticks of `frequency` from now
    pub fn abstime(&self, delta: TimeValue, frequency: u64) -> TimeValue {
        self.time()
            .saturating_add(convert(delta, frequency, self.frequency))
    }

    /// Host instant corresponding to `ticks` of this clock
    pub fn instant_of(&self, ticks: TimeValue) -> Instant {
        let nanos = scale(ticks as u128, self.frequency, NANOS_PER_SEC);
        self.origin + Duration::from_nanos(nanos)
    }

    /// Time left until `deadline`, zero if it already passed
    pub fn until(&self, deadline: TimeValue) -> Duration {
        self.instant_of(deadline)
            .saturating_duration_since(Instant::now())
    }
}

/// Convert `value` ticks of frequency `from` into ticks of frequency `to`
///
/// Results saturate at `TimeValue::MAX`. Ticks of a zero frequency never
/// end, so any non-zero `value` of them saturates too.
pub fn convert(value: TimeValue, from: u64, to: u64) -> TimeValue {
    scale(value as u128, from, to)
}

fn scale(value: u128, from: u64, to: u64) -> u64 {
    if value == 0 {
        return 0;
    }
    match (value * to as u128).checked_div(from as u128) {
        Some(scaled) => u64::try_from(scaled).unwrap_or(u64::MAX),
        None => u64::MAX,
    }
}
