//! Data types for timestamps and call timeouts

use core::time::Duration;

use crate::constants::timeouts;

/// A hardware timestamp, in ticks of the card's timestamp clock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The zero timestamp
    pub const ZERO: Timestamp = Timestamp(0);

    /// Get the raw tick count
    pub const fn ticks(&self) -> u64 {
        self.0
    }

    /// Add a number of ticks, saturating at `u64::MAX`
    pub const fn saturating_add(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }

    /// Subtract a number of ticks, saturating at zero
    pub const fn saturating_sub(self, ticks: u64) -> Self {
        Self(self.0.saturating_sub(ticks))
    }

    /// Ticks elapsed from `earlier` to `self`, or zero if `earlier` is later
    pub const fn ticks_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Convert a duration to ticks of a clock running at `frequency` Hz
pub fn duration_to_ticks(duration: Duration, frequency: u64) -> u64 {
    let ticks = duration.as_nanos() * frequency as u128 / 1_000_000_000;
    ticks.min(u64::MAX as u128) as u64
}

/// Convert ticks of a clock running at `frequency` Hz to a duration
pub fn ticks_to_duration(ticks: u64, frequency: u64) -> Duration {
    if frequency == 0 {
        return Duration::ZERO;
    }
    let nanos = ticks as u128 * 1_000_000_000 / frequency as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// How long a blocking call may wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Return immediately with whatever is available
    Immediate,
    /// Wait up to this many milliseconds
    Millis(u32),
    /// Wait until completion, abort or close
    Infinite,
}

impl Timeout {
    /// Get the wait duration, or `None` for an infinite wait
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Immediate => Some(Duration::ZERO),
            Timeout::Millis(ms) => Some(Duration::from_millis(*ms as u64)),
            Timeout::Infinite => None,
        }
    }

    /// Get the raw millisecond value as used by the control call surface
    pub fn raw(&self) -> u32 {
        match self {
            Timeout::Immediate => timeouts::IMMEDIATE,
            Timeout::Millis(ms) => *ms,
            Timeout::Infinite => timeouts::INFINITE,
        }
    }
}

impl From<u32> for Timeout {
    fn from(value: u32) -> Self {
        match value {
            timeouts::IMMEDIATE => Timeout::Immediate,
            timeouts::INFINITE => Timeout::Infinite,
            ms => Timeout::Millis(ms),
        }
    }
}

impl From<Timeout> for u32 {
    fn from(value: Timeout) -> Self {
        value.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_sentinels() {
        assert_eq!(Timeout::Immediate, Timeout::from(0));
        assert_eq!(Timeout::Infinite, Timeout::from(0xFFFF_FFFF));
        assert_eq!(Timeout::Millis(100), Timeout::from(100));
        assert_eq!(None, Timeout::Infinite.as_duration());
        assert_eq!(0xFFFF_FFFF, u32::from(Timeout::Infinite));
    }

    #[test]
    fn test_tick_conversion() {
        assert_eq!(80_000, duration_to_ticks(Duration::from_millis(1), 80_000_000));
        assert_eq!(
            Duration::from_millis(1),
            ticks_to_duration(80_000, 80_000_000)
        );
        assert_eq!(Duration::ZERO, ticks_to_duration(1000, 0));
    }
}
