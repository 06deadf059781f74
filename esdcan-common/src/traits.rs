//! Common traits

/// A source of hardware timestamps
///
/// Implemented by hardware backends which own a free running counter. The driver falls back to a
/// software counter whenever [`ClockSource::ticks`] returns `None`.
pub trait ClockSource: Send + Sync {
    /// Read the current counter value, or `None` if the counter cannot be read
    fn ticks(&self) -> Option<u64>;

    /// The counter frequency in Hz
    fn frequency(&self) -> u64;
}
