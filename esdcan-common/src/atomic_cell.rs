//! A small cell type which can be shared between interrupt and thread context
use core::cell::Cell;

use critical_section::Mutex;

/// A value cell whose accesses are guarded by a critical section
///
/// Useful for storing single values (flags, mode words, small `Copy` structs) which are written in
/// one context and read in another, e.g. written by a control call and read during the busmaster
/// drain.
#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Copy + Default> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy> AtomicCell<T> {
    /// Create a new AtomicCell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Read the current value
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Replace the current value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value))
    }

    /// Replace the current value, returning the previous one
    pub fn swap(&self, value: T) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).replace(value))
    }

    /// Atomically apply `f` to the stored value
    ///
    /// If `f` returns `Some`, the new value is stored and the previous value is returned as `Ok`.
    /// If it returns `None`, the value is left untouched and returned as `Err`.
    pub fn fetch_update(&self, mut f: impl FnMut(T) -> Option<T>) -> Result<T, T> {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let prev = cell.get();
            match f(prev) {
                Some(next) => {
                    cell.set(next);
                    Ok(prev)
                }
                None => Err(prev),
            }
        })
    }
}

impl<T: Copy + Default> AtomicCell<T> {
    /// Read the value and reset it to the default
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets_to_default() {
        let cell = AtomicCell::new(Some(5u8));
        assert_eq!(Some(5), cell.take());
        assert_eq!(None, cell.load());
    }

    #[test]
    fn test_fetch_update() {
        let cell = AtomicCell::new(3u32);
        assert_eq!(Ok(3), cell.fetch_update(|v| Some(v + 1)));
        assert_eq!(Err(4), cell.fetch_update(|_| None));
        assert_eq!(4, cell.load());
    }
}
