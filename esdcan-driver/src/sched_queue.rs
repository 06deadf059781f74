//! A time ordered queue for scheduled transmission
use core::cell::RefCell;

use critical_section::Mutex;
use esdcan_common::Timestamp;

#[derive(Clone, Copy, Debug)]
struct Scheduled<T: Copy> {
    due: Timestamp,
    seq: u64,
    value: T,
}

#[derive(Debug)]
struct Slots<T: Copy> {
    buffer: Vec<Option<Scheduled<T>>>,
    next_seq: u64,
}

impl<T: Copy> Slots<T> {
    fn earliest(&self) -> Option<usize> {
        self.buffer
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, (s.due, s.seq))))
            .min_by_key(|(_, key)| *key)
            .map(|(i, _)| i)
    }
}

/// A fixed capacity queue releasing items in order of their due time
///
/// Items with the same due time come out in the order they were pushed.
#[derive(Debug)]
pub struct SchedQueue<T: Copy> {
    slots: Mutex<RefCell<Slots<T>>>,
}

impl<T> SchedQueue<T>
where
    T: Copy + Send,
{
    /// Create a queue holding up to `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(RefCell::new(Slots {
                buffer: vec![None; capacity.max(1)],
                next_seq: 0,
            })),
        }
    }

    /// Queue an item for time `due`
    ///
    /// Returns the item if the queue is full.
    pub fn push(&self, due: Timestamp, value: T) -> Result<(), T> {
        critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            let seq = slots.next_seq;
            let Some(loc) = slots.buffer.iter_mut().find(|s| s.is_none()) else {
                return Err(value);
            };
            *loc = Some(Scheduled { due, seq, value });
            slots.next_seq += 1;
            Ok(())
        })
    }

    /// Remove the earliest item if it is due at `now`
    pub fn pop_due(&self, now: Timestamp) -> Option<T> {
        critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            let i = slots.earliest()?;
            let item = slots.buffer[i]?;
            if item.due > now {
                return None;
            }
            slots.buffer[i] = None;
            Some(item.value)
        })
    }

    /// Due time of the earliest item
    pub fn next_due(&self) -> Option<Timestamp> {
        critical_section::with(|cs| {
            let slots = self.slots.borrow_ref_mut(cs);
            slots.earliest().and_then(|i| slots.buffer[i]).map(|s| s.due)
        })
    }

    /// Drop every item for which `pred` returns true, returning how many were dropped
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            let mut removed = 0;
            for loc in slots.buffer.iter_mut() {
                if loc.is_some_and(|s| pred(&s.value)) {
                    *loc = None;
                    removed += 1;
                }
            }
            removed
        })
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        critical_section::with(|cs| {
            self.slots
                .borrow_ref_mut(cs)
                .buffer
                .iter()
                .filter(|s| s.is_some())
                .count()
        })
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
