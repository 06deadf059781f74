//! Fixed capacity message ring shared between the drain and caller context
use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam::queue::ArrayQueue;
use esdcan_common::CanMessage;

/// A lock-free ring of CAN messages with loss accounting
///
/// Producers never block: a push onto a full ring hands the message back and adds one to the
/// lost count. The next message popped carries the accumulated lost count (saturated to 255) in
/// its `msg_lost` field, and the count restarts from zero.
#[derive(Debug)]
pub struct CmRing {
    queue: ArrayQueue<CanMessage>,
    lost: AtomicU32,
}

impl CmRing {
    /// Create a ring holding up to `capacity` messages
    ///
    /// A capacity of zero is rounded up to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            lost: AtomicU32::new(0),
        }
    }

    /// Append a message
    pub fn push(&self, msg: CanMessage) -> Result<(), CanMessage> {
        self.queue.push(msg).inspect_err(|_| self.add_lost(1))
    }

    /// Remove the oldest message, stamping it with the lost count
    pub fn pop(&self) -> Option<CanMessage> {
        let mut msg = self.queue.pop()?;
        let lost = self.lost.swap(0, Ordering::AcqRel);
        msg.msg_lost = msg.msg_lost.max(lost.min(u8::MAX as u32) as u8);
        Some(msg)
    }

    /// Account messages lost upstream of this ring
    pub fn add_lost(&self, n: u32) {
        // fetch_update with a saturating add never returns Err
        let _ = self
            .lost
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(n))
            });
    }

    /// Lost count not yet reported to a reader
    pub fn lost(&self) -> u32 {
        self.lost.load(Ordering::Acquire)
    }

    /// Discard all queued messages, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.queue.pop().is_some() {
            n += 1;
        }
        n
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no message is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of free slots
    pub fn free(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
