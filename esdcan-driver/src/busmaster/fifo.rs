//! The busmaster FIFO and the handle hardware backends use to fill it
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use esdcan_common::{constants::limits::MAX_NODES_PER_CARD, Timestamp};
use tokio::sync::Notify;

use super::event::{BusmasterRecord, RawEvent};
use crate::timer::Timers;

/// Ring of raw event records written by the hardware and consumed by the drain
///
/// Every posted record takes the next value of a free running IRQ counter as its sequence number,
/// whether or not it fits. A record which does not fit is dropped and counted against its node.
#[derive(Debug)]
pub struct BusmasterFifo {
    queue: ArrayQueue<RawEvent>,
    irq_count: AtomicU32,
    drops: [AtomicU32; MAX_NODES_PER_CARD],
}

impl BusmasterFifo {
    /// Create a FIFO holding `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            irq_count: AtomicU32::new(0),
            drops: Default::default(),
        }
    }

    /// Post a record. Returns false if the FIFO was full and the record was dropped.
    ///
    /// Records must be posted from one producer at a time.
    pub fn post(&self, mut raw: RawEvent) -> bool {
        raw.irq_seq = self.irq_count.fetch_add(1, Ordering::AcqRel);
        match self.queue.push(raw) {
            Ok(()) => true,
            Err(raw) => {
                let slot = &self.drops[raw.net as usize % MAX_NODES_PER_CARD];
                // Saturating update; never fails
                let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_add(1))
                });
                false
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<RawEvent> {
        self.queue.pop()
    }

    /// Value of the IRQ counter, i.e. the sequence number the next record will get
    pub fn irq_count(&self) -> u32 {
        self.irq_count.load(Ordering::Acquire)
    }

    /// Take the number of records dropped for a node since the last call
    pub(crate) fn take_drops(&self, net: usize) -> u32 {
        self.drops[net].swap(0, Ordering::AcqRel)
    }

    /// Number of records waiting
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no record is waiting
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// FIFO capacity
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// The hardware's view of a card: post events and raise the interrupt
///
/// Controllers receive a port when they are bound to a card. Posting only enqueues; nothing is
/// processed until the interrupt is raised and the card's DPC task drains the FIFO.
#[derive(Clone, Debug)]
pub struct BusmasterPort {
    fifo: Arc<BusmasterFifo>,
    irq: Arc<Notify>,
    timers: Arc<Timers>,
}

impl BusmasterPort {
    pub(crate) fn new(fifo: Arc<BusmasterFifo>, irq: Arc<Notify>, timers: Arc<Timers>) -> Self {
        Self { fifo, irq, timers }
    }

    /// Current card time, for stamping posted records
    pub fn now(&self) -> Timestamp {
        self.timers.now()
    }

    /// Encode and post a record. Returns false if it was dropped.
    pub fn post(&self, record: &BusmasterRecord) -> bool {
        self.fifo.post(record.encode())
    }

    /// Post a raw record. Returns false if it was dropped.
    pub fn post_raw(&self, raw: RawEvent) -> bool {
        self.fifo.post(raw)
    }

    /// Signal the card that records are waiting
    pub fn raise_irq(&self) {
        self.irq.notify_one();
    }

    /// The FIFO behind this port
    pub fn fifo(&self) -> &BusmasterFifo {
        &self.fifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_fifo_drops_and_counts() {
        let fifo = BusmasterFifo::new(4);
        for i in 0..6u8 {
            let raw = RawEvent {
                net: i % 2,
                ..Default::default()
            };
            assert_eq!(i < 4, fifo.post(raw));
        }
        assert_eq!(6, fifo.irq_count());
        assert_eq!(1, fifo.take_drops(0));
        assert_eq!(1, fifo.take_drops(1));
        assert_eq!(0, fifo.take_drops(1));
        let seqs: Vec<u32> = std::iter::from_fn(|| fifo.pop()).map(|r| r.irq_seq).collect();
        assert_eq!(vec![0, 1, 2, 3], seqs);
    }
}
