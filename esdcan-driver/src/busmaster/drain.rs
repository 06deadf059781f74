//! Draining the busmaster FIFO
use defmt_or_log::{debug, warn};
use esdcan_common::constants::limits::MAX_NODES_PER_CARD;

use super::event::BusmasterRecord;
use super::fifo::BusmasterFifo;

/// Counts of one drain pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records decoded and dispatched
    pub processed: u32,
    /// Records dropped by the FIFO and credited to their nodes
    pub dropped: u32,
    /// Sequence numbers skipped over while resynchronising
    pub skipped: u32,
    /// Records which could not be decoded
    pub invalid: u32,
}

/// Consumer side state of the FIFO
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DrainCursor {
    expected: u32,
}

impl DrainCursor {
    /// Consume records until the FIFO has caught up with the IRQ counter
    ///
    /// `dispatch` is called for every record in arrival order. `credit` is called with the number
    /// of dropped records per node. Neither may block.
    pub fn drain(
        &mut self,
        fifo: &BusmasterFifo,
        mut dispatch: impl FnMut(BusmasterRecord),
        mut credit: impl FnMut(u8, u32),
    ) -> DrainSummary {
        let mut summary = DrainSummary::default();
        loop {
            let observed = fifo.irq_count();
            while let Some(raw) = fifo.pop() {
                let gap = raw.irq_seq.wrapping_sub(self.expected);
                if gap != 0 {
                    debug!(
                        "Busmaster resync: expected seq {}, got {}",
                        self.expected, raw.irq_seq
                    );
                    summary.skipped = summary.skipped.saturating_add(gap);
                }
                self.expected = raw.irq_seq.wrapping_add(1);
                match BusmasterRecord::decode(&raw) {
                    Ok(record) => {
                        dispatch(record);
                        summary.processed += 1;
                    }
                    Err(e) => {
                        warn!("Dropping busmaster record {}: {:?}", raw.irq_seq, e);
                        summary.invalid += 1;
                    }
                }
            }
            for net in 0..MAX_NODES_PER_CARD {
                let dropped = fifo.take_drops(net);
                if dropped > 0 {
                    credit(net as u8, dropped);
                    summary.dropped = summary.dropped.saturating_add(dropped);
                }
            }
            // Every record up to `observed` has been consumed or credited as dropped
            if fifo.is_empty() && fifo.irq_count() == observed {
                self.expected = observed;
                break;
            }
        }
        summary
    }
}
