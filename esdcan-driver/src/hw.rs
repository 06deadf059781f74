//! The hardware interface of a card, and a software loopback controller
//!
//! Everything the driver needs from the physical board goes through [`Controller`]. Results of
//! hardware activity (received frames, completed transmissions, error state changes) never come
//! back through the trait; the controller posts them as busmaster records on the
//! [`BusmasterPort`] it was bound to and raises the card interrupt.
use core::cell::RefCell;
use std::collections::VecDeque;

use critical_section::Mutex;
use defmt_or_log::{debug, warn};
use esdcan_common::{
    baud::BitTiming,
    bus_status::BusState,
    constants::limits::MAX_NODES_PER_CARD,
    CanMessage, DriverError,
};

use crate::busmaster::{
    BusmasterEvent, BusmasterPort, BusmasterRecord, ErrorReport, FrameEvent, FrameFlags,
};
use crate::eei::InjectionPattern;

/// Transmit slots offered by a controller unless it says otherwise
pub const DEFAULT_TX_SLOTS: usize = 16;

/// Transmit error counter increment per injected error frame
const TEC_STEP: u16 = 8;

/// A CAN controller backing the nodes of one card
///
/// Implementations must never block: every method may be called from the card's DPC context.
pub trait Controller: Send + Sync {
    /// Connect the controller to the busmaster FIFO of its card
    fn bind(&self, port: BusmasterPort);

    /// Number of frames which may be outstanding per node
    fn tx_slots(&self) -> usize {
        DEFAULT_TX_SLOTS
    }

    /// Start transmission of a frame
    ///
    /// Completion is reported by an RX/TX-done record carrying `tag`. Return
    /// [`DriverError::ControllerBusy`] if the frame cannot be accepted right now.
    fn transmit(&self, node: u8, msg: &CanMessage, tag: u32) -> Result<(), DriverError>;

    /// Abort a pending transmission, or all of a node's pending transmissions for `None`
    ///
    /// Frames actually aborted are reported with TX abort records.
    fn abort_transmit(&self, node: u8, tag: Option<u32>);

    /// Program the bit timing of a node. `None` takes the node off the bus.
    fn set_baud(
        &self,
        node: u8,
        nominal: Option<BitTiming>,
        data: Option<BitTiming>,
        listen_only: bool,
    ) -> Result<(), DriverError>;

    /// Put an error pattern on the bus
    fn inject_error(&self, node: u8, pattern: &InjectionPattern) -> Result<(), DriverError>;
}

#[derive(Debug, Default)]
struct LoopbackState {
    port: Option<BusmasterPort>,
    paused: bool,
    held: VecDeque<(u8, CanMessage, u32)>,
    tec: [u16; MAX_NODES_PER_CARD],
    injected: [u32; MAX_NODES_PER_CARD],
    timing: [Option<BitTiming>; MAX_NODES_PER_CARD],
}

/// A controller which reflects every transmitted frame back to its own node
///
/// Each transmission shows up as a self received frame followed by its TX-done record. While
/// paused, transmissions are held back and complete only when the controller is resumed, which
/// leaves them available for aborts. Injected errors raise the transmit error counter of the node
/// and are reported as bus error records.
#[derive(Debug)]
pub struct LoopbackController {
    state: Mutex<RefCell<LoopbackState>>,
    tx_slots: usize,
}

impl Default for LoopbackController {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackController {
    /// Create a loopback controller
    pub fn new() -> Self {
        Self::with_tx_slots(DEFAULT_TX_SLOTS)
    }

    /// Create a loopback controller offering `tx_slots` transmit slots per node
    pub fn with_tx_slots(tx_slots: usize) -> Self {
        Self {
            state: Mutex::new(RefCell::new(LoopbackState::default())),
            tx_slots: tx_slots.max(1),
        }
    }

    /// Hold back transmissions, or release everything held
    pub fn set_paused(&self, paused: bool) {
        let (port, released) = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.paused = paused;
            let released: Vec<_> = if paused {
                Vec::new()
            } else {
                state.held.drain(..).collect()
            };
            (state.port.clone(), released)
        });
        if let Some(port) = port {
            for (node, msg, tag) in released.iter() {
                Self::reflect(&port, *node, msg, *tag);
            }
            if !released.is_empty() {
                port.raise_irq();
            }
        }
    }

    /// Number of transmissions currently held back
    pub fn held(&self) -> usize {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).held.len())
    }

    /// Number of error patterns injected on a node
    pub fn injected(&self, node: u8) -> u32 {
        critical_section::with(|cs| {
            self.state
                .borrow_ref_mut(cs)
                .injected
                .get(node as usize)
                .copied()
                .unwrap_or(0)
        })
    }

    /// The bit timing last programmed on a node
    pub fn timing(&self, node: u8) -> Option<BitTiming> {
        critical_section::with(|cs| {
            self.state
                .borrow_ref_mut(cs)
                .timing
                .get(node as usize)
                .copied()
                .flatten()
        })
    }

    fn reflect(port: &BusmasterPort, node: u8, msg: &CanMessage, tag: u32) {
        let now = port.now();
        for flags in [FrameFlags::SELF_RX, FrameFlags::TX] {
            let record = BusmasterRecord::new(
                node,
                now,
                BusmasterEvent::RxTxDone(FrameEvent {
                    msg: *msg,
                    flags,
                    tag,
                }),
            );
            if !port.post(&record) {
                debug!("Loopback record for tag {} dropped by full FIFO", tag);
            }
        }
    }

    fn bound_port(&self) -> Result<BusmasterPort, DriverError> {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).port.clone())
            .ok_or(DriverError::InvalidHardware)
    }
}

fn check_node(node: u8) -> Result<usize, DriverError> {
    let n = node as usize;
    if n < MAX_NODES_PER_CARD {
        Ok(n)
    } else {
        Err(DriverError::InvalidParameter {
            reason: "node index out of range",
        })
    }
}

impl Controller for LoopbackController {
    fn bind(&self, port: BusmasterPort) {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).port = Some(port));
    }

    fn tx_slots(&self) -> usize {
        self.tx_slots
    }

    fn transmit(&self, node: u8, msg: &CanMessage, tag: u32) -> Result<(), DriverError> {
        check_node(node)?;
        let port = self.bound_port()?;
        let held = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.paused {
                state.held.push_back((node, *msg, tag));
            }
            state.paused
        });
        if !held {
            Self::reflect(&port, node, msg, tag);
            port.raise_irq();
        }
        Ok(())
    }

    fn abort_transmit(&self, node: u8, tag: Option<u32>) {
        let Ok(port) = self.bound_port() else {
            return;
        };
        let aborted: Vec<u32> = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let mut aborted = Vec::new();
            state.held.retain(|(n, _, t)| {
                let hit = *n == node && tag.map_or(true, |tag| tag == *t);
                if hit {
                    aborted.push(*t);
                }
                !hit
            });
            aborted
        });
        let now = port.now();
        for t in aborted.iter() {
            port.post(&BusmasterRecord::new(
                node,
                now,
                BusmasterEvent::TxAbort { tag: Some(*t) },
            ));
        }
        if !aborted.is_empty() {
            port.raise_irq();
        }
    }

    fn set_baud(
        &self,
        node: u8,
        nominal: Option<BitTiming>,
        _data: Option<BitTiming>,
        _listen_only: bool,
    ) -> Result<(), DriverError> {
        let n = check_node(node)?;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.timing[n] = nominal;
            // Re-initialising the controller restarts error counting
            state.tec[n] = 0;
        });
        Ok(())
    }

    fn inject_error(&self, node: u8, _pattern: &InjectionPattern) -> Result<(), DriverError> {
        let n = check_node(node)?;
        let port = self.bound_port()?;
        let tec = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.injected[n] = state.injected[n].saturating_add(1);
            state.tec[n] = state.tec[n].saturating_add(TEC_STEP);
            state.tec[n]
        });
        let report = ErrorReport {
            state: BusState::from_counters(0, tec),
            rec: 0,
            tec: tec.min(u8::MAX as u16) as u8,
            ecc: 0,
        };
        if !port.post(&BusmasterRecord::new(
            node,
            port.now(),
            BusmasterEvent::BusError(report),
        )) {
            warn!("Bus error record for node {} dropped", node);
        }
        port.raise_irq();
        Ok(())
    }
}
