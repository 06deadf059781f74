use std::sync::{Arc, Mutex};

use esdcan_common::{baud::BitTiming, CanMessage, DriverError};
use esdcan_driver::busmaster::{
    BusmasterEvent, BusmasterPort, BusmasterRecord, FrameEvent, FrameFlags,
};
use esdcan_driver::eei::InjectionPattern;
use esdcan_driver::Controller;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

struct Member {
    port: Option<BusmasterPort>,
    nodes: u8,
}

/// A CAN bus joining every node of every card attached through it
///
/// A frame transmitted by one node is received by all other nodes on the bus, and by the
/// external listeners created with [`SimBus::new_receiver`].
#[derive(Clone, Default)]
pub struct SimBus {
    members: Arc<Mutex<Vec<Member>>>,
    // None node external channels for sending messages to, e.g. test listeners
    external_channels: Arc<Mutex<Vec<UnboundedSender<CanMessage>>>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the controller for a card with `nodes` channels, all of them on this bus
    pub fn controller(&self, nodes: u8) -> Arc<SimController> {
        let mut members = self.members.lock().unwrap();
        let slot = members.len();
        members.push(Member { port: None, nodes });
        Arc::new(SimController {
            bus: self.clone(),
            slot,
        })
    }

    pub fn new_receiver(&self) -> SimBusReceiver {
        let (tx, rx) = unbounded_channel();
        self.external_channels.lock().unwrap().push(tx);
        SimBusReceiver { channel_rx: rx }
    }

    /// Put a frame on the bus as a node outside of any card
    pub fn inject(&self, msg: CanMessage) {
        self.deliver(None, &msg);
    }

    fn deliver(&self, sender: Option<(usize, u8)>, msg: &CanMessage) {
        // Ports are cloned out so that no bus lock is held while posting
        let targets: Vec<(usize, BusmasterPort, u8)> = self
            .members
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(slot, m)| Some((slot, m.port.clone()?, m.nodes)))
            .collect();
        for (slot, port, nodes) in targets {
            let now = port.now();
            let mut posted = false;
            for node in 0..nodes {
                // The sender sees its own frame through the self reception path
                if sender == Some((slot, node)) {
                    continue;
                }
                port.post(&BusmasterRecord::new(
                    node,
                    now,
                    BusmasterEvent::RxTxDone(FrameEvent {
                        msg: *msg,
                        flags: FrameFlags::empty(),
                        tag: 0,
                    }),
                ));
                posted = true;
            }
            if posted {
                port.raise_irq();
            }
        }
        let externals = self.external_channels.lock().unwrap().clone();
        for ext in externals.iter() {
            ext.send(*msg).ok();
        }
    }

    fn port(&self, slot: usize) -> Option<BusmasterPort> {
        self.members.lock().unwrap()[slot].port.clone()
    }
}

/// The controller of one card on a [`SimBus`]
///
/// Every transmission completes at once: the sender gets its self received frame and TX done
/// record, every other node on the bus receives the frame.
pub struct SimController {
    bus: SimBus,
    slot: usize,
}

impl Controller for SimController {
    fn bind(&self, port: BusmasterPort) {
        self.bus.members.lock().unwrap()[self.slot].port = Some(port);
    }

    fn transmit(&self, node: u8, msg: &CanMessage, tag: u32) -> Result<(), DriverError> {
        let port = self.bus.port(self.slot).ok_or(DriverError::InvalidHardware)?;
        let now = port.now();
        for flags in [FrameFlags::SELF_RX, FrameFlags::TX] {
            port.post(&BusmasterRecord::new(
                node,
                now,
                BusmasterEvent::RxTxDone(FrameEvent {
                    msg: *msg,
                    flags,
                    tag,
                }),
            ));
        }
        port.raise_irq();
        self.bus.deliver(Some((self.slot, node)), msg);
        Ok(())
    }

    fn abort_transmit(&self, _node: u8, _tag: Option<u32>) {
        // Nothing is ever left pending
    }

    fn set_baud(
        &self,
        _node: u8,
        _nominal: Option<BitTiming>,
        _data: Option<BitTiming>,
        _listen_only: bool,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    fn inject_error(&self, _node: u8, _pattern: &InjectionPattern) -> Result<(), DriverError> {
        Err(DriverError::NotSupported)
    }
}

pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl SimBusReceiver {
    pub async fn recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }

    pub fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }
}
