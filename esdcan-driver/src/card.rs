//! A CAN interface card
//!
//! The card owns what its nodes share: the busmaster FIFO and its interrupt, the timer subsystem,
//! the error injection pool and the hardware controller. Hardware activity reaches the nodes only
//! through the FIFO; [`Card::irq`] signals the deferred task, which is the single consumer calling
//! [`Card::dpc`].
use core::cell::RefCell;
use std::sync::{Arc, Weak};

use critical_section::Mutex;
use defmt_or_log::{debug, info, warn};
use esdcan_common::{
    card_config::{CardConfig, ConfigError},
    device_info::{encode_serial, DeviceInfo, Version},
    flags::FeatureFlags,
    traits::ClockSource,
    AtomicCell, DriverError,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::busmaster::{
    BusmasterEvent, BusmasterFifo, BusmasterPort, BusmasterRecord, DrainCursor, DrainSummary,
};
use crate::eei::EeiPool;
use crate::hw::Controller;
use crate::node::{Node, NodeLinks};
use crate::timer::{MonotonicClock, Timers};

/// Version of this driver, reported as driver and library version in device info
fn crate_version() -> Version {
    Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_default()
}

/// An attached card
#[allow(missing_debug_implementations)]
pub struct Card {
    config: CardConfig,
    hardware: Version,
    firmware: Version,
    features: FeatureFlags,
    fault: Option<DriverError>,
    fifo: Arc<BusmasterFifo>,
    irq: Arc<Notify>,
    timers: Arc<Timers>,
    eei: Arc<EeiPool>,
    controller: Arc<dyn Controller>,
    nodes: Vec<Arc<Node>>,
    cursor: AtomicCell<DrainCursor>,
    tasks: Mutex<RefCell<Vec<JoinHandle<()>>>>,
}

impl Card {
    /// Build a card from its configuration and bind `controller` to it
    ///
    /// A card whose firmware or hardware is older than the configured minimum is still created,
    /// but every operation on it fails with [`DriverError::InvalidFirmware`] or
    /// [`DriverError::InvalidHardware`].
    pub fn new(
        config: CardConfig,
        controller: Arc<dyn Controller>,
        clock: Option<Arc<dyn ClockSource>>,
    ) -> Result<Arc<Self>, ConfigError> {
        let hardware = config.hardware_version()?;
        let firmware = config.firmware_version()?;
        let fault = if config
            .min_firmware_version()?
            .is_some_and(|min| firmware < min)
        {
            Some(DriverError::InvalidFirmware)
        } else if config
            .min_hardware_version()?
            .is_some_and(|min| hardware < min)
        {
            Some(DriverError::InvalidHardware)
        } else {
            None
        };
        if let Some(e) = fault {
            warn!("Card {}: disabled, {:?}", config.serial.as_str(), e);
        }

        let clock = MonotonicClock::new(clock, config.timer.frequency);
        let timers = Arc::new(Timers::new(clock, config.timer.calibration_ticks));
        let fifo = Arc::new(BusmasterFifo::new(config.busmaster.fifo_capacity));
        let irq = Arc::new(Notify::new());
        controller.bind(BusmasterPort::new(fifo.clone(), irq.clone(), timers.clone()));
        let eei = EeiPool::new(config.eei_units, timers.clone(), controller.clone());
        let features = config.feature_flags();

        let nodes = config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node_config)| {
                Node::new(
                    i as u8,
                    config.base_net.wrapping_add(i as u8),
                    node_config.clone(),
                    NodeLinks {
                        controller: controller.clone(),
                        timers: timers.clone(),
                        eei: eei.clone(),
                        features,
                        queues: config.queues.clone(),
                        fault,
                    },
                )
            })
            .collect();

        info!(
            "Card {} attached: hw {}, fw {}, {} nodes",
            config.serial.as_str(),
            hardware.packed(),
            firmware.packed(),
            config.nodes.len()
        );
        Ok(Arc::new(Self {
            config,
            hardware,
            firmware,
            features,
            fault,
            fifo,
            irq,
            timers,
            eei,
            controller,
            nodes,
            cursor: AtomicCell::new(DrainCursor::default()),
            tasks: Mutex::new(RefCell::new(Vec::new())),
        }))
    }

    /// Serial number
    pub fn serial(&self) -> &str {
        &self.config.serial
    }

    /// The configuration the card was built from
    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    /// Fault detected at attach time
    pub fn fault(&self) -> Option<DriverError> {
        self.fault
    }

    /// The card's nodes, by index
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// A node by index
    pub fn node(&self, index: u8) -> Option<&Arc<Node>> {
        self.nodes.get(index as usize)
    }

    /// The timer subsystem
    pub fn timers(&self) -> &Arc<Timers> {
        &self.timers
    }

    /// The error injection pool
    pub fn eei(&self) -> &Arc<EeiPool> {
        &self.eei
    }

    /// The controller the card was bound to
    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    /// A port onto the busmaster FIFO, as the hardware sees it
    pub fn port(&self) -> BusmasterPort {
        BusmasterPort::new(self.fifo.clone(), self.irq.clone(), self.timers.clone())
    }

    /// The busmaster FIFO
    pub fn fifo(&self) -> &BusmasterFifo {
        &self.fifo
    }

    /// Interrupt entry: signal the deferred task
    pub fn irq(&self) {
        self.irq.notify_one();
    }

    /// Drain the busmaster FIFO and process every record
    ///
    /// Must only run in one context at a time. [`Card::start`] runs it from a task whenever the
    /// interrupt is raised.
    pub fn dpc(&self) -> DrainSummary {
        let mut cursor = self.cursor.load();
        let summary = cursor.drain(
            &self.fifo,
            |record| self.dispatch(&record),
            |net, dropped| match self.nodes.get(net as usize) {
                Some(node) => node.credit_fifo_overrun(dropped),
                None => warn!("{} records dropped for missing node {}", dropped, net),
            },
        );
        self.cursor.store(cursor);
        summary
    }

    fn dispatch(&self, record: &BusmasterRecord) {
        match record.event {
            BusmasterEvent::Timeslice | BusmasterEvent::HwTimer { .. } => {
                self.timers.process(self.timers.now());
            }
            BusmasterEvent::Hotplug { attached } => {
                info!(
                    "Card {}: hotplug, attached = {}",
                    self.config.serial.as_str(),
                    attached
                );
            }
            _ => match self.nodes.get(record.net as usize) {
                Some(node) => node.handle(record),
                None => warn!("Busmaster record for missing node {}", record.net),
            },
        }
    }

    /// Spawn the deferred procedure task and the software alarm task
    ///
    /// Must be called from within a tokio runtime. The tasks stop when the card is shut down or
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Card> = Arc::downgrade(self);
        let irq = self.irq.clone();
        let dpc = tokio::spawn(async move {
            loop {
                irq.notified().await;
                let Some(card) = weak.upgrade() else {
                    break;
                };
                card.dpc();
            }
        });
        let timers = self.timers.clone();
        let alarms = tokio::spawn(async move { timers.run().await });
        critical_section::with(|cs| {
            let mut tasks = self.tasks.borrow_ref_mut(cs);
            tasks.push(dpc);
            tasks.push(alarms);
        });
        debug!("Card {}: tasks started", self.config.serial.as_str());
    }

    fn stop_tasks(&self) {
        let tasks =
            critical_section::with(|cs| core::mem::take(&mut *self.tasks.borrow_ref_mut(cs)));
        for task in tasks {
            task.abort();
        }
    }

    /// Tear the card down: every open session is force closed and the tasks are stopped
    pub fn shutdown(&self) {
        for node in self.nodes.iter() {
            node.force_close_all();
            self.controller.abort_transmit(node.index(), None);
        }
        self.eei.clear();
        self.stop_tasks();
        info!("Card {} shut down", self.config.serial.as_str());
    }

    /// Identity and version information, as seen from one node
    pub fn device_info(&self, index: u8) -> Result<DeviceInfo, DriverError> {
        let node = self.node(index).ok_or(DriverError::InvalidParameter {
            reason: "node index out of range",
        })?;
        let config = node.config();
        Ok(DeviceInfo {
            hardware: self.hardware,
            firmware: self.firmware,
            driver: crate_version(),
            library: crate_version(),
            serial: encode_serial(&self.config.serial),
            features: self.features.bits(),
            ctrl_type: config.ctrl_type,
            ctrl_clock: config.clock,
            transceiver: config.transceiver,
            timestamp_freq: self.timers.frequency(),
            net: node.net(),
            open_handles: node.open_sessions().min(u16::MAX as usize) as u16,
        })
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
