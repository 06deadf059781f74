//! One CAN channel of a card
//!
//! A [`Node`] owns the acceptance filter, statistics, error counters and baudrate of its channel,
//! the list of sessions open on it, and the transmit scheduling between those sessions. Busmaster
//! records for the node are handed to it by the card's drain in arrival order.
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use critical_section::Mutex;
use defmt_or_log::{debug, info, trace, warn};
use esdcan_common::{
    baud::{Baud, BaudSetting, BitrateInfo, BitTiming, PhaseInfo},
    bus_status::{BusState, BusStatistics, ErrorCounters},
    card_config::{NodeConfig, QueueConfig},
    constants::{ids, len_flags},
    flags::{FeatureFlags, FilterClass, ModeFlags},
    messages::Direction,
    CanMessage, DriverError, FrameMode, Timestamp,
};

use crate::busmaster::{event::ABORT_ALL, BusmasterEvent, BusmasterRecord, ErrorReport, FrameEvent};
use crate::eei::EeiPool;
use crate::filter::{AcceptanceFilter, FilterCmd, FilterTarget};
use crate::hw::Controller;
use crate::sched_queue::SchedQueue;
use crate::session::SessionCore;
use crate::timer::{TimerHandle, TimerOwner, Timers};

#[derive(Clone, Copy, Debug)]
struct InFlight {
    /// `None` for automatic answers, which belong to no write call
    session: Option<u32>,
    msg: CanMessage,
}

#[derive(Debug, Default)]
struct NodeState {
    filter: AcceptanceFilter,
    stats: BusStatistics,
    counters: ErrorCounters,
    baud: BaudSetting,
    data_baud: Option<BaudSetting>,
    inflight: BTreeMap<u32, InFlight>,
    next_tag: u32,
    /// Round robin position among sessions with pending transmissions
    rr: usize,
}

impl NodeState {
    fn alloc_tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        if self.next_tag == ABORT_ALL {
            self.next_tag = 0;
        }
        tag
    }
}

/// Resources a node shares with the rest of its card
pub(crate) struct NodeLinks {
    pub controller: Arc<dyn Controller>,
    pub timers: Arc<Timers>,
    pub eei: Arc<EeiPool>,
    pub features: FeatureFlags,
    pub queues: QueueConfig,
    pub fault: Option<DriverError>,
}

/// A CAN channel
#[allow(missing_debug_implementations)]
pub struct Node {
    index: u8,
    net: u8,
    config: NodeConfig,
    links: NodeLinks,
    sessions: Mutex<RefCell<Vec<Arc<SessionCore>>>>,
    state: Mutex<RefCell<NodeState>>,
    sched: SchedQueue<(u32, CanMessage)>,
    sched_timer: TimerHandle,
    next_session: AtomicU32,
}

impl Node {
    pub(crate) fn new(index: u8, net: u8, config: NodeConfig, links: NodeLinks) -> Arc<Self> {
        let sched_capacity = links.queues.tx;
        let node = Arc::new_cyclic(|weak: &Weak<Node>| {
            let weak = weak.clone();
            let sched_timer = links.timers.create(
                TimerOwner::Node(index),
                Box::new(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.pump_tx();
                        node.arm_schedule();
                    }
                }),
            );
            Self {
                index,
                net,
                config,
                links,
                sessions: Mutex::new(RefCell::new(Vec::new())),
                state: Mutex::new(RefCell::new(NodeState::default())),
                sched: SchedQueue::new(sched_capacity),
                sched_timer,
                next_session: AtomicU32::new(1),
            }
        });
        if let Some(raw) = node.config.baud {
            match BaudSetting::from_raw(raw) {
                Ok(setting) => {
                    if let Err(e) = node.set_baud(setting) {
                        warn!("Net {}: configured baudrate rejected: {:?}", net, e);
                    }
                }
                Err(e) => warn!("Net {}: invalid configured baudrate {:x}: {:?}", net, raw, e),
            }
        }
        node
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    fn sessions(&self) -> Vec<Arc<SessionCore>> {
        critical_section::with(|cs| self.sessions.borrow_ref(cs).clone())
    }

    fn session(&self, id: u32) -> Option<Arc<SessionCore>> {
        critical_section::with(|cs| {
            self.sessions
                .borrow_ref(cs)
                .iter()
                .find(|s| s.id == id)
                .cloned()
        })
    }

    /// Index of the node on its card
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Logical net number
    pub fn net(&self) -> u8 {
        self.net
    }

    /// Static configuration of the channel
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Frame format of the controller
    pub fn frame_mode(&self) -> FrameMode {
        self.config.frame_mode
    }

    /// Features of the card
    pub fn features(&self) -> FeatureFlags {
        self.links.features
    }

    /// Timer subsystem of the card
    pub fn timers(&self) -> &Arc<Timers> {
        &self.links.timers
    }

    /// Error injection pool of the card
    pub fn eei(&self) -> &Arc<EeiPool> {
        &self.links.eei
    }

    /// Number of open sessions
    pub fn open_sessions(&self) -> usize {
        critical_section::with(|cs| self.sessions.borrow_ref(cs).len())
    }

    /// Fails with the card fault, if the card failed its version checks
    pub fn check_fault(&self) -> Result<(), DriverError> {
        match self.links.fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn default_queues(&self) -> (usize, usize) {
        (self.links.queues.rx, self.links.queues.tx)
    }

    pub(crate) fn next_session_id(&self) -> u32 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, core: Arc<SessionCore>) {
        critical_section::with(|cs| self.sessions.borrow_ref_mut(cs).push(core));
    }

    /// Remove a session; pending scheduled frames of the session are dropped
    pub(crate) fn unregister(&self, id: u32) {
        let removed = critical_section::with(|cs| {
            let mut sessions = self.sessions.borrow_ref_mut(cs);
            let before = sessions.len();
            sessions.retain(|s| s.id != id);
            before != sessions.len()
        });
        if removed {
            self.sched.remove_where(|(sid, _)| *sid == id);
            trace!("Net {}: session {} unregistered", self.net, id);
        }
    }

    /// Close every session with a forced close
    pub(crate) fn force_close_all(&self) {
        let sessions = critical_section::with(|cs| {
            core::mem::take(&mut *self.sessions.borrow_ref_mut(cs))
        });
        for core in sessions.iter() {
            core.force_close();
        }
        self.sched.remove_where(|_| true);
    }

    /// Check that a session with `mode` may transmit right now
    pub(crate) fn check_tx(&self, mode: ModeFlags) -> Result<(), DriverError> {
        self.check_fault()?;
        let (bus_state, baud) = self.with_state(|s| (s.counters.bus_state, s.baud));
        if bus_state == BusState::BusOff {
            return Err(DriverError::BusOff);
        }
        if mode.contains(ModeFlags::LISTEN_ONLY) || baud.listen_only {
            return Err(DriverError::ListenOnly);
        }
        if baud.baud == Baud::NotSet {
            return Err(DriverError::NoBaudrate);
        }
        Ok(())
    }

    pub(crate) fn schedule(
        &self,
        session: u32,
        due: Timestamp,
        msg: CanMessage,
    ) -> Result<(), CanMessage> {
        self.sched.push(due, (session, msg)).map_err(|(_, msg)| msg)
    }

    /// Arm the schedule timer for the earliest scheduled frame
    pub(crate) fn arm_schedule(&self) {
        if let Some(due) = self.sched.next_due() {
            if let Err(e) = self.links.timers.arm_at(self.sched_timer, due) {
                warn!("Net {}: cannot arm schedule timer: {:?}", self.net, e);
            }
        }
    }

    /// Start a transmission. Returns false if the controller cannot take more frames.
    fn start_tx(
        &self,
        state: &mut NodeState,
        session: Option<&SessionCore>,
        msg: CanMessage,
    ) -> bool {
        let tag = state.alloc_tag();
        state.inflight.insert(
            tag,
            InFlight {
                session: session.map(|s| s.id),
                msg,
            },
        );
        match self.links.controller.transmit(self.index, &msg, tag) {
            Ok(()) => true,
            Err(DriverError::ControllerBusy) => {
                state.inflight.remove(&tag);
                match session {
                    Some(core) => core.hold(msg),
                    None => {
                        warn!(
                            "Net {}: controller busy, answer for {:x} dropped",
                            self.net,
                            msg.id.raw()
                        );
                        state.stats.aborted_frames = state.stats.aborted_frames.saturating_add(1);
                    }
                }
                false
            }
            Err(e) => {
                state.inflight.remove(&tag);
                warn!("Net {}: transmit failed: {:?}", self.net, e);
                state.stats.aborted_frames = state.stats.aborted_frames.saturating_add(1);
                if let Some(core) = session {
                    core.tx_finished(1);
                }
                true
            }
        }
    }

    /// Hand queued frames to the controller while it has free transmit slots
    ///
    /// Due scheduled frames go first, then the transmit rings of all sessions in round robin
    /// order, one frame per session per turn.
    pub(crate) fn pump_tx(&self) {
        let slots = self.links.controller.tx_slots();
        let sessions = self.sessions();
        let now = self.links.timers.now();
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            while state.inflight.len() < slots {
                let Some((sid, msg)) = self.sched.pop_due(now) else {
                    break;
                };
                let Some(core) = sessions.iter().find(|s| s.id == sid) else {
                    continue;
                };
                if !self.start_tx(&mut state, Some(core), msg) {
                    // Controller busy; the frame was put back on hold by start_tx
                    break;
                }
            }
            if sessions.is_empty() {
                return;
            }
            let mut idle = 0;
            while state.inflight.len() < slots && idle < sessions.len() {
                let core = &sessions[state.rr % sessions.len()];
                state.rr = state.rr.wrapping_add(1);
                let Some(msg) = core.next_tx() else {
                    idle += 1;
                    continue;
                };
                idle = 0;
                if !self.start_tx(&mut state, Some(core), msg) {
                    break;
                }
            }
        });
    }

    /// Drop every pending transmission of a session
    ///
    /// Returns the number of frames removed from the schedule; frames already handed to the
    /// controller are aborted there and complete through TX abort records.
    pub(crate) fn abort_session_tx(&self, session: u32) -> usize {
        let removed = self.sched.remove_where(|(sid, _)| *sid == session);
        let tags: Vec<u32> = self.with_state(|s| {
            s.inflight
                .iter()
                .filter(|(_, f)| f.session == Some(session))
                .map(|(tag, _)| *tag)
                .collect()
        });
        for tag in tags {
            self.links.controller.abort_transmit(self.index, Some(tag));
        }
        removed
    }

    /// Process one busmaster record addressed to this node
    pub(crate) fn handle(&self, record: &BusmasterRecord) {
        match record.event {
            BusmasterEvent::RxTxDone(frame) => match frame.direction() {
                Direction::Tx => self.tx_done(frame.tag),
                Direction::Rx => self.receive(&frame, record.timestamp),
            },
            BusmasterEvent::TxAbort { tag } => self.tx_aborted(tag),
            BusmasterEvent::Overrun { direction, lost } => {
                self.with_state(|s| s.stats.ctrl_ovr = s.stats.ctrl_ovr.saturating_add(lost));
                if direction == Direction::Rx {
                    for core in self.sessions() {
                        core.rx.add_lost(lost);
                    }
                }
                debug!("Net {}: controller overrun, {} frames lost", self.net, lost);
            }
            BusmasterEvent::BusError(report) => self.error_report(&report, true, record.timestamp),
            BusmasterEvent::ErrorPassive(report) | BusmasterEvent::ErrorWarn(report) => {
                self.error_report(&report, false, record.timestamp)
            }
            BusmasterEvent::Statistic { busload } => {
                self.with_state(|s| s.stats.busload = busload);
                self.post_event(ids::EV_BUSLOAD, &busload.to_le_bytes(), record.timestamp);
            }
            BusmasterEvent::Timeslice
            | BusmasterEvent::HwTimer { .. }
            | BusmasterEvent::Hotplug { .. } => {
                trace!("Net {}: card level record reached node", self.net);
            }
        }
    }

    /// Account records the FIFO had to drop for this node
    ///
    /// The completion records of frames in flight may have been among the dropped ones. Those
    /// frames would hold their transmit slots forever, so everything in flight is aborted at the
    /// controller and finished as aborted here. Records which still arrive for these tags later
    /// are ignored.
    pub(crate) fn credit_fifo_overrun(&self, dropped: u32) {
        let inflight = self.with_state(|s| {
            s.stats.fifo_ovr = s.stats.fifo_ovr.saturating_add(dropped);
            s.inflight.len()
        });
        for core in self.sessions() {
            core.rx.add_lost(dropped);
        }
        debug!("Net {}: {} busmaster records dropped", self.net, dropped);
        if inflight > 0 {
            warn!(
                "Net {}: reclaiming {} transmissions after FIFO overflow",
                self.net, inflight
            );
            self.links.controller.abort_transmit(self.index, None);
            self.tx_aborted(None);
        }
    }

    fn receive(&self, frame: &FrameEvent, timestamp: Timestamp) {
        let msg = frame.msg;
        let self_rx = frame.flags.contains(crate::busmaster::FrameFlags::SELF_RX);
        let (filter, origin) = self.with_state(|s| {
            let origin = if self_rx {
                s.inflight.get(&frame.tag).and_then(|f| f.session)
            } else {
                None
            };
            (s.filter.clone(), origin)
        });
        let rtr = msg.is_rtr();
        let mut matched = false;
        let mut overruns = 0u32;
        let mut answers = Vec::new();
        for core in self.sessions() {
            let mode = core.mode;
            let mut out = msg;
            if self_rx {
                if origin == Some(core.id) {
                    if !mode.contains(ModeFlags::LOCAL_ECHO) {
                        continue;
                    }
                } else if mode.contains(ModeFlags::NO_INTERACTION) {
                    continue;
                } else if mode.contains(ModeFlags::MARK_INTERACTION) {
                    out.set_len_flag(len_flags::INTERACTION, true);
                }
            }
            if (rtr && mode.contains(ModeFlags::IGNORE_RTR))
                || (!rtr && mode.contains(ModeFlags::IGNORE_DATA))
                || (msg.is_fd() && core.frame_mode != FrameMode::Fd)
            {
                continue;
            }
            let class = FilterClass::classify(rtr, msg.is_fd(), mode.contains(ModeFlags::OBJECT));
            if !filter.admits(&msg.id, class) || !core.admits(&msg.id) {
                continue;
            }
            matched = true;
            if !core.deliver(out) {
                overruns = overruns.saturating_add(1);
            }
            if rtr && !self_rx && mode.contains(ModeFlags::AUTO_ANSWER) {
                if let Some(answer) = core.answer_for(&msg.id) {
                    answers.push(answer);
                }
            }
        }
        self.with_state(|s| {
            s.stats.fifo_ovr = s.stats.fifo_ovr.saturating_add(overruns);
            if !self_rx {
                s.stats.count_rx(&msg);
                if !matched {
                    s.stats.unmatched = s.stats.unmatched.saturating_add(1);
                }
            }
        });
        if !self_rx {
            self.links.eei.on_frame(self.index, &msg, timestamp);
        }
        if !answers.is_empty() {
            critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                for answer in answers {
                    let started = self.start_tx(&mut state, None, answer);
                    trace!(
                        "Net {}: auto answer for {:x}, started {}",
                        self.net,
                        answer.id.raw(),
                        started
                    );
                }
            });
        }
    }

    fn tx_done(&self, tag: u32) {
        let done = self.with_state(|s| {
            let f = s.inflight.remove(&tag)?;
            s.stats.count_tx(&f.msg);
            Some(f)
        });
        match done {
            Some(InFlight {
                session: Some(sid), ..
            }) => {
                if let Some(core) = self.session(sid) {
                    core.tx_finished(1);
                }
            }
            Some(_) => (),
            None => debug!("Net {}: TX done for unknown tag {}", self.net, tag),
        }
        self.pump_tx();
    }

    fn tx_aborted(&self, tag: Option<u32>) {
        let aborted: Vec<InFlight> = self.with_state(|s| {
            let aborted: Vec<InFlight> = match tag {
                Some(tag) => s.inflight.remove(&tag).into_iter().collect(),
                None => core::mem::take(&mut s.inflight).into_values().collect(),
            };
            s.stats.aborted_frames = s
                .stats
                .aborted_frames
                .saturating_add(aborted.len() as u32);
            aborted
        });
        for f in aborted.iter() {
            if let Some(core) = f.session.and_then(|sid| self.session(sid)) {
                core.tx_finished(1);
            }
        }
        debug!("Net {}: {} transmissions aborted", self.net, aborted.len());
        self.pump_tx();
    }

    fn error_report(&self, report: &ErrorReport, bus_error: bool, timestamp: Timestamp) {
        let (state, ctrl_ovr, fifo_ovr) = self.with_state(|s| {
            let c = &mut s.counters;
            let previous = c.bus_state;
            c.rec = report.rec;
            c.tec = report.tec;
            c.ecc = report.ecc;
            c.timestamp = timestamp;
            c.bus_state = if bus_error {
                c.bus_errors = c.bus_errors.saturating_add(1);
                s.stats.err_frames = s.stats.err_frames.saturating_add(1);
                // Bus off only ends with a re-initialisation
                if previous == BusState::BusOff {
                    BusState::BusOff
                } else {
                    report.state
                }
            } else {
                previous.max(report.state)
            };
            if c.bus_state != previous {
                info!(
                    "Net {}: bus state {:?} -> {:?}",
                    self.net, previous, c.bus_state
                );
            }
            (c.bus_state, s.stats.ctrl_ovr, s.stats.fifo_ovr)
        });
        let sat = |v: u32| v.min(u8::MAX as u32) as u8;
        let data = [
            state.to_status_byte(),
            sat(ctrl_ovr),
            sat(fifo_ovr),
            report.rec,
            report.tec,
            report.ecc,
        ];
        self.post_event(ids::EV_CAN_ERROR, &data, timestamp);
    }

    /// Deliver an event message to every session which enabled the event
    fn post_event(&self, ev: u16, data: &[u8], timestamp: Timestamp) {
        let mut msg = CanMessage::new_event(ev, data);
        msg.timestamp = timestamp;
        let mut overruns = 0u32;
        for core in self.sessions() {
            if core.admits(&msg.id) && !core.deliver(msg) {
                overruns = overruns.saturating_add(1);
            }
        }
        if overruns > 0 {
            self.with_state(|s| s.stats.fifo_ovr = s.stats.fifo_ovr.saturating_add(overruns));
        }
    }

    fn apply_baud(
        &self,
        nominal: BaudSetting,
        data: Option<BaudSetting>,
    ) -> Result<(), DriverError> {
        self.check_fault()?;
        let clock = self.config.clock;
        let invalid = |_| DriverError::InvalidParameter {
            reason: "baudrate cannot be applied",
        };
        let nominal_timing = nominal.timing(clock).map_err(invalid)?;
        let data_timing = match data {
            Some(d) => d.timing(clock).map_err(invalid)?,
            None => None,
        };
        self.links.controller.set_baud(
            self.index,
            nominal_timing,
            data_timing,
            nominal.listen_only,
        )?;
        let now = self.links.timers.now();
        self.with_state(|s| {
            s.baud = nominal;
            s.data_baud = data;
            // Re-initialising the controller leaves bus off and clears the counters
            s.counters = ErrorCounters {
                timestamp: now,
                ..Default::default()
            };
        });
        info!("Net {}: baudrate set to {:x}", self.net, nominal.to_raw());
        self.post_event(ids::EV_BAUD_CHANGE, &nominal.to_raw().to_le_bytes(), now);
        self.pump_tx();
        Ok(())
    }

    /// Set the nominal baudrate
    pub fn set_baud(&self, setting: BaudSetting) -> Result<(), DriverError> {
        self.apply_baud(setting, None)
    }

    /// Set the arbitration and data phase baudrates of an FD channel
    pub fn set_baud_x(&self, nominal: BaudSetting, data: BaudSetting) -> Result<(), DriverError> {
        if self.config.frame_mode != FrameMode::Fd {
            return Err(DriverError::NotSupported);
        }
        self.apply_baud(nominal, Some(data))
    }

    /// The nominal baudrate setting
    pub fn get_baud(&self) -> BaudSetting {
        self.with_state(|s| s.baud)
    }

    /// The data phase baudrate setting, if one is set
    pub fn get_data_baud(&self) -> Option<BaudSetting> {
        self.with_state(|s| s.data_baud)
    }

    /// Decode the effective bit timing of the channel
    pub fn bitrate(&self) -> Result<BitrateInfo, DriverError> {
        self.check_fault()?;
        let (nominal, data) = self.with_state(|s| (s.baud, s.data_baud));
        let clock = self.config.clock;
        let phase = |setting: BaudSetting| -> Result<Option<PhaseInfo>, DriverError> {
            let timing: Option<BitTiming> = setting.timing(clock).map_err(|_| {
                DriverError::InvalidParameter {
                    reason: "baudrate cannot be decoded",
                }
            })?;
            Ok(timing.map(|t| PhaseInfo::new(t, clock)))
        };
        let nominal_info = phase(nominal)?;
        let data_info = match data {
            Some(d) => phase(d)?,
            None => None,
        };
        Ok(BitrateInfo {
            baud: nominal.to_raw(),
            valid: nominal_info.is_some(),
            clock,
            listen_only: nominal.listen_only,
            nominal: nominal_info.unwrap_or_default(),
            data: data_info,
        })
    }

    /// Snapshot of the bus statistics
    pub fn bus_statistics(&self) -> BusStatistics {
        let now = self.links.timers.now();
        self.with_state(|s| {
            let mut stats = s.stats;
            stats.timestamp = now;
            stats
        })
    }

    /// Clear the bus statistics
    pub fn reset_bus_statistics(&self) {
        self.with_state(|s| s.stats = BusStatistics::default());
    }

    /// Snapshot of the error counters
    pub fn error_counters(&self) -> ErrorCounters {
        self.with_state(|s| s.counters)
    }

    /// Current bus state
    pub fn bus_state(&self) -> BusState {
        self.with_state(|s| s.counters.bus_state)
    }

    /// Change the acceptance filter
    pub fn set_filter(
        &self,
        cmd: FilterCmd,
        classes: FilterClass,
        target: FilterTarget,
    ) -> Result<(), DriverError> {
        self.check_fault()?;
        self.with_state(|s| s.filter.set(cmd, classes, target))
    }

    /// Set the legacy 11-bit acceptance code and mask
    pub fn set_std_acceptance(&self, code: u16, mask: u16) -> Result<(), DriverError> {
        self.check_fault()?;
        self.with_state(|s| s.filter.set_std_acceptance(code, mask))
    }

    /// Admit a region of extended identifiers
    pub fn add_ext_region(&self, first: u32, count: u32) -> Result<(), DriverError> {
        self.check_fault()?;
        self.with_state(|s| s.filter.add_ext_region(first, count))
    }

    /// Remove every acceptance filter entry, admitting all traffic again
    pub fn clear_filter(&self) {
        self.with_state(|s| s.filter.clear());
    }

    /// Re-initialise the controller with the current baudrate
    ///
    /// Aborts everything in flight and clears bus off.
    pub fn reinit(&self) -> Result<(), DriverError> {
        self.links.controller.abort_transmit(self.index, None);
        let (nominal, data) = self.with_state(|s| (s.baud, s.data_baud));
        self.apply_baud(nominal, data)
    }
}

#[cfg(test)]
mod tests {
    use esdcan_common::{card_config::CardConfig, CanId};

    use super::*;
    use crate::busmaster::{BusmasterPort, FrameFlags};
    use crate::card::Card;
    use crate::eei::InjectionPattern;
    use crate::hw::LoopbackController;
    use crate::session::{OpenParams, Session};

    const CONFIG: &str = r#"
        name = "test"
        serial = "N0000001"
        hardware_version = "1.0.0"
        firmware_version = "1.0.0"
        features = ["local_echo"]

        [[node]]
        baud = 2
    "#;

    fn card(controller: Arc<dyn Controller>) -> (Arc<Card>, Arc<Node>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = CardConfig::load_from_str(CONFIG).unwrap();
        let card = Card::new(config, controller, None).unwrap();
        let node = card.node(0).unwrap().clone();
        (card, node)
    }

    fn frame(id: u16, data: u8) -> CanMessage {
        CanMessage::new(CanId::std(id), &[data]).unwrap()
    }

    /// Refuses every frame
    struct BusyController;

    impl Controller for BusyController {
        fn bind(&self, _port: BusmasterPort) {}

        fn transmit(&self, _node: u8, _msg: &CanMessage, _tag: u32) -> Result<(), DriverError> {
            Err(DriverError::ControllerBusy)
        }

        fn abort_transmit(&self, _node: u8, _tag: Option<u32>) {}

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
            Ok(())
        }
    }

    #[test]
    fn test_sessions_take_turns() {
        let (card, node) = card(Arc::new(LoopbackController::with_tx_slots(1)));
        let a = Session::open(node.clone(), OpenParams::default()).unwrap();
        let b = Session::open(node.clone(), OpenParams::default()).unwrap();
        let reader = Session::open(node.clone(), OpenParams::default()).unwrap();
        reader.id_region_add(CanId::std(0x1), 2).unwrap();

        a.send(&[frame(0x1, 1), frame(0x1, 2), frame(0x1, 3)]).unwrap();
        b.send(&[frame(0x2, 1), frame(0x2, 2), frame(0x2, 3)]).unwrap();
        card.dpc();

        let mut buf = [CanMessage::default(); 8];
        assert_eq!(6, reader.take(&mut buf).unwrap());
        let order: Vec<(u32, u8)> = buf[..6]
            .iter()
            .map(|m| (m.id.value(), m.data()[0]))
            .collect();
        assert_eq!(vec![(1, 1), (2, 1), (1, 2), (2, 2), (1, 3), (2, 3)], order);
        assert_eq!(6, node.bus_statistics().xmit_count.std_data);
    }

    #[test]
    fn test_abort_all_record_finishes_everything_in_flight() {
        let controller = Arc::new(LoopbackController::new());
        controller.set_paused(true);
        let (card, node) = card(controller.clone());
        let session = Session::open(node.clone(), OpenParams::default()).unwrap();
        assert_eq!(2, session.send(&[frame(0x5, 1), frame(0x5, 2)]).unwrap());
        assert_eq!(2, controller.held());

        card.port().post(&BusmasterRecord::new(
            0,
            card.timers().now(),
            BusmasterEvent::TxAbort { tag: None },
        ));
        card.dpc();
        assert_eq!(2, node.bus_statistics().aborted_frames);
        assert_eq!(0, node.with_state(|s| s.inflight.len()));
    }

    #[test]
    fn test_error_state_only_escalates_without_bus_error() {
        let (card, node) = card(Arc::new(LoopbackController::new()));
        let post = |event| {
            card.port()
                .post(&BusmasterRecord::new(0, card.timers().now(), event));
            card.dpc();
        };
        let report = |state, tec| ErrorReport {
            state,
            rec: 0,
            tec,
            ecc: 0,
        };

        post(BusmasterEvent::ErrorPassive(report(BusState::ErrorPassive, 130)));
        assert_eq!(BusState::ErrorPassive, node.bus_state());
        post(BusmasterEvent::ErrorWarn(report(BusState::Warn, 100)));
        assert_eq!(BusState::ErrorPassive, node.bus_state());
        assert_eq!(100, node.error_counters().tec);

        post(BusmasterEvent::BusError(report(BusState::Ok, 0)));
        assert_eq!(BusState::Ok, node.bus_state());
        post(BusmasterEvent::BusError(report(BusState::BusOff, 255)));
        post(BusmasterEvent::BusError(report(BusState::Ok, 0)));
        assert_eq!(BusState::BusOff, node.bus_state());
        assert_eq!(Err(DriverError::BusOff), node.check_tx(ModeFlags::empty()));

        node.reinit().unwrap();
        assert_eq!(BusState::Ok, node.bus_state());
        assert_eq!(Ok(()), node.check_tx(ModeFlags::empty()));
    }

    #[test]
    fn test_local_echo_only_for_the_sender() {
        let (card, node) = card(Arc::new(LoopbackController::new()));
        let echo = Session::open(node.clone(), OpenParams::new(ModeFlags::LOCAL_ECHO)).unwrap();
        let quiet = Session::open(node.clone(), OpenParams::default()).unwrap();
        echo.id_add(CanId::std(0x9)).unwrap();
        quiet.id_add(CanId::std(0x9)).unwrap();

        quiet.send(&[frame(0x9, 1)]).unwrap();
        card.dpc();
        echo.send(&[frame(0x9, 2)]).unwrap();
        card.dpc();

        let mut buf = [CanMessage::default(); 4];
        // The echo session sees both, the quiet one only the other's frame
        assert_eq!(2, echo.take(&mut buf).unwrap());
        assert_eq!(1, quiet.take(&mut buf).unwrap());
        assert_eq!(&[2], buf[0].data());
        // Own transmissions are not counted as received
        assert_eq!(0, node.bus_statistics().rcv_count.std_data);
    }

    #[test]
    fn test_busy_controller_drops_auto_answer() {
        let (card, node) = card(Arc::new(BusyController));
        let answering =
            Session::open(node.clone(), OpenParams::new(ModeFlags::AUTO_ANSWER)).unwrap();
        answering.id_add(CanId::std(0x300)).unwrap();
        answering.update_answer(&[frame(0x300, 7)]).unwrap();

        card.port().post(&BusmasterRecord::new(
            0,
            card.timers().now(),
            BusmasterEvent::RxTxDone(FrameEvent {
                msg: CanMessage::new_rtr(CanId::std(0x300), 0),
                flags: FrameFlags::empty(),
                tag: 0,
            }),
        ));
        card.dpc();

        let stats = node.bus_statistics();
        assert_eq!(1, stats.rcv_count.std_rtr);
        assert_eq!(1, stats.aborted_frames);
        assert_eq!(0, stats.xmit_count.std_data);
        assert_eq!(0, node.with_state(|s| s.inflight.len()));
    }
}
