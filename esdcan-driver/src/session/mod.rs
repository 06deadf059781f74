//! Handles opened on a node
//!
//! A [`Session`] is one open handle. It owns a receive ring, a transmit ring and the state of
//! both directions, and is registered with its node for as long as it is open. The node's drain
//! path only ever touches the shared [`SessionCore`]: it pushes received frames, completes
//! transmissions and signals waiters, without taking any lock a caller could block in.
use core::cell::RefCell;
use core::pin::Pin;
use std::collections::BTreeMap;
use std::sync::Arc;

use critical_section::Mutex;
use defmt_or_log::{debug, trace};
use esdcan_common::{
    bus_status::BusState,
    constants::{len_flags, limits},
    flags::{FeatureFlags, ModeFlags},
    CanId, CanMessage, DriverError, FrameMode, Timeout, Timestamp,
};
use tokio::sync::{futures::Notified, Notify, Semaphore};
use tokio::time::Instant;

use crate::filter::IdSet;
use crate::node::Node;
use crate::ring::CmRing;

mod pipeline;

pub use pipeline::{CancelReason, RxState, TxState};
use pipeline::{PipeState, Pipeline};

/// Parameters of a new session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OpenParams {
    /// Mode flags
    pub mode: ModeFlags,
    /// Receive queue size; 0 selects the card default
    pub rx_queue: usize,
    /// Transmit queue size; 0 selects the card default
    pub tx_queue: usize,
    /// Default receive timeout
    pub rx_timeout: Timeout,
    /// Default transmit timeout
    pub tx_timeout: Timeout,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self::new(ModeFlags::empty())
    }
}

impl OpenParams {
    /// Parameters with the given mode and card default queues
    pub fn new(mode: ModeFlags) -> Self {
        Self {
            mode,
            rx_queue: 0,
            tx_queue: 0,
            rx_timeout: Timeout::Infinite,
            tx_timeout: Timeout::Infinite,
        }
    }

    /// Set the queue sizes
    pub fn with_queues(mut self, rx: usize, tx: usize) -> Self {
        self.rx_queue = rx;
        self.tx_queue = tx;
        self
    }

    /// Set the default timeouts
    pub fn with_timeouts(mut self, rx: Timeout, tx: Timeout) -> Self {
        self.rx_timeout = rx;
        self.tx_timeout = tx;
        self
    }
}

/// Whether a call transferred everything it was asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoStatus {
    /// Every requested message was transferred
    Success,
    /// Fewer messages than requested were transferred
    Partial,
}

/// Result of a successful read or write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    /// Number of messages transferred
    pub count: usize,
    /// Full or partial transfer
    pub status: IoStatus,
}

impl Completion {
    fn new(count: usize, requested: usize) -> Self {
        let status = if count >= requested {
            IoStatus::Success
        } else {
            IoStatus::Partial
        };
        Self { count, status }
    }
}

pub(crate) struct SessionState {
    rx: Pipeline<RxState>,
    tx: Pipeline<TxState>,
    /// Frames ever accepted for transmission
    tx_queued: u64,
    /// Frames ever completed or aborted
    tx_done: u64,
    /// A frame the controller refused, retried before the ring
    held: Option<CanMessage>,
    rx_timeout: Timeout,
    tx_timeout: Timeout,
    ids: IdSet,
    /// Latest frame per identifier, and whether it arrived after the last `take_objects`
    objects: BTreeMap<CanId, (CanMessage, bool)>,
    answers: BTreeMap<CanId, CanMessage>,
}

/// The part of a session shared with its node
pub(crate) struct SessionCore {
    pub id: u32,
    pub mode: ModeFlags,
    pub frame_mode: FrameMode,
    pub rx: CmRing,
    tx: CmRing,
    state: Mutex<RefCell<SessionState>>,
    rx_ready: Notify,
    tx_ready: Notify,
    close_ack: Semaphore,
}

impl SessionCore {
    fn new(id: u32, params: &OpenParams, rx_queue: usize, tx_queue: usize) -> Self {
        let frame_mode = if params.mode.contains(ModeFlags::FD) {
            FrameMode::Fd
        } else {
            FrameMode::Classic
        };
        Self {
            id,
            mode: params.mode,
            frame_mode,
            rx: CmRing::new(rx_queue),
            tx: CmRing::new(tx_queue),
            state: Mutex::new(RefCell::new(SessionState {
                rx: Pipeline::new(),
                tx: Pipeline::new(),
                tx_queued: 0,
                tx_done: 0,
                held: None,
                rx_timeout: params.rx_timeout,
                tx_timeout: params.tx_timeout,
                ids: IdSet::new(),
                objects: BTreeMap::new(),
                answers: BTreeMap::new(),
            })),
            rx_ready: Notify::new(),
            tx_ready: Notify::new(),
            close_ack: Semaphore::new(0),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    /// True if the handle's ID set admits `id`
    pub fn admits(&self, id: &CanId) -> bool {
        self.with_state(|s| s.ids.admits(id))
    }

    /// Hand a received frame to the handle. Returns false if it had to be dropped.
    pub fn deliver(&self, msg: CanMessage) -> bool {
        let ok = if self.mode.contains(ModeFlags::OBJECT) && !msg.id.is_event() {
            self.with_state(|s| s.objects.insert(msg.id, (msg, true)));
            true
        } else {
            self.rx.push(msg).is_ok()
        };
        self.rx_ready.notify_waiters();
        ok
    }

    /// The stored answer for a remote request on `id`
    pub fn answer_for(&self, id: &CanId) -> Option<CanMessage> {
        self.with_state(|s| s.answers.get(id).copied())
    }

    /// Next frame waiting for transmission
    pub fn next_tx(&self) -> Option<CanMessage> {
        self.with_state(|s| s.held.take()).or_else(|| self.tx.pop())
    }

    /// Put back a frame the controller could not take
    pub fn hold(&self, msg: CanMessage) {
        self.with_state(|s| s.held = Some(msg));
    }

    /// Account finished transmissions and wake a blocked writer
    pub fn tx_finished(&self, n: u64) {
        self.with_state(|s| s.tx_done = s.tx_done.saturating_add(n));
        self.tx_ready.notify_waiters();
    }

    /// Note frames accepted for transmission outside the transmit ring
    pub fn tx_accepted(&self, n: u64) {
        self.with_state(|s| s.tx_queued = s.tx_queued.saturating_add(n));
    }

    /// Tear down without waiting; blocked and future calls fail with a forced close error
    pub fn force_close(&self) {
        self.with_state(|s| {
            s.rx.close(true);
            s.tx.close(true);
        });
        self.rx_ready.notify_waiters();
        self.tx_ready.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.with_state(|s| s.rx.check_open().is_err())
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Rx,
    Tx,
}

/// Returns a direction to idle, or acknowledges a close, when a blocked call leaves
///
/// Also runs when the call's future is dropped while waiting.
struct WaitGuard<'a> {
    core: &'a SessionCore,
    direction: Direction,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let ack = self.core.with_state(|s| match self.direction {
            Direction::Rx => s.rx.finish(),
            Direction::Tx => s.tx.finish(),
        });
        if ack {
            self.core.close_ack.add_permits(1);
        }
    }
}

fn deadline(timeout: Timeout) -> Option<Instant> {
    timeout.as_duration().map(|d| Instant::now() + d)
}

/// Wait for a notification. Returns false when the deadline passed first.
async fn wait_until(deadline: Option<Instant>, notified: Pin<&mut Notified<'_>>) -> bool {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, notified).await.is_ok(),
        None => {
            notified.await;
            true
        }
    }
}

/// An open handle on a node
///
/// All operations take `&self`, so one session may be shared between tasks; each direction
/// admits one blocking call at a time. Dropping a session unregisters it from its node. Use
/// [`Session::close`] to also wait for blocked calls to return.
#[allow(missing_debug_implementations)]
pub struct Session {
    core: Arc<SessionCore>,
    node: Arc<Node>,
}

impl Session {
    /// Open a session on a node
    pub fn open(node: Arc<Node>, params: OpenParams) -> Result<Self, DriverError> {
        node.check_fault()?;
        let features = node.features();
        let required = [
            (ModeFlags::OBJECT, FeatureFlags::RX_OBJECT_MODE),
            (ModeFlags::SCHEDULED_TX, FeatureFlags::SCHEDULING),
            (ModeFlags::LOCAL_ECHO, FeatureFlags::LOCAL_ECHO),
            (ModeFlags::LISTEN_ONLY, FeatureFlags::LISTEN_ONLY_MODE),
            (ModeFlags::FD, FeatureFlags::CAN_FD),
        ];
        for (mode, feature) in required {
            if params.mode.contains(mode) && !features.contains(feature) {
                return Err(DriverError::NotSupported);
            }
        }
        if params.mode.contains(ModeFlags::FD) && node.frame_mode() != FrameMode::Fd {
            return Err(DriverError::NotSupported);
        }
        let (default_rx, default_tx) = node.default_queues();
        let pick = |size: usize, default: usize| match size {
            0 => Ok(default),
            n if n <= limits::MAX_QUEUE_SIZE => Ok(n),
            _ => Err(DriverError::InvalidParameter {
                reason: "queue size too large",
            }),
        };
        let rx_queue = pick(params.rx_queue, default_rx)?;
        let tx_queue = pick(params.tx_queue, default_tx)?;
        let core = Arc::new(SessionCore::new(
            node.next_session_id(),
            &params,
            rx_queue,
            tx_queue,
        ));
        node.register(core.clone());
        debug!(
            "Opened session {} on net {} with mode {:x}",
            core.id,
            node.net(),
            params.mode.bits()
        );
        Ok(Self { core, node })
    }

    /// Session number, unique on its node
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Mode flags the session was opened with
    pub fn mode(&self) -> ModeFlags {
        self.core.mode
    }

    /// Net number of the node
    pub fn net(&self) -> u8 {
        self.node.net()
    }

    /// The node this session is open on
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Current receive and transmit state
    pub fn state(&self) -> (RxState, TxState) {
        self.core.with_state(|s| (s.rx.state, s.tx.state))
    }

    /// Number of messages waiting in the receive queue
    pub fn rx_queued(&self) -> usize {
        self.core.rx.len()
    }

    /// Default receive and transmit timeouts
    pub fn timeouts(&self) -> (Timeout, Timeout) {
        self.core.with_state(|s| (s.rx_timeout, s.tx_timeout))
    }

    /// Set the default receive timeout
    pub fn set_rx_timeout(&self, timeout: Timeout) {
        self.core.with_state(|s| s.rx_timeout = timeout);
    }

    /// Set the default transmit timeout
    pub fn set_tx_timeout(&self, timeout: Timeout) {
        self.core.with_state(|s| s.tx_timeout = timeout);
    }

    fn require_fifo_mode(&self) -> Result<(), DriverError> {
        if self.core.mode.contains(ModeFlags::OBJECT) {
            Err(DriverError::NotSupported)
        } else {
            Ok(())
        }
    }

    fn poll_rx(&self, buf: &mut [CanMessage], keep_timestamps: bool) -> Result<usize, DriverError> {
        self.core.with_state(|s| s.rx.check_terminal())?;
        let mut n = 0;
        while n < buf.len() {
            let Some(mut msg) = self.core.rx.pop() else {
                break;
            };
            if !keep_timestamps {
                msg.timestamp = Timestamp::ZERO;
            }
            buf[n] = msg;
            n += 1;
        }
        Ok(n)
    }

    async fn read_inner(
        &self,
        buf: &mut [CanMessage],
        timeout: Timeout,
        keep_timestamps: bool,
    ) -> Result<Completion, DriverError> {
        self.require_fifo_mode()?;
        if buf.is_empty() {
            return Ok(Completion::new(0, 0));
        }
        let core = &*self.core;
        core.with_state(|s| {
            s.rx.begin(
                RxState::PendingRead {
                    requested: buf.len(),
                },
                DriverError::PendingRead,
            )
        })?;
        let _guard = WaitGuard {
            core,
            direction: Direction::Rx,
        };
        let deadline = deadline(timeout);
        loop {
            let notified = core.rx_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let n = self.poll_rx(buf, keep_timestamps)?;
            if n > 0 {
                return Ok(Completion::new(n, buf.len()));
            }
            if !wait_until(deadline, notified).await {
                let n = self.poll_rx(buf, keep_timestamps)?;
                if n > 0 {
                    return Ok(Completion::new(n, buf.len()));
                }
                trace!("Read on session {} timed out", core.id);
                return Err(DriverError::RxTimeout);
            }
        }
    }

    /// Read received messages, blocking until at least one is available
    ///
    /// Returns as soon as some messages are available, with [`IoStatus::Partial`] if there are
    /// fewer than `buf.len()`. Timestamps are cleared; see [`Session::read_t`].
    pub async fn read(
        &self,
        buf: &mut [CanMessage],
        timeout: Timeout,
    ) -> Result<Completion, DriverError> {
        self.read_inner(buf, timeout, false).await
    }

    /// Like [`Session::read`], keeping reception timestamps
    pub async fn read_t(
        &self,
        buf: &mut [CanMessage],
        timeout: Timeout,
    ) -> Result<Completion, DriverError> {
        self.read_inner(buf, timeout, true).await
    }

    fn take_inner(
        &self,
        buf: &mut [CanMessage],
        keep_timestamps: bool,
    ) -> Result<usize, DriverError> {
        self.require_fifo_mode()?;
        self.core.with_state(|s| {
            s.rx.check_open()?;
            if s.rx.state.is_pending() {
                return Err(DriverError::PendingRead);
            }
            Ok(())
        })?;
        self.poll_rx(buf, keep_timestamps)
    }

    /// Take whatever messages are available without blocking
    pub fn take(&self, buf: &mut [CanMessage]) -> Result<usize, DriverError> {
        self.take_inner(buf, false)
    }

    /// Like [`Session::take`], keeping reception timestamps
    pub fn take_t(&self, buf: &mut [CanMessage]) -> Result<usize, DriverError> {
        self.take_inner(buf, true)
    }

    /// Fill `buf` with the latest frame received for each entry's identifier
    ///
    /// Entries whose identifier has not been received yet come back with no data and the
    /// `NO_DATA` length flag. Returns the number of entries which carry data.
    ///
    /// If none of the entries with data was updated since the previous call, `buf` is still
    /// filled but the call fails with [`DriverError::StaleData`].
    pub fn take_objects(&self, buf: &mut [CanMessage]) -> Result<usize, DriverError> {
        if !self.core.mode.contains(ModeFlags::OBJECT) {
            return Err(DriverError::NotSupported);
        }
        self.core.with_state(|s| {
            s.rx.check_open()?;
            let mut found = 0;
            let mut fresh = 0;
            for entry in buf.iter_mut() {
                match s.objects.get_mut(&entry.id) {
                    Some((msg, updated)) => {
                        *entry = *msg;
                        found += 1;
                        if core::mem::take(updated) {
                            fresh += 1;
                        }
                    }
                    None => {
                        let mut empty = CanMessage::new_rtr(entry.id, 0);
                        empty.set_len_flag(len_flags::RTR, false);
                        empty.set_len_flag(len_flags::NO_DATA, true);
                        *entry = empty;
                    }
                }
            }
            if found > 0 && fresh == 0 {
                return Err(DriverError::StaleData);
            }
            Ok(found)
        })
    }

    /// Store answer objects for automatic replies to remote requests
    pub fn update_answer(&self, msgs: &[CanMessage]) -> Result<(), DriverError> {
        if !self.core.mode.contains(ModeFlags::AUTO_ANSWER) {
            return Err(DriverError::NotSupported);
        }
        self.validate_tx(msgs)?;
        self.core.with_state(|s| {
            s.tx.check_open()?;
            for msg in msgs {
                s.answers.insert(msg.id, *msg);
            }
            Ok(())
        })
    }

    fn validate_tx(&self, msgs: &[CanMessage]) -> Result<(), DriverError> {
        self.node.check_tx(self.core.mode)?;
        for msg in msgs {
            if msg.id.is_event() {
                return Err(DriverError::InvalidParameter {
                    reason: "event identifiers cannot be transmitted",
                });
            }
            msg.check_mode(self.core.frame_mode)?;
        }
        Ok(())
    }

    /// Queue frames for transmission, returning how many were accepted
    fn enqueue(&self, msgs: &[CanMessage], timed: bool) -> usize {
        let core = &*self.core;
        let mut accepted = 0;
        if core.mode.contains(ModeFlags::SCHEDULED_TX) {
            for msg in msgs {
                let due = if timed { msg.timestamp } else { Timestamp::ZERO };
                if self.node.schedule(core.id, due, *msg).is_err() {
                    break;
                }
                core.tx_accepted(1);
                accepted += 1;
            }
            self.node.arm_schedule();
        } else {
            for msg in msgs {
                core.tx_accepted(1);
                if core.tx.push(*msg).is_err() {
                    core.with_state(|s| s.tx_queued -= 1);
                    break;
                }
                accepted += 1;
            }
            self.node.pump_tx();
        }
        accepted
    }

    fn send_inner(&self, msgs: &[CanMessage], timed: bool) -> Result<usize, DriverError> {
        self.validate_tx(msgs)?;
        self.core.with_state(|s| {
            s.tx.check_open()?;
            if s.tx.state.is_pending() {
                return Err(DriverError::PendingWrite);
            }
            Ok(())
        })?;
        Ok(self.enqueue(msgs, timed))
    }

    /// Queue frames without waiting for completion
    ///
    /// Returns the number of frames which fit into the transmit queue.
    pub fn send(&self, msgs: &[CanMessage]) -> Result<usize, DriverError> {
        self.send_inner(msgs, false)
    }

    /// Like [`Session::send`]; in scheduled mode each frame's timestamp is its due time
    pub fn send_t(&self, msgs: &[CanMessage]) -> Result<usize, DriverError> {
        self.send_inner(msgs, true)
    }

    async fn write_inner(
        &self,
        msgs: &[CanMessage],
        timeout: Timeout,
        timed: bool,
    ) -> Result<Completion, DriverError> {
        if msgs.is_empty() {
            return Ok(Completion::new(0, 0));
        }
        self.validate_tx(msgs)?;
        let requested = msgs.len();
        let core = &*self.core;
        let first = core.with_state(|s| {
            s.tx.begin(
                TxState::PendingWrite {
                    requested,
                    queued: 0,
                },
                DriverError::PendingWrite,
            )?;
            Ok::<u64, DriverError>(s.tx_queued)
        })?;
        let _guard = WaitGuard {
            core,
            direction: Direction::Tx,
        };
        let deadline = deadline(timeout);
        let mut queued = 0;
        let progress = |queued: usize| {
            core.with_state(|s| {
                s.tx.check_terminal()?;
                let completed = s.tx_done.saturating_sub(first).min(requested as u64) as usize;
                s.tx.state = if queued < requested {
                    TxState::PendingWrite { requested, queued }
                } else {
                    TxState::PendingSend {
                        requested,
                        completed,
                    }
                };
                Ok::<usize, DriverError>(completed)
            })
        };
        loop {
            let notified = core.tx_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if queued < requested {
                queued += self.enqueue(&msgs[queued..], timed);
            }
            if progress(queued)? >= requested {
                return Ok(Completion::new(requested, requested));
            }
            if !wait_until(deadline, notified).await {
                let completed = progress(queued)?;
                if completed >= requested {
                    return Ok(Completion::new(requested, requested));
                }
                debug!(
                    "Write on session {} timed out after {} of {} frames",
                    core.id, completed, requested
                );
                // Nothing got out; report the error state which is likely holding it back
                if completed == 0 {
                    match self.node.bus_state() {
                        BusState::Warn => return Err(DriverError::ControllerWarn),
                        BusState::ErrorPassive => {
                            return Err(DriverError::ControllerErrorPassive)
                        }
                        _ => (),
                    }
                }
                return Err(DriverError::TxTimeout { completed });
            }
        }
    }

    /// Transmit frames and wait until every one of them has completed
    pub async fn write(
        &self,
        msgs: &[CanMessage],
        timeout: Timeout,
    ) -> Result<Completion, DriverError> {
        self.write_inner(msgs, timeout, false).await
    }

    /// Like [`Session::write`]; in scheduled mode each frame's timestamp is its due time
    pub async fn write_t(
        &self,
        msgs: &[CanMessage],
        timeout: Timeout,
    ) -> Result<Completion, DriverError> {
        self.write_inner(msgs, timeout, true).await
    }

    /// Make a blocked read return with an abort error
    pub fn abort_rx(&self) {
        self.core
            .with_state(|s| s.rx.request_cancel(CancelReason::Abort));
        self.core.rx_ready.notify_waiters();
    }

    /// Drop every queued frame, abort transmissions in progress and release a blocked writer
    pub fn abort_tx(&self) {
        let core = &*self.core;
        core.with_state(|s| s.tx.request_cancel(CancelReason::Abort));
        let held = core.with_state(|s| s.held.take()).is_some() as u64;
        let dropped = core.tx.clear() as u64 + held + self.node.abort_session_tx(core.id) as u64;
        core.tx_finished(dropped);
        debug!("Aborted transmission on session {}, {} frames dropped", core.id, dropped);
    }

    /// Make blocked calls in both directions return with an interrupted error
    pub fn interrupt(&self) {
        self.core.with_state(|s| {
            s.rx.request_cancel(CancelReason::Interrupt);
            s.tx.request_cancel(CancelReason::Interrupt);
        });
        self.core.rx_ready.notify_waiters();
        self.core.tx_ready.notify_waiters();
    }

    /// Enable one identifier
    pub fn id_add(&self, id: CanId) -> Result<(), DriverError> {
        self.core.with_state(|s| s.ids.id_add(id))
    }

    /// Disable one identifier
    pub fn id_delete(&self, id: CanId) -> Result<(), DriverError> {
        self.core.with_state(|s| s.ids.id_delete(id))
    }

    /// Enable `count` consecutive identifiers
    pub fn id_region_add(&self, first: CanId, count: u32) -> Result<(), DriverError> {
        self.core.with_state(|s| s.ids.id_region_add(first, count))
    }

    /// Disable `count` consecutive identifiers
    pub fn id_region_delete(&self, first: CanId, count: u32) -> Result<(), DriverError> {
        self.core.with_state(|s| s.ids.id_region_delete(first, count))
    }

    /// Set the 29-bit acceptance code and mask of this handle
    pub fn set_20b_filter(&self, code: u32, mask: u32) {
        self.core.with_state(|s| s.ids.set_20b_filter(code, mask));
    }

    /// Close the session
    ///
    /// Blocked calls return with a closed error. Returns once every one of them has observed the
    /// close, and the session has been removed from its node.
    pub async fn close(&self) {
        let core = &*self.core;
        let pending = core.with_state(|s| s.rx.close(false) + s.tx.close(false));
        core.rx_ready.notify_waiters();
        core.tx_ready.notify_waiters();
        if pending > 0 {
            // Permits go back when dropped so that a concurrent close can wait too
            if let Ok(acks) = core.close_ack.acquire_many(pending).await {
                drop(acks);
            }
        }
        self.node.unregister(core.id);
        debug!("Closed session {}", core.id);
    }

    /// True once the session has been closed
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.node.unregister(self.core.id);
    }
}
