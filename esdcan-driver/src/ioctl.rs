//! The numbered control call surface
//!
//! Every driver operation is reachable as an [`IoctlCmd`] applied to a handle. Calls never fail
//! as such; the outcome is a [`Reply`] carrying a numeric [`StatusCode`] and, where the command
//! produces one, a [`Response`].
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use critical_section::Mutex;
use defmt_or_log::debug;
use esdcan_common::{
    baud::{BaudSetting, BitrateInfo},
    bus_status::{BusStatistics, ErrorCounters},
    device_info::DeviceInfo,
    flags::{FeatureFlags, FilterClass},
    CanId, CanMessage, DriverError, StatusCode, Timeout, Timestamp,
};
use int_enum::IntEnum;

use crate::eei::{EeiConfig, EeiId, EeiStatus};
use crate::filter::{FilterCmd, FilterTarget};
use crate::registry::Registry;
use crate::session::{Completion, IoStatus, OpenParams, Session};

/// Control call numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum IoctlCmd {
    /// Open a session on a net
    CreateSession = 1,
    /// Close a session
    DestroySession = 2,
    /// Set the nominal baudrate
    SetBaud = 3,
    /// Read the nominal baudrate
    GetBaud = 4,
    /// Set arbitration and data phase baudrates
    SetBaudX = 5,
    /// Set the default receive timeout
    SetRxTimeout = 6,
    /// Set the default transmit timeout
    SetTxTimeout = 7,
    /// Read the default timeouts
    GetTimeouts = 8,
    /// Queue frames
    Send = 9,
    /// Queue frames, with due times in scheduled mode
    SendT = 10,
    /// Take available frames
    Take = 11,
    /// Take available frames with timestamps
    TakeT = 12,
    /// Wait for frames
    Read = 13,
    /// Wait for frames, keeping timestamps
    ReadT = 14,
    /// Transmit and wait for completion
    Write = 15,
    /// Transmit and wait, with due times in scheduled mode
    WriteT = 16,
    /// Abort a pending read
    AbortRx = 17,
    /// Abort pending transmissions
    AbortTx = 18,
    /// Change the node acceptance filter
    SetFilter = 19,
    /// Set the legacy 11-bit acceptance code and mask
    SetAcceptance = 20,
    /// Enable an identifier on the handle
    IdAdd = 21,
    /// Disable an identifier on the handle
    IdDelete = 22,
    /// Enable a range of identifiers
    IdRegionAdd = 23,
    /// Disable a range of identifiers
    IdRegionDelete = 24,
    /// Set the 29-bit code and mask of the handle
    Set20bFilter = 25,
    /// Read the bus statistics
    GetBusStatistic = 26,
    /// Clear the bus statistics
    ResetBusStatistic = 27,
    /// Read the error counters
    GetErrorCounters = 28,
    /// Decode the effective bitrate
    GetBitrate = 29,
    /// Allocate an error injection unit
    EeiCreate = 30,
    /// Release an error injection unit
    EeiDestroy = 31,
    /// Configure an error injection unit
    EeiConfigure = 32,
    /// Start an error injection unit
    EeiStart = 33,
    /// Stop an error injection unit
    EeiStop = 34,
    /// Read the status of an error injection unit
    EeiStatus = 35,
    /// Fire an error injection unit now
    EeiTriggerNow = 36,
    /// Read identity and versions
    GetDeviceInfo = 37,
    /// Read the current card time
    GetTimestamp = 38,
    /// Read the timestamp frequency
    GetTimestampFreq = 39,
    /// Read the object store
    TakeObjects = 40,
    /// Update auto answer objects
    UpdateAnswer = 41,
    /// Re-initialise the controller
    Reinit = 42,
}

/// A control call with its arguments
#[derive(Debug)]
pub enum Request<'a> {
    /// See [`IoctlCmd::CreateSession`]
    CreateSession {
        /// Net to open
        net: u8,
        /// Session parameters
        params: OpenParams,
    },
    /// See [`IoctlCmd::DestroySession`]
    DestroySession,
    /// See [`IoctlCmd::SetBaud`]; the raw baudrate word
    SetBaud(u32),
    /// See [`IoctlCmd::GetBaud`]
    GetBaud,
    /// See [`IoctlCmd::SetBaudX`]
    SetBaudX {
        /// Raw arbitration phase word
        nominal: u32,
        /// Raw data phase word
        data: u32,
    },
    /// See [`IoctlCmd::SetRxTimeout`]
    SetRxTimeout(Timeout),
    /// See [`IoctlCmd::SetTxTimeout`]
    SetTxTimeout(Timeout),
    /// See [`IoctlCmd::GetTimeouts`]
    GetTimeouts,
    /// See [`IoctlCmd::Send`]
    Send(&'a [CanMessage]),
    /// See [`IoctlCmd::SendT`]
    SendT(&'a [CanMessage]),
    /// See [`IoctlCmd::Take`]
    Take(&'a mut [CanMessage]),
    /// See [`IoctlCmd::TakeT`]
    TakeT(&'a mut [CanMessage]),
    /// See [`IoctlCmd::Read`]; uses the handle's receive timeout
    Read(&'a mut [CanMessage]),
    /// See [`IoctlCmd::ReadT`]
    ReadT(&'a mut [CanMessage]),
    /// See [`IoctlCmd::Write`]; uses the handle's transmit timeout
    Write(&'a [CanMessage]),
    /// See [`IoctlCmd::WriteT`]
    WriteT(&'a [CanMessage]),
    /// See [`IoctlCmd::AbortRx`]
    AbortRx,
    /// See [`IoctlCmd::AbortTx`]
    AbortTx,
    /// See [`IoctlCmd::SetFilter`]
    SetFilter {
        /// Add or remove
        cmd: FilterCmd,
        /// Traffic classes affected
        classes: FilterClass,
        /// Identifiers affected
        target: FilterTarget,
    },
    /// See [`IoctlCmd::SetAcceptance`]
    SetAcceptance {
        /// Acceptance code
        code: u16,
        /// Acceptance mask, bits set are "don't care"
        mask: u16,
    },
    /// See [`IoctlCmd::IdAdd`]
    IdAdd(CanId),
    /// See [`IoctlCmd::IdDelete`]
    IdDelete(CanId),
    /// See [`IoctlCmd::IdRegionAdd`]
    IdRegionAdd {
        /// First identifier
        first: CanId,
        /// Number of identifiers
        count: u32,
    },
    /// See [`IoctlCmd::IdRegionDelete`]
    IdRegionDelete {
        /// First identifier
        first: CanId,
        /// Number of identifiers
        count: u32,
    },
    /// See [`IoctlCmd::Set20bFilter`]
    Set20bFilter {
        /// Acceptance code
        code: u32,
        /// Acceptance mask, bits set are "don't care"
        mask: u32,
    },
    /// See [`IoctlCmd::GetBusStatistic`]
    GetBusStatistic,
    /// See [`IoctlCmd::ResetBusStatistic`]
    ResetBusStatistic,
    /// See [`IoctlCmd::GetErrorCounters`]
    GetErrorCounters,
    /// See [`IoctlCmd::GetBitrate`]
    GetBitrate,
    /// See [`IoctlCmd::EeiCreate`]
    EeiCreate,
    /// See [`IoctlCmd::EeiDestroy`]
    EeiDestroy(EeiId),
    /// See [`IoctlCmd::EeiConfigure`]
    EeiConfigure(EeiId, EeiConfig),
    /// See [`IoctlCmd::EeiStart`]
    EeiStart(EeiId),
    /// See [`IoctlCmd::EeiStop`]
    EeiStop(EeiId),
    /// See [`IoctlCmd::EeiStatus`]
    EeiStatus(EeiId),
    /// See [`IoctlCmd::EeiTriggerNow`]
    EeiTriggerNow(EeiId),
    /// See [`IoctlCmd::GetDeviceInfo`]
    GetDeviceInfo,
    /// See [`IoctlCmd::GetTimestamp`]
    GetTimestamp,
    /// See [`IoctlCmd::GetTimestampFreq`]
    GetTimestampFreq,
    /// See [`IoctlCmd::TakeObjects`]
    TakeObjects(&'a mut [CanMessage]),
    /// See [`IoctlCmd::UpdateAnswer`]
    UpdateAnswer(&'a [CanMessage]),
    /// See [`IoctlCmd::Reinit`]
    Reinit,
}

impl Request<'_> {
    /// The command number of this request
    pub fn cmd(&self) -> IoctlCmd {
        use Request::*;
        match self {
            CreateSession { .. } => IoctlCmd::CreateSession,
            DestroySession => IoctlCmd::DestroySession,
            SetBaud(_) => IoctlCmd::SetBaud,
            GetBaud => IoctlCmd::GetBaud,
            SetBaudX { .. } => IoctlCmd::SetBaudX,
            SetRxTimeout(_) => IoctlCmd::SetRxTimeout,
            SetTxTimeout(_) => IoctlCmd::SetTxTimeout,
            GetTimeouts => IoctlCmd::GetTimeouts,
            Send(_) => IoctlCmd::Send,
            SendT(_) => IoctlCmd::SendT,
            Take(_) => IoctlCmd::Take,
            TakeT(_) => IoctlCmd::TakeT,
            Read(_) => IoctlCmd::Read,
            ReadT(_) => IoctlCmd::ReadT,
            Write(_) => IoctlCmd::Write,
            WriteT(_) => IoctlCmd::WriteT,
            AbortRx => IoctlCmd::AbortRx,
            AbortTx => IoctlCmd::AbortTx,
            SetFilter { .. } => IoctlCmd::SetFilter,
            SetAcceptance { .. } => IoctlCmd::SetAcceptance,
            IdAdd(_) => IoctlCmd::IdAdd,
            IdDelete(_) => IoctlCmd::IdDelete,
            IdRegionAdd { .. } => IoctlCmd::IdRegionAdd,
            IdRegionDelete { .. } => IoctlCmd::IdRegionDelete,
            Set20bFilter { .. } => IoctlCmd::Set20bFilter,
            GetBusStatistic => IoctlCmd::GetBusStatistic,
            ResetBusStatistic => IoctlCmd::ResetBusStatistic,
            GetErrorCounters => IoctlCmd::GetErrorCounters,
            GetBitrate => IoctlCmd::GetBitrate,
            EeiCreate => IoctlCmd::EeiCreate,
            EeiDestroy(_) => IoctlCmd::EeiDestroy,
            EeiConfigure(..) => IoctlCmd::EeiConfigure,
            EeiStart(_) => IoctlCmd::EeiStart,
            EeiStop(_) => IoctlCmd::EeiStop,
            EeiStatus(_) => IoctlCmd::EeiStatus,
            EeiTriggerNow(_) => IoctlCmd::EeiTriggerNow,
            GetDeviceInfo => IoctlCmd::GetDeviceInfo,
            GetTimestamp => IoctlCmd::GetTimestamp,
            GetTimestampFreq => IoctlCmd::GetTimestampFreq,
            TakeObjects(_) => IoctlCmd::TakeObjects,
            UpdateAnswer(_) => IoctlCmd::UpdateAnswer,
            Reinit => IoctlCmd::Reinit,
        }
    }
}

/// Data produced by a control call
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The command produces no data
    None,
    /// Handle of a new session
    Handle(u32),
    /// Number of messages transferred by a non-blocking call
    Count(usize),
    /// Result of a blocking read or write
    Completed(Completion),
    /// Raw baudrate word
    Baud(u32),
    /// Default timeouts
    Timeouts {
        /// Receive timeout
        rx: Timeout,
        /// Transmit timeout
        tx: Timeout,
    },
    /// Bus statistics
    Statistics(BusStatistics),
    /// Error counters
    ErrorCounters(ErrorCounters),
    /// Decoded bitrate
    Bitrate(BitrateInfo),
    /// A new error injection unit
    Eei(EeiId),
    /// Error injection unit status
    EeiStatus(EeiStatus),
    /// Device identity
    DeviceInfo(DeviceInfo),
    /// Card time
    Timestamp(Timestamp),
    /// Timestamp frequency in Hz
    Frequency(u64),
}

/// Outcome of a control call
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Numeric status, [`StatusCode::Success`] on success
    pub status: StatusCode,
    /// Returned data
    pub data: Response,
}

impl Reply {
    fn ok(data: Response) -> Self {
        let status = match &data {
            Response::Completed(Completion {
                status: IoStatus::Partial,
                ..
            }) => StatusCode::IoIncomplete,
            _ => StatusCode::Success,
        };
        Self { status, data }
    }

    fn err(e: DriverError) -> Self {
        let data = match e {
            DriverError::TxTimeout { completed } => Response::Count(completed),
            _ => Response::None,
        };
        Self {
            status: e.status(),
            data,
        }
    }

    /// The status as its raw number
    pub fn code(&self) -> u32 {
        self.status.into()
    }
}

fn decode_baud(raw: u32) -> Result<BaudSetting, DriverError> {
    BaudSetting::from_raw(raw).map_err(|_| DriverError::InvalidParameter {
        reason: "invalid baudrate word",
    })
}

/// Session handle table over a [`Registry`]
#[allow(missing_debug_implementations)]
pub struct Driver {
    registry: Arc<Registry>,
    handles: Mutex<RefCell<BTreeMap<u32, Arc<Session>>>>,
    next_handle: AtomicU32,
}

impl Driver {
    /// Create the call surface for the cards of `registry`
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            handles: Mutex::new(RefCell::new(BTreeMap::new())),
            next_handle: AtomicU32::new(1),
        }
    }

    /// The card registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The session behind a handle
    pub fn session(&self, handle: u32) -> Result<Arc<Session>, DriverError> {
        critical_section::with(|cs| self.handles.borrow_ref(cs).get(&handle).cloned())
            .ok_or(DriverError::InvalidHandle)
    }

    /// Perform a control call on `handle`
    ///
    /// The handle is ignored by [`Request::CreateSession`].
    pub async fn ioctl(&self, handle: u32, request: Request<'_>) -> Reply {
        let cmd = request.cmd();
        match self.dispatch(handle, request).await {
            Ok(data) => Reply::ok(data),
            Err(e) => {
                debug!("ioctl {:?} on handle {} failed: {:?}", cmd, handle, e);
                Reply::err(e)
            }
        }
    }

    /// Perform a control call given by its raw command number
    ///
    /// Fails with [`StatusCode::NotImplemented`] when `cmd` is unknown or does not match the
    /// request.
    pub async fn ioctl_raw(&self, handle: u32, cmd: u32, request: Request<'_>) -> Reply {
        match IoctlCmd::try_from(cmd) {
            Ok(cmd) if cmd == request.cmd() => self.ioctl(handle, request).await,
            _ => Reply::err(DriverError::NotImplemented),
        }
    }

    async fn dispatch(&self, handle: u32, request: Request<'_>) -> Result<Response, DriverError> {
        match request {
            Request::CreateSession { net, params } => {
                let session = self.registry.open(net, params)?;
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                critical_section::with(|cs| {
                    self.handles
                        .borrow_ref_mut(cs)
                        .insert(handle, Arc::new(session))
                });
                Ok(Response::Handle(handle))
            }
            Request::DestroySession => {
                let session =
                    critical_section::with(|cs| self.handles.borrow_ref_mut(cs).remove(&handle))
                        .ok_or(DriverError::InvalidHandle)?;
                session.close().await;
                Ok(Response::None)
            }
            request => self.session_call(handle, request).await,
        }
    }

    async fn session_call(
        &self,
        handle: u32,
        request: Request<'_>,
    ) -> Result<Response, DriverError> {
        let session = self.session(handle)?;
        let node = session.node().clone();
        node.check_fault()?;
        let eei = || {
            if node.features().contains(FeatureFlags::ERROR_INJECTION) {
                Ok(node.eei())
            } else {
                Err(DriverError::NotSupported)
            }
        };
        // Units belong to the node they were created on
        let unit = |id: EeiId| -> Result<_, DriverError> {
            let pool = eei()?;
            if pool.node_of(id)? == node.index() {
                Ok(pool)
            } else {
                Err(DriverError::InvalidHandle)
            }
        };
        let (rx_timeout, tx_timeout) = session.timeouts();
        use Request::*;
        let data = match request {
            CreateSession { .. } | DestroySession => {
                return Err(DriverError::InvalidParameter {
                    reason: "not a session call",
                })
            }
            SetBaud(raw) => {
                node.set_baud(decode_baud(raw)?)?;
                Response::None
            }
            GetBaud => Response::Baud(node.get_baud().to_raw()),
            SetBaudX { nominal, data } => {
                node.set_baud_x(decode_baud(nominal)?, decode_baud(data)?)?;
                Response::None
            }
            SetRxTimeout(t) => {
                session.set_rx_timeout(t);
                Response::None
            }
            SetTxTimeout(t) => {
                session.set_tx_timeout(t);
                Response::None
            }
            GetTimeouts => Response::Timeouts {
                rx: rx_timeout,
                tx: tx_timeout,
            },
            Send(msgs) => Response::Count(session.send(msgs)?),
            SendT(msgs) => Response::Count(session.send_t(msgs)?),
            Take(buf) => Response::Count(session.take(buf)?),
            TakeT(buf) => Response::Count(session.take_t(buf)?),
            Read(buf) => Response::Completed(session.read(buf, rx_timeout).await?),
            ReadT(buf) => Response::Completed(session.read_t(buf, rx_timeout).await?),
            Write(msgs) => Response::Completed(session.write(msgs, tx_timeout).await?),
            WriteT(msgs) => Response::Completed(session.write_t(msgs, tx_timeout).await?),
            AbortRx => {
                session.abort_rx();
                Response::None
            }
            AbortTx => {
                session.abort_tx();
                Response::None
            }
            SetFilter {
                cmd,
                classes,
                target,
            } => {
                node.set_filter(cmd, classes, target)?;
                Response::None
            }
            SetAcceptance { code, mask } => {
                node.set_std_acceptance(code, mask)?;
                Response::None
            }
            IdAdd(id) => {
                session.id_add(id)?;
                Response::None
            }
            IdDelete(id) => {
                session.id_delete(id)?;
                Response::None
            }
            IdRegionAdd { first, count } => {
                session.id_region_add(first, count)?;
                Response::None
            }
            IdRegionDelete { first, count } => {
                session.id_region_delete(first, count)?;
                Response::None
            }
            Set20bFilter { code, mask } => {
                session.set_20b_filter(code, mask);
                Response::None
            }
            GetBusStatistic => Response::Statistics(node.bus_statistics()),
            ResetBusStatistic => {
                node.reset_bus_statistics();
                Response::None
            }
            GetErrorCounters => Response::ErrorCounters(node.error_counters()),
            GetBitrate => Response::Bitrate(node.bitrate()?),
            EeiCreate => Response::Eei(eei()?.create(node.index())?),
            EeiDestroy(id) => {
                unit(id)?.destroy(id)?;
                Response::None
            }
            EeiConfigure(id, config) => {
                unit(id)?.configure(id, config)?;
                Response::None
            }
            EeiStart(id) => {
                unit(id)?.start(id)?;
                Response::None
            }
            EeiStop(id) => {
                unit(id)?.stop(id)?;
                Response::None
            }
            EeiStatus(id) => Response::EeiStatus(unit(id)?.status(id)?),
            EeiTriggerNow(id) => {
                unit(id)?.trigger_now(id)?;
                Response::None
            }
            GetDeviceInfo => {
                let (card, index) = self.registry.lookup(node.net())?;
                Response::DeviceInfo(card.device_info(index)?)
            }
            GetTimestamp => Response::Timestamp(node.timers().now()),
            GetTimestampFreq => Response::Frequency(node.timers().frequency()),
            TakeObjects(buf) => Response::Count(session.take_objects(buf)?),
            UpdateAnswer(msgs) => {
                session.update_answer(msgs)?;
                Response::None
            }
            Reinit => {
                node.reinit()?;
                Response::None
            }
        };
        Ok(data)
    }
}
