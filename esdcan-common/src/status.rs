//! Status codes returned by control calls, and the driver error type
//!
//! Driver specific codes live in the `0xE000_00xx` range. Generic conditions reuse the host OS
//! errno values verbatim.

use int_enum::IntEnum;
use snafu::Snafu;

use crate::messages::MessageError;

/// Numeric result of a control call
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum StatusCode {
    /// The call succeeded
    Success = 0,
    /// Operation interrupted by a signal (EINTR)
    Interrupted = 4,
    /// Invalid handle (EBADF)
    InvalidHandle = 9,
    /// Out of memory or resource pool exhausted (ENOMEM)
    InsufficientResources = 12,
    /// No such device or net (ENODEV)
    NetNotFound = 19,
    /// Invalid parameter (EINVAL)
    InvalidParameter = 22,
    /// Operation aborted (ECANCELED)
    OperationAborted = 125,
    /// Receive timeout
    RxTimeout = 0xE000_0001,
    /// Transmit timeout
    TxTimeout = 0xE000_0002,
    /// Transmit error
    TxError = 0xE000_0004,
    /// Controller is bus-off
    ContrOffBus = 0xE000_0005,
    /// Controller busy, no free transmit slot
    ContrBusy = 0xE000_0006,
    /// Controller is in the warning state
    ContrWarn = 0xE000_0007,
    /// No identifier enabled on this handle
    NoIdEnabled = 0xE000_0009,
    /// Identifier is already enabled
    IdAlreadyEnabled = 0xE000_000A,
    /// Identifier is not enabled
    IdNotEnabled = 0xE000_000B,
    /// Firmware version is not supported
    InvalidFirmware = 0xE000_000D,
    /// Messages were lost
    MessageLost = 0xE000_000E,
    /// Hardware revision is not supported
    InvalidHardware = 0xE000_000F,
    /// A write is already pending on this handle
    PendingWrite = 0xE000_0010,
    /// A read is already pending on this handle
    PendingRead = 0xE000_0011,
    /// The handle was closed
    InvalidDriver = 0xE000_0012,
    /// Operation not allowed in the current device state
    WrongDeviceState = 0xE000_0013,
    /// The handle was forcibly closed (device detached)
    HandleForcedClose = 0xE000_0014,
    /// Command is not implemented
    NotImplemented = 0xE000_0015,
    /// Command is not supported by this hardware
    NotSupported = 0xE000_0016,
    /// Controller is error passive
    ContrErrPassive = 0xE000_0017,
    /// No baudrate has been configured
    NoBaudrate = 0xE000_0018,
    /// Transmission attempted in listen-only mode
    ListenOnly = 0xE000_0019,
    /// Object mode data has not been updated since the last read
    StaleData = 0xE000_001A,
    /// Fewer messages than requested were transferred
    IoIncomplete = 0xE000_001B,
}

impl StatusCode {
    /// True for [`StatusCode::Success`]
    pub fn is_success(&self) -> bool {
        *self == StatusCode::Success
    }
}

/// Errors returned by driver operations
///
/// Every variant maps onto exactly one [`StatusCode`] via [`DriverError::status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[snafu(visibility(pub))]
pub enum DriverError {
    /// No message arrived before the timeout expired
    RxTimeout,
    /// Transmission did not complete before the timeout expired
    #[snafu(display("Transmit timeout after {completed} frames"))]
    TxTimeout {
        /// Number of frames which did complete
        completed: usize,
    },
    /// The blocked call was aborted
    Aborted,
    /// The blocked call was interrupted
    Interrupted,
    /// The handle is being closed
    Closed,
    /// The handle was forcibly closed because the device went away
    ForcedClose,
    /// A read is already pending in this direction
    PendingRead,
    /// A write is already pending in this direction
    PendingWrite,
    /// The controller is bus-off
    BusOff,
    /// No transmit slot available
    ControllerBusy,
    /// The controller is in the warning state
    ControllerWarn,
    /// The controller is error passive
    ControllerErrorPassive,
    /// Identifier already enabled on this handle or filter
    IdAlreadyEnabled,
    /// Identifier not enabled on this handle or filter
    IdNotEnabled,
    /// The card runs an unsupported firmware version
    InvalidFirmware,
    /// The card is an unsupported hardware revision
    InvalidHardware,
    /// Not implemented
    NotImplemented,
    /// Not supported by this hardware or mode
    NotSupported,
    /// No baudrate configured
    NoBaudrate,
    /// Transmission is not allowed in listen-only mode
    ListenOnly,
    /// Object data not updated since the last read
    StaleData,
    /// A parameter was out of range
    #[snafu(display("Invalid parameter: {reason}"))]
    InvalidParameter {
        /// What was wrong
        reason: &'static str,
    },
    /// The handle does not exist
    InvalidHandle,
    /// The requested net does not exist
    #[snafu(display("Net {net} not found"))]
    NetNotFound {
        /// The requested net number
        net: u8,
    },
    /// A resource pool was exhausted
    InsufficientResources,
    /// A message did not fit the channel
    #[snafu(display("Invalid message: {source}"))]
    InvalidMessage {
        /// The underlying message error
        source: MessageError,
    },
}

impl DriverError {
    /// Get the numeric status code for this error
    pub fn status(&self) -> StatusCode {
        use DriverError::*;
        match self {
            RxTimeout => StatusCode::RxTimeout,
            TxTimeout { .. } => StatusCode::TxTimeout,
            Aborted => StatusCode::OperationAborted,
            Interrupted => StatusCode::Interrupted,
            Closed => StatusCode::InvalidDriver,
            ForcedClose => StatusCode::HandleForcedClose,
            PendingRead => StatusCode::PendingRead,
            PendingWrite => StatusCode::PendingWrite,
            BusOff => StatusCode::ContrOffBus,
            ControllerBusy => StatusCode::ContrBusy,
            ControllerWarn => StatusCode::ContrWarn,
            ControllerErrorPassive => StatusCode::ContrErrPassive,
            IdAlreadyEnabled => StatusCode::IdAlreadyEnabled,
            IdNotEnabled => StatusCode::IdNotEnabled,
            InvalidFirmware => StatusCode::InvalidFirmware,
            InvalidHardware => StatusCode::InvalidHardware,
            NotImplemented => StatusCode::NotImplemented,
            NotSupported => StatusCode::NotSupported,
            NoBaudrate => StatusCode::NoBaudrate,
            ListenOnly => StatusCode::ListenOnly,
            StaleData => StatusCode::StaleData,
            InvalidParameter { .. } => StatusCode::InvalidParameter,
            InvalidHandle => StatusCode::InvalidHandle,
            NetNotFound { .. } => StatusCode::NetNotFound,
            InsufficientResources => StatusCode::InsufficientResources,
            InvalidMessage { .. } => StatusCode::InvalidParameter,
        }
    }
}

impl From<MessageError> for DriverError {
    fn from(source: MessageError) -> Self {
        DriverError::InvalidMessage { source }
    }
}

impl From<DriverError> for StatusCode {
    fn from(value: DriverError) -> Self {
        value.status()
    }
}
