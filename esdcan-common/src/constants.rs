//! Constants defining identifier ranges, length byte flags and special values
//!
//! These values make up the externally visible wire encoding and must not change.

/// Identifier ranges and special identifiers
pub mod ids {
    /// Largest 11-bit identifier
    pub const STD_ID_MAX: u16 = 0x7FF;
    /// Largest 29-bit identifier
    pub const EXT_ID_MAX: u32 = 0x1FFF_FFFF;
    /// Bit marking a raw identifier as a 29-bit identifier
    pub const ID_20B_BASE: u32 = 0x2000_0000;
    /// Base of the event identifier range
    pub const EV_BASE: u32 = 0x4000_0000;
    /// Number of event identifiers
    pub const EV_COUNT: u16 = 0x100;
    /// Bits reserved for accelerator flags in the raw identifier word
    pub const ACCEL_FLAGS_MASK: u32 = 0xC000_0000;

    /// Event: CAN error state change (bus status, error counters, lost counts)
    pub const EV_CAN_ERROR: u16 = 2;
    /// Event: baudrate changed
    pub const EV_BAUD_CHANGE: u16 = 3;
    /// Event: extended CAN error information (error code capture)
    pub const EV_CAN_ERROR_EXT: u16 = 4;
    /// Event: bus load measurement
    pub const EV_BUSLOAD: u16 = 5;
}

/// Flags overloaded into the upper bits of the length byte
///
/// The low nibble is always the data length code. The meaning of bits 5 and 6 depends on the
/// direction of the message and the frame mode.
pub mod len_flags {
    /// Mask selecting the data length code
    pub const DLC_MASK: u8 = 0x0F;
    /// Remote transmission request (classic frames only)
    pub const RTR: u8 = 0x10;
    /// Transmit / object mode: no data has been received for this object
    pub const NO_DATA: u8 = 0x20;
    /// Receive: frame was transmitted by another handle on the same net
    pub const INTERACTION: u8 = 0x20;
    /// Transmit, FD frames: do not switch to the data phase bitrate
    pub const NO_BRS: u8 = 0x40;
    /// Receive, FD frames: transmitter was error passive
    pub const ESI: u8 = 0x40;
    /// Frame is a CAN-FD frame
    pub const FD: u8 = 0x80;
}

/// Error flag byte values carried in [`CanMessage::err_flags`](crate::CanMessage::err_flags)
pub mod err_flags {
    /// A receive overrun happened while this frame was being received
    pub const OVERRUN: u8 = 0x01;
    /// The frame was delivered through the FIFO path rather than the timestamped path
    pub const FIFO_PATH: u8 = 0x02;
}

/// Special timeout values, in milliseconds
pub mod timeouts {
    /// Return immediately with whatever is available
    pub const IMMEDIATE: u32 = 0;
    /// Block until completion, abort or close
    pub const INFINITE: u32 = 0xFFFF_FFFF;
}

/// Limits on structure sizes
pub mod limits {
    /// Maximum number of nodes (CAN channels) on one card
    pub const MAX_NODES_PER_CARD: usize = 8;
    /// Default busmaster FIFO capacity, in events
    pub const DEFAULT_FIFO_CAPACITY: usize = 256;
    /// Maximum number of node level acceptance filter entries
    pub const MAX_FILTER_ENTRIES: usize = 16;
    /// Maximum number of 29-bit regions one handle may enable
    pub const MAX_ID_REGIONS: usize = 32;
    /// Largest queue size accepted for a handle
    pub const MAX_QUEUE_SIZE: usize = 0x4000;
}
