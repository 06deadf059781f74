//! Busmaster event records
//!
//! The hardware writes fixed size 88 byte records into the busmaster FIFO. They are decoded
//! exactly once, when they leave the FIFO, into a [`BusmasterRecord`]. The raw layout is:
//!
//! | offset | size | field                                         |
//! |--------|------|-----------------------------------------------|
//! | 0      | 1    | event type                                    |
//! | 1      | 1    | node index on the card                        |
//! | 2      | 1    | flags                                         |
//! | 3      | 1    | data length code                              |
//! | 4      | 4    | raw identifier                                |
//! | 8      | 8    | timestamp                                     |
//! | 16     | 4    | IRQ sequence number                           |
//! | 20     | 4    | auxiliary word (TX tag, lost count, busload)  |
//! | 24     | 64   | payload                                       |
//!
//! All multi byte fields are little endian.
use bitflags::bitflags;
use esdcan_common::{
    bus_status::BusState,
    constants::{err_flags, len_flags},
    messages::{Direction, FrameMode, MessageError, FD_MAX_LEN},
    CanMessage, Timestamp,
};
use snafu::{ResultExt, Snafu};

/// Size of a raw record
pub const RAW_EVENT_SIZE: usize = 88;

/// Raw event type codes
pub mod kind {
    /// Frame received or transmitted
    pub const RX_TX_DONE: u8 = 1;
    /// Transmission aborted
    pub const TX_ABORT: u8 = 2;
    /// Controller overrun
    pub const OVERRUN: u8 = 3;
    /// Bus error
    pub const BUS_ERROR: u8 = 4;
    /// Controller became error passive
    pub const ERROR_PASSIVE: u8 = 5;
    /// Controller reached the warning limit
    pub const ERROR_WARN: u8 = 6;
    /// Periodic time slice tick
    pub const TIMESLICE: u8 = 7;
    /// Bus statistic snapshot
    pub const STATISTIC: u8 = 8;
    /// Hardware timer expired
    pub const HW_TIMER: u8 = 9;
    /// Device attached or removed
    pub const HOTPLUG: u8 = 10;
}

/// TX abort tag meaning "every pending transmission"
pub const ABORT_ALL: u32 = 0xFFFF_FFFF;

bitflags! {
    /// Flag bits of a frame record
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// The record reports a completed transmission
        const TX = 0x01;
        /// Remote frame
        const RTR = 0x02;
        /// The controller received its own transmission
        const SELF_RX = 0x04;
        /// Delivered through the FIFO path rather than the timestamped path
        const FIFO = 0x08;
        /// CAN-FD frame
        const FD = 0x10;
        /// An overrun happened while this frame was received
        const OVERRUN = 0x20;
        /// FD frame sent without bitrate switch
        const NO_BRS = 0x40;
        /// FD frame sent by an error passive transmitter
        const ESI = 0x80;
    }
}

/// Errors decoding a raw record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The event type byte is not known
    #[snafu(display("Unknown busmaster event type {kind}"))]
    UnknownType {
        /// The type byte
        kind: u8,
    },
    /// The frame fields do not form a valid message
    #[snafu(display("Invalid frame in busmaster event: {source}"))]
    InvalidFrame {
        /// The underlying message error
        source: MessageError,
    },
}

/// A raw busmaster record as written by the hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEvent {
    /// Event type, see [`kind`]
    pub kind: u8,
    /// Node index on the card
    pub net: u8,
    /// Flag bits
    pub flags: u8,
    /// Data length code
    pub len: u8,
    /// Raw identifier word
    pub id: u32,
    /// Event timestamp
    pub timestamp: u64,
    /// IRQ sequence number, filled in when the record is posted
    pub irq_seq: u32,
    /// Auxiliary word
    pub aux: u32,
    /// Payload
    pub data: [u8; FD_MAX_LEN],
}

impl Default for RawEvent {
    fn default() -> Self {
        Self {
            kind: 0,
            net: 0,
            flags: 0,
            len: 0,
            id: 0,
            timestamp: 0,
            irq_seq: 0,
            aux: 0,
            data: [0; FD_MAX_LEN],
        }
    }
}

impl RawEvent {
    /// Serialize into the wire layout
    pub fn to_bytes(&self) -> [u8; RAW_EVENT_SIZE] {
        let mut buf = [0u8; RAW_EVENT_SIZE];
        buf[0] = self.kind;
        buf[1] = self.net;
        buf[2] = self.flags;
        buf[3] = self.len;
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.irq_seq.to_le_bytes());
        buf[20..24].copy_from_slice(&self.aux.to_le_bytes());
        buf[24..88].copy_from_slice(&self.data);
        buf
    }

    /// Parse the wire layout
    pub fn from_bytes(buf: &[u8; RAW_EVENT_SIZE]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[8..16]);
        let mut data = [0u8; FD_MAX_LEN];
        data.copy_from_slice(&buf[24..88]);
        Self {
            kind: buf[0],
            net: buf[1],
            flags: buf[2],
            len: buf[3],
            id: u32_at(4),
            timestamp: u64::from_le_bytes(ts),
            irq_seq: u32_at(16),
            aux: u32_at(20),
            data,
        }
    }
}

/// A received or transmitted frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEvent {
    /// The frame, timestamped with the event time
    pub msg: CanMessage,
    /// Record flags
    pub flags: FrameFlags,
    /// Transmit tag; only meaningful for TX and self received frames
    pub tag: u32,
}

impl FrameEvent {
    /// Direction of the frame relative to the host
    pub fn direction(&self) -> Direction {
        if self.flags.contains(FrameFlags::TX) {
            Direction::Tx
        } else {
            Direction::Rx
        }
    }
}

/// Error state report of the controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorReport {
    /// Bus state reported by the controller
    pub state: BusState,
    /// Receive error counter
    pub rec: u8,
    /// Transmit error counter
    pub tec: u8,
    /// Error code capture
    pub ecc: u8,
}

/// A decoded busmaster event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusmasterEvent {
    /// A frame was received, or a transmission completed
    RxTxDone(FrameEvent),
    /// Pending transmissions were aborted; `None` aborts all
    TxAbort {
        /// Tag of the aborted transmission
        tag: Option<u32>,
    },
    /// The controller lost frames
    Overrun {
        /// Direction the loss applies to
        direction: Direction,
        /// Number of frames lost
        lost: u32,
    },
    /// A bus error was detected
    BusError(ErrorReport),
    /// The controller became error passive
    ErrorPassive(ErrorReport),
    /// The controller reached the warning limit
    ErrorWarn(ErrorReport),
    /// Periodic time slice tick
    Timeslice,
    /// Bus statistic snapshot
    Statistic {
        /// Bus load in 1/100 percent
        busload: u32,
    },
    /// A hardware timer expired
    HwTimer {
        /// Hardware timer number
        timer: u32,
    },
    /// The device was attached or removed
    Hotplug {
        /// True on attach
        attached: bool,
    },
}

/// A decoded event with its envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusmasterRecord {
    /// Node index on the card
    pub net: u8,
    /// IRQ sequence number
    pub seq: u32,
    /// Event time
    pub timestamp: Timestamp,
    /// The event
    pub event: BusmasterEvent,
}

fn error_report(raw: &RawEvent) -> ErrorReport {
    ErrorReport {
        rec: raw.data[0],
        tec: raw.data[1],
        ecc: raw.data[2],
        state: BusState::from_status_byte(raw.data[3]),
    }
}

impl BusmasterRecord {
    /// Create a record; the sequence number is assigned when the record is posted
    pub fn new(net: u8, timestamp: Timestamp, event: BusmasterEvent) -> Self {
        Self {
            net,
            seq: 0,
            timestamp,
            event,
        }
    }

    /// Decode a raw record
    pub fn decode(raw: &RawEvent) -> Result<Self, DecodeError> {
        let timestamp = Timestamp(raw.timestamp);
        let event = match raw.kind {
            kind::RX_TX_DONE => {
                let flags = FrameFlags::from_bits_retain(raw.flags);
                let mut len = raw.len & len_flags::DLC_MASK;
                if flags.contains(FrameFlags::FD) {
                    len |= len_flags::FD;
                    if flags.intersects(FrameFlags::NO_BRS | FrameFlags::ESI) {
                        len |= len_flags::NO_BRS;
                    }
                } else if flags.contains(FrameFlags::RTR) {
                    len |= len_flags::RTR;
                }
                let mut msg = CanMessage::from_raw_parts(raw.id, len, &raw.data, FrameMode::Fd)
                    .context(InvalidFrameSnafu)?;
                msg.timestamp = timestamp;
                if flags.contains(FrameFlags::OVERRUN) {
                    msg.err_flags |= err_flags::OVERRUN;
                }
                if flags.contains(FrameFlags::FIFO) {
                    msg.err_flags |= err_flags::FIFO_PATH;
                }
                BusmasterEvent::RxTxDone(FrameEvent {
                    msg,
                    flags,
                    tag: raw.aux,
                })
            }
            kind::TX_ABORT => BusmasterEvent::TxAbort {
                tag: (raw.aux != ABORT_ALL).then_some(raw.aux),
            },
            kind::OVERRUN => BusmasterEvent::Overrun {
                direction: if raw.flags & FrameFlags::TX.bits() != 0 {
                    Direction::Tx
                } else {
                    Direction::Rx
                },
                lost: raw.aux,
            },
            kind::BUS_ERROR => BusmasterEvent::BusError(error_report(raw)),
            kind::ERROR_PASSIVE => BusmasterEvent::ErrorPassive(error_report(raw)),
            kind::ERROR_WARN => BusmasterEvent::ErrorWarn(error_report(raw)),
            kind::TIMESLICE => BusmasterEvent::Timeslice,
            kind::STATISTIC => BusmasterEvent::Statistic { busload: raw.aux },
            kind::HW_TIMER => BusmasterEvent::HwTimer { timer: raw.aux },
            kind::HOTPLUG => BusmasterEvent::Hotplug {
                attached: raw.aux != 0,
            },
            kind => return UnknownTypeSnafu { kind }.fail(),
        };
        Ok(Self {
            net: raw.net,
            seq: raw.irq_seq,
            timestamp,
            event,
        })
    }

    /// Encode into a raw record, as the hardware would write it
    pub fn encode(&self) -> RawEvent {
        let mut raw = RawEvent {
            net: self.net,
            timestamp: self.timestamp.ticks(),
            irq_seq: self.seq,
            ..Default::default()
        };
        let put_report = |raw: &mut RawEvent, kind: u8, r: &ErrorReport| {
            raw.kind = kind;
            raw.data[0] = r.rec;
            raw.data[1] = r.tec;
            raw.data[2] = r.ecc;
            raw.data[3] = r.state.to_status_byte();
        };
        match &self.event {
            BusmasterEvent::RxTxDone(frame) => {
                let msg = &frame.msg;
                let mut flags = frame.flags;
                flags.set(FrameFlags::FD, msg.is_fd());
                flags.set(FrameFlags::RTR, msg.is_rtr());
                if msg.is_fd() && msg.has_len_flag(len_flags::NO_BRS) {
                    // The same length bit is NO_BRS on transmit and ESI on receive
                    if flags.contains(FrameFlags::TX) {
                        flags |= FrameFlags::NO_BRS;
                    } else {
                        flags |= FrameFlags::ESI;
                    }
                }
                raw.kind = kind::RX_TX_DONE;
                raw.flags = flags.bits();
                raw.len = msg.dlc();
                raw.id = msg.id.raw();
                raw.aux = frame.tag;
                raw.data[..msg.data_len()].copy_from_slice(msg.data());
            }
            BusmasterEvent::TxAbort { tag } => {
                raw.kind = kind::TX_ABORT;
                raw.aux = tag.unwrap_or(ABORT_ALL);
            }
            BusmasterEvent::Overrun { direction, lost } => {
                raw.kind = kind::OVERRUN;
                if *direction == Direction::Tx {
                    raw.flags = FrameFlags::TX.bits();
                }
                raw.aux = *lost;
            }
            BusmasterEvent::BusError(r) => put_report(&mut raw, kind::BUS_ERROR, r),
            BusmasterEvent::ErrorPassive(r) => put_report(&mut raw, kind::ERROR_PASSIVE, r),
            BusmasterEvent::ErrorWarn(r) => put_report(&mut raw, kind::ERROR_WARN, r),
            BusmasterEvent::Timeslice => raw.kind = kind::TIMESLICE,
            BusmasterEvent::Statistic { busload } => {
                raw.kind = kind::STATISTIC;
                raw.aux = *busload;
            }
            BusmasterEvent::HwTimer { timer } => {
                raw.kind = kind::HW_TIMER;
                raw.aux = *timer;
            }
            BusmasterEvent::Hotplug { attached } => {
                raw.kind = kind::HOTPLUG;
                raw.aux = *attached as u32;
            }
        }
        raw
    }
}
