//! CAN identifiers, messages and their fixed wire layouts
//!
//! A [`CanMessage`] stores the raw length byte exactly as it appears on the wire: the data length
//! code in the low nibble, and direction dependent flags in the upper bits (see
//! [`len_flags`](crate::constants::len_flags)). This bit reuse is part of the compatibility
//! encoding and is reproduced as-is.

use snafu::Snafu;

use crate::constants::{ids, len_flags};
use crate::time_types::Timestamp;

/// Payload capacity of classic CAN frames
pub const CLASSIC_MAX_LEN: usize = 8;
/// Payload capacity of CAN-FD frames
pub const FD_MAX_LEN: usize = 64;

/// Data length for each data length code, classic CAN
pub const CLASSIC_DLC_TABLE: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 8, 8, 8, 8, 8, 8, 8];
/// Data length for each data length code, CAN-FD
pub const FD_DLC_TABLE: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Size of the `CMSG` wire layout
pub const CMSG_SIZE: usize = 16;
/// Size of the `CMSG_T` wire layout
pub const CMSG_T_SIZE: usize = 24;
/// Size of the `CMSG_X` wire layout
pub const CMSG_X_SIZE: usize = 80;

/// Convert a data length code to a length in bytes
pub fn dlc_to_len(dlc: u8, fd: bool) -> usize {
    let table = if fd { &FD_DLC_TABLE } else { &CLASSIC_DLC_TABLE };
    table[(dlc & len_flags::DLC_MASK) as usize] as usize
}

/// Find the smallest data length code which holds at least `len` bytes
pub fn len_to_dlc(len: usize, fd: bool) -> Option<u8> {
    let table = if fd { &FD_DLC_TABLE } else { &CLASSIC_DLC_TABLE };
    table
        .iter()
        .position(|&l| l as usize >= len)
        .map(|dlc| dlc as u8)
}

/// Errors creating or decoding messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageError {
    /// The raw identifier word does not describe a valid identifier
    #[snafu(display("Invalid CAN identifier 0x{raw:08X}"))]
    InvalidId {
        /// The offending raw identifier
        raw: u32,
    },
    /// More data than the frame mode allows
    #[snafu(display("{len} bytes exceeds the frame capacity of {capacity}"))]
    TooMuchData {
        /// Requested payload length
        len: usize,
        /// Capacity of the frame mode
        capacity: usize,
    },
    /// An FD frame was used on a classic channel or layout
    FdNotAllowed,
    /// Remote frames are not allowed in CAN-FD
    FdRemoteFrame,
}

/// Frame mode negotiated for a channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(serde::Deserialize), serde(rename_all = "snake_case"))]
pub enum FrameMode {
    /// Classic CAN, up to 8 data bytes
    #[default]
    Classic,
    /// CAN-FD, up to 64 data bytes
    Fd,
}

impl FrameMode {
    /// Maximum payload size in this mode
    pub const fn payload_capacity(&self) -> usize {
        match self {
            FrameMode::Classic => CLASSIC_MAX_LEN,
            FrameMode::Fd => FD_MAX_LEN,
        }
    }
}

/// Direction of a message relative to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Received from the bus
    Rx,
    /// Transmitted to the bus
    Tx,
}

/// A CAN identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    /// An 11-bit identifier
    Std(u16),
    /// A 29-bit identifier
    Extended(u32),
    /// A driver generated event
    Event(u16),
}

impl CanId {
    /// Create a standard ID, masking off bits above bit 10
    pub const fn std(id: u16) -> Self {
        Self::Std(id & ids::STD_ID_MAX)
    }

    /// Create an extended ID, masking off bits above bit 28
    pub const fn extended(id: u32) -> Self {
        Self::Extended(id & ids::EXT_ID_MAX)
    }

    /// Create an event ID
    pub const fn event(ev: u16) -> Self {
        Self::Event(ev)
    }

    /// Get the identifier value without any range marker bits
    pub const fn value(&self) -> u32 {
        match self {
            CanId::Std(id) => *id as u32,
            CanId::Extended(id) => *id,
            CanId::Event(ev) => *ev as u32,
        }
    }

    /// Get the raw identifier word as used on the wire
    pub const fn raw(&self) -> u32 {
        match self {
            CanId::Std(id) => *id as u32,
            CanId::Extended(id) => *id | ids::ID_20B_BASE,
            CanId::Event(ev) => ids::EV_BASE + *ev as u32,
        }
    }

    /// Decode a raw identifier word
    pub fn from_raw(raw: u32) -> Result<Self, MessageError> {
        if raw & ids::EV_BASE != 0 {
            let ev = raw - ids::EV_BASE;
            if ev < ids::EV_COUNT as u32 {
                return Ok(CanId::Event(ev as u16));
            }
            return InvalidIdSnafu { raw }.fail();
        }
        if raw & ids::ID_20B_BASE != 0 {
            return Ok(CanId::Extended(raw & ids::EXT_ID_MAX));
        }
        if raw <= ids::STD_ID_MAX as u32 {
            Ok(CanId::Std(raw as u16))
        } else {
            InvalidIdSnafu { raw }.fail()
        }
    }

    /// True for 29-bit identifiers
    pub const fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }

    /// True for event identifiers
    pub const fn is_event(&self) -> bool {
        matches!(self, CanId::Event(_))
    }
}

/// A CAN message as exchanged between the driver and its callers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The message identifier
    pub id: CanId,
    len: u8,
    data: [u8; FD_MAX_LEN],
    /// Number of messages lost before this one, saturating at 255
    pub msg_lost: u8,
    /// Error flag byte, see [`err_flags`](crate::constants::err_flags)
    pub err_flags: u8,
    /// Reception or transmission timestamp
    pub timestamp: Timestamp,
    /// Opaque value owned by the caller, carried through unchanged
    pub host_handle: u64,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            id: CanId::Std(0),
            len: 0,
            data: [0; FD_MAX_LEN],
            msg_lost: 0,
            err_flags: 0,
            timestamp: Timestamp::ZERO,
            host_handle: 0,
        }
    }
}

impl CanMessage {
    /// Create a classic data frame
    pub fn new(id: CanId, data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > CLASSIC_MAX_LEN {
            return TooMuchDataSnafu {
                len: data.len(),
                capacity: CLASSIC_MAX_LEN,
            }
            .fail();
        }
        let mut msg = Self {
            id,
            len: data.len() as u8,
            ..Default::default()
        };
        msg.data[..data.len()].copy_from_slice(data);
        Ok(msg)
    }

    /// Create a classic remote frame requesting `dlc` bytes
    pub fn new_rtr(id: CanId, dlc: u8) -> Self {
        Self {
            id,
            len: (dlc & len_flags::DLC_MASK) | len_flags::RTR,
            ..Default::default()
        }
    }

    /// Create a CAN-FD data frame
    ///
    /// Payloads whose length is not directly representable are zero padded to the next data
    /// length code.
    pub fn new_fd(id: CanId, data: &[u8], bitrate_switch: bool) -> Result<Self, MessageError> {
        let dlc = len_to_dlc(data.len(), true).ok_or(
            TooMuchDataSnafu {
                len: data.len(),
                capacity: FD_MAX_LEN,
            }
            .build(),
        )?;
        let mut len = dlc | len_flags::FD;
        if !bitrate_switch {
            len |= len_flags::NO_BRS;
        }
        let mut msg = Self {
            id,
            len,
            ..Default::default()
        };
        msg.data[..data.len()].copy_from_slice(data);
        Ok(msg)
    }

    /// Create a driver event message
    pub fn new_event(ev: u16, data: &[u8]) -> Self {
        let n = data.len().min(CLASSIC_MAX_LEN);
        let mut msg = Self {
            id: CanId::Event(ev),
            len: n as u8,
            ..Default::default()
        };
        msg.data[..n].copy_from_slice(&data[..n]);
        msg
    }

    /// Build a message from its raw wire fields, validating against the frame mode
    pub fn from_raw_parts(
        raw_id: u32,
        len: u8,
        data: &[u8],
        mode: FrameMode,
    ) -> Result<Self, MessageError> {
        let id = CanId::from_raw(raw_id)?;
        let fd = len & len_flags::FD != 0;
        if fd && mode != FrameMode::Fd {
            return FdNotAllowedSnafu.fail();
        }
        if fd && len & len_flags::RTR != 0 {
            return FdRemoteFrameSnafu.fail();
        }
        let data_len = if len & len_flags::RTR != 0 {
            0
        } else {
            dlc_to_len(len, fd)
        };
        if data_len > data.len() {
            return TooMuchDataSnafu {
                len: data_len,
                capacity: data.len(),
            }
            .fail();
        }
        let mut msg = Self {
            id,
            len,
            ..Default::default()
        };
        msg.data[..data_len].copy_from_slice(&data[..data_len]);
        Ok(msg)
    }

    /// The raw length byte, including flag bits
    pub const fn len_byte(&self) -> u8 {
        self.len
    }

    /// The data length code
    pub const fn dlc(&self) -> u8 {
        self.len & len_flags::DLC_MASK
    }

    /// True if this is a remote frame
    pub const fn is_rtr(&self) -> bool {
        self.len & len_flags::RTR != 0 && !self.is_fd()
    }

    /// True if this is a CAN-FD frame
    pub const fn is_fd(&self) -> bool {
        self.len & len_flags::FD != 0
    }

    /// The frame mode required to carry this message
    pub const fn frame_mode(&self) -> FrameMode {
        if self.is_fd() {
            FrameMode::Fd
        } else {
            FrameMode::Classic
        }
    }

    /// Number of payload bytes, decoded from the data length code
    pub fn data_len(&self) -> usize {
        if self.is_rtr() {
            0
        } else {
            dlc_to_len(self.len, self.is_fd())
        }
    }

    /// The payload
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_len()]
    }

    /// Test a flag bit of the length byte
    pub const fn has_len_flag(&self, flag: u8) -> bool {
        self.len & flag != 0
    }

    /// Set or clear one of the overloaded flag bits of the length byte
    ///
    /// The DLC and the FD bit are not affected.
    pub fn set_len_flag(&mut self, flag: u8, on: bool) {
        let flag = flag & !(len_flags::DLC_MASK | len_flags::FD);
        if on {
            self.len |= flag;
        } else {
            self.len &= !flag;
        }
    }

    /// Check that this message fits a channel's frame mode
    pub fn check_mode(&self, mode: FrameMode) -> Result<(), MessageError> {
        if self.is_fd() && mode != FrameMode::Fd {
            return FdNotAllowedSnafu.fail();
        }
        Ok(())
    }

    /// Encode into the 16-byte `CMSG` layout
    pub fn to_cmsg_bytes(&self) -> Result<[u8; CMSG_SIZE], MessageError> {
        if self.is_fd() {
            return FdNotAllowedSnafu.fail();
        }
        let mut buf = [0u8; CMSG_SIZE];
        buf[0..4].copy_from_slice(&self.id.raw().to_le_bytes());
        buf[4] = self.len;
        buf[5] = self.msg_lost;
        buf[8..16].copy_from_slice(&self.data[..CLASSIC_MAX_LEN]);
        Ok(buf)
    }

    /// Decode the 16-byte `CMSG` layout
    pub fn from_cmsg_bytes(buf: &[u8; CMSG_SIZE]) -> Result<Self, MessageError> {
        let raw_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut msg = Self::from_raw_parts(raw_id, buf[4], &buf[8..16], FrameMode::Classic)?;
        msg.msg_lost = buf[5];
        Ok(msg)
    }

    /// Encode into the 24-byte `CMSG_T` layout
    pub fn to_cmsg_t_bytes(&self) -> Result<[u8; CMSG_T_SIZE], MessageError> {
        let mut buf = [0u8; CMSG_T_SIZE];
        buf[..CMSG_SIZE].copy_from_slice(&self.to_cmsg_bytes()?);
        buf[16..24].copy_from_slice(&self.timestamp.0.to_le_bytes());
        Ok(buf)
    }

    /// Decode the 24-byte `CMSG_T` layout
    pub fn from_cmsg_t_bytes(buf: &[u8; CMSG_T_SIZE]) -> Result<Self, MessageError> {
        let mut head = [0u8; CMSG_SIZE];
        head.copy_from_slice(&buf[..CMSG_SIZE]);
        let mut msg = Self::from_cmsg_bytes(&head)?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[16..24]);
        msg.timestamp = Timestamp(u64::from_le_bytes(ts));
        Ok(msg)
    }

    /// Encode into the 80-byte `CMSG_X` layout used for CAN-FD capable handles
    pub fn to_cmsg_x_bytes(&self) -> [u8; CMSG_X_SIZE] {
        let mut buf = [0u8; CMSG_X_SIZE];
        buf[0..4].copy_from_slice(&self.id.raw().to_le_bytes());
        buf[4] = self.len;
        buf[5] = self.msg_lost;
        buf[6] = self.err_flags;
        buf[8..16].copy_from_slice(&self.timestamp.0.to_le_bytes());
        buf[16..80].copy_from_slice(&self.data);
        buf
    }

    /// Decode the 80-byte `CMSG_X` layout
    pub fn from_cmsg_x_bytes(buf: &[u8; CMSG_X_SIZE]) -> Result<Self, MessageError> {
        let raw_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut msg = Self::from_raw_parts(raw_id, buf[4], &buf[16..80], FrameMode::Fd)?;
        msg.msg_lost = buf[5];
        msg.err_flags = buf[6];
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[8..16]);
        msg.timestamp = Timestamp(u64::from_le_bytes(ts));
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlc_tables_invert() {
        for dlc in 0..16u8 {
            let len = dlc_to_len(dlc, true);
            assert_eq!(Some(dlc), len_to_dlc(len, true));
        }
        for dlc in 0..=8u8 {
            let len = dlc_to_len(dlc, false);
            assert_eq!(Some(dlc), len_to_dlc(len, false));
        }
        // Classic codes above 8 still mean 8 bytes
        assert_eq!(8, dlc_to_len(15, false));
        assert_eq!(None, len_to_dlc(9, false));
        assert_eq!(Some(9), len_to_dlc(9, true));
        assert_eq!(None, len_to_dlc(65, true));
    }

    #[test]
    fn test_raw_ids() {
        assert_eq!(CanId::Std(0x72), CanId::from_raw(0x72).unwrap());
        assert_eq!(
            CanId::Extended(0x1234_5678),
            CanId::from_raw(0x3234_5678).unwrap()
        );
        assert_eq!(CanId::Event(2), CanId::from_raw(0x4000_0002).unwrap());
        assert!(CanId::from_raw(0x800).is_err());
        assert!(CanId::from_raw(0x4000_0100).is_err());
        assert_eq!(0x2000_0001, CanId::extended(1).raw());
    }

    #[test]
    fn test_classic_capacity_enforced() {
        assert!(CanMessage::new(CanId::std(1), &[0; 8]).is_ok());
        assert_eq!(
            Err(MessageError::TooMuchData {
                len: 9,
                capacity: 8
            }),
            CanMessage::new(CanId::std(1), &[0; 9])
        );
    }

    #[test]
    fn test_fd_padding() {
        let msg = CanMessage::new_fd(CanId::std(5), &[1; 10], true).unwrap();
        assert_eq!(9, msg.dlc());
        assert_eq!(12, msg.data_len());
        assert_eq!(&[1, 1, 0, 0], &msg.data()[8..]);
        assert!(!msg.has_len_flag(len_flags::NO_BRS));
    }

    #[test]
    fn test_len_flag_overload() {
        let mut msg = CanMessage::new(CanId::std(1), &[1, 2]).unwrap();
        msg.set_len_flag(len_flags::INTERACTION, true);
        assert_eq!(0x22, msg.len_byte());
        assert_eq!(2, msg.data_len());
        // DLC and FD bit cannot be touched through set_len_flag
        msg.set_len_flag(0xFF, false);
        assert_eq!(0x02, msg.len_byte());
    }

    #[test]
    fn test_cmsg_layouts() {
        let mut msg = CanMessage::new(CanId::extended(0x1ABCDEF), &[9, 8, 7]).unwrap();
        msg.msg_lost = 3;
        msg.timestamp = Timestamp(0x0102_0304_0506_0708);
        let bytes = msg.to_cmsg_t_bytes().unwrap();
        assert_eq!(&[0xEF, 0xCD, 0xAB, 0x21], &bytes[0..4]);
        assert_eq!(3, bytes[4]);
        assert_eq!(msg, CanMessage::from_cmsg_t_bytes(&bytes).unwrap());

        let fd = CanMessage::new_fd(CanId::std(0x10), &[0x55; 64], false).unwrap();
        assert!(fd.to_cmsg_bytes().is_err());
        assert_eq!(fd, CanMessage::from_cmsg_x_bytes(&fd.to_cmsg_x_bytes()).unwrap());
    }

    #[test]
    fn test_fd_rejected_on_classic_channel() {
        let fd = CanMessage::new_fd(CanId::std(0x10), &[1; 12], true).unwrap();
        assert_eq!(Err(MessageError::FdNotAllowed), fd.check_mode(FrameMode::Classic));
        assert_eq!(
            Err(MessageError::FdNotAllowed),
            CanMessage::from_raw_parts(0x10, fd.len_byte(), fd.data(), FrameMode::Classic)
        );
    }
}
