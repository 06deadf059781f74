//! Identity and version information of cards and nodes

use crate::flags::FeatureFlags;

/// A major.minor.revision version triple
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Version {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Revision
    pub revision: u16,
}

impl Version {
    /// Create a new version
    pub const fn new(major: u8, minor: u8, revision: u16) -> Self {
        Self {
            major,
            minor,
            revision,
        }
    }

    /// Pack into the 16-bit `mmmm.nnnn.rrrrrrrr` form used in device info records
    pub const fn packed(&self) -> u16 {
        ((self.major as u16 & 0xF) << 12)
            | ((self.minor as u16 & 0xF) << 8)
            | (self.revision & 0xFF)
    }

    /// Parse "major.minor.revision"
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().trim_start_matches('v').split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let revision = parts.next().map(|r| r.parse()).unwrap_or(Ok(0)).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, revision))
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// CAN controller type of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(serde::Deserialize), serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum ControllerType {
    /// Unknown controller
    #[default]
    Unknown = 0,
    /// NXP SJA1000
    Sja1000 = 1,
    /// Bosch M_CAN
    MCan = 2,
    /// FPGA based CAN core with busmaster DMA
    EsdAcc = 3,
    /// Software loopback controller
    Loopback = 0xFF,
}

/// Transceiver fitted to a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(serde::Deserialize), serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum TransceiverType {
    /// Unknown transceiver
    #[default]
    Unknown = 0,
    /// ISO 11898-2 high speed
    HighSpeed = 1,
    /// ISO 11898-3 low speed / fault tolerant
    LowSpeed = 2,
    /// CAN-FD capable high speed
    HighSpeedFd = 3,
    /// No physical transceiver
    None = 0xFF,
}

/// Serial number maximum length
pub const SERIAL_LEN: usize = 16;

/// Information returned by the `get_device_info` control call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo {
    /// Hardware revision
    pub hardware: Version,
    /// Firmware version
    pub firmware: Version,
    /// Driver version
    pub driver: Version,
    /// Interface library version
    pub library: Version,
    /// Serial number, zero padded ASCII
    pub serial: [u8; SERIAL_LEN],
    /// Card feature mask
    pub features: u32,
    /// Controller type of the queried node
    pub ctrl_type: ControllerType,
    /// Controller clock of the queried node, in Hz
    pub ctrl_clock: u32,
    /// Transceiver of the queried node
    pub transceiver: TransceiverType,
    /// Timestamp clock frequency in Hz
    pub timestamp_freq: u64,
    /// Net number of the queried node
    pub net: u8,
    /// Number of handles open on the queried node
    pub open_handles: u16,
}

impl DeviceInfo {
    /// The feature mask as flags
    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags::from_bits_truncate(self.features)
    }

    /// The serial number as a string
    pub fn serial_str(&self) -> &str {
        let end = self
            .serial
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SERIAL_LEN);
        core::str::from_utf8(&self.serial[..end]).unwrap_or("")
    }
}

/// Encode a serial number string into the fixed-size info field, truncating if needed
pub fn encode_serial(serial: &str) -> [u8; SERIAL_LEN] {
    let mut buf = [0u8; SERIAL_LEN];
    let n = serial.len().min(SERIAL_LEN);
    buf[..n].copy_from_slice(&serial.as_bytes()[..n]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_order() {
        assert_eq!(Some(Version::new(1, 2, 3)), Version::parse("v1.2.3"));
        assert_eq!(Some(Version::new(2, 0, 0)), Version::parse("2.0"));
        assert_eq!(None, Version::parse("1.x.3"));
        assert!(Version::new(1, 10, 0) > Version::new(1, 9, 99));
        assert_eq!(0x1203, Version::new(1, 2, 3).packed());
    }

    #[test]
    fn test_serial_encoding() {
        let info_serial = encode_serial("AA123456");
        assert_eq!(b'A', info_serial[0]);
        assert_eq!(0, info_serial[8]);
    }
}
