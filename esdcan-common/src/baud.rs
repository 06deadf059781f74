//! Baudrate encodings and bit timing calculation
//!
//! A baudrate is configured with a single 32-bit word which selects one of three encodings:
//!
//! - A table index (`0..=14`) into [`BAUD_TABLE`]
//! - Bit timing register fields, flagged with [`BAUD_USER_BTR`]
//! - A numeric rate in bits/s, flagged with [`BAUD_USER_NUM`]
//!
//! [`BAUD_LISTEN_ONLY`] may be OR'd into any of them. CAN-FD channels configure the data phase
//! with a second word using the same encoding.

use snafu::Snafu;

/// No baudrate configured
pub const NO_BAUDRATE: u32 = 0x7FFF_FFFF;
/// Flag: the word carries bit timing register fields
pub const BAUD_USER_BTR: u32 = 0x8000_0000;
/// Flag: the controller should only listen
pub const BAUD_LISTEN_ONLY: u32 = 0x4000_0000;
/// Flag: the word carries a numeric rate in bits/s
pub const BAUD_USER_NUM: u32 = 0x2000_0000;

const NUM_RATE_MASK: u32 = 0x1FFF_FFFF;

/// Bitrates of the table indices, in bits/s
pub const BAUD_TABLE: [u32; 15] = [
    1_000_000, 666_666, 500_000, 333_333, 250_000, 166_666, 125_000, 100_000, 66_666, 50_000,
    33_333, 20_000, 12_500, 10_000, 800_000,
];

/// Errors decoding or applying a baudrate word
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BaudError {
    /// Table index out of range
    #[snafu(display("Baudrate index {index} out of range"))]
    InvalidIndex {
        /// The index
        index: u32,
    },
    /// A bit timing field is zero or out of range
    InvalidTiming,
    /// No exact bit timing exists for this rate at the controller clock
    #[snafu(display("Cannot reach {rate} bit/s from a {clock} Hz clock"))]
    Unreachable {
        /// Requested rate
        rate: u32,
        /// Controller clock
        clock: u32,
    },
}

/// Bit timing register fields, all in time quanta and one based
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitTiming {
    /// Bitrate prescaler, 1..=1024
    pub brp: u16,
    /// Time segment 1 including propagation segment, 1..=256
    pub tseg1: u16,
    /// Time segment 2, 1..=128
    pub tseg2: u8,
    /// Synchronisation jump width, 1..=16
    pub sjw: u8,
}

impl BitTiming {
    fn is_valid(&self) -> bool {
        (1..=1024).contains(&self.brp)
            && (1..=256).contains(&self.tseg1)
            && (1..=128).contains(&self.tseg2)
            && (1..=16).contains(&self.sjw)
            && self.sjw <= self.tseg2
    }

    fn to_raw(self) -> u32 {
        (self.brp as u32 - 1)
            | ((self.tseg1 as u32 - 1) << 10)
            | ((self.tseg2 as u32 - 1) << 18)
            | ((self.sjw as u32 - 1) << 25)
    }

    fn from_raw(raw: u32) -> Self {
        Self {
            brp: (raw & 0x3FF) as u16 + 1,
            tseg1: ((raw >> 10) & 0xFF) as u16 + 1,
            tseg2: ((raw >> 18) & 0x7F) as u8 + 1,
            sjw: ((raw >> 25) & 0xF) as u8 + 1,
        }
    }

    /// Time quanta per bit
    pub fn quanta_per_bit(&self) -> u32 {
        1 + self.tseg1 as u32 + self.tseg2 as u32
    }

    /// Resulting bitrate for a controller clock
    pub fn bitrate(&self, clock: u32) -> u32 {
        clock / (self.brp as u32 * self.quanta_per_bit())
    }

    /// Sample point in 1/1000 of the bit time
    pub fn sample_point(&self) -> u16 {
        ((1 + self.tseg1 as u32) * 1000 / self.quanta_per_bit()) as u16
    }

    /// Find a timing which hits `rate` exactly, preferring many quanta per bit and a sample point
    /// near 80%
    pub fn solve(clock: u32, rate: u32) -> Result<Self, BaudError> {
        if rate == 0 {
            return UnreachableSnafu { rate, clock }.fail();
        }
        for tq in (8..=25u32).rev() {
            let div = rate as u64 * tq as u64;
            if clock as u64 % div != 0 {
                continue;
            }
            let brp = clock as u64 / div;
            if !(1..=1024).contains(&brp) {
                continue;
            }
            let tseg1 = (tq * 8 + 5) / 10 - 1;
            let tseg2 = tq - 1 - tseg1;
            let timing = Self {
                brp: brp as u16,
                tseg1: tseg1 as u16,
                tseg2: tseg2 as u8,
                sjw: tseg2.min(4) as u8,
            };
            if timing.is_valid() {
                return Ok(timing);
            }
        }
        UnreachableSnafu { rate, clock }.fail()
    }
}

/// A decoded baudrate selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Baud {
    /// Not configured
    NotSet,
    /// Index into [`BAUD_TABLE`]
    Index(u8),
    /// Explicit bit timing
    Btr(BitTiming),
    /// Numeric rate in bits/s
    Numeric(u32),
}

/// A baudrate selection together with the listen-only flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BaudSetting {
    /// The selected rate
    pub baud: Baud,
    /// Controller only listens
    pub listen_only: bool,
}

impl Default for BaudSetting {
    fn default() -> Self {
        Self {
            baud: Baud::NotSet,
            listen_only: false,
        }
    }
}

impl BaudSetting {
    /// Create a setting from a table index
    pub const fn index(index: u8) -> Self {
        Self {
            baud: Baud::Index(index),
            listen_only: false,
        }
    }

    /// Create a setting from a numeric rate
    pub const fn numeric(rate: u32) -> Self {
        Self {
            baud: Baud::Numeric(rate),
            listen_only: false,
        }
    }

    /// Encode into the raw baudrate word
    pub fn to_raw(&self) -> u32 {
        let lom = if self.listen_only { BAUD_LISTEN_ONLY } else { 0 };
        match self.baud {
            Baud::NotSet => NO_BAUDRATE,
            Baud::Index(i) => i as u32 | lom,
            Baud::Btr(t) => BAUD_USER_BTR | t.to_raw() | lom,
            Baud::Numeric(rate) => BAUD_USER_NUM | (rate & NUM_RATE_MASK) | lom,
        }
    }

    /// Decode a raw baudrate word
    pub fn from_raw(raw: u32) -> Result<Self, BaudError> {
        if raw == NO_BAUDRATE {
            return Ok(Self::default());
        }
        let listen_only = raw & BAUD_LISTEN_ONLY != 0;
        let raw = raw & !BAUD_LISTEN_ONLY;
        let baud = if raw & BAUD_USER_BTR != 0 {
            let timing = BitTiming::from_raw(raw & !BAUD_USER_BTR);
            if !timing.is_valid() {
                return InvalidTimingSnafu.fail();
            }
            Baud::Btr(timing)
        } else if raw & BAUD_USER_NUM != 0 {
            Baud::Numeric(raw & NUM_RATE_MASK)
        } else if (raw as usize) < BAUD_TABLE.len() {
            Baud::Index(raw as u8)
        } else {
            return InvalidIndexSnafu { index: raw }.fail();
        };
        Ok(Self { baud, listen_only })
    }

    /// Resolve the bit timing used on a controller with the given clock
    ///
    /// Returns `Ok(None)` when no baudrate is set.
    pub fn timing(&self, clock: u32) -> Result<Option<BitTiming>, BaudError> {
        match self.baud {
            Baud::NotSet => Ok(None),
            Baud::Btr(t) => Ok(Some(t)),
            Baud::Numeric(rate) => BitTiming::solve(clock, rate).map(Some),
            Baud::Index(i) => {
                let rate = *BAUD_TABLE
                    .get(i as usize)
                    .ok_or(InvalidIndexSnafu { index: i as u32 }.build())?;
                BitTiming::solve(clock, rate).map(Some)
            }
        }
    }
}

/// Decoded bit timing details of one bus phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseInfo {
    /// Effective bitrate in bits/s
    pub rate: u32,
    /// Time quantum in nanoseconds
    pub tq_ns: u32,
    /// Bitrate prescaler
    pub brp: u16,
    /// Time segment 1
    pub tseg1: u16,
    /// Time segment 2
    pub tseg2: u8,
    /// Synchronisation jump width
    pub sjw: u8,
    /// Sample point in 1/1000 of the bit time
    pub sample_point: u16,
}

impl PhaseInfo {
    /// Compute the details for a timing at a controller clock
    pub fn new(timing: BitTiming, clock: u32) -> Self {
        let tq_ns = (timing.brp as u64 * 1_000_000_000 / clock.max(1) as u64) as u32;
        Self {
            rate: timing.bitrate(clock),
            tq_ns,
            brp: timing.brp,
            tseg1: timing.tseg1,
            tseg2: timing.tseg2,
            sjw: timing.sjw,
            sample_point: timing.sample_point(),
        }
    }
}

/// The effective bitrate configuration of a node, as reported by `get_bitrate`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitrateInfo {
    /// The configured raw baudrate word
    pub baud: u32,
    /// True when a baudrate is configured
    pub valid: bool,
    /// Controller clock in Hz
    pub clock: u32,
    /// Listen-only mode active
    pub listen_only: bool,
    /// Arbitration (nominal) phase
    pub nominal: PhaseInfo,
    /// Data phase, CAN-FD only
    pub data: Option<PhaseInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_encodings() {
        let s = BaudSetting::index(2);
        assert_eq!(2, s.to_raw());
        assert_eq!(s, BaudSetting::from_raw(2).unwrap());

        let s = BaudSetting {
            baud: Baud::Numeric(500_000),
            listen_only: true,
        };
        assert_eq!(BAUD_USER_NUM | BAUD_LISTEN_ONLY | 500_000, s.to_raw());
        assert_eq!(s, BaudSetting::from_raw(s.to_raw()).unwrap());

        let t = BitTiming {
            brp: 10,
            tseg1: 12,
            tseg2: 3,
            sjw: 1,
        };
        let s = BaudSetting {
            baud: Baud::Btr(t),
            listen_only: false,
        };
        assert_eq!(s, BaudSetting::from_raw(s.to_raw()).unwrap());

        assert_eq!(Baud::NotSet, BaudSetting::from_raw(NO_BAUDRATE).unwrap().baud);
        assert!(BaudSetting::from_raw(15).is_err());
    }

    #[test]
    fn test_solve_timing() {
        let t = BitTiming::solve(80_000_000, 500_000).unwrap();
        assert_eq!(500_000, t.bitrate(80_000_000));
        let sp = t.sample_point();
        assert!((750..=850).contains(&sp), "sample point {sp}");
        assert!(BitTiming::solve(80_000_000, 333_333).is_err());
    }

    #[test]
    fn test_index_timing() {
        let s = BaudSetting::index(0);
        let t = s.timing(80_000_000).unwrap().unwrap();
        assert_eq!(1_000_000, t.bitrate(80_000_000));
        assert_eq!(None, BaudSetting::default().timing(80_000_000).unwrap());
    }
}
