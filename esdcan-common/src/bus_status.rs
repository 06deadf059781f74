//! Bus state, error counters and traffic statistics of a CAN channel

use crate::messages::CanMessage;
use crate::time_types::Timestamp;

/// Controller bus state, ordered by severity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BusState {
    /// Error active, counters below the warning limit
    #[default]
    Ok = 0,
    /// An error counter reached the warning limit
    Warn = 1,
    /// An error counter exceeded 127
    ErrorPassive = 2,
    /// The transmit error counter exceeded 255
    BusOff = 3,
}

impl BusState {
    /// Encode into the 2-bit status field at bits 7:6 of a status byte
    pub const fn to_status_byte(self) -> u8 {
        (self as u8) << 6
    }

    /// Decode the 2-bit status field at bits 7:6 of a status byte
    pub const fn from_status_byte(byte: u8) -> Self {
        match byte >> 6 {
            0 => BusState::Ok,
            1 => BusState::Warn,
            2 => BusState::ErrorPassive,
            _ => BusState::BusOff,
        }
    }

    /// Derive the bus state from receive and transmit error counters
    pub fn from_counters(rec: u8, tec: u16) -> Self {
        if tec > 255 {
            BusState::BusOff
        } else if rec > 127 || tec > 127 {
            BusState::ErrorPassive
        } else if rec >= 96 || tec >= 96 {
            BusState::Warn
        } else {
            BusState::Ok
        }
    }
}

/// Error counter snapshot of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCounters {
    /// Current bus state
    pub bus_state: BusState,
    /// Receive error counter
    pub rec: u8,
    /// Transmit error counter
    pub tec: u8,
    /// Last captured error code of the controller
    pub ecc: u8,
    /// Number of bus error events seen
    pub bus_errors: u32,
    /// Time of the last state change
    pub timestamp: Timestamp,
}

/// Number of length classes per identifier type: 16 data length codes plus remote frames
pub const LENGTH_CLASSES: usize = 17;
/// Length class index used for remote frames
pub const RTR_LENGTH_CLASS: usize = 16;

/// Decode the length class of a raw length byte
///
/// Data frames are classed by their data length code (0..=15, covering both the classic 0..8
/// byte lengths and the CAN-FD 12/16/20/24/32/48/64 byte lengths). Classic remote frames all share
/// the [`RTR_LENGTH_CLASS`].
pub fn length_class(len_byte: u8) -> usize {
    use crate::constants::len_flags;
    let fd = len_byte & len_flags::FD != 0;
    if !fd && len_byte & len_flags::RTR != 0 {
        RTR_LENGTH_CLASS
    } else {
        (len_byte & len_flags::DLC_MASK) as usize
    }
}

/// Frame counts split by identifier type and frame type
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameCount {
    /// 11-bit data frames
    pub std_data: u32,
    /// 11-bit remote frames
    pub std_rtr: u32,
    /// 29-bit data frames
    pub ext_data: u32,
    /// 29-bit remote frames
    pub ext_rtr: u32,
}

impl FrameCount {
    fn count(&mut self, msg: &CanMessage) {
        let cell = match (msg.id.is_extended(), msg.is_rtr()) {
            (false, false) => &mut self.std_data,
            (false, true) => &mut self.std_rtr,
            (true, false) => &mut self.ext_data,
            (true, true) => &mut self.ext_rtr,
        };
        *cell = cell.saturating_add(1);
    }

    /// Sum over all cells, saturating
    pub fn total(&self) -> u32 {
        self.std_data
            .saturating_add(self.std_rtr)
            .saturating_add(self.ext_data)
            .saturating_add(self.ext_rtr)
    }
}

/// Traffic statistics of a node
///
/// All counters saturate instead of wrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusStatistics {
    /// Time the snapshot was taken
    pub timestamp: Timestamp,
    /// Received frames
    pub rcv_count: FrameCount,
    /// Transmitted frames
    pub xmit_count: FrameCount,
    /// Received payload bytes
    pub rcv_byte_count: u64,
    /// Transmitted payload bytes
    pub xmit_byte_count: u64,
    /// Frames lost because the controller overran
    pub ctrl_ovr: u32,
    /// Events lost because the busmaster FIFO or a handle queue was full
    pub fifo_ovr: u32,
    /// Error frames observed
    pub err_frames: u32,
    /// Transmissions aborted
    pub aborted_frames: u32,
    /// Received frames which matched no handle
    pub unmatched: u32,
    /// Bus load in 1/100 percent, from the last statistic event
    pub busload: u32,
    /// Frame count per length class, index 0 for 11-bit and 1 for 29-bit identifiers
    pub length_classes: [[u32; LENGTH_CLASSES]; 2],
}

impl Default for BusStatistics {
    fn default() -> Self {
        Self {
            timestamp: Timestamp::ZERO,
            rcv_count: FrameCount::default(),
            xmit_count: FrameCount::default(),
            rcv_byte_count: 0,
            xmit_byte_count: 0,
            ctrl_ovr: 0,
            fifo_ovr: 0,
            err_frames: 0,
            aborted_frames: 0,
            unmatched: 0,
            busload: 0,
            length_classes: [[0; LENGTH_CLASSES]; 2],
        }
    }
}

impl BusStatistics {
    fn count_length(&mut self, msg: &CanMessage) {
        let row = if msg.id.is_extended() { 1 } else { 0 };
        let cell = &mut self.length_classes[row][length_class(msg.len_byte())];
        *cell = cell.saturating_add(1);
    }

    /// Account one received frame
    pub fn count_rx(&mut self, msg: &CanMessage) {
        self.rcv_count.count(msg);
        self.rcv_byte_count = self.rcv_byte_count.saturating_add(msg.data_len() as u64);
        self.count_length(msg);
    }

    /// Account one transmitted frame
    pub fn count_tx(&mut self, msg: &CanMessage) {
        self.xmit_count.count(msg);
        self.xmit_byte_count = self.xmit_byte_count.saturating_add(msg.data_len() as u64);
        self.count_length(msg);
    }

    /// Total over the length class table
    pub fn length_class_total(&self) -> u64 {
        self.length_classes
            .iter()
            .flat_map(|row| row.iter())
            .map(|&c| c as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CanId;

    #[test]
    fn test_status_byte_encoding() {
        for state in [
            BusState::Ok,
            BusState::Warn,
            BusState::ErrorPassive,
            BusState::BusOff,
        ] {
            assert_eq!(state, BusState::from_status_byte(state.to_status_byte()));
        }
        assert_eq!(0xC0, BusState::BusOff.to_status_byte());
        assert!(BusState::Warn < BusState::ErrorPassive);
    }

    #[test]
    fn test_state_from_counters() {
        assert_eq!(BusState::Ok, BusState::from_counters(0, 0));
        assert_eq!(BusState::Warn, BusState::from_counters(96, 0));
        assert_eq!(BusState::ErrorPassive, BusState::from_counters(0, 128));
        assert_eq!(BusState::BusOff, BusState::from_counters(0, 256));
    }

    #[test]
    fn test_each_frame_counts_one_length_cell() {
        let mut stats = BusStatistics::default();
        stats.count_rx(&CanMessage::new(CanId::std(1), &[1, 2, 3]).unwrap());
        stats.count_rx(&CanMessage::new_rtr(CanId::extended(1), 4));
        stats.count_tx(&CanMessage::new_fd(CanId::std(1), &[0; 48], true).unwrap());
        assert_eq!(3, stats.length_class_total());
        assert_eq!(1, stats.length_classes[0][3]);
        assert_eq!(1, stats.length_classes[1][RTR_LENGTH_CLASS]);
        assert_eq!(1, stats.length_classes[0][14]);
        assert_eq!(3, stats.rcv_byte_count);
        assert_eq!(48, stats.xmit_byte_count);
    }

    #[test]
    fn test_counters_saturate() {
        let mut stats = BusStatistics::default();
        stats.rcv_count.std_data = u32::MAX;
        stats.count_rx(&CanMessage::new(CanId::std(1), &[]).unwrap());
        assert_eq!(u32::MAX, stats.rcv_count.std_data);
    }
}
