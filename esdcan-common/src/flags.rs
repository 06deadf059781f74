//! Bitmask types for handle modes, card features and filter traffic classes

use bitflags::bitflags;

bitflags! {
    /// Mode flags selected when a handle is opened
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ModeFlags: u32 {
        /// Frames are transmitted at the time given by their timestamp
        const SCHEDULED_TX = 0x0000_0040;
        /// Remote frames matching a stored answer object are answered automatically
        const AUTO_ANSWER = 0x0000_0200;
        /// Handle exchanges CAN-FD frames
        const FD = 0x0001_0000;
        /// Handle only listens, transmission is rejected
        const LISTEN_ONLY = 0x0008_0000;
        /// Frames from other handles on the same net are marked with the interaction bit
        const MARK_INTERACTION = 0x0100_0000;
        /// Frames transmitted by this handle are also received by it
        const LOCAL_ECHO = 0x0200_0000;
        /// Received frames are stored per identifier instead of queued
        const OBJECT = 0x1000_0000;
        /// Remote frames are not received
        const IGNORE_RTR = 0x2000_0000;
        /// Data frames are not received
        const IGNORE_DATA = 0x4000_0000;
        /// Frames transmitted by other handles on the same net are not received
        const NO_INTERACTION = 0x8000_0000;
    }
}

bitflags! {
    /// Features advertised by a card
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FeatureFlags: u32 {
        /// Full-CAN controller with acceptance filtering
        const FULL_CAN = 1 << 0;
        /// 29-bit identifiers supported
        const CAN_20B = 1 << 1;
        /// Scheduled transmission supported
        const SCHEDULING = 1 << 3;
        /// Object mode supported
        const RX_OBJECT_MODE = 1 << 4;
        /// Hardware timestamps supported
        const TIMESTAMP = 1 << 5;
        /// Listen-only mode supported
        const LISTEN_ONLY_MODE = 1 << 6;
        /// Local echo supported
        const LOCAL_ECHO = 1 << 8;
        /// Node level acceptance filtering supported
        const SMART_ID_FILTER = 1 << 9;
        /// Busmaster FIFO present
        const BUSMASTER = 1 << 10;
        /// Extended diagnostics
        const DIAGNOSTIC = 1 << 11;
        /// Error injection units present
        const ERROR_INJECTION = 1 << 12;
        /// CAN-FD supported
        const CAN_FD = 1 << 15;
    }
}

bitflags! {
    /// Traffic classes a node acceptance filter entry applies to
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FilterClass: u8 {
        /// Classic data frames delivered in FIFO mode
        const DATA = 0x01;
        /// Remote frames delivered in FIFO mode
        const RTR = 0x02;
        /// Data frames delivered in object mode
        const OBJ_DATA = 0x04;
        /// Remote frames delivered in object mode
        const OBJ_RTR = 0x08;
        /// CAN-FD data frames
        const FD_DATA = 0x10;
    }
}

impl FilterClass {
    /// Classify a frame as seen by a handle in or out of object mode
    pub fn classify(rtr: bool, fd: bool, object_mode: bool) -> Self {
        match (fd, rtr, object_mode) {
            (true, _, _) => FilterClass::FD_DATA,
            (false, false, false) => FilterClass::DATA,
            (false, true, false) => FilterClass::RTR,
            (false, false, true) => FilterClass::OBJ_DATA,
            (false, true, true) => FilterClass::OBJ_RTR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(FilterClass::DATA, FilterClass::classify(false, false, false));
        assert_eq!(FilterClass::OBJ_RTR, FilterClass::classify(true, false, true));
        assert_eq!(FilterClass::FD_DATA, FilterClass::classify(false, true, true));
    }
}
