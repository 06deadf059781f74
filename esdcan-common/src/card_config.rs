//! Loading of card configuration from TOML
//!
//! A card configuration describes one attached board: its identity, versions, feature set, the
//! busmaster FIFO and timer parameters, and one `[[node]]` table per CAN channel.
//!
//! ```toml
//! name = "CAN-PCIe/402-4"
//! serial = "AB012345"
//! hardware_version = "1.2.0"
//! firmware_version = "2.5.1"
//! min_firmware_version = "2.0.0"
//! base_net = 0
//! features = ["can_20b", "timestamp", "busmaster", "error_injection", "can_fd"]
//! eei_units = 2
//!
//! [busmaster]
//! fifo_capacity = 256
//!
//! [timer]
//! frequency = 80000000
//! calibration_ticks = 40
//!
//! [queues]
//! rx = 1024
//! tx = 256
//!
//! [[node]]
//! ctrl_type = "esd_acc"
//! clock = 80000000
//! transceiver = "high_speed_fd"
//! frame_mode = "fd"
//! ```

use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::constants::limits;
use crate::device_info::{ControllerType, TransceiverType, Version};
use crate::flags::FeatureFlags;
use crate::messages::FrameMode;

/// Error returned when loading a card configuration fails
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("Failed to read config file: {source}"))]
    Io {
        /// The underlying IO error
        source: std::io::Error,
    },
    /// The TOML was malformed or did not match the expected schema
    #[snafu(display("Failed to parse config: {source}"))]
    Parse {
        /// The underlying TOML error
        source: toml::de::Error,
    },
    /// A version string could not be parsed
    #[snafu(display("Invalid version '{value}' for {field}"))]
    InvalidVersion {
        /// Name of the field
        field: &'static str,
        /// The offending value
        value: String,
    },
    /// The card has no nodes, or more than a card can carry
    #[snafu(display("A card must have 1 to 8 nodes, got {count}"))]
    NodeCount {
        /// Number of nodes configured
        count: usize,
    },
    /// The FIFO or a queue size is zero or too large
    #[snafu(display("Invalid size for {field}: {value}"))]
    InvalidSize {
        /// Name of the field
        field: &'static str,
        /// The offending value
        value: usize,
    },
}

/// Named card features as they appear in the `features` list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// See [`FeatureFlags::FULL_CAN`]
    FullCan,
    /// See [`FeatureFlags::CAN_20B`]
    #[serde(rename = "can_20b")]
    Can20b,
    /// See [`FeatureFlags::SCHEDULING`]
    Scheduling,
    /// See [`FeatureFlags::RX_OBJECT_MODE`]
    RxObjectMode,
    /// See [`FeatureFlags::TIMESTAMP`]
    Timestamp,
    /// See [`FeatureFlags::LISTEN_ONLY_MODE`]
    ListenOnlyMode,
    /// See [`FeatureFlags::LOCAL_ECHO`]
    LocalEcho,
    /// See [`FeatureFlags::SMART_ID_FILTER`]
    SmartIdFilter,
    /// See [`FeatureFlags::BUSMASTER`]
    Busmaster,
    /// See [`FeatureFlags::DIAGNOSTIC`]
    Diagnostic,
    /// See [`FeatureFlags::ERROR_INJECTION`]
    ErrorInjection,
    /// See [`FeatureFlags::CAN_FD`]
    CanFd,
}

impl From<Feature> for FeatureFlags {
    fn from(value: Feature) -> Self {
        match value {
            Feature::FullCan => FeatureFlags::FULL_CAN,
            Feature::Can20b => FeatureFlags::CAN_20B,
            Feature::Scheduling => FeatureFlags::SCHEDULING,
            Feature::RxObjectMode => FeatureFlags::RX_OBJECT_MODE,
            Feature::Timestamp => FeatureFlags::TIMESTAMP,
            Feature::ListenOnlyMode => FeatureFlags::LISTEN_ONLY_MODE,
            Feature::LocalEcho => FeatureFlags::LOCAL_ECHO,
            Feature::SmartIdFilter => FeatureFlags::SMART_ID_FILTER,
            Feature::Busmaster => FeatureFlags::BUSMASTER,
            Feature::Diagnostic => FeatureFlags::DIAGNOSTIC,
            Feature::ErrorInjection => FeatureFlags::ERROR_INJECTION,
            Feature::CanFd => FeatureFlags::CAN_FD,
        }
    }
}

fn default_fifo_capacity() -> usize {
    limits::DEFAULT_FIFO_CAPACITY
}

fn default_timer_frequency() -> u64 {
    80_000_000
}

fn default_ctrl_clock() -> u32 {
    80_000_000
}

fn default_rx_queue() -> usize {
    1024
}

fn default_tx_queue() -> usize {
    256
}

/// Busmaster FIFO parameters
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusmasterConfig {
    /// Number of event records the FIFO holds
    #[serde(default = "default_fifo_capacity")]
    pub fifo_capacity: usize,
}

impl Default for BusmasterConfig {
    fn default() -> Self {
        Self {
            fifo_capacity: default_fifo_capacity(),
        }
    }
}

/// Timer subsystem parameters
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerConfig {
    /// Timestamp clock frequency in Hz
    #[serde(default = "default_timer_frequency")]
    pub frequency: u64,
    /// Fixed dispatch latency subtracted from elapsed durations, in ticks
    #[serde(default)]
    pub calibration_ticks: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            frequency: default_timer_frequency(),
            calibration_ticks: 0,
        }
    }
}

/// Default queue sizes for new handles
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Receive queue size in messages
    #[serde(default = "default_rx_queue")]
    pub rx: usize,
    /// Transmit queue size in messages
    #[serde(default = "default_tx_queue")]
    pub tx: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rx: default_rx_queue(),
            tx: default_tx_queue(),
        }
    }
}

/// Configuration of one CAN channel
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Controller type
    #[serde(default)]
    pub ctrl_type: ControllerType,
    /// Controller clock in Hz
    #[serde(default = "default_ctrl_clock")]
    pub clock: u32,
    /// Fitted transceiver
    #[serde(default)]
    pub transceiver: TransceiverType,
    /// Classic or FD framing
    #[serde(default)]
    pub frame_mode: FrameMode,
    /// Baudrate word applied at attach time
    #[serde(default)]
    pub baud: Option<u32>,
}

/// Configuration of one card
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CardConfig {
    /// Product name
    pub name: String,
    /// Serial number, used as the card identity
    pub serial: String,
    /// Hardware revision
    pub hardware_version: String,
    /// Firmware version
    pub firmware_version: String,
    /// Lowest supported firmware version
    #[serde(default)]
    pub min_firmware_version: Option<String>,
    /// Lowest supported hardware revision
    #[serde(default)]
    pub min_hardware_version: Option<String>,
    /// Net number of the first node
    #[serde(default)]
    pub base_net: u8,
    /// Card features
    #[serde(default)]
    pub features: Vec<Feature>,
    /// Number of error injection units
    #[serde(default)]
    pub eei_units: usize,
    /// Busmaster FIFO parameters
    #[serde(default)]
    pub busmaster: BusmasterConfig,
    /// Timer parameters
    #[serde(default)]
    pub timer: TimerConfig,
    /// Default handle queue sizes
    #[serde(default)]
    pub queues: QueueConfig,
    /// One entry per CAN channel
    #[serde(rename = "node")]
    pub nodes: Vec<NodeConfig>,
}

impl CardConfig {
    /// Load a configuration from a TOML string
    pub fn load_from_str(s: &str) -> Result<Self, ConfigError> {
        let config: CardConfig = toml::from_str(s).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).context(IoSnafu)?;
        Self::load_from_str(&s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() || self.nodes.len() > limits::MAX_NODES_PER_CARD {
            return NodeCountSnafu {
                count: self.nodes.len(),
            }
            .fail();
        }
        self.hardware_version()?;
        self.firmware_version()?;
        self.min_firmware_version()?;
        self.min_hardware_version()?;
        for (field, value) in [
            ("busmaster.fifo_capacity", self.busmaster.fifo_capacity),
            ("queues.rx", self.queues.rx),
            ("queues.tx", self.queues.tx),
        ] {
            if value == 0 || value > limits::MAX_QUEUE_SIZE {
                return InvalidSizeSnafu { field, value }.fail();
            }
        }
        Ok(())
    }

    fn parse_version(field: &'static str, value: &str) -> Result<Version, ConfigError> {
        Version::parse(value).ok_or_else(|| ConfigError::InvalidVersion {
            field,
            value: value.to_string(),
        })
    }

    /// The parsed hardware revision
    pub fn hardware_version(&self) -> Result<Version, ConfigError> {
        Self::parse_version("hardware_version", &self.hardware_version)
    }

    /// The parsed firmware version
    pub fn firmware_version(&self) -> Result<Version, ConfigError> {
        Self::parse_version("firmware_version", &self.firmware_version)
    }

    /// The parsed minimum firmware version, if one is set
    pub fn min_firmware_version(&self) -> Result<Option<Version>, ConfigError> {
        self.min_firmware_version
            .as_deref()
            .map(|v| Self::parse_version("min_firmware_version", v))
            .transpose()
    }

    /// The parsed minimum hardware revision, if one is set
    pub fn min_hardware_version(&self) -> Result<Option<Version>, ConfigError> {
        self.min_hardware_version
            .as_deref()
            .map(|v| Self::parse_version("min_hardware_version", v))
            .transpose()
    }

    /// The feature list as a flag mask
    pub fn feature_flags(&self) -> FeatureFlags {
        self.features
            .iter()
            .fold(FeatureFlags::empty(), |acc, f| acc | FeatureFlags::from(*f))
    }
}
