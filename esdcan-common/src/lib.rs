//! Common types shared among the esdcan crates.
//!
//! This crate holds the externally visible encodings of the driver: CAN identifiers and messages
//! with their fixed wire layouts, status codes, mode and feature flags, baudrate words, bus status
//! and statistics records, and the card configuration file format. Most users will reach it through
//! the re-export in `esdcan-driver`.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod baud;
pub mod bus_status;
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod card_config;
pub mod constants;
pub mod device_info;
pub mod flags;
pub mod messages;
pub mod status;
mod time_types;
pub mod traits;

pub use messages::{CanId, CanMessage, FrameMode};
pub use status::{DriverError, StatusCode};
pub use time_types::{duration_to_ticks, ticks_to_duration, Timeout, Timestamp};
