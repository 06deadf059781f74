//! Message transport and timing core of a busmaster CAN interface driver
//!
//! The crate implements everything between a CAN controller and the handles applications open on
//! it: per handle receive and transmit pipelines, the interrupt deferred busmaster FIFO, and the
//! timer subsystem which stamps every message with a monotonic time base.
//!
//! # Structure
//!
//! - A [`Registry`] holds the attached [`Card`]s and maps logical net numbers to their nodes.
//! - A [`Card`] owns the [busmaster FIFO](busmaster), the [`Timers`], a pool of
//!   [error injection units](eei) and a [`Controller`] for the hardware.
//! - Each [`Node`] is one CAN channel: acceptance filter, statistics, error counters, baudrate,
//!   and the sessions open on it.
//! - A [`Session`] is one open handle, with `read`/`take`/`write`/`send` and their timestamped
//!   variants.
//! - [`Driver`] exposes all of it as numbered control calls.
//!
//! # Getting Started
//!
//! Cards are described by a [`CardConfig`](common::card_config::CardConfig) TOML file, see the
//! [common::card_config] module docs. A card is attached together with the controller backing it;
//! the [`LoopbackController`] reflects every transmitted frame back to its own node, which is
//! enough to exercise the whole path without hardware.
//!
//! ```ignore
//! let registry = Registry::new();
//! let config = CardConfig::load_from_file("card.toml")?;
//! registry.attach(config, Arc::new(LoopbackController::new()), None)?;
//!
//! let session = registry.open(0, OpenParams::new(ModeFlags::LOCAL_ECHO))?;
//! session.id_add(CanId::std(0x72))?;
//! session.write(&[CanMessage::new(CanId::std(0x72), &[1, 2, 3])?], Timeout::Millis(100)).await?;
//!
//! let mut buf = [CanMessage::default(); 8];
//! let done = session.read(&mut buf, Timeout::Millis(100)).await?;
//! ```
//!
//! ## Interrupt handling
//!
//! Hardware backends post [`RawEvent`](busmaster::RawEvent) records through the
//! [`BusmasterPort`](busmaster::BusmasterPort) they were bound to and raise the interrupt. The
//! interrupt only wakes the card's deferred task; all processing happens in [`Card::dpc`], one
//! record at a time, in arrival order.
//!
//! ## Logging
//!
//! Logging goes through `defmt-or-log`; enable the `log` feature (default) for the `log` crate or
//! the `defmt` feature for defmt.
#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::comparison_chain)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod busmaster;
mod card;
pub mod eei;
pub mod filter;
pub mod hw;
pub mod ioctl;
mod node;
mod registry;
mod ring;
mod sched_queue;
mod session;
mod timer;

pub use card::Card;
pub use eei::{EeiConfig, EeiId, EeiPool, EeiState, EeiStatus, EeiTrigger, InjectionPattern};
pub use filter::{AcceptanceFilter, FilterCmd, FilterTarget, IdSet};
pub use hw::{Controller, LoopbackController};
pub use ioctl::{Driver, IoctlCmd, Reply, Request, Response};
pub use node::Node;
pub use registry::{AttachError, Registry};
pub use ring::CmRing;
pub use sched_queue::SchedQueue;
pub use session::{Completion, IoStatus, OpenParams, RxState, Session, TxState};
pub use timer::{MonotonicClock, TimerCallback, TimerHandle, TimerOwner, Timers};

pub use esdcan_common as common;
