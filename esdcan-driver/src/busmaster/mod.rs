//! The busmaster event path from hardware to nodes
//!
//! Hardware backends post [`RawEvent`] records through a [`BusmasterPort`] and raise the card
//! interrupt. The card's DPC task then drains the [`BusmasterFifo`] in arrival order, decoding each
//! record once into a [`BusmasterRecord`] and handing it to the owning node.
mod drain;
pub mod event;
mod fifo;

pub(crate) use drain::DrainCursor;
pub use drain::DrainSummary;
pub use event::{
    BusmasterEvent, BusmasterRecord, DecodeError, ErrorReport, FrameEvent, FrameFlags, RawEvent,
};
pub use fifo::{BusmasterFifo, BusmasterPort};
