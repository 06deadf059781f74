//! Attached cards and the logical nets they provide
//!
//! Cards are registered when their device is attached and dropped when it is detached. Each node
//! of a card is reachable by its logical net number for as long as the card is attached.
use core::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use critical_section::Mutex;
use defmt_or_log::info;
use esdcan_common::{
    card_config::{CardConfig, ConfigError},
    traits::ClockSource,
    DriverError,
};
use snafu::{ResultExt, Snafu};

use crate::card::Card;
use crate::hw::Controller;
use crate::node::Node;
use crate::session::{OpenParams, Session};

/// Errors attaching a card
#[derive(Debug, Snafu)]
pub enum AttachError {
    /// The card configuration is not usable
    #[snafu(display("Invalid card configuration: {source}"))]
    Config {
        /// The underlying configuration error
        source: ConfigError,
    },
    /// A card with the same serial number is already attached
    #[snafu(display("Card {serial} is already attached"))]
    DuplicateSerial {
        /// The serial number
        serial: String,
    },
    /// One of the card's nets is provided by another card
    #[snafu(display("Net {net} is already in use"))]
    NetInUse {
        /// The net number
        net: u8,
    },
    /// Attaching starts the card's tasks, which needs a running tokio runtime
    #[snafu(display("Cards must be attached from within a tokio runtime"))]
    NoRuntime,
}

#[derive(Default)]
struct Entries {
    cards: BTreeMap<String, Arc<Card>>,
    nets: BTreeMap<u8, (String, u8)>,
}

/// The set of attached cards
#[allow(missing_debug_implementations)]
pub struct Registry {
    entries: Mutex<RefCell<Entries>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(RefCell::new(Entries::default())),
        }
    }

    /// Build a card, start its tasks and make its nets available
    pub fn attach(
        &self,
        config: CardConfig,
        controller: Arc<dyn Controller>,
        clock: Option<Arc<dyn ClockSource>>,
    ) -> Result<Arc<Card>, AttachError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return NoRuntimeSnafu.fail();
        }
        let serial = config.serial.clone();
        let base = config.base_net;
        let count = config.nodes.len();
        critical_section::with(|cs| {
            let entries = self.entries.borrow_ref(cs);
            if entries.cards.contains_key(&serial) {
                return DuplicateSerialSnafu {
                    serial: serial.clone(),
                }
                .fail();
            }
            for i in 0..count {
                let net = base.wrapping_add(i as u8);
                if entries.nets.contains_key(&net) {
                    return NetInUseSnafu { net }.fail();
                }
            }
            Ok(())
        })?;

        let card = Card::new(config, controller, clock).context(ConfigSnafu)?;
        critical_section::with(|cs| {
            let mut entries = self.entries.borrow_ref_mut(cs);
            // Checked again, another attach may have raced this one
            if entries.cards.contains_key(&serial) {
                return DuplicateSerialSnafu {
                    serial: serial.clone(),
                }
                .fail();
            }
            if let Some(node) = card
                .nodes()
                .iter()
                .find(|n| entries.nets.contains_key(&n.net()))
            {
                return NetInUseSnafu { net: node.net() }.fail();
            }
            for node in card.nodes() {
                entries.nets.insert(node.net(), (serial.clone(), node.index()));
            }
            entries.cards.insert(serial.clone(), card.clone());
            Ok(())
        })?;
        card.start();
        Ok(card)
    }

    /// Remove a card. Its sessions are force closed.
    ///
    /// Returns the card, or `None` if no card with that serial is attached.
    pub fn detach(&self, serial: &str) -> Option<Arc<Card>> {
        let card = critical_section::with(|cs| {
            let mut entries = self.entries.borrow_ref_mut(cs);
            let card = entries.cards.remove(serial)?;
            entries.nets.retain(|_, (s, _)| s != serial);
            Some(card)
        })?;
        card.shutdown();
        info!("Card {} detached", serial);
        Some(card)
    }

    /// A card by serial number
    pub fn card(&self, serial: &str) -> Option<Arc<Card>> {
        critical_section::with(|cs| self.entries.borrow_ref(cs).cards.get(serial).cloned())
    }

    /// Serial numbers of all attached cards
    pub fn serials(&self) -> Vec<String> {
        critical_section::with(|cs| self.entries.borrow_ref(cs).cards.keys().cloned().collect())
    }

    /// The card and node index providing a net
    pub fn lookup(&self, net: u8) -> Result<(Arc<Card>, u8), DriverError> {
        critical_section::with(|cs| {
            let entries = self.entries.borrow_ref(cs);
            let (serial, index) = entries
                .nets
                .get(&net)
                .ok_or(DriverError::NetNotFound { net })?;
            let card = entries
                .cards
                .get(serial)
                .ok_or(DriverError::NetNotFound { net })?;
            Ok((card.clone(), *index))
        })
    }

    /// The node providing a net
    pub fn node(&self, net: u8) -> Result<Arc<Node>, DriverError> {
        let (card, index) = self.lookup(net)?;
        card.node(index)
            .cloned()
            .ok_or(DriverError::NetNotFound { net })
    }

    /// Open a session on a net
    pub fn open(&self, net: u8, params: OpenParams) -> Result<Session, DriverError> {
        let node = self.node(net)?;
        Session::open(node, params)
    }
}
