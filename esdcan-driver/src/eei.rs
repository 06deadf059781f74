//! Error injection units
//!
//! A card carries a small pool of error injection units. Each unit is bound to one node and goes
//! through `create -> configure -> start -> (fire)* -> stop -> destroy`. Once started, a unit fires
//! when its trigger condition holds: a received frame matching an identifier pattern, or a
//! periodic timer. [`EeiPool::trigger_now`] fires a configured unit regardless of its trigger.
//!
//! Firing hands the unit's bit pattern to the controller, which puts it on the bus.
use core::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use critical_section::Mutex;
use defmt_or_log::{debug, warn};
use esdcan_common::{CanId, CanMessage, DriverError, Timestamp};

use crate::filter::FilterTarget;
use crate::hw::Controller;
use crate::timer::{TimerHandle, TimerOwner, Timers};

/// Maximum length of an injection pattern, in bytes
pub const EEI_PATTERN_BYTES: usize = 40;

/// The bit sequence an error injection unit drives onto the bus
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InjectionPattern {
    bits: heapless::Vec<u8, EEI_PATTERN_BYTES>,
    bit_len: u16,
}

impl InjectionPattern {
    /// Create a pattern of `bit_len` bits, MSB first
    pub fn new(bits: &[u8], bit_len: u16) -> Result<Self, DriverError> {
        let bits = heapless::Vec::from_slice(bits).map_err(|_| DriverError::InvalidParameter {
            reason: "injection pattern too long",
        })?;
        if bit_len == 0 || bit_len as usize > bits.len() * 8 {
            return Err(DriverError::InvalidParameter {
                reason: "invalid injection pattern length",
            });
        }
        Ok(Self { bits, bit_len })
    }

    /// The pattern bytes
    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Number of valid bits
    pub fn bit_len(&self) -> u16 {
        self.bit_len
    }
}

/// What makes a running unit fire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EeiTrigger {
    /// A received frame whose identifier matches; mask bits set to 1 are "don't care"
    Pattern {
        /// Identifier to match
        id: CanId,
        /// Don't care mask
        mask: u32,
    },
    /// Fire periodically while running
    Timer {
        /// Period between firings
        period: Duration,
    },
    /// Fire only on [`EeiPool::trigger_now`]
    Manual,
}

/// Configuration of an error injection unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EeiConfig {
    /// Trigger condition
    pub trigger: EeiTrigger,
    /// Pattern driven onto the bus
    pub pattern: InjectionPattern,
    /// Delay between a pattern or manual trigger and the injection
    pub delay: Duration,
    /// Number of firings after which the unit stops; 0 never stops
    pub repeat: u32,
}

/// State of an error injection unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EeiState {
    /// Allocated, not configured yet
    Created,
    /// Configured and idle
    Configured,
    /// Armed and waiting for its trigger
    Running,
    /// Stopped, either explicitly or after its repeat count
    Stopped,
}

/// Status record of an error injection unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EeiStatus {
    /// Current state
    pub state: EeiState,
    /// Number of firings since the unit was last started
    pub fired: u32,
    /// Time of the last trigger
    pub last_trigger: Timestamp,
}

/// Identifies one unit in a card's pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EeiId(pub u8);

struct EeiUnit {
    node: u8,
    config: Option<EeiConfig>,
    status: EeiStatus,
    timer: TimerHandle,
    /// A delayed injection is armed on the unit timer
    delayed: bool,
}

/// The error injection units of one card
#[allow(missing_debug_implementations)]
pub struct EeiPool {
    units: Mutex<RefCell<Vec<Option<EeiUnit>>>>,
    timers: Arc<Timers>,
    controller: Arc<dyn Controller>,
    weak: Weak<EeiPool>,
}

impl EeiPool {
    /// Create a pool of `size` units
    pub fn new(size: usize, timers: Arc<Timers>, controller: Arc<dyn Controller>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            units: Mutex::new(RefCell::new((0..size).map(|_| None).collect())),
            timers,
            controller,
            weak: weak.clone(),
        })
    }

    /// Number of units in the pool
    pub fn size(&self) -> usize {
        critical_section::with(|cs| self.units.borrow_ref_mut(cs).len())
    }

    /// Number of units currently allocated
    pub fn in_use(&self) -> usize {
        critical_section::with(|cs| {
            self.units
                .borrow_ref_mut(cs)
                .iter()
                .filter(|u| u.is_some())
                .count()
        })
    }

    fn with_unit<R>(
        &self,
        id: EeiId,
        f: impl FnOnce(&mut EeiUnit) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        critical_section::with(|cs| {
            let mut units = self.units.borrow_ref_mut(cs);
            let unit = units
                .get_mut(id.0 as usize)
                .and_then(|u| u.as_mut())
                .ok_or(DriverError::InvalidHandle)?;
            f(unit)
        })
    }

    /// Allocate a unit on `node`
    pub fn create(&self, node: u8) -> Result<EeiId, DriverError> {
        let free = critical_section::with(|cs| {
            self.units
                .borrow_ref_mut(cs)
                .iter()
                .position(|u| u.is_none())
        })
        .ok_or(DriverError::InsufficientResources)?;
        let weak = self.weak.clone();
        let index = free as u8;
        let timer = self.timers.create(
            TimerOwner::Eei(index),
            Box::new(move |_| {
                if let Some(pool) = weak.upgrade() {
                    pool.timer_fired(EeiId(index));
                }
            }),
        );
        let unit = EeiUnit {
            node,
            config: None,
            status: EeiStatus {
                state: EeiState::Created,
                fired: 0,
                last_trigger: Timestamp::ZERO,
            },
            timer,
            delayed: false,
        };
        critical_section::with(|cs| {
            let mut units = self.units.borrow_ref_mut(cs);
            // The slot may have been taken by a concurrent create
            let slot = units
                .get_mut(free)
                .filter(|u| u.is_none())
                .ok_or(DriverError::InsufficientResources)?;
            *slot = Some(unit);
            Ok::<(), DriverError>(())
        })
        .inspect_err(|_| {
            let _ = self.timers.destroy(timer);
        })?;
        debug!("Created EEI unit {} on node {}", index, node);
        Ok(EeiId(index))
    }

    /// Release a unit
    pub fn destroy(&self, id: EeiId) -> Result<(), DriverError> {
        let unit = critical_section::with(|cs| {
            self.units
                .borrow_ref_mut(cs)
                .get_mut(id.0 as usize)
                .and_then(|u| u.take())
        })
        .ok_or(DriverError::InvalidHandle)?;
        self.timers.destroy(unit.timer)
    }

    /// Configure a unit which is not running
    pub fn configure(&self, id: EeiId, config: EeiConfig) -> Result<(), DriverError> {
        if let EeiTrigger::Timer { period } = config.trigger {
            if period.is_zero() {
                return Err(DriverError::InvalidParameter {
                    reason: "zero EEI timer period",
                });
            }
        }
        self.with_unit(id, |unit| {
            if unit.status.state == EeiState::Running {
                return Err(DriverError::InvalidParameter {
                    reason: "EEI unit is running",
                });
            }
            unit.config = Some(config);
            unit.status.state = EeiState::Configured;
            Ok(())
        })
    }

    /// Start a configured unit
    pub fn start(&self, id: EeiId) -> Result<(), DriverError> {
        let (timer, period) = self.with_unit(id, |unit| {
            let config = unit.config.as_ref().ok_or(DriverError::InvalidParameter {
                reason: "EEI unit not configured",
            })?;
            let period = match config.trigger {
                EeiTrigger::Timer { period } => Some(period),
                _ => None,
            };
            unit.status.state = EeiState::Running;
            unit.status.fired = 0;
            Ok((unit.timer, period))
        })?;
        if let Some(period) = period {
            self.timers.arm(timer, period)?;
        }
        Ok(())
    }

    /// Stop a unit. A stopped unit may be reconfigured and started again.
    pub fn stop(&self, id: EeiId) -> Result<(), DriverError> {
        let timer = self.with_unit(id, |unit| {
            if unit.status.state == EeiState::Created {
                return Err(DriverError::InvalidParameter {
                    reason: "EEI unit not configured",
                });
            }
            unit.status.state = EeiState::Stopped;
            unit.delayed = false;
            Ok(unit.timer)
        })?;
        self.timers.disarm(timer)?;
        Ok(())
    }

    /// Node index a unit was created on
    pub fn node_of(&self, id: EeiId) -> Result<u8, DriverError> {
        self.with_unit(id, |unit| Ok(unit.node))
    }

    /// Status record of a unit
    pub fn status(&self, id: EeiId) -> Result<EeiStatus, DriverError> {
        self.with_unit(id, |unit| Ok(unit.status))
    }

    /// Fire a configured unit now, ignoring its trigger condition
    pub fn trigger_now(&self, id: EeiId) -> Result<(), DriverError> {
        self.trigger(id, self.timers.now(), true)
    }

    /// Check a received frame against the pattern triggers of running units on `node`
    pub(crate) fn on_frame(&self, node: u8, msg: &CanMessage, timestamp: Timestamp) {
        let hits: heapless::Vec<EeiId, 16> = critical_section::with(|cs| {
            self.units
                .borrow_ref_mut(cs)
                .iter()
                .enumerate()
                .filter_map(|(i, u)| {
                    let u = u.as_ref()?;
                    let config = u.config.as_ref()?;
                    let EeiTrigger::Pattern { id, mask } = config.trigger else {
                        return None;
                    };
                    let target = FilterTarget::Mask { code: id, mask };
                    (u.node == node
                        && u.status.state == EeiState::Running
                        && target.matches(&msg.id))
                    .then_some(EeiId(i as u8))
                })
                .take(16)
                .collect()
        });
        for id in hits {
            if let Err(e) = self.trigger(id, timestamp, false) {
                warn!("EEI unit {} trigger failed: {:?}", id.0, e);
            }
        }
    }

    fn trigger(&self, id: EeiId, at: Timestamp, manual: bool) -> Result<(), DriverError> {
        let delay = self.with_unit(id, |unit| {
            let config = unit.config.as_ref().ok_or(DriverError::InvalidParameter {
                reason: "EEI unit not configured",
            })?;
            if !manual && unit.status.state != EeiState::Running {
                return Ok(None);
            }
            unit.status.last_trigger = at;
            if config.delay.is_zero() {
                Ok(Some(None))
            } else {
                unit.delayed = true;
                Ok(Some(Some((unit.timer, config.delay))))
            }
        })?;
        match delay {
            None => Ok(()),
            Some(None) => self.fire(id),
            Some(Some((timer, delay))) => self.timers.arm(timer, delay),
        }
    }

    fn timer_fired(&self, id: EeiId) {
        let action = self.with_unit(id, |unit| {
            let periodic = match unit.config.as_ref().map(|c| c.trigger) {
                Some(EeiTrigger::Timer { period }) => Some(period),
                _ => None,
            };
            if unit.delayed {
                unit.delayed = false;
                Ok((true, None))
            } else if unit.status.state == EeiState::Running {
                unit.status.last_trigger = self.timers.now();
                Ok((periodic.is_some(), periodic.map(|p| (unit.timer, p))))
            } else {
                Ok((false, None))
            }
        });
        let Ok((fire, rearm)) = action else {
            return;
        };
        if fire {
            if let Err(e) = self.fire(id) {
                warn!("EEI unit {} injection failed: {:?}", id.0, e);
            }
        }
        if let Some((timer, period)) = rearm {
            let running = self
                .status(id)
                .is_ok_and(|s| s.state == EeiState::Running);
            if running {
                if let Err(e) = self.timers.arm(timer, period) {
                    warn!("EEI unit {} cannot re-arm its timer: {:?}", id.0, e);
                    let _ = self.with_unit(id, |unit| {
                        unit.status.state = EeiState::Stopped;
                        Ok(())
                    });
                }
            }
        }
    }

    fn fire(&self, id: EeiId) -> Result<(), DriverError> {
        let (node, pattern, timer, exhausted) = self.with_unit(id, |unit| {
            let config = unit.config.as_ref().ok_or(DriverError::InvalidParameter {
                reason: "EEI unit not configured",
            })?;
            unit.status.fired = unit.status.fired.saturating_add(1);
            let exhausted = config.repeat != 0
                && unit.status.fired >= config.repeat
                && unit.status.state == EeiState::Running;
            let pattern = config.pattern.clone();
            if exhausted {
                unit.status.state = EeiState::Stopped;
            }
            Ok((unit.node, pattern, unit.timer, exhausted))
        })?;
        if exhausted {
            debug!("EEI unit {} reached its repeat count", id.0);
            self.timers.disarm(timer)?;
        }
        self.controller.inject_error(node, &pattern)
    }

    /// Release every unit
    pub(crate) fn clear(&self) {
        let timers: Vec<TimerHandle> = critical_section::with(|cs| {
            self.units
                .borrow_ref_mut(cs)
                .iter_mut()
                .filter_map(|u| u.take().map(|u| u.timer))
                .collect()
        });
        for t in timers {
            let _ = self.timers.destroy(t);
        }
    }
}
