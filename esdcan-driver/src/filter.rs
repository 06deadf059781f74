//! Identifier filtering at node and handle level
//!
//! A received frame reaches a handle only if it passes two stages. The node's
//! [`AcceptanceFilter`] is shared by every handle on a channel and works per traffic class. The
//! handle's own [`IdSet`] then selects the identifiers that handle asked for.
//!
//! The node filter is an entry list. With no entries it admits everything. Once an entry is
//! enabled, a frame is admitted only if some entry matches its identifier and covers its class.
use esdcan_common::{
    constants::{ids, limits},
    flags::FilterClass,
    CanId, DriverError,
};

/// Enable or disable a filter entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterCmd {
    /// Admit the target for the given classes
    On,
    /// Stop admitting the target for the given classes
    Off,
}

/// The identifiers a node filter entry applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterTarget {
    /// One identifier
    Single(CanId),
    /// An inclusive identifier range; both ends of the same kind
    Range {
        /// First identifier
        first: CanId,
        /// Last identifier
        last: CanId,
    },
    /// Acceptance code and mask; mask bits set to 1 are "don't care"
    Mask {
        /// Acceptance code
        code: CanId,
        /// Don't care mask
        mask: u32,
    },
}

fn same_kind(a: &CanId, b: &CanId) -> bool {
    matches!(
        (a, b),
        (CanId::Std(_), CanId::Std(_)) | (CanId::Extended(_), CanId::Extended(_))
    )
}

fn id_mask(id: &CanId) -> u32 {
    if id.is_extended() {
        ids::EXT_ID_MAX
    } else {
        ids::STD_ID_MAX as u32
    }
}

impl FilterTarget {
    fn validate(&self) -> Result<(), DriverError> {
        let ok = match self {
            FilterTarget::Single(id) => !id.is_event(),
            FilterTarget::Range { first, last } => {
                same_kind(first, last) && first.value() <= last.value()
            }
            FilterTarget::Mask { code, .. } => !code.is_event(),
        };
        if ok {
            Ok(())
        } else {
            Err(DriverError::InvalidParameter {
                reason: "invalid filter target",
            })
        }
    }

    /// True if `id` is covered by this target
    pub fn matches(&self, id: &CanId) -> bool {
        match self {
            FilterTarget::Single(t) => t == id,
            FilterTarget::Range { first, last } => {
                same_kind(first, id) && (first.value()..=last.value()).contains(&id.value())
            }
            FilterTarget::Mask { code, mask } => {
                same_kind(code, id) && (id.value() ^ code.value()) & !mask & id_mask(id) == 0
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FilterEntry {
    target: FilterTarget,
    classes: FilterClass,
}

/// The acceptance filter of a node
#[derive(Clone, Debug, Default)]
pub struct AcceptanceFilter {
    entries: heapless::Vec<FilterEntry, { limits::MAX_FILTER_ENTRIES }>,
}

impl AcceptanceFilter {
    /// Create an open filter which admits everything
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Enable or disable `target` for `classes`
    ///
    /// Enabling a target that already has an entry adds the classes to it. Disabling removes the
    /// classes from the entry with exactly this target, dropping the entry once it has none left.
    pub fn set(
        &mut self,
        cmd: FilterCmd,
        classes: FilterClass,
        target: FilterTarget,
    ) -> Result<(), DriverError> {
        target.validate()?;
        if classes.is_empty() {
            return Err(DriverError::InvalidParameter {
                reason: "empty filter class mask",
            });
        }
        let existing = self.entries.iter().position(|e| e.target == target);
        match (cmd, existing) {
            (FilterCmd::On, Some(i)) => {
                self.entries[i].classes |= classes;
                Ok(())
            }
            (FilterCmd::On, None) => self
                .entries
                .push(FilterEntry { target, classes })
                .map_err(|_| DriverError::InsufficientResources),
            (FilterCmd::Off, Some(i)) => {
                let entry = &mut self.entries[i];
                entry.classes.remove(classes);
                if entry.classes.is_empty() {
                    self.entries.remove(i);
                }
                Ok(())
            }
            (FilterCmd::Off, None) => Err(DriverError::IdNotEnabled),
        }
    }

    /// Legacy 11-bit acceptance code and mask
    ///
    /// Replaces any earlier 11-bit code/mask entry. Applies to all traffic classes.
    pub fn set_std_acceptance(&mut self, code: u16, mask: u16) -> Result<(), DriverError> {
        self.entries.retain(|e| {
            !matches!(
                e.target,
                FilterTarget::Mask {
                    code: CanId::Std(_),
                    ..
                }
            )
        });
        self.set(
            FilterCmd::On,
            FilterClass::all(),
            FilterTarget::Mask {
                code: CanId::std(code),
                mask: mask as u32,
            },
        )
    }

    /// Admit an extended identifier region for all traffic classes
    pub fn add_ext_region(&mut self, first: u32, count: u32) -> Result<(), DriverError> {
        let last = region_end(first, count, ids::EXT_ID_MAX)?;
        self.set(
            FilterCmd::On,
            FilterClass::all(),
            FilterTarget::Range {
                first: CanId::extended(first),
                last: CanId::extended(last),
            },
        )
    }

    /// Remove every entry, reopening the filter
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True if the filter admits everything
    pub fn is_open(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check a frame. Event identifiers are never filtered.
    pub fn admits(&self, id: &CanId, class: FilterClass) -> bool {
        if id.is_event() || self.is_open() {
            return true;
        }
        self.entries
            .iter()
            .any(|e| e.classes.intersects(class) && e.target.matches(id))
    }
}

fn region_end(first: u32, count: u32, max: u32) -> Result<u32, DriverError> {
    if count == 0 {
        return Err(DriverError::InvalidParameter {
            reason: "empty identifier region",
        });
    }
    first
        .checked_add(count - 1)
        .filter(|&last| last <= max)
        .ok_or(DriverError::InvalidParameter {
            reason: "identifier region out of range",
        })
}

const STD_WORDS: usize = (ids::STD_ID_MAX as usize + 1) / 64;
const EV_WORDS: usize = ids::EV_COUNT as usize / 64;

fn bit_get(words: &[u64], n: usize) -> bool {
    words[n / 64] & (1 << (n % 64)) != 0
}

fn bit_set(words: &mut [u64], n: usize, on: bool) {
    if on {
        words[n / 64] |= 1 << (n % 64);
    } else {
        words[n / 64] &= !(1 << (n % 64));
    }
}

/// The identifiers enabled on one handle
///
/// 11-bit identifiers and events are kept as bitmaps. 29-bit identifiers are kept as a sorted
/// list of disjoint inclusive ranges, plus an optional code/mask filter.
#[derive(Clone, Debug, Default)]
pub struct IdSet {
    std: [u64; STD_WORDS],
    ext: heapless::Vec<(u32, u32), { limits::MAX_ID_REGIONS }>,
    ext_mask: Option<(u32, u32)>,
    events: [u64; EV_WORDS],
}

impl IdSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `id` is enabled
    pub fn admits(&self, id: &CanId) -> bool {
        match *id {
            CanId::Std(v) => bit_get(&self.std, v as usize),
            CanId::Extended(v) => {
                self.ext.iter().any(|&(a, b)| (a..=b).contains(&v))
                    || self
                        .ext_mask
                        .is_some_and(|(code, mask)| (v ^ code) & !mask & ids::EXT_ID_MAX == 0)
            }
            CanId::Event(ev) => {
                (ev as usize) < ids::EV_COUNT as usize && bit_get(&self.events, ev as usize)
            }
        }
    }

    /// True if nothing is enabled
    pub fn is_empty(&self) -> bool {
        self.std.iter().all(|w| *w == 0)
            && self.ext.is_empty()
            && self.ext_mask.is_none()
            && self.events.iter().all(|w| *w == 0)
    }

    /// Enable one identifier
    pub fn id_add(&mut self, id: CanId) -> Result<(), DriverError> {
        if self.admits_exact(&id) {
            return Err(DriverError::IdAlreadyEnabled);
        }
        match id {
            CanId::Std(v) => bit_set(&mut self.std, v as usize, true),
            CanId::Extended(v) => self.insert_ext(v, v)?,
            CanId::Event(ev) => {
                if ev >= ids::EV_COUNT {
                    return Err(DriverError::InvalidParameter {
                        reason: "event number out of range",
                    });
                }
                bit_set(&mut self.events, ev as usize, true)
            }
        }
        Ok(())
    }

    /// Disable one identifier
    pub fn id_delete(&mut self, id: CanId) -> Result<(), DriverError> {
        if !self.admits_exact(&id) {
            return Err(DriverError::IdNotEnabled);
        }
        match id {
            CanId::Std(v) => bit_set(&mut self.std, v as usize, false),
            CanId::Extended(v) => self.remove_ext(v, v)?,
            CanId::Event(ev) => bit_set(&mut self.events, ev as usize, false),
        }
        Ok(())
    }

    /// Enable `count` consecutive identifiers starting at `first`
    pub fn id_region_add(&mut self, first: CanId, count: u32) -> Result<(), DriverError> {
        match first {
            CanId::Std(v) => {
                let last = region_end(v as u32, count, ids::STD_ID_MAX as u32)?;
                (v as usize..=last as usize).for_each(|n| bit_set(&mut self.std, n, true));
                Ok(())
            }
            CanId::Extended(v) => {
                let last = region_end(v, count, ids::EXT_ID_MAX)?;
                self.insert_ext(v, last)
            }
            CanId::Event(ev) => {
                let last = region_end(ev as u32, count, ids::EV_COUNT as u32 - 1)?;
                (ev as usize..=last as usize).for_each(|n| bit_set(&mut self.events, n, true));
                Ok(())
            }
        }
    }

    /// Disable `count` consecutive identifiers starting at `first`
    pub fn id_region_delete(&mut self, first: CanId, count: u32) -> Result<(), DriverError> {
        match first {
            CanId::Std(v) => {
                let last = region_end(v as u32, count, ids::STD_ID_MAX as u32)?;
                (v as usize..=last as usize).for_each(|n| bit_set(&mut self.std, n, false));
                Ok(())
            }
            CanId::Extended(v) => {
                let last = region_end(v, count, ids::EXT_ID_MAX)?;
                self.remove_ext(v, last)
            }
            CanId::Event(ev) => {
                let last = region_end(ev as u32, count, ids::EV_COUNT as u32 - 1)?;
                (ev as usize..=last as usize).for_each(|n| bit_set(&mut self.events, n, false));
                Ok(())
            }
        }
    }

    /// Set the 29-bit acceptance code and mask; mask bits set to 1 are "don't care"
    pub fn set_20b_filter(&mut self, code: u32, mask: u32) {
        self.ext_mask = Some((code & ids::EXT_ID_MAX, mask & ids::EXT_ID_MAX));
    }

    /// Remove the 29-bit acceptance code and mask
    pub fn clear_20b_filter(&mut self) {
        self.ext_mask = None;
    }

    // Enabled through the bitmap or an explicit region, ignoring the code/mask filter
    fn admits_exact(&self, id: &CanId) -> bool {
        match *id {
            CanId::Extended(v) => self.ext.iter().any(|&(a, b)| (a..=b).contains(&v)),
            _ => self.admits(id),
        }
    }

    fn insert_ext(&mut self, mut lo: u32, mut hi: u32) -> Result<(), DriverError> {
        let mut merged = self.ext.clone();
        let mut i = 0;
        while i < merged.len() {
            let (a, b) = merged[i];
            if b.saturating_add(1) >= lo && a <= hi.saturating_add(1) {
                lo = lo.min(a);
                hi = hi.max(b);
                merged.remove(i);
            } else {
                i += 1;
            }
        }
        let pos = merged
            .iter()
            .position(|&(a, _)| a > hi)
            .unwrap_or(merged.len());
        merged
            .insert(pos, (lo, hi))
            .map_err(|_| DriverError::InsufficientResources)?;
        self.ext = merged;
        Ok(())
    }

    fn remove_ext(&mut self, lo: u32, hi: u32) -> Result<(), DriverError> {
        let mut kept: heapless::Vec<(u32, u32), { limits::MAX_ID_REGIONS }> = heapless::Vec::new();
        for &(a, b) in self.ext.iter() {
            let parts = if b < lo || a > hi {
                [Some((a, b)), None]
            } else {
                [
                    (a < lo).then(|| (a, lo - 1)),
                    (b > hi).then(|| (hi + 1, b)),
                ]
            };
            for part in parts.into_iter().flatten() {
                kept.push(part)
                    .map_err(|_| DriverError::InsufficientResources)?;
            }
        }
        self.ext = kept;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_filter_admits_all() {
        let f = AcceptanceFilter::new();
        assert!(f.admits(&CanId::std(0x123), FilterClass::DATA));
        assert!(f.admits(&CanId::extended(0x1234567), FilterClass::FD_DATA));
    }

    #[test]
    fn test_filter_classes() {
        let mut f = AcceptanceFilter::new();
        f.set(FilterCmd::On, FilterClass::DATA, FilterTarget::Single(CanId::std(0x72)))
            .unwrap();
        assert!(f.admits(&CanId::std(0x72), FilterClass::DATA));
        assert!(!f.admits(&CanId::std(0x72), FilterClass::RTR));
        assert!(!f.admits(&CanId::std(0x73), FilterClass::DATA));
        // Events pass regardless
        assert!(f.admits(&CanId::event(2), FilterClass::DATA));

        f.set(FilterCmd::On, FilterClass::RTR, FilterTarget::Single(CanId::std(0x72)))
            .unwrap();
        assert!(f.admits(&CanId::std(0x72), FilterClass::RTR));
        f.set(
            FilterCmd::Off,
            FilterClass::DATA | FilterClass::RTR,
            FilterTarget::Single(CanId::std(0x72)),
        )
        .unwrap();
        assert!(f.is_open());
        assert_eq!(
            Err(DriverError::IdNotEnabled),
            f.set(FilterCmd::Off, FilterClass::DATA, FilterTarget::Single(CanId::std(1)))
        );
    }

    #[test]
    fn test_filter_ranges_and_masks() {
        let mut f = AcceptanceFilter::new();
        f.add_ext_region(0x1000, 0x100).unwrap();
        f.set_std_acceptance(0x100, 0x00F).unwrap();
        assert!(f.admits(&CanId::extended(0x10FF), FilterClass::DATA));
        assert!(!f.admits(&CanId::extended(0x1100), FilterClass::DATA));
        assert!(f.admits(&CanId::std(0x10A), FilterClass::OBJ_RTR));
        assert!(!f.admits(&CanId::std(0x110), FilterClass::DATA));

        // A new legacy code/mask replaces the old one
        f.set_std_acceptance(0x200, 0).unwrap();
        assert!(!f.admits(&CanId::std(0x10A), FilterClass::DATA));
        assert!(f.admits(&CanId::std(0x200), FilterClass::DATA));

        assert!(f
            .set(
                FilterCmd::On,
                FilterClass::DATA,
                FilterTarget::Range {
                    first: CanId::std(5),
                    last: CanId::extended(6)
                }
            )
            .is_err());
    }

    #[test]
    fn test_filter_capacity() {
        let mut f = AcceptanceFilter::new();
        for i in 0..limits::MAX_FILTER_ENTRIES as u16 {
            f.set(FilterCmd::On, FilterClass::DATA, FilterTarget::Single(CanId::std(i)))
                .unwrap();
        }
        assert_eq!(
            Err(DriverError::InsufficientResources),
            f.set(FilterCmd::On, FilterClass::DATA, FilterTarget::Single(CanId::std(100)))
        );
    }

    #[test]
    fn test_id_set_single_ids() {
        let mut s = IdSet::new();
        assert!(s.is_empty());
        s.id_add(CanId::std(0x7FF)).unwrap();
        assert_eq!(Err(DriverError::IdAlreadyEnabled), s.id_add(CanId::std(0x7FF)));
        assert!(s.admits(&CanId::std(0x7FF)));
        assert!(!s.admits(&CanId::extended(0x7FF)));
        s.id_delete(CanId::std(0x7FF)).unwrap();
        assert_eq!(Err(DriverError::IdNotEnabled), s.id_delete(CanId::std(0x7FF)));

        s.id_add(CanId::event(2)).unwrap();
        assert!(s.admits(&CanId::event(2)));
        assert!(!s.admits(&CanId::event(3)));
    }

    #[test]
    fn test_id_set_ext_regions_merge_and_split() {
        let mut s = IdSet::new();
        s.id_region_add(CanId::extended(100), 10).unwrap();
        s.id_region_add(CanId::extended(110), 10).unwrap();
        s.id_add(CanId::extended(50)).unwrap();
        assert_eq!(&[(50, 50), (100, 119)], s.ext.as_slice());

        s.id_delete(CanId::extended(105)).unwrap();
        assert_eq!(&[(50, 50), (100, 104), (106, 119)], s.ext.as_slice());
        s.id_region_delete(CanId::extended(0), 103).unwrap();
        assert_eq!(&[(103, 104), (106, 119)], s.ext.as_slice());
        assert!(s.admits(&CanId::extended(119)));
        assert!(!s.admits(&CanId::extended(105)));
    }

    #[test]
    fn test_id_set_20b_mask() {
        let mut s = IdSet::new();
        s.set_20b_filter(0x1234_5600, 0xFF);
        assert!(s.admits(&CanId::extended(0x1234_56AB)));
        assert!(!s.admits(&CanId::extended(0x1234_57AB)));
        // Mask hits do not count as explicitly enabled ids
        assert_eq!(Err(DriverError::IdNotEnabled), s.id_delete(CanId::extended(0x1234_56AB)));
        s.clear_20b_filter();
        assert!(s.is_empty());
    }

    #[test]
    fn test_region_bounds() {
        let mut s = IdSet::new();
        assert!(s.id_region_add(CanId::std(0x7F0), 0x20).is_err());
        assert!(s.id_region_add(CanId::std(0), 0).is_err());
        s.id_region_add(CanId::std(0), 0x800).unwrap();
        assert!(s.admits(&CanId::std(0x7FF)));
    }
}
