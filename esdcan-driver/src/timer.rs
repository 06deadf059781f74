//! Timer subsystem and the monotonic time base
//!
//! Every timestamp handed out by the driver comes from a [`MonotonicClock`]. The clock reads a
//! hardware [`ClockSource`] when one is present, and silently continues from a software counter
//! anchored at the last hardware value whenever the hardware cannot be read.
//!
//! [`Timers`] keeps an arena of timer entries addressed by [`TimerHandle`]. Armed entries are
//! additionally tracked in a min-heap ordered by expiry and arm sequence. Disarming or re-arming
//! does not touch the heap; stale heap records are discarded when they reach the top.
use core::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use critical_section::Mutex;
use defmt_or_log::{debug, trace};
use esdcan_common::{
    duration_to_ticks, ticks_to_duration, traits::ClockSource, AtomicCell, DriverError, Timestamp,
};
use tokio::sync::Notify;

/// Callback run when a timer expires
///
/// Callbacks run without any driver lock held, and may re-arm or destroy their own timer.
pub type TimerCallback = Box<dyn FnMut(TimerHandle) + Send>;

/// Reference to a timer entry
///
/// Handles stay valid until the timer is destroyed. A handle to a destroyed timer is rejected
/// even if its slot has been reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerHandle {
    slot: u32,
    generation: u32,
}

/// What a timer was created for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerOwner {
    /// Card level housekeeping
    Card,
    /// Owned by the node with this index
    Node(u8),
    /// Owned by the error injection unit with this index
    Eei(u8),
}

#[derive(Clone, Copy, Debug)]
struct ClockState {
    last: u64,
    fallback: Option<(u64, Instant)>,
}

impl ClockState {
    fn advance(mut self, hw: Option<u64>, at: Instant, frequency: u64) -> Self {
        match hw {
            Some(ticks) => {
                self.last = self.last.max(ticks);
                self.fallback = None;
            }
            None => {
                let (anchor, since) = *self.fallback.get_or_insert((self.last, at));
                let elapsed = at.saturating_duration_since(since);
                let ticks = anchor.saturating_add(duration_to_ticks(elapsed, frequency));
                self.last = self.last.max(ticks);
            }
        }
        self
    }
}

/// A monotonic tick counter backed by an optional hardware clock
#[allow(missing_debug_implementations)]
pub struct MonotonicClock {
    source: Option<Arc<dyn ClockSource>>,
    frequency: u64,
    state: AtomicCell<ClockState>,
}

impl MonotonicClock {
    /// Create a clock
    ///
    /// The frequency of `source` takes precedence over `frequency` when a source is given.
    pub fn new(source: Option<Arc<dyn ClockSource>>, frequency: u64) -> Self {
        let frequency = source
            .as_ref()
            .map(|s| s.frequency())
            .unwrap_or(frequency)
            .max(1);
        Self {
            source,
            frequency,
            state: AtomicCell::new(ClockState {
                last: 0,
                fallback: None,
            }),
        }
    }

    /// Create a clock driven by the software counter only
    pub fn software(frequency: u64) -> Self {
        Self::new(None, frequency)
    }

    /// Read the current time. Never goes backwards.
    pub fn now(&self) -> Timestamp {
        let hw = self.source.as_ref().and_then(|s| s.ticks());
        let at = Instant::now();
        let mut next = 0;
        // fetch_update always stores here, so the Err arm cannot happen
        let _ = self.state.fetch_update(|st| {
            let st = st.advance(hw, at, self.frequency);
            next = st.last;
            Some(st)
        });
        Timestamp(next)
    }

    /// Tick frequency in Hz
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// True while the software counter stands in for the hardware clock
    pub fn is_fallback(&self) -> bool {
        self.state.load().fallback.is_some()
    }
}

struct TimerEntry {
    owner: TimerOwner,
    callback: Option<TimerCallback>,
    expiry: Option<Timestamp>,
    arm_seq: u64,
    running: bool,
}

struct Slot {
    generation: u32,
    entry: Option<TimerEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Armed {
    expiry: Timestamp,
    seq: u64,
    handle: TimerHandle,
}

#[derive(Default)]
struct TimerState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    active: BinaryHeap<Reverse<Armed>>,
    next_seq: u64,
}

impl TimerState {
    fn entry_mut(&mut self, handle: TimerHandle) -> Option<&mut TimerEntry> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }

    fn is_current(&self, armed: &Armed) -> bool {
        self.slots
            .get(armed.handle.slot as usize)
            .filter(|s| s.generation == armed.handle.generation)
            .and_then(|s| s.entry.as_ref())
            .is_some_and(|e| e.expiry == Some(armed.expiry) && e.arm_seq == armed.seq)
    }

    fn prune(&mut self) {
        while let Some(Reverse(head)) = self.active.peek() {
            if self.is_current(head) {
                break;
            }
            self.active.pop();
        }
    }

    fn earliest(&mut self) -> Option<Timestamp> {
        self.prune();
        self.active.peek().map(|Reverse(a)| a.expiry)
    }

    /// Remove the earliest entry due at or before `horizon` from the active set and take its
    /// callback
    fn pop_due(&mut self, horizon: Timestamp) -> Option<(TimerHandle, TimerCallback)> {
        self.prune();
        let Reverse(head) = *self.active.peek()?;
        if head.expiry > horizon {
            return None;
        }
        self.active.pop();
        let entry = self.entry_mut(head.handle)?;
        match entry.callback.take() {
            Some(cb) => {
                entry.expiry = None;
                entry.running = true;
                Some((head.handle, cb))
            }
            None => {
                // Callback is out with another processing pass; leave it armed for that pass
                self.active.push(Reverse(head));
                None
            }
        }
    }

    fn finish(&mut self, handle: TimerHandle, callback: TimerCallback) {
        if let Some(entry) = self.entry_mut(handle) {
            entry.callback = Some(callback);
            entry.running = false;
        }
    }
}

/// The timer subsystem of one card
pub struct Timers {
    clock: MonotonicClock,
    calibration: u64,
    state: Mutex<RefCell<TimerState>>,
    alarm: Notify,
}

impl core::fmt::Debug for Timers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timers")
            .field("frequency", &self.frequency())
            .field("calibration", &self.calibration)
            .finish_non_exhaustive()
    }
}

impl Timers {
    /// Create a timer subsystem
    ///
    /// `calibration` is the fixed dispatch latency in ticks. It is subtracted from elapsed
    /// durations and alarms are programmed this many ticks early.
    pub fn new(clock: MonotonicClock, calibration: u64) -> Self {
        Self {
            clock,
            calibration,
            state: Mutex::new(RefCell::new(TimerState::default())),
            alarm: Notify::new(),
        }
    }

    /// Create a new, disarmed timer
    pub fn create(&self, owner: TimerOwner, callback: TimerCallback) -> TimerHandle {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let entry = TimerEntry {
                owner,
                callback: Some(callback),
                expiry: None,
                arm_seq: 0,
                running: false,
            };
            let slot = match state.free.pop() {
                Some(slot) => slot,
                None => {
                    state.slots.push(Slot {
                        generation: 0,
                        entry: None,
                    });
                    (state.slots.len() - 1) as u32
                }
            };
            let s = &mut state.slots[slot as usize];
            s.entry = Some(entry);
            TimerHandle {
                slot,
                generation: s.generation,
            }
        })
    }

    /// Arm a timer to expire `duration` from now, replacing any earlier arming
    pub fn arm(&self, handle: TimerHandle, duration: Duration) -> Result<(), DriverError> {
        let expiry = self
            .now()
            .saturating_add(duration_to_ticks(duration, self.frequency()));
        self.arm_at(handle, expiry)
    }

    /// Arm a timer to expire at an absolute time, replacing any earlier arming
    pub fn arm_at(&self, handle: TimerHandle, expiry: Timestamp) -> Result<(), DriverError> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = state.entry_mut(handle).ok_or(DriverError::InvalidHandle)?;
            entry.expiry = Some(expiry);
            entry.arm_seq = seq;
            trace!("Arming timer {:?} for {:?} at {}", handle, entry.owner, expiry.ticks());
            state.active.push(Reverse(Armed {
                expiry,
                seq,
                handle,
            }));
            Ok::<(), DriverError>(())
        })?;
        self.alarm.notify_one();
        Ok(())
    }

    /// Disarm a timer. Returns true if it was armed.
    pub fn disarm(&self, handle: TimerHandle) -> Result<bool, DriverError> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let entry = state.entry_mut(handle).ok_or(DriverError::InvalidHandle)?;
            Ok(entry.expiry.take().is_some())
        })
    }

    /// Destroy a timer. The handle becomes invalid.
    pub fn destroy(&self, handle: TimerHandle) -> Result<(), DriverError> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let slot = state
                .slots
                .get_mut(handle.slot as usize)
                .filter(|s| s.generation == handle.generation && s.entry.is_some())
                .ok_or(DriverError::InvalidHandle)?;
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            state.free.push(handle.slot);
            Ok(())
        })
    }

    /// True if the timer is armed
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        critical_section::with(|cs| {
            self.state
                .borrow_ref_mut(cs)
                .entry_mut(handle)
                .is_some_and(|e| e.expiry.is_some())
        })
    }

    /// True while the timer's callback is executing
    pub fn is_running(&self, handle: TimerHandle) -> bool {
        critical_section::with(|cs| {
            self.state
                .borrow_ref_mut(cs)
                .entry_mut(handle)
                .is_some_and(|e| e.running)
        })
    }

    /// Current time
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Tick frequency in Hz
    pub fn frequency(&self) -> u64 {
        self.clock.frequency()
    }

    /// The clock backing this timer subsystem
    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    /// The dispatch latency compensation, in ticks
    pub fn calibration(&self) -> u64 {
        self.calibration
    }

    /// Calibrated number of ticks elapsed since `since`
    pub fn elapsed(&self, since: Timestamp) -> u64 {
        self.now()
            .ticks_since(since)
            .saturating_sub(self.calibration)
    }

    /// When the next alarm has to be raised, or `None` if no timer is armed
    pub fn next_alarm(&self) -> Option<Timestamp> {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).earliest())
            .map(|t| t.saturating_sub(self.calibration))
    }

    /// Fire every timer which is due at `now`, in expiry order
    ///
    /// Returns the number of callbacks run. Must only be called from one context at a time.
    pub fn process(&self, now: Timestamp) -> usize {
        let horizon = now.saturating_add(self.calibration);
        let mut fired = 0;
        loop {
            let due = critical_section::with(|cs| self.state.borrow_ref_mut(cs).pop_due(horizon));
            let Some((handle, mut callback)) = due else {
                break;
            };
            callback(handle);
            fired += 1;
            critical_section::with(|cs| self.state.borrow_ref_mut(cs).finish(handle, callback));
        }
        if fired > 0 {
            debug!("Fired {} timers at {}", fired, now.ticks());
        }
        fired
    }

    /// Run the software alarm loop
    ///
    /// Sleeps until the earliest armed timer is due, processes it, and repeats. Never returns.
    pub async fn run(&self) {
        loop {
            let notified = self.alarm.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.process(self.now());
            match self.next_alarm() {
                Some(at) => {
                    let wait = ticks_to_duration(at.ticks_since(self.now()), self.frequency());
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    use assertables::assert_ge;

    use super::*;

    const FREQ: u64 = 1_000_000;

    fn timers() -> Timers {
        Timers::new(MonotonicClock::software(FREQ), 0)
    }

    fn recorder(log: &Arc<StdMutex<Vec<u32>>>, tag: u32) -> TimerCallback {
        let log = log.clone();
        Box::new(move |_| log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_timers_fire_in_expiry_order() {
        let t = timers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let expiries = [50u64, 10, 40, 20, 30];
        for (i, e) in expiries.iter().enumerate() {
            let h = t.create(TimerOwner::Card, recorder(&log, i as u32));
            t.arm_at(h, Timestamp(*e)).unwrap();
        }
        assert_eq!(Some(Timestamp(10)), t.next_alarm());
        assert_eq!(3, t.process(Timestamp(30)));
        assert_eq!(2, t.process(Timestamp(100)));
        assert_eq!(vec![1, 3, 4, 2, 0], *log.lock().unwrap());
        assert_eq!(None, t.next_alarm());
    }

    #[test]
    fn test_equal_expiry_fires_in_arm_order() {
        let t = timers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..4 {
            let h = t.create(TimerOwner::Node(0), recorder(&log, i));
            t.arm_at(h, Timestamp(5)).unwrap();
        }
        t.process(Timestamp(5));
        assert_eq!(vec![0, 1, 2, 3], *log.lock().unwrap());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let t = timers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let a = t.create(TimerOwner::Card, recorder(&log, 1));
        let b = t.create(TimerOwner::Card, recorder(&log, 2));
        let c = t.create(TimerOwner::Card, recorder(&log, 3));
        t.arm_at(a, Timestamp(10)).unwrap();
        t.arm_at(b, Timestamp(20)).unwrap();
        t.arm_at(c, Timestamp(30)).unwrap();
        assert!(t.disarm(b).unwrap());
        assert!(!t.disarm(b).unwrap());
        t.destroy(c).unwrap();
        t.process(Timestamp(1000));
        assert_eq!(vec![1], *log.lock().unwrap());
        assert_eq!(Err(DriverError::InvalidHandle), t.arm_at(c, Timestamp(0)));
    }

    #[test]
    fn test_rearm_moves_expiry() {
        let t = timers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let a = t.create(TimerOwner::Card, recorder(&log, 1));
        t.arm_at(a, Timestamp(10)).unwrap();
        t.arm_at(a, Timestamp(50)).unwrap();
        assert_eq!(0, t.process(Timestamp(20)));
        assert_eq!(1, t.process(Timestamp(50)));
        // Fired once only, for the latest arming
        assert_eq!(0, t.process(Timestamp(100)));
    }

    #[test]
    fn test_callback_may_rearm_itself() {
        let t = Arc::new(timers());
        let count = Arc::new(AtomicU64::new(0));
        let cb = {
            let t = Arc::downgrade(&t);
            let count = count.clone();
            Box::new(move |h: TimerHandle| {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    if let Some(t) = t.upgrade() {
                        t.arm_at(h, Timestamp(n * 100)).unwrap();
                    }
                }
            })
        };
        let h = t.create(TimerOwner::Card, cb);
        t.arm_at(h, Timestamp(0)).unwrap();
        t.process(Timestamp(0));
        assert!(t.is_armed(h));
        assert!(!t.is_running(h));
        t.process(Timestamp(100));
        t.process(Timestamp(200));
        assert_eq!(3, count.load(Ordering::SeqCst));
        assert!(!t.is_armed(h));
    }

    #[test]
    fn test_slot_reuse_invalidates_old_handle() {
        let t = timers();
        let a = t.create(TimerOwner::Card, Box::new(|_| {}));
        t.destroy(a).unwrap();
        let b = t.create(TimerOwner::Card, Box::new(|_| {}));
        assert_ne!(a, b);
        assert_eq!(Err(DriverError::InvalidHandle), t.destroy(a));
        assert!(t.destroy(b).is_ok());
    }

    #[test]
    fn test_calibration() {
        let hw = Arc::new(FlakyClock {
            ticks: AtomicU64::new(5_000),
            present: AtomicBool::new(true),
        });
        let t = Timers::new(MonotonicClock::new(Some(hw), FREQ), 40);
        let h = t.create(TimerOwner::Card, Box::new(|_| {}));
        t.arm_at(h, Timestamp(1000)).unwrap();
        assert_eq!(Some(Timestamp(960)), t.next_alarm());
        // Due within the calibration window
        assert_eq!(1, t.process(Timestamp(965)));

        assert_eq!(Timestamp(5_000), t.now());
        assert_eq!(5_000 - 1_000 - 40, t.elapsed(Timestamp(1_000)));
        // Shorter than the calibration constant
        assert_eq!(0, t.elapsed(Timestamp(4_980)));
        assert_eq!(0, t.elapsed(Timestamp(u64::MAX)));
    }

    struct FlakyClock {
        ticks: AtomicU64,
        present: AtomicBool,
    }

    impl ClockSource for FlakyClock {
        fn ticks(&self) -> Option<u64> {
            self.present
                .load(Ordering::SeqCst)
                .then(|| self.ticks.load(Ordering::SeqCst))
        }

        fn frequency(&self) -> u64 {
            FREQ
        }
    }

    #[test]
    fn test_clock_falls_back_to_software() {
        let hw = Arc::new(FlakyClock {
            ticks: AtomicU64::new(5_000_000),
            present: AtomicBool::new(true),
        });
        let clock = MonotonicClock::new(Some(hw.clone()), 1);
        assert_eq!(FREQ, clock.frequency());
        assert_eq!(Timestamp(5_000_000), clock.now());
        assert!(!clock.is_fallback());

        hw.present.store(false, Ordering::SeqCst);
        let t1 = clock.now();
        assert!(clock.is_fallback());
        assert_ge!(t1, Timestamp(5_000_000));
        std::thread::sleep(Duration::from_millis(2));
        let t2 = clock.now();
        assert_ge!(t2.ticks_since(t1), 1000);

        // Hardware comes back behind the software count: time must not go backwards
        hw.ticks.store(5_000_001, Ordering::SeqCst);
        hw.present.store(true, Ordering::SeqCst);
        let t3 = clock.now();
        assert_ge!(t3, t2);
        assert!(!clock.is_fallback());
    }
}
