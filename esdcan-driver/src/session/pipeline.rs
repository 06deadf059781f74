//! Per direction state of a session
//!
//! Each direction of a session is a [`Pipeline`]: a tagged state plus an orthogonal cancellation
//! request. All transitions happen under the session lock. A blocked caller holds the direction
//! in its pending state; exactly one of completion, timeout, cancellation or close moves it out
//! again.
use esdcan_common::DriverError;

/// Why a pending call was asked to return early
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CancelReason {
    /// Explicit abort of the direction
    Abort,
    /// The blocked caller was interrupted
    Interrupt,
}

impl From<CancelReason> for DriverError {
    fn from(value: CancelReason) -> Self {
        match value {
            CancelReason::Abort => DriverError::Aborted,
            CancelReason::Interrupt => DriverError::Interrupted,
        }
    }
}

/// Receive direction state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    /// No call in progress
    Idle,
    /// A read is blocked waiting for messages
    PendingRead {
        /// Number of messages requested
        requested: usize,
    },
    /// The session is being torn down
    Closing {
        /// Torn down because the device went away
        forced: bool,
    },
}

/// Transmit direction state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxState {
    /// No call in progress
    Idle,
    /// A write is still copying frames into the transmit queue
    PendingWrite {
        /// Number of frames in the call
        requested: usize,
        /// Number of frames queued so far
        queued: usize,
    },
    /// Every frame of a write is queued; waiting for them to complete
    PendingSend {
        /// Number of frames in the call
        requested: usize,
        /// Number of frames completed so far
        completed: usize,
    },
    /// The session is being torn down
    Closing {
        /// Torn down because the device went away
        forced: bool,
    },
}

pub(crate) trait PipeState: Copy {
    const IDLE: Self;

    fn closing(forced: bool) -> Self;

    /// `Some(forced)` while closing
    fn closed(&self) -> Option<bool>;

    fn is_pending(&self) -> bool;
}

impl PipeState for RxState {
    const IDLE: Self = RxState::Idle;

    fn closing(forced: bool) -> Self {
        RxState::Closing { forced }
    }

    fn closed(&self) -> Option<bool> {
        match self {
            RxState::Closing { forced } => Some(*forced),
            _ => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, RxState::PendingRead { .. })
    }
}

impl PipeState for TxState {
    const IDLE: Self = TxState::Idle;

    fn closing(forced: bool) -> Self {
        TxState::Closing { forced }
    }

    fn closed(&self) -> Option<bool> {
        match self {
            TxState::Closing { forced } => Some(*forced),
            _ => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(
            self,
            TxState::PendingWrite { .. } | TxState::PendingSend { .. }
        )
    }
}

/// One direction of a session
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pipeline<S> {
    pub state: S,
    pub cancel: Option<CancelReason>,
    pub waiters: u32,
}

impl<S: PipeState> Pipeline<S> {
    pub fn new() -> Self {
        Self {
            state: S::IDLE,
            cancel: None,
            waiters: 0,
        }
    }

    /// Fails once the direction is closing
    pub fn check_open(&self) -> Result<(), DriverError> {
        match self.state.closed() {
            Some(true) => Err(DriverError::ForcedClose),
            Some(false) => Err(DriverError::Closed),
            None => Ok(()),
        }
    }

    /// Enter a pending state
    ///
    /// `busy` is returned when another call already holds the direction.
    pub fn begin(&mut self, pending: S, busy: DriverError) -> Result<(), DriverError> {
        self.check_open()?;
        if self.state.is_pending() {
            return Err(busy);
        }
        self.state = pending;
        self.cancel = None;
        self.waiters += 1;
        Ok(())
    }

    /// Check for a terminal condition, in priority order: close, then cancellation
    pub fn check_terminal(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        match self.cancel.take() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Leave the pending state
    ///
    /// Returns true if the direction is closing and the closer is waiting for this call to
    /// acknowledge.
    pub fn finish(&mut self) -> bool {
        self.waiters = self.waiters.saturating_sub(1);
        self.cancel = None;
        if self.state.closed().is_some() {
            true
        } else {
            self.state = S::IDLE;
            false
        }
    }

    /// Ask a pending call to return. Returns false if nothing is pending.
    pub fn request_cancel(&mut self, reason: CancelReason) -> bool {
        if self.state.is_pending() {
            self.cancel = Some(reason);
            true
        } else {
            false
        }
    }

    /// Move to closing. Returns the number of calls which still have to acknowledge.
    pub fn close(&mut self, forced: bool) -> u32 {
        let forced = forced || self.state.closed() == Some(true);
        self.state = S::closing(forced);
        self.waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_call_is_rejected() {
        let mut p = Pipeline::<RxState>::new();
        p.begin(RxState::PendingRead { requested: 4 }, DriverError::PendingRead)
            .unwrap();
        assert_eq!(
            Err(DriverError::PendingRead),
            p.begin(RxState::PendingRead { requested: 1 }, DriverError::PendingRead)
        );
        assert!(!p.finish());
        assert_eq!(RxState::Idle, p.state);
        assert_eq!(0, p.waiters);
    }

    #[test]
    fn test_close_wins_over_cancel() {
        let mut p = Pipeline::<TxState>::new();
        p.begin(
            TxState::PendingWrite {
                requested: 2,
                queued: 0,
            },
            DriverError::PendingWrite,
        )
        .unwrap();
        assert!(p.request_cancel(CancelReason::Interrupt));
        assert_eq!(1, p.close(false));
        assert_eq!(Err(DriverError::Closed), p.check_terminal());
        assert!(p.finish());
        // Closing is terminal
        assert_eq!(TxState::Closing { forced: false }, p.state);
        assert_eq!(
            Err(DriverError::Closed),
            p.begin(TxState::Idle, DriverError::PendingWrite)
        );
        p.close(true);
        assert_eq!(Err(DriverError::ForcedClose), p.check_open());
    }

    #[test]
    fn test_cancel_only_applies_to_pending_calls() {
        let mut p = Pipeline::<RxState>::new();
        assert!(!p.request_cancel(CancelReason::Abort));
        p.begin(RxState::PendingRead { requested: 1 }, DriverError::PendingRead)
            .unwrap();
        assert!(p.request_cancel(CancelReason::Abort));
        assert_eq!(Err(DriverError::Aborted), p.check_terminal());
        // The request is consumed by the call that observed it
        assert_eq!(Ok(()), p.check_terminal());
    }
}
