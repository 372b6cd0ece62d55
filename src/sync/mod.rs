//! Synchronization
//!
//! ```text
//! SYNC <session> ──► TimeAlignmentCoordinator ──► TuningEngine ──► Ready
//!                    (time zero on PPS edge)      (timed tune, LO lock)
//! ```
//!
//! [`ClockLockManager`] runs once at bring-up; the other two run for every
//! SYNC session, strictly in that order.

pub mod clock_lock;
pub mod time_align;
pub mod tuning;

pub use clock_lock::ClockLockManager;
pub use time_align::{
    sync_channel, AlignedSession, SessionId, SyncError, SyncTrigger, SyncWaiter,
    TimeAlignmentCoordinator,
};
pub use tuning::{ChainTune, LockOutcome, TuneError, TuneReport, TuningEngine};
