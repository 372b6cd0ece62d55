//! Node-local persistence
//!
//! Two files live in the data directory: the PID lock that keeps a second
//! node process off the same front-end, and one append-only measurement log
//! per SYNC session.

pub mod lockfile;
pub mod measurement_log;

pub use lockfile::{LockError, NodeLock};
pub use measurement_log::{LogError, MeasurementLog};
