//! Loopback Calibration
//!
//! ```text
//!            enable switch
//!                 │
//!   ┌─────────────┼──────────────┐   all three reference the same `at`
//!   ▼             ▼              ▼
//! transmit     metadata        receive ── ref_rx + loopback_rx
//!   │          monitor           │
//!   └──── quit ───┴──── join ────┘
//!                 │
//!           disable switch
//!                 │
//!           PhaseEstimator ──► single-slot handoff ──► scheduler
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::radio::{HwTime, RadioError};
use crate::sync::SessionId;

pub mod burst;
pub mod handoff;
pub mod phase;
pub mod pipeline;
pub mod waveform;

pub use burst::{BurstOutcome, BurstState, TxEventCounts};
pub use handoff::{result_slot, ResultPublisher, ResultReceiver};
pub use phase::{wrap_phase, PhaseError, PhaseEstimate, PhaseEstimator};
pub use pipeline::{BurstReport, LoopbackCalibrationPipeline, PilotRole};
pub use waveform::ReferenceTone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementMode {
    /// Internal loopback through the RF switch.
    Loopback,
    /// Over-the-air pilot between tiles.
    Pilot,
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loopback => write!(f, "LB"),
            Self::Pilot => write!(f, "PILOT"),
        }
    }
}

/// One phase measurement, produced exactly once per completed measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub session: SessionId,
    pub mode: MeasurementMode,
    pub reference_phase: f64,
    pub measured_phase: f64,
    /// Radians, wrapped to (-π, π]
    pub phase_difference: f64,
    /// Measured / reference magnitude at the tone bin
    pub amplitude: Option<f64>,
    /// Device time of the first captured sample
    pub captured_at: HwTime,
    pub recorded_at: DateTime<Utc>,
    /// Switch unavailable or tx errors during the burst
    pub degraded: bool,
}

impl CalibrationResult {
    pub fn phase_degrees(&self) -> f64 {
        self.phase_difference.to_degrees()
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("measurement time {at} is not in the future (now {now})")]
    Late { at: HwTime, now: HwTime },

    #[error("measurement cancelled")]
    Cancelled,

    #[error("receive capture missing")]
    MissingCapture,

    #[error("channel {0} not in capture")]
    MissingChannel(usize),

    #[error("result handoff closed")]
    HandoffClosed,

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Radio(#[from] RadioError),
}
