//! Node state machine.
//!
//! ```text
//!            SYNC                ok
//!   Idle ──────────► Syncing ──────────► Ready ◄──────────┐
//!    ▲                  │ fail           │  │             │ done / STOP
//!    └──────────────────┘        CAL/PILOT  START         │
//!                                        ▼  ▼             │
//!                               Measuring  Transmitting ──┘
//!
//!   any ── ABORT ──► Stopped ── SYNC ──► Syncing
//! ```

use serde::Serialize;
use std::fmt;

use super::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum NodeState {
    #[default]
    Idle,
    Syncing,
    Ready,
    Measuring,
    Transmitting,
    Stopped,
}

impl NodeState {
    /// Whether `command` may be accepted in this state.
    ///
    /// STATUS, STOP and ABORT are accepted everywhere.
    pub const fn accepts(self, command: &Command) -> bool {
        match command {
            Command::Status { .. } | Command::Stop(_) | Command::Abort { .. } => true,
            Command::Sync(_) => matches!(self, Self::Idle | Self::Stopped),
            Command::Cal(_) | Command::Pilot(_) | Command::Start(_) => matches!(self, Self::Ready),
            Command::Setup(_) => matches!(self, Self::Idle | Self::Ready | Self::Stopped),
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Syncing => "SYNCING",
            Self::Ready => "READY",
            Self::Measuring => "MEASURING",
            Self::Transmitting => "TRANSMITTING",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}
