//! tilesync: distributed SDR tile node
//!
//! Each tile of a distributed antenna array runs one node. Nodes share a
//! 10 MHz reference and a PPS edge; the node aligns its device time to the
//! shared zero, tunes all chains at one instant, and measures the phase of
//! its own transmit path through an internal loopback so the array can be
//! phase-aligned.
//!
//! ## Architecture
//!
//! - **radio**: capability interface of the front-end, simulated backend,
//!   loopback switch and bring-up
//! - **sync**: reference-clock lock, PPS time alignment, timed tuning
//! - **calibration**: tone waveform, burst activities, phase estimation
//! - **scheduler**: controller commands mapped onto the node state machine
//! - **transport**: command/event channel to the controller
//! - **storage**: measurement log and process lock

pub mod calibration;
pub mod config;
pub mod exit_code;
pub mod radio;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::{NodeConfig, WeightsTable};
pub use exit_code::NodeExit;
pub use radio::{HwTime, RadioDevice, SimRadio};
pub use scheduler::{CommandScheduler, NodeState};
pub use transport::{ChannelTransport, CommandTransport, LineTransport};
