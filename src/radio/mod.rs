//! Radio Front-End Capability
//!
//! Abstraction over the physical SDR front-end. The node never talks to a
//! driver directly; everything it needs from the hardware goes through
//! [`RadioDevice`] and the stream handles it hands out.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  sync::* / calibration::* / scheduler                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  RadioDevice   TxStream   TxEventSource   RxStream        │
//! │  LoopbackSwitch (register-backed)                         │
//! ├───────────────────────────────────────────────────────────┤
//! │  SimRadio (in-memory)  |  driver bindings (external)      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every timed operation is expressed as an absolute [`HwTime`] on the
//! device clock. The device clock only becomes meaningful across tiles after
//! the time alignment sequence has latched time zero on a PPS edge.

use async_trait::async_trait;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod setup;
pub mod sim;
pub mod switch;

pub use setup::{bring_up, AppliedGain, SetupError, SetupReport};
pub use sim::{SimBurst, SimOptions, SimRadio, TuneRecord};
pub use switch::{LoopbackSwitch, RegisterSwitch};

/// Complex baseband sample as carried on the streams (fc32).
pub type Sample = Complex32;

// ============================================================================
// Device Time
// ============================================================================

/// Absolute instant on the front-end's hardware clock, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct HwTime(f64);

impl HwTime {
    pub const ZERO: Self = Self(0.0);

    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn from_millis(ms: u64) -> Self {
        Self(ms as f64 / 1000.0)
    }

    pub const fn as_secs(self) -> f64 {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn as_millis(self) -> i64 {
        (self.0 * 1000.0).round() as i64
    }

    /// Time remaining from `earlier` until `self`, or `None` if `self` is not later.
    pub fn duration_since(self, earlier: Self) -> Option<Duration> {
        let delta = self.0 - earlier.0;
        (delta > 0.0).then(|| Duration::from_secs_f64(delta))
    }
}

impl Add<Duration> for HwTime {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.as_secs_f64())
    }
}

impl Sub for HwTime {
    type Output = f64;

    fn sub(self, rhs: Self) -> f64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for HwTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.0)
    }
}

// ============================================================================
// Device Enums
// ============================================================================

/// Reference clock input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    #[default]
    Internal,
    External,
    Gpsdo,
}

/// Source of the PPS edge used to latch the time counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    #[default]
    Internal,
    External,
}

/// Signal direction of a front-end chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub const fn opposite(self) -> Self {
        match self {
            Self::Rx => Self::Tx,
            Self::Tx => Self::Rx,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "rx"),
            Self::Tx => write!(f, "tx"),
        }
    }
}

// ============================================================================
// Tuning
// ============================================================================

/// How the driver is allowed to pick the RF or DSP part of a tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunePolicy {
    /// Driver chooses.
    Auto,
    /// Use the value in the request as-is.
    Manual,
    /// Leave untouched.
    None,
}

/// Synthesizer mode for the RF local oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthMode {
    /// Integer-N: the LO lands exactly on the requested frequency.
    Integer,
    /// Fractional-N: finer resolution, small residual absorbed by the DSP mixer.
    Fractional,
}

/// Request sent to one chain of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRequest {
    pub target_freq: f64,
    pub rf_freq: f64,
    pub dsp_freq: f64,
    pub rf_policy: TunePolicy,
    pub dsp_policy: TunePolicy,
    pub synth_mode: SynthMode,
}

impl TuneRequest {
    /// Manual RF, zero DSP shift.
    pub const fn manual(freq: f64, synth_mode: SynthMode) -> Self {
        Self {
            target_freq: freq,
            rf_freq: freq,
            dsp_freq: 0.0,
            rf_policy: TunePolicy::Manual,
            dsp_policy: TunePolicy::Manual,
            synth_mode,
        }
    }
}

/// What the driver actually did for a tune request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneResult {
    pub target_rf_freq: f64,
    pub actual_rf_freq: f64,
    pub target_dsp_freq: f64,
    pub actual_dsp_freq: f64,
}

impl fmt::Display for TuneResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target RF {:.6} MHz, actual RF {:.6} MHz, target DSP {:.6} MHz, actual DSP {:.6} MHz",
            self.target_rf_freq / 1e6,
            self.actual_rf_freq / 1e6,
            self.target_dsp_freq / 1e6,
            self.actual_dsp_freq / 1e6
        )
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// Metadata accompanying one transmit packet.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TxMetadata {
    /// Start transmitting at this device time (first packet of a burst only).
    pub time_spec: Option<HwTime>,
    pub start_of_burst: bool,
    /// No further samples follow.
    pub end_of_burst: bool,
}

impl TxMetadata {
    pub const fn timed_start(at: HwTime) -> Self {
        Self {
            time_spec: Some(at),
            start_of_burst: true,
            end_of_burst: false,
        }
    }

    pub const fn continuation() -> Self {
        Self {
            time_spec: None,
            start_of_burst: false,
            end_of_burst: false,
        }
    }

    pub const fn end_of_burst() -> Self {
        Self {
            time_spec: None,
            start_of_burst: false,
            end_of_burst: true,
        }
    }
}

/// Asynchronous transmit-side event reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxEventKind {
    /// End-of-burst was consumed by the hardware.
    BurstAck,
    /// The host did not deliver samples fast enough.
    Underflow,
    /// Packet sequence gap.
    SequenceError,
    /// Timed packet arrived after its time spec.
    TimeError,
}

impl TxEventKind {
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::BurstAck)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxEvent {
    pub kind: TxEventKind,
    pub channel: usize,
    pub time: Option<HwTime>,
}

/// Samples captured by a receive stream, one vector per stream channel.
#[derive(Debug, Clone, Default)]
pub struct RxCapture {
    /// Device channel index for each entry of `samples`.
    pub channels: Vec<usize>,
    pub samples: Vec<Vec<Sample>>,
    /// Timestamp of the first sample.
    pub start: HwTime,
    pub sample_rate: f64,
    /// Capture ended early on the quit signal.
    pub truncated: bool,
}

impl RxCapture {
    /// Samples for one device channel.
    pub fn channel(&self, channel: usize) -> Option<&[Sample]> {
        self.channels
            .iter()
            .position(|&c| c == channel)
            .map(|i| self.samples[i].as_slice())
    }

    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device time of sample `index`.
    #[allow(clippy::cast_precision_loss)]
    pub fn timestamp(&self, index: usize) -> HwTime {
        HwTime::from_secs(self.start.as_secs() + index as f64 / self.sample_rate)
    }
}

#[async_trait]
pub trait TxStream: Send {
    fn channels(&self) -> &[usize];

    /// Samples per channel per packet.
    fn max_samples_per_packet(&self) -> usize;

    /// Send one packet (one buffer per stream channel). Returns samples sent per channel.
    async fn send(&mut self, buffers: &[Vec<Sample>], metadata: &TxMetadata) -> RadioResult<usize>;
}

/// Async event channel belonging to a transmit stream.
#[async_trait]
pub trait TxEventSource: Send {
    /// Wait up to `timeout` for the next event. `Ok(None)` on timeout.
    async fn recv_event(&mut self, timeout: Duration) -> RadioResult<Option<TxEvent>>;
}

#[async_trait]
pub trait RxStream: Send {
    fn channels(&self) -> &[usize];

    /// Capture `duration` worth of samples starting exactly at `start`.
    ///
    /// Returns early (with `truncated` set) when `quit` fires.
    async fn receive(
        &mut self,
        start: HwTime,
        duration: Duration,
        quit: &CancellationToken,
    ) -> RadioResult<RxCapture>;
}

/// Transmit stream plus its event channel, owned by separate activities.
pub struct TxHandles {
    pub stream: Box<dyn TxStream>,
    pub events: Box<dyn TxEventSource>,
}

// ============================================================================
// Device Capability
// ============================================================================

/// The capability set the node requires from a front-end.
#[async_trait]
pub trait RadioDevice: Send + Sync {
    fn description(&self) -> String;

    fn num_boards(&self) -> usize;

    fn num_channels(&self) -> usize;

    async fn set_master_clock_rate(&self, rate: f64) -> RadioResult<f64>;

    async fn set_clock_source(&self, source: ClockSource) -> RadioResult<()>;

    async fn set_time_source(&self, source: TimeSource) -> RadioResult<()>;

    /// `ref_locked` sensor of one board.
    async fn ref_locked(&self, board: usize) -> RadioResult<bool>;

    /// `lo_locked` sensor of the rx or tx synthesizer.
    async fn lo_locked(&self, direction: Direction) -> RadioResult<bool>;

    async fn set_rate(&self, direction: Direction, channel: usize, rate: f64) -> RadioResult<f64>;

    async fn set_rx_bandwidth(&self, channel: usize, bandwidth: f64) -> RadioResult<f64>;

    async fn set_gain(&self, direction: Direction, channel: usize, gain_db: f64) -> RadioResult<()>;

    /// DC-offset correction and AGC of an rx chain.
    async fn set_rx_frontend(&self, channel: usize, dc_offset: bool, agc: bool) -> RadioResult<()>;

    /// Apply `request` to one chain at device time `at`.
    async fn tune_channel(
        &self,
        direction: Direction,
        channel: usize,
        request: &TuneRequest,
        at: HwTime,
    ) -> RadioResult<TuneResult>;

    async fn time_now(&self) -> RadioResult<HwTime>;

    /// Latch `time` into the counter on the next PPS edge (not immediately).
    async fn set_time_next_pps(&self, time: HwTime) -> RadioResult<()>;

    async fn open_tx_stream(&self, channels: &[usize]) -> RadioResult<TxHandles>;

    async fn open_rx_stream(&self, channels: &[usize]) -> RadioResult<Box<dyn RxStream>>;

    async fn poke32(&self, bank: usize, addr: u32, value: u32) -> RadioResult<()>;

    async fn peek32(&self, bank: usize, addr: u32) -> RadioResult<u32>;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    #[error("invalid channel {0}")]
    InvalidChannel(usize),

    #[error("invalid board {0}")]
    InvalidBoard(usize),

    #[error("register bank {bank} addr {addr:#x} unavailable: {reason}")]
    Register { bank: usize, addr: u32, reason: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("requested time {at} already passed (now {now})")]
    Late { at: HwTime, now: HwTime },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type RadioResult<T> = Result<T, RadioError>;
