//! System-wide default constants.
//!
//! Reference values for the operator-tunable settings in `node_config.rs`,
//! plus the handful of constants that are not exposed in the config file.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Configuration Discovery
// ============================================================================

/// Environment variable consulted when `--config-file` is not given.
pub const CONFIG_ENV_VAR: &str = "TILESYNC_CONFIG";

/// Tile identity used when neither the config nor `$HOSTNAME` provide one.
pub const FALLBACK_TILE_NAME: &str = "localhost";

// ============================================================================
// Radio
// ============================================================================

/// Baseband sample rate (samples/s).
pub const SAMPLE_RATE: f64 = 1e6;

/// Master clock rate (Hz). Must be an integer multiple of the sample rate.
pub const MASTER_CLOCK_RATE: f64 = 20e6;

/// Carrier frequency (Hz).
pub const CENTER_FREQUENCY: f64 = 920e6;

/// Analog rx filter bandwidth (Hz).
pub const RX_BANDWIDTH: f64 = 200e3;

/// Offset applied to the chain that does not carry the internal LO (Hz).
///
/// The receive tone lands at this baseband frequency.
pub const TUNE_OFFSET_HZ: f64 = 1e3;

// ============================================================================
// Gains (dB)
// ============================================================================

pub const LOOPBACK_TX_GAIN_DB: f64 = 36.0;
pub const FREE_TX_GAIN_DB: f64 = 50.0;
pub const LOOPBACK_RX_GAIN_DB: f64 = 22.0;
pub const REF_RX_GAIN_DB: f64 = 22.0;

/// Upper bound accepted for any gain setting.
pub const MAX_GAIN_DB: f64 = 90.0;

// ============================================================================
// Timing
// ============================================================================

/// External reference lock timeout (ms).
pub const CLOCK_LOCK_TIMEOUT_MS: u64 = 1_000;

/// LO lock timeout after a timed tune (ms).
pub const LO_LOCK_TIMEOUT_MS: u64 = 5_000;

/// How long time alignment waits for the sync signal (ms).
pub const SYNC_TIMEOUT_MS: u64 = 10_000;

/// Interval between PPS edges (ms).
pub const PPS_PERIOD_MS: u64 = 1_000;

/// Hold after arming the PPS reset, two full PPS periods (ms).
pub const PPS_SETTLE_MS: u64 = 2 * PPS_PERIOD_MS;

/// Lead between time zero and the timed tune (ms).
pub const BEGIN_TIME_MS: u64 = 5_000;

/// Loopback capture duration (ms).
pub const CAPTURE_TIME_MS: u64 = 2_000;

/// Default burst length for START without `duration_ms` (ms).
pub const TX_TIME_MS: u64 = 10_000;

/// Longest capture or burst a command may request (ms).
pub const MAX_CAPTURE_MS: u64 = 60_000;

/// Slack added on top of `capture + (at - now)` before quit is raised (ms).
pub const SCHEDULING_SLACK_MS: u64 = 500;

/// Grace period for joining burst activities after quit (ms).
pub const JOIN_GRACE_MS: u64 = 2_000;

/// Lead used to turn "as soon as possible" into a timed command (ms).
pub const ASAP_LEAD_MS: u64 = 200;

/// `ref_locked` sensor poll interval (ms).
pub const SENSOR_POLL_MS: u64 = 1;

/// `lo_locked` sensor poll interval (ms).
pub const LO_POLL_MS: u64 = 10;

// ============================================================================
// Calibration
// ============================================================================

/// Amplitude of the loopback reference tone (full scale = 1.0).
pub const TX_AMPLITUDE: f64 = 0.8;

/// User settings register bank holding the loopback switch.
pub const SWITCH_BANK: usize = 1;

/// Register address of the loopback switch.
pub const SWITCH_ADDR: u32 = 0;

/// Register value routing loopback-tx into loopback-rx.
pub const SWITCH_LOOPBACK_MODE: u32 = 0x6;

/// Register value for normal operation.
pub const SWITCH_RESET_MODE: u32 = 0x0;

// ============================================================================
// Runtime (not configurable)
// ============================================================================

/// Name of the PID lock file inside the data directory.
pub const LOCK_FILE_NAME: &str = "tilesync.lock";

/// Window length of a continuous rx capture (ms).
pub const RX_CONTINUOUS_WINDOW_MS: u64 = 1_000;

/// Poll timeout of the tx metadata monitor (ms).
pub const TX_EVENT_POLL_MS: u64 = 100;

/// Longest accepted controller line; longer lines are dropped.
pub const MAX_COMMAND_LINE_BYTES: usize = 4096;

/// Depth of the inbound and outbound transport queues.
pub const TRANSPORT_QUEUE_DEPTH: usize = 64;
