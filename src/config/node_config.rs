//! Node Configuration - radio, timing and calibration settings as TOML values
//!
//! Every reference constant is a field here. Each struct implements `Default`
//! with the values in [`super::defaults`], so a config file only needs the
//! keys that differ from the reference bring-up.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::exit_code::NodeExit;
use crate::radio::{ClockSource, Direction};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration of one tile node.
///
/// Resolve the file with [`NodeConfig::resolve_path`], then load it with
/// [`NodeConfig::load_from_file`]. There is no fallback to built-in defaults
/// when the file is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity and local paths
    #[serde(default)]
    pub node: NodeInfo,

    /// Front-end rates and frequencies
    #[serde(default)]
    pub radio: RadioConfig,

    /// Per-role gains
    #[serde(default)]
    pub gains: GainConfig,

    /// Channel assignment of each role
    #[serde(default)]
    pub channels: ChannelRoles,

    /// Timeouts, margins and poll intervals
    #[serde(default)]
    pub timing: TimingConfig,

    /// Loopback waveform and switch register
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Controller connection
    #[serde(default)]
    pub transport: TransportConfig,
}

impl NodeConfig {
    /// Pick the config file: explicit path first, then `$TILESYNC_CONFIG`.
    pub fn resolve_path(cli: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = cli {
            return Ok(path.to_path_buf());
        }
        match std::env::var(defaults::CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Err(ConfigError::NotSpecified),
        }
    }

    /// Load, check for unknown keys, deserialize and validate.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io(path.to_path_buf(), e)
            }
        })?;

        let config = Self::from_toml_str(&contents)
            .map_err(|e| e.with_path(path))?;
        info!(
            path = %path.display(),
            tile = %config.node.tile,
            "Loaded node config"
        );
        Ok(config)
    }

    /// Parse and validate an in-memory TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        // Two-pass: check for unknown keys first (warnings only)
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all settings for internal consistency.
    ///
    /// Every violation is collected so the operator sees them all at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.radio;
        let mut errors: Vec<String> = Vec::new();

        if self.node.tile.trim().is_empty() {
            errors.push("node.tile must not be empty".to_string());
        }

        Self::check_positive(r.sample_rate, "radio.sample_rate", &mut errors);
        Self::check_positive(r.master_clock_rate, "radio.master_clock_rate", &mut errors);
        Self::check_positive(r.center_frequency, "radio.center_frequency", &mut errors);
        Self::check_positive(r.rx_bandwidth, "radio.rx_bandwidth", &mut errors);
        if !r.tune_offset_hz.is_finite() {
            errors.push(format!(
                "radio.tune_offset_hz must be finite (got {})",
                r.tune_offset_hz
            ));
        }

        if r.sample_rate > 0.0 && r.master_clock_rate > 0.0 {
            let ratio = r.master_clock_rate / r.sample_rate;
            if (ratio - ratio.round()).abs() > 1e-9 || ratio < 1.0 {
                errors.push(format!(
                    "radio.master_clock_rate ({}) must be an integer multiple of radio.sample_rate ({})",
                    r.master_clock_rate, r.sample_rate
                ));
            }
        }

        if r.channels.is_empty() {
            errors.push("radio.channels must list at least one channel".to_string());
        }

        for (name, gain) in [
            ("gains.loopback_tx", self.gains.loopback_tx),
            ("gains.free_tx", self.gains.free_tx),
            ("gains.loopback_rx", self.gains.loopback_rx),
            ("gains.ref_rx", self.gains.ref_rx),
        ] {
            if !(0.0..=defaults::MAX_GAIN_DB).contains(&gain) {
                errors.push(format!(
                    "{name} = {gain} dB is outside 0..={} dB",
                    defaults::MAX_GAIN_DB
                ));
            }
        }

        for (name, channel) in [
            ("channels.ref_rx", self.channels.ref_rx),
            ("channels.free_tx", self.channels.free_tx),
            ("channels.loopback_rx", self.channels.loopback_rx),
            ("channels.loopback_tx", self.channels.loopback_tx),
        ] {
            if !r.channels.contains(&channel) {
                errors.push(format!(
                    "{name} = {channel} is not in radio.channels {:?}",
                    r.channels
                ));
            }
        }
        if self.channels.ref_rx == self.channels.loopback_rx {
            errors.push(format!(
                "channels.ref_rx and channels.loopback_rx must differ (both {})",
                self.channels.ref_rx
            ));
        }

        let a = self.calibration.tx_amplitude;
        if !(a > 0.0 && a <= 1.0) {
            errors.push(format!("calibration.tx_amplitude = {a} must be in (0, 1]"));
        }
        if self.calibration.switch_loopback_value == self.calibration.switch_reset_value {
            errors.push(
                "calibration.switch_loopback_value must differ from switch_reset_value".to_string(),
            );
        }

        let t = &self.timing;
        for (name, value) in [
            ("timing.clock_lock_timeout_ms", t.clock_lock_timeout_ms),
            ("timing.lo_lock_timeout_ms", t.lo_lock_timeout_ms),
            ("timing.sync_timeout_ms", t.sync_timeout_ms),
            ("timing.pps_settle_ms", t.pps_settle_ms),
            ("timing.begin_time_ms", t.begin_time_ms),
            ("timing.capture_time_ms", t.capture_time_ms),
            ("timing.tx_time_ms", t.tx_time_ms),
            ("timing.join_grace_ms", t.join_grace_ms),
            ("timing.asap_lead_ms", t.asap_lead_ms),
            ("timing.sensor_poll_ms", t.sensor_poll_ms),
            ("timing.lo_poll_ms", t.lo_poll_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be > 0"));
            }
        }

        // The reset latches on the next edge, up to one period away.
        let min_settle = 2 * defaults::PPS_PERIOD_MS;
        if t.pps_settle_ms > 0 && t.pps_settle_ms < min_settle {
            errors.push(format!(
                "timing.pps_settle_ms = {} is shorter than two PPS periods ({min_settle} ms)",
                t.pps_settle_ms
            ));
        }
        for (name, value) in [
            ("timing.capture_time_ms", t.capture_time_ms),
            ("timing.tx_time_ms", t.tx_time_ms),
        ] {
            if value > t.max_capture_ms {
                errors.push(format!(
                    "{name} = {value} exceeds timing.max_capture_ms ({})",
                    t.max_capture_ms
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_positive(value: f64, name: &str, errors: &mut Vec<String>) {
        // NaN comparisons silently pass, catch them explicitly
        if !value.is_finite() || value <= 0.0 {
            errors.push(format!("{name} must be a positive finite number (got {value})"));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file given (use --config-file or ${})", defaults::CONFIG_ENV_VAR)]
    NotSpecified,

    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

impl ConfigError {
    /// Process exit status for a fatal start-up failure.
    pub const fn exit_code(&self) -> NodeExit {
        match self {
            Self::NotSpecified | Self::NotFound(_) => NodeExit::ConfigNotFound,
            Self::Parse(..) => NodeExit::ConfigParse,
            Self::Io(..) | Self::Serialize(_) | Self::Validation(_) => NodeExit::ConfigUnexpected,
        }
    }

    fn with_path(self, path: &Path) -> Self {
        match self {
            Self::Parse(_, e) => Self::Parse(path.to_path_buf(), e),
            other => other,
        }
    }
}

// ============================================================================
// Node Info
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Tile identity, matched against command tile selectors and the weights table
    #[serde(default = "default_tile")]
    pub tile: String,

    /// Directory for the measurement log and the lock file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Tx weights table (TOML). No weights are applied when unset.
    #[serde(default)]
    pub weights_file: Option<PathBuf>,
}

fn default_tile() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| defaults::FALLBACK_TILE_NAME.to_string())
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            tile: default_tile(),
            data_dir: default_data_dir(),
            weights_file: None,
        }
    }
}

// ============================================================================
// Radio
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Baseband sample rate (samples/s)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Master clock rate (Hz)
    #[serde(default = "default_master_clock_rate")]
    pub master_clock_rate: f64,

    /// Carrier frequency tuned after SYNC (Hz)
    #[serde(default = "default_center_frequency")]
    pub center_frequency: f64,

    /// Analog rx bandwidth (Hz)
    #[serde(default = "default_rx_bandwidth")]
    pub rx_bandwidth: f64,

    /// Offset of the chain without the internal LO (Hz)
    #[serde(default = "default_tune_offset")]
    pub tune_offset_hz: f64,

    /// Chain carrying the internal LO: "tx" or "rx"
    #[serde(default = "default_internal_lo")]
    pub internal_lo: Direction,

    /// Reference clock input used at bring-up
    #[serde(default = "default_clock_source")]
    pub clock_source: ClockSource,

    /// Device channels in use
    #[serde(default = "default_channels")]
    pub channels: Vec<usize>,
}

fn default_sample_rate() -> f64 {
    defaults::SAMPLE_RATE
}
fn default_master_clock_rate() -> f64 {
    defaults::MASTER_CLOCK_RATE
}
fn default_center_frequency() -> f64 {
    defaults::CENTER_FREQUENCY
}
fn default_rx_bandwidth() -> f64 {
    defaults::RX_BANDWIDTH
}
fn default_tune_offset() -> f64 {
    defaults::TUNE_OFFSET_HZ
}
fn default_internal_lo() -> Direction {
    Direction::Tx
}
fn default_clock_source() -> ClockSource {
    ClockSource::External
}
fn default_channels() -> Vec<usize> {
    vec![0, 1]
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            master_clock_rate: default_master_clock_rate(),
            center_frequency: default_center_frequency(),
            rx_bandwidth: default_rx_bandwidth(),
            tune_offset_hz: default_tune_offset(),
            internal_lo: default_internal_lo(),
            clock_source: default_clock_source(),
            channels: default_channels(),
        }
    }
}

// ============================================================================
// Gains
// ============================================================================

/// Gain per role in dB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GainConfig {
    #[serde(default = "default_loopback_tx_gain")]
    pub loopback_tx: f64,

    #[serde(default = "default_free_tx_gain")]
    pub free_tx: f64,

    #[serde(default = "default_loopback_rx_gain")]
    pub loopback_rx: f64,

    #[serde(default = "default_ref_rx_gain")]
    pub ref_rx: f64,
}

fn default_loopback_tx_gain() -> f64 {
    defaults::LOOPBACK_TX_GAIN_DB
}
fn default_free_tx_gain() -> f64 {
    defaults::FREE_TX_GAIN_DB
}
fn default_loopback_rx_gain() -> f64 {
    defaults::LOOPBACK_RX_GAIN_DB
}
fn default_ref_rx_gain() -> f64 {
    defaults::REF_RX_GAIN_DB
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            loopback_tx: default_loopback_tx_gain(),
            free_tx: default_free_tx_gain(),
            loopback_rx: default_loopback_rx_gain(),
            ref_rx: default_ref_rx_gain(),
        }
    }
}

// ============================================================================
// Channel Roles
// ============================================================================

/// Reference wiring: PLL ref into ch0 rx, ch1 tx looped into ch1 rx, ch0 tx free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRoles {
    #[serde(default = "default_ref_rx")]
    pub ref_rx: usize,

    #[serde(default = "default_free_tx")]
    pub free_tx: usize,

    #[serde(default = "default_loopback_rx")]
    pub loopback_rx: usize,

    #[serde(default = "default_loopback_tx")]
    pub loopback_tx: usize,
}

fn default_ref_rx() -> usize {
    0
}
fn default_free_tx() -> usize {
    0
}
fn default_loopback_rx() -> usize {
    1
}
fn default_loopback_tx() -> usize {
    1
}

impl Default for ChannelRoles {
    fn default() -> Self {
        Self {
            ref_rx: default_ref_rx(),
            free_tx: default_free_tx(),
            loopback_rx: default_loopback_rx(),
            loopback_tx: default_loopback_tx(),
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_clock_lock_timeout")]
    pub clock_lock_timeout_ms: u64,

    #[serde(default = "default_lo_lock_timeout")]
    pub lo_lock_timeout_ms: u64,

    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    #[serde(default = "default_pps_settle")]
    pub pps_settle_ms: u64,

    #[serde(default = "default_begin_time")]
    pub begin_time_ms: u64,

    #[serde(default = "default_capture_time")]
    pub capture_time_ms: u64,

    #[serde(default = "default_tx_time")]
    pub tx_time_ms: u64,

    /// Upper bound on `duration_ms` of CAL, PILOT and START
    #[serde(default = "default_max_capture")]
    pub max_capture_ms: u64,

    #[serde(default = "default_scheduling_slack")]
    pub scheduling_slack_ms: u64,

    #[serde(default = "default_join_grace")]
    pub join_grace_ms: u64,

    #[serde(default = "default_asap_lead")]
    pub asap_lead_ms: u64,

    #[serde(default = "default_sensor_poll")]
    pub sensor_poll_ms: u64,

    #[serde(default = "default_lo_poll")]
    pub lo_poll_ms: u64,
}

fn default_clock_lock_timeout() -> u64 {
    defaults::CLOCK_LOCK_TIMEOUT_MS
}
fn default_lo_lock_timeout() -> u64 {
    defaults::LO_LOCK_TIMEOUT_MS
}
fn default_sync_timeout() -> u64 {
    defaults::SYNC_TIMEOUT_MS
}
fn default_pps_settle() -> u64 {
    defaults::PPS_SETTLE_MS
}
fn default_begin_time() -> u64 {
    defaults::BEGIN_TIME_MS
}
fn default_capture_time() -> u64 {
    defaults::CAPTURE_TIME_MS
}
fn default_tx_time() -> u64 {
    defaults::TX_TIME_MS
}
fn default_max_capture() -> u64 {
    defaults::MAX_CAPTURE_MS
}
fn default_scheduling_slack() -> u64 {
    defaults::SCHEDULING_SLACK_MS
}
fn default_join_grace() -> u64 {
    defaults::JOIN_GRACE_MS
}
fn default_asap_lead() -> u64 {
    defaults::ASAP_LEAD_MS
}
fn default_sensor_poll() -> u64 {
    defaults::SENSOR_POLL_MS
}
fn default_lo_poll() -> u64 {
    defaults::LO_POLL_MS
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            clock_lock_timeout_ms: default_clock_lock_timeout(),
            lo_lock_timeout_ms: default_lo_lock_timeout(),
            sync_timeout_ms: default_sync_timeout(),
            pps_settle_ms: default_pps_settle(),
            begin_time_ms: default_begin_time(),
            capture_time_ms: default_capture_time(),
            tx_time_ms: default_tx_time(),
            max_capture_ms: default_max_capture(),
            scheduling_slack_ms: default_scheduling_slack(),
            join_grace_ms: default_join_grace(),
            asap_lead_ms: default_asap_lead(),
            sensor_poll_ms: default_sensor_poll(),
            lo_poll_ms: default_lo_poll(),
        }
    }
}

impl TimingConfig {
    pub const fn clock_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.clock_lock_timeout_ms)
    }

    pub const fn lo_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lo_lock_timeout_ms)
    }

    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub const fn pps_settle(&self) -> Duration {
        Duration::from_millis(self.pps_settle_ms)
    }

    pub const fn begin_time(&self) -> Duration {
        Duration::from_millis(self.begin_time_ms)
    }

    pub const fn capture_time(&self) -> Duration {
        Duration::from_millis(self.capture_time_ms)
    }

    pub const fn tx_time(&self) -> Duration {
        Duration::from_millis(self.tx_time_ms)
    }

    pub const fn max_capture(&self) -> Duration {
        Duration::from_millis(self.max_capture_ms)
    }

    pub const fn scheduling_slack(&self) -> Duration {
        Duration::from_millis(self.scheduling_slack_ms)
    }

    pub const fn join_grace(&self) -> Duration {
        Duration::from_millis(self.join_grace_ms)
    }

    pub const fn asap_lead(&self) -> Duration {
        Duration::from_millis(self.asap_lead_ms)
    }

    pub const fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms)
    }

    pub const fn lo_poll(&self) -> Duration {
        Duration::from_millis(self.lo_poll_ms)
    }
}

// ============================================================================
// Calibration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Loopback tone amplitude (full scale = 1.0)
    #[serde(default = "default_tx_amplitude")]
    pub tx_amplitude: f64,

    #[serde(default = "default_switch_bank")]
    pub switch_bank: usize,

    #[serde(default = "default_switch_addr")]
    pub switch_addr: u32,

    #[serde(default = "default_switch_loopback_value")]
    pub switch_loopback_value: u32,

    #[serde(default = "default_switch_reset_value")]
    pub switch_reset_value: u32,
}

fn default_tx_amplitude() -> f64 {
    defaults::TX_AMPLITUDE
}
fn default_switch_bank() -> usize {
    defaults::SWITCH_BANK
}
fn default_switch_addr() -> u32 {
    defaults::SWITCH_ADDR
}
fn default_switch_loopback_value() -> u32 {
    defaults::SWITCH_LOOPBACK_MODE
}
fn default_switch_reset_value() -> u32 {
    defaults::SWITCH_RESET_MODE
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            tx_amplitude: default_tx_amplitude(),
            switch_bank: default_switch_bank(),
            switch_addr: default_switch_addr(),
            switch_loopback_value: default_switch_loopback_value(),
            switch_reset_value: default_switch_reset_value(),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `host:port` of the controller; commands are read from stdin when unset
    #[serde(default)]
    pub controller_addr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert!((config.radio.center_frequency - 920e6).abs() < 1.0);
        assert_eq!(config.timing.clock_lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.radio.internal_lo, Direction::Tx);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.channels.loopback_tx, 1);
        assert_eq!(config.calibration.switch_loopback_value, 0x6);
    }

    #[test]
    fn clock_rate_must_be_integer_multiple() {
        let mut config = NodeConfig::default();
        config.radio.sample_rate = 3e6;
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert!(errors.iter().any(|e| e.contains("integer multiple")));
    }

    #[test]
    fn every_violation_is_reported() {
        let mut config = NodeConfig::default();
        config.gains.ref_rx = 120.0;
        config.calibration.tx_amplitude = 0.0;
        config.timing.lo_lock_timeout_ms = 0;
        config.channels.loopback_tx = 7;
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn missing_file_maps_to_not_found_exit() {
        let err = NodeConfig::load_from_file(Path::new("/nonexistent/tilesync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        assert_eq!(err.exit_code(), NodeExit::ConfigNotFound);
    }

    #[test]
    fn malformed_toml_maps_to_parse_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[radio\nsample_rate = ").unwrap();
        let err = NodeConfig::load_from_file(&path).unwrap_err();
        assert_eq!(err.exit_code(), NodeExit::ConfigParse);
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        let path = NodeConfig::resolve_path(Some(Path::new("node.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("node.toml"));
    }
}
