//! Device bring-up.
//!
//! Runs once before the scheduler starts: master clock, reference lock,
//! PPS time source, per-channel rates and front-end, per-role gains. What was
//! applied is kept as the "last setup" reported by STATUS.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::{ClockSource, Direction, RadioDevice, RadioError, TimeSource};
use crate::config::NodeConfig;
use crate::sync::ClockLockManager;

/// Gain applied to one chain at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AppliedGain {
    pub direction: Direction,
    pub channel: usize,
    pub gain_db: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupReport {
    pub device: String,
    pub master_clock_rate: f64,
    pub sample_rate: f64,
    pub rx_bandwidth: f64,
    pub clock_source: ClockSource,
    pub channels: Vec<usize>,
    pub gains: Vec<AppliedGain>,
}

impl SetupReport {
    /// Flat `key=value` view for STATUS replies.
    pub fn fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("device".to_string(), self.device.replace(' ', "_")),
            ("mcr".to_string(), format!("{}", self.master_clock_rate)),
            ("rate".to_string(), format!("{}", self.sample_rate)),
            ("rx_bw".to_string(), format!("{}", self.rx_bandwidth)),
            (
                "channels".to_string(),
                self.channels
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ];
        for g in &self.gains {
            fields.push((
                format!("{}{}_gain", g.direction, g.channel),
                format!("{}", g.gain_db),
            ));
        }
        fields
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("master clock rate {master} Hz is not an integer multiple of sample rate {rate} S/s")]
    ClockRateMismatch { master: f64, rate: f64 },

    #[error("reference clock did not lock within {timeout_ms} ms")]
    ClockNotLocked { timeout_ms: u64 },

    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Bring the front-end into the reference operating point.
pub async fn bring_up(
    radio: &Arc<dyn RadioDevice>,
    config: &NodeConfig,
) -> Result<SetupReport, SetupError> {
    let rc = &config.radio;
    let ratio = rc.master_clock_rate / rc.sample_rate;
    if !ratio.is_finite() || ratio < 1.0 || (ratio - ratio.round()).abs() > 1e-9 {
        return Err(SetupError::ClockRateMismatch {
            master: rc.master_clock_rate,
            rate: rc.sample_rate,
        });
    }
    let master_clock_rate = radio.set_master_clock_rate(rc.master_clock_rate).await?;
    info!(device = %radio.description(), mcr = master_clock_rate, "[Setup] Master clock set");

    let lock = ClockLockManager::new(Arc::clone(radio), config.timing.sensor_poll());
    if !lock
        .confirm_lock(rc.clock_source, config.timing.clock_lock_timeout())
        .await
    {
        return Err(SetupError::ClockNotLocked {
            timeout_ms: config.timing.clock_lock_timeout_ms,
        });
    }
    radio.set_time_source(TimeSource::External).await?;

    let mut sample_rate = rc.sample_rate;
    let mut rx_bandwidth = rc.rx_bandwidth;
    for &channel in &rc.channels {
        sample_rate = radio.set_rate(Direction::Rx, channel, rc.sample_rate).await?;
        radio.set_rate(Direction::Tx, channel, rc.sample_rate).await?;
        radio.set_rx_frontend(channel, true, false).await?;
        rx_bandwidth = radio.set_rx_bandwidth(channel, rc.rx_bandwidth).await?;
        debug!(channel, rate = sample_rate, bw = rx_bandwidth, "[Setup] Channel configured");
    }

    let roles = &config.channels;
    let gains = &config.gains;
    let plan = [
        (Direction::Tx, roles.free_tx, gains.free_tx),
        (Direction::Tx, roles.loopback_tx, gains.loopback_tx),
        (Direction::Rx, roles.loopback_rx, gains.loopback_rx),
        (Direction::Rx, roles.ref_rx, gains.ref_rx),
    ];
    let mut applied: Vec<AppliedGain> = Vec::with_capacity(plan.len());
    for (direction, channel, gain_db) in plan {
        radio.set_gain(direction, channel, gain_db).await?;
        applied.retain(|g| !(g.direction == direction && g.channel == channel));
        applied.push(AppliedGain {
            direction,
            channel,
            gain_db,
        });
    }

    info!(
        channels = ?rc.channels,
        rate = sample_rate,
        "[Setup] Front-end ready"
    );
    Ok(SetupReport {
        device: radio.description(),
        master_clock_rate,
        sample_rate,
        rx_bandwidth,
        clock_source: rc.clock_source,
        channels: rc.channels.clone(),
        gains: applied,
    })
}
