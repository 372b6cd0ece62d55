//! Timed, coordinated frequency tuning.
//!
//! Every tune request carries the same future device time so the hardware
//! applies them together. The chain carrying the internal LO is tuned
//! integer-N exactly on the carrier; the opposite chain gets a fractional-N
//! request shifted by a small offset, which its DSP mixer re-derives without
//! a separate LO relock. Lock is then confirmed with a bounded poll.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::radio::{
    Direction, HwTime, RadioDevice, RadioError, SynthMode, TuneRequest, TuneResult,
};

/// Result of a bounded LO-lock wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked { after: Duration },
    TimedOut { waited: Duration },
}

impl LockOutcome {
    pub const fn is_locked(self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// One request applied to one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTune {
    pub direction: Direction,
    pub channel: usize,
    pub request: TuneRequest,
    pub result: TuneResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuneReport {
    pub frequency: f64,
    pub at: HwTime,
    pub chains: Vec<ChainTune>,
    pub rx_lock: LockOutcome,
    pub tx_lock: LockOutcome,
}

impl TuneReport {
    /// Both synthesizers confirmed locked.
    pub const fn is_ready(&self) -> bool {
        self.rx_lock.is_locked() && self.tx_lock.is_locked()
    }
}

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("tune time {at} is not in the future (now {now})")]
    Late { at: HwTime, now: HwTime },

    #[error("no channels to tune")]
    NoChannels,

    #[error(transparent)]
    Radio(#[from] RadioError),
}

pub struct TuningEngine {
    radio: Arc<dyn RadioDevice>,
    offset_hz: f64,
    internal_lo: Direction,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl TuningEngine {
    pub fn new(
        radio: Arc<dyn RadioDevice>,
        offset_hz: f64,
        internal_lo: Direction,
        lock_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            radio,
            offset_hz,
            internal_lo,
            lock_timeout,
            poll_interval,
        }
    }

    pub fn from_config(radio: Arc<dyn RadioDevice>, config: &NodeConfig) -> Self {
        Self::new(
            radio,
            config.radio.tune_offset_hz,
            config.radio.internal_lo,
            config.timing.lo_lock_timeout(),
            config.timing.lo_poll(),
        )
    }

    /// Tune every channel for `frequency` at device time `at`, then confirm LO lock.
    ///
    /// Returns once both `lo_locked` sensors report locked or the lock timeout
    /// expired; check [`TuneReport::is_ready`].
    pub async fn tune_all(
        &self,
        frequency: f64,
        channels: &[usize],
        at: HwTime,
    ) -> Result<TuneReport, TuneError> {
        if channels.is_empty() {
            return Err(TuneError::NoChannels);
        }
        let now = self.radio.time_now().await?;
        if at <= now {
            return Err(TuneError::Late { at, now });
        }

        let internal = TuneRequest::manual(frequency, SynthMode::Integer);
        let shifted = TuneRequest::manual(frequency - self.offset_hz, SynthMode::Fractional);

        // Every internal-LO chain first, then the shifted chains.
        let mut chains = Vec::with_capacity(channels.len() * 2);
        for (direction, request) in [
            (self.internal_lo, &internal),
            (self.internal_lo.opposite(), &shifted),
        ] {
            for &channel in channels {
                let result = self
                    .radio
                    .tune_channel(direction, channel, request, at)
                    .await?;
                debug!(channel, direction = %direction, "[Tuning] {result}");
                chains.push(ChainTune {
                    direction,
                    channel,
                    request: request.clone(),
                    result,
                });
            }
        }
        info!(
            frequency_mhz = frequency / 1e6,
            at = %at,
            chains = chains.len(),
            "[Tuning] Timed tune issued"
        );

        // Sensors only reflect the new setting once the command time has passed.
        let now = self.radio.time_now().await?;
        if let Some(wait) = at.duration_since(now) {
            tokio::time::sleep(wait).await;
        }

        let deadline = Instant::now() + self.lock_timeout;
        let rx_lock = self.wait_lo_lock(Direction::Rx, deadline).await?;
        let tx_lock = self.wait_lo_lock(Direction::Tx, deadline).await?;

        let report = TuneReport {
            frequency,
            at,
            chains,
            rx_lock,
            tx_lock,
        };
        if report.is_ready() {
            info!(frequency_mhz = frequency / 1e6, "[Tuning] LO locked on rx and tx");
        } else {
            warn!(
                rx = ?report.rx_lock,
                tx = ?report.tx_lock,
                "[Tuning] LO lock not achieved"
            );
        }
        Ok(report)
    }

    async fn wait_lo_lock(
        &self,
        direction: Direction,
        deadline: Instant,
    ) -> Result<LockOutcome, TuneError> {
        let started = Instant::now();
        loop {
            if self.radio.lo_locked(direction).await? {
                return Ok(LockOutcome::Locked {
                    after: started.elapsed(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(LockOutcome::TimedOut {
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{SimOptions, SimRadio, TunePolicy};

    fn engine(sim: &Arc<SimRadio>) -> TuningEngine {
        TuningEngine::new(
            sim.clone(),
            1e3,
            Direction::Tx,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_request_per_chain_with_offset_on_the_other_side() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let at = sim.time_now().await.unwrap() + Duration::from_secs(5);

        let report = engine(&sim).tune_all(920e6, &[0, 1], at).await.unwrap();
        assert!(report.is_ready());

        let log = sim.tune_log();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|r| r.at == at));
        let order: Vec<_> = log.iter().map(|r| (r.direction, r.channel)).collect();
        assert_eq!(
            order,
            vec![
                (Direction::Tx, 0),
                (Direction::Tx, 1),
                (Direction::Rx, 0),
                (Direction::Rx, 1),
            ]
        );
        for channel in [0, 1] {
            let tx: Vec<_> = log
                .iter()
                .filter(|r| r.channel == channel && r.direction == Direction::Tx)
                .collect();
            let rx: Vec<_> = log
                .iter()
                .filter(|r| r.channel == channel && r.direction == Direction::Rx)
                .collect();
            assert_eq!(tx.len(), 1);
            assert_eq!(rx.len(), 1);
            assert_eq!(tx[0].request.synth_mode, SynthMode::Integer);
            assert_eq!(tx[0].request.rf_policy, TunePolicy::Manual);
            assert!((tx[0].request.target_freq - 920e6).abs() < 1e-3);
            assert_eq!(rx[0].request.synth_mode, SynthMode::Fractional);
            assert!((rx[0].request.target_freq - (920e6 - 1e3)).abs() < 1e-3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_command_time_before_polling_lock() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let now = sim.time_now().await.unwrap();
        let at = now + Duration::from_secs(5);

        engine(&sim).tune_all(920e6, &[0, 1], at).await.unwrap();
        assert!(sim.time_now().await.unwrap() >= at);
    }

    #[tokio::test(start_paused = true)]
    async fn lo_that_never_locks_times_out() {
        let sim = Arc::new(SimRadio::new(SimOptions {
            lo_lock_delay: None,
            ..SimOptions::default()
        }));
        let at = sim.time_now().await.unwrap() + Duration::from_millis(100);

        let started = Instant::now();
        let report = engine(&sim).tune_all(920e6, &[0, 1], at).await.unwrap();
        assert!(!report.is_ready());
        assert!(matches!(report.rx_lock, LockOutcome::TimedOut { .. }));
        let bound = Duration::from_millis(100) + Duration::from_secs(5) + Duration::from_millis(10);
        assert!(started.elapsed() <= bound);
    }

    #[tokio::test(start_paused = true)]
    async fn past_instant_is_not_sent_to_hardware() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let err = engine(&sim)
            .tune_all(920e6, &[0], HwTime::from_secs(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Late { .. }));
        assert!(sim.tune_log().is_empty());
    }
}
