//! Loopback and pilot measurement orchestration.
//!
//! One measurement at a time: the pipeline serializes on an async mutex that
//! is held until the result has been handed off, so a second request waits
//! instead of interleaving. The switch is restored on every exit path once it
//! was touched, including cancellation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::burst::{BurstOutcome, BurstState, TxEventCounts};
use super::handoff::ResultPublisher;
use super::phase::PhaseEstimator;
use super::waveform::ReferenceTone;
use super::{CalibrationError, CalibrationResult, MeasurementMode};
use crate::config::{defaults, NodeConfig};
use crate::radio::{HwTime, LoopbackSwitch, RadioDevice};
use crate::sync::SessionId;

/// This tile's part in a pilot exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PilotRole {
    pub transmit: bool,
    pub receive: bool,
}

/// Summary of one finished measurement.
#[derive(Debug, Clone)]
pub struct BurstReport {
    pub mode: MeasurementMode,
    pub at: HwTime,
    pub duration: Duration,
    pub tx_samples: u64,
    pub rx_samples: usize,
    pub events: TxEventCounts,
    pub degraded: bool,
    /// Present when this tile captured
    pub result: Option<CalibrationResult>,
    pub aborted: usize,
}

struct BurstPlan {
    mode: MeasurementMode,
    at: HwTime,
    duration: Duration,
    transmit: bool,
    receive: bool,
    use_switch: bool,
    active_tx: usize,
}

pub struct LoopbackCalibrationPipeline {
    radio: Arc<dyn RadioDevice>,
    switch: Arc<dyn LoopbackSwitch>,
    config: Arc<NodeConfig>,
    publisher: ResultPublisher,
    estimator: PhaseEstimator,
    in_flight: Mutex<()>,
}

impl LoopbackCalibrationPipeline {
    pub fn new(
        radio: Arc<dyn RadioDevice>,
        switch: Arc<dyn LoopbackSwitch>,
        config: Arc<NodeConfig>,
        publisher: ResultPublisher,
    ) -> Self {
        Self {
            radio,
            switch,
            config,
            publisher,
            estimator: PhaseEstimator::new(),
            in_flight: Mutex::new(()),
        }
    }

    /// A measurement currently holds the pipeline.
    #[cfg(test)]
    fn is_busy(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Loopback-tx routed into loopback-rx, phase of loopback-rx against ref-rx.
    pub async fn measure_loopback(
        &self,
        session: &SessionId,
        at: HwTime,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<BurstReport, CalibrationError> {
        let plan = BurstPlan {
            mode: MeasurementMode::Loopback,
            at,
            duration,
            transmit: true,
            receive: true,
            use_switch: true,
            active_tx: self.config.channels.loopback_tx,
        };
        self.run(session, plan, cancel).await
    }

    /// Over-the-air pilot: transmit on the free-tx channel and/or capture.
    pub async fn measure_pilot(
        &self,
        session: &SessionId,
        at: HwTime,
        duration: Duration,
        role: PilotRole,
        cancel: &CancellationToken,
    ) -> Result<BurstReport, CalibrationError> {
        let plan = BurstPlan {
            mode: MeasurementMode::Pilot,
            at,
            duration,
            transmit: role.transmit,
            receive: role.receive,
            use_switch: false,
            active_tx: self.config.channels.free_tx,
        };
        self.run(session, plan, cancel).await
    }

    async fn run(
        &self,
        session: &SessionId,
        plan: BurstPlan,
        cancel: &CancellationToken,
    ) -> Result<BurstReport, CalibrationError> {
        let _guard = self.in_flight.lock().await;

        let now = self.radio.time_now().await?;
        if plan.at <= now {
            return Err(CalibrationError::Late { at: plan.at, now });
        }

        let channels = &self.config.radio.channels;
        let amplitude = self.config.calibration.tx_amplitude;
        let amplitudes: Vec<f64> = channels
            .iter()
            .map(|&c| if c == plan.active_tx { amplitude } else { 0.0 })
            .collect();
        let tone = ReferenceTone::random(&amplitudes, &mut rand::thread_rng());

        let mut degraded = false;
        if plan.use_switch {
            match self.switch.enable().await {
                Ok(()) => debug!("[Loopback] Switch engaged"),
                Err(e) => {
                    warn!(
                        error = %e,
                        "[Loopback] Switch unavailable, measuring without loopback routing"
                    );
                    degraded = true;
                }
            }
        }

        let activities = self.run_activities(&plan, channels, tone, cancel).await;

        if plan.use_switch {
            match self.switch.disable().await {
                Ok(()) => debug!("[Loopback] Switch reset"),
                Err(e) => warn!(error = %e, "[Loopback] Failed to reset switch"),
            }
        }

        let outcome = activities?;
        if cancel.is_cancelled() {
            info!(mode = %plan.mode, aborted = outcome.aborted, "[Loopback] Measurement cancelled");
            return Err(CalibrationError::Cancelled);
        }

        let tx_samples = match outcome.transmit {
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(e.into()),
            None => 0,
        };
        let events = outcome.events.unwrap_or_default();
        if events.errors() > 0 {
            degraded = true;
        }

        let mut result = None;
        let mut rx_samples = 0;
        if plan.receive {
            let capture = outcome.capture.ok_or(CalibrationError::MissingCapture)??;
            rx_samples = capture.len();
            let roles = &self.config.channels;
            let reference = capture
                .channel(roles.ref_rx)
                .ok_or(CalibrationError::MissingChannel(roles.ref_rx))?;
            let measured = capture
                .channel(roles.loopback_rx)
                .ok_or(CalibrationError::MissingChannel(roles.loopback_rx))?;
            let estimate = self.estimator.estimate(reference, measured)?;

            let calibration = CalibrationResult {
                session: session.clone(),
                mode: plan.mode,
                reference_phase: estimate.reference_phase,
                measured_phase: estimate.measured_phase,
                phase_difference: estimate.difference,
                amplitude: Some(estimate.amplitude_ratio()),
                captured_at: capture.start,
                recorded_at: chrono::Utc::now(),
                degraded,
            };
            info!(
                mode = %plan.mode,
                phase_rad = calibration.phase_difference,
                phase_deg = calibration.phase_degrees(),
                degraded,
                "[Loopback] Phase measured"
            );
            self.publisher.publish(calibration.clone()).await?;
            result = Some(calibration);
        }

        Ok(BurstReport {
            mode: plan.mode,
            at: plan.at,
            duration: plan.duration,
            tx_samples,
            rx_samples,
            events,
            degraded,
            result,
            aborted: outcome.aborted,
        })
    }

    async fn run_activities(
        &self,
        plan: &BurstPlan,
        channels: &[usize],
        tone: ReferenceTone,
        cancel: &CancellationToken,
    ) -> Result<BurstOutcome, CalibrationError> {
        let timing = &self.config.timing;
        let mut state = BurstState::new(cancel.child_token());

        if plan.transmit {
            let handles = self.radio.open_tx_stream(channels).await?;
            state.spawn_transmit(handles.stream, tone, plan.at, None);
            state.spawn_monitor(
                handles.events,
                Duration::from_millis(defaults::TX_EVENT_POLL_MS),
            );
        }
        if plan.receive {
            match self.radio.open_rx_stream(channels).await {
                Ok(rx) => state.spawn_receive(rx, plan.at, plan.duration),
                Err(e) => {
                    state.shutdown(timing.join_grace()).await;
                    return Err(e.into());
                }
            }
        }

        let now = self.radio.time_now().await?;
        let lead = plan.at.duration_since(now).unwrap_or_default();
        let wait = plan.duration + lead + timing.scheduling_slack();
        debug!(
            at = %plan.at,
            wait_ms = wait.as_millis(),
            "[Loopback] Activities started"
        );
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = cancel.cancelled() => {}
        }

        Ok(state.shutdown(timing.join_grace()).await)
    }
}
