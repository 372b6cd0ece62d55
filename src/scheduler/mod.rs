//! Command Scheduler
//!
//! Single control flow that maps controller commands onto the node state
//! machine. Long-running work (sync sequence, measurements, START streams)
//! runs as one cancellable activity task at a time; the loop keeps serving
//! STATUS, STOP and ABORT while it runs.
//!
//! ```text
//!   transport.recv() ──► Command::parse ──► targets? ──► state accepts?
//!                                                          │
//!             ACK / NACK ◄─────────────────────────────────┤
//!                                                          ▼
//!   results.take() ──► cal-done          spawn activity (one at a time)
//!   activity joined ──► synced / tx-done / rx-done, next state
//! ```
//!
//! Every execution instant is resolved against device time on receipt and
//! must lie strictly in the future; anything else is rejected before it
//! reaches the hardware.

use futures::future::OptionFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod command;
pub mod state;

pub use command::{
    CalCommand, Command, CommandError, PilotCommand, SetupCommand, StartCommand, StartMode,
    StatusQuery, StopCommand, StopScope, TileSelector, TimingSpec,
};
pub use state::NodeState;

use crate::calibration::waveform::burst_samples;
use crate::calibration::{
    result_slot, BurstReport, BurstState, CalibrationError, CalibrationResult,
    LoopbackCalibrationPipeline, MeasurementMode, PilotRole, ReferenceTone, ResultReceiver,
};
use crate::config::{defaults, NodeConfig, TileWeights, WeightsTable};
use crate::radio::{Direction, HwTime, LoopbackSwitch, RadioDevice, RadioError, SetupReport};
use crate::storage::MeasurementLog;
use crate::sync::{
    sync_channel, LockOutcome, SessionId, SyncError, SyncTrigger, SyncWaiter,
    TimeAlignmentCoordinator, TuneError, TuneReport, TuningEngine,
};
use crate::transport::{CommandTransport, InboundCommand, OutboundEvent, TransportError};

/// Waveforms the node can generate.
const KNOWN_WAVEFORMS: &[&str] = &["tone"];

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure of a background activity, reported as a NACK.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Tune(#[from] TuneError),

    #[error("LO not locked after tuning (rx {rx:?}, tx {tx:?})")]
    LoNotLocked { rx: LockOutcome, tx: LockOutcome },

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error("activity cancelled")]
    Cancelled,

    #[error("activity ended without a transmit report")]
    Incomplete,
}

impl ActivityError {
    fn reason(&self) -> &'static str {
        match self {
            Self::Sync(SyncError::SignalTimeout(_)) => "sync-timeout",
            Self::Sync(SyncError::NotLatched(_)) => "time-not-latched",
            Self::Sync(SyncError::Cancelled) | Self::Cancelled => "cancelled",
            Self::Tune(TuneError::Late { .. })
            | Self::Calibration(CalibrationError::Late { .. }) => "late",
            Self::LoNotLocked { .. } => "lo-not-locked",
            Self::Calibration(_) => "measurement-failed",
            Self::Sync(SyncError::Radio(_)) | Self::Tune(_) | Self::Radio(_) => "radio-error",
            Self::Incomplete => "incomplete",
        }
    }
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityKind {
    Sync,
    Measure(MeasurementMode),
    Stream(Direction),
}

impl ActivityKind {
    const fn command(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Measure(MeasurementMode::Loopback) => "CAL",
            Self::Measure(MeasurementMode::Pilot) => "PILOT",
            Self::Stream(_) => "START",
        }
    }
}

#[derive(Debug)]
struct SyncSummary {
    session: SessionId,
    time: HwTime,
    tune: TuneReport,
}

#[derive(Debug)]
enum ActivityOutcome {
    Synced(Result<SyncSummary, ActivityError>),
    Measured(Result<BurstReport, CalibrationError>),
    Streamed {
        direction: Direction,
        result: Result<u64, ActivityError>,
    },
}

struct Activity {
    kind: ActivityKind,
    cancel: CancellationToken,
    handle: JoinHandle<ActivityOutcome>,
}

/// Static experiment defaults stored by SETUP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentDefaults {
    pub waveform: Option<String>,
    pub weights: Option<String>,
    pub direction: Option<Direction>,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct CommandScheduler {
    tile: String,
    config: Arc<NodeConfig>,
    radio: Arc<dyn RadioDevice>,
    switch: Arc<dyn LoopbackSwitch>,
    weights: WeightsTable,
    pipeline: Arc<LoopbackCalibrationPipeline>,
    results: ResultReceiver,
    aligner: Arc<TimeAlignmentCoordinator>,
    tuner: Arc<TuningEngine>,
    trigger: SyncTrigger,
    waiter: Arc<Mutex<SyncWaiter>>,

    state: NodeState,
    setup: Option<SetupReport>,
    defaults: ExperimentDefaults,
    session: Option<SessionId>,
    log: Option<MeasurementLog>,
    last_result: Option<CalibrationResult>,
    last_tune: Option<TuneReport>,
    active: Option<Activity>,
    pending_stops: Vec<JoinHandle<()>>,
}

impl CommandScheduler {
    /// `setup` is the bring-up report retained for STATUS.
    pub fn new(
        radio: Arc<dyn RadioDevice>,
        switch: Arc<dyn LoopbackSwitch>,
        config: Arc<NodeConfig>,
        weights: WeightsTable,
        setup: Option<SetupReport>,
    ) -> Self {
        let (publisher, results) = result_slot();
        let (trigger, waiter) = sync_channel();
        let pipeline = Arc::new(LoopbackCalibrationPipeline::new(
            Arc::clone(&radio),
            Arc::clone(&switch),
            Arc::clone(&config),
            publisher,
        ));
        let aligner = Arc::new(TimeAlignmentCoordinator::new(
            Arc::clone(&radio),
            config.timing.pps_settle(),
        ));
        let tuner = Arc::new(TuningEngine::from_config(Arc::clone(&radio), &config));

        Self {
            tile: config.node.tile.clone(),
            config,
            radio,
            switch,
            weights,
            pipeline,
            results,
            aligner,
            tuner,
            trigger,
            waiter: Arc::new(Mutex::new(waiter)),
            state: NodeState::Idle,
            setup,
            defaults: ExperimentDefaults::default(),
            session: None,
            log: None,
            last_result: None,
            last_tune: None,
            active: None,
            pending_stops: Vec::new(),
        }
    }

    pub const fn state(&self) -> NodeState {
        self.state
    }

    /// Serve commands until the controller goes away or `shutdown` fires.
    pub async fn run<T>(
        mut self,
        transport: &mut T,
        shutdown: CancellationToken,
    ) -> Result<(), SchedulerError>
    where
        T: CommandTransport + ?Sized,
    {
        info!(tile = %self.tile, transport = transport.name(), "[Scheduler] Serving commands");
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!("[Scheduler] Shutdown requested");
                    self.halt().await;
                    break;
                }

                Some(result) = self.results.take() => {
                    self.record_result(result, transport).await?;
                }

                Some(joined) = OptionFuture::from(self.active.as_mut().map(|a| &mut a.handle)) => {
                    let kind = self.active.take().map_or(ActivityKind::Sync, |a| a.kind);
                    self.finish(kind, joined, transport).await?;
                }

                inbound = transport.recv() => match inbound? {
                    Some(inbound) => self.dispatch(inbound, transport).await?,
                    None => {
                        info!("[Scheduler] Controller closed, stopping");
                        self.halt().await;
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    async fn emit<T>(transport: &mut T, event: OutboundEvent) -> Result<(), TransportError>
    where
        T: CommandTransport + ?Sized,
    {
        debug!(%event, "[Scheduler] Event");
        transport.send(event).await
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch<T>(
        &mut self,
        inbound: InboundCommand,
        transport: &mut T,
    ) -> Result<(), TransportError>
    where
        T: CommandTransport + ?Sized,
    {
        let command = match Command::parse(&inbound) {
            Ok(command) => command,
            Err(e) => {
                warn!(command = %inbound, error = %e, "[Scheduler] Rejected");
                let name = inbound.name.to_ascii_uppercase();
                return Self::emit(transport, OutboundEvent::nack(&name, &e.reason())).await;
            }
        };
        let name = command.name();

        if !command.targets(&self.tile) {
            debug!(command = name, "[Scheduler] Not addressed to this tile");
            return Self::emit(transport, OutboundEvent::nack(name, "not-targeted")).await;
        }
        if !self.state.accepts(&command) {
            warn!(command = name, state = %self.state, "[Scheduler] Not accepted in current state");
            let reason = format!("state-{}", self.state);
            return Self::emit(transport, OutboundEvent::nack(name, &reason)).await;
        }

        let outcome = match command {
            Command::Status { query, .. } => {
                let event = match self.status(query).await {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "[Scheduler] Status query failed");
                        OutboundEvent::nack(name, "radio-error")
                    }
                };
                return Self::emit(transport, event).await;
            }
            Command::Abort { .. } => {
                self.abort().await;
                Self::emit(transport, OutboundEvent::ack(name)).await?;
                return Self::emit(transport, OutboundEvent::new("stopped")).await;
            }
            Command::Sync(session) => {
                self.start_sync(session);
                Ok(())
            }
            Command::Start(start) => self.start_stream(start).await,
            Command::Cal(cal) => self.start_calibration(&cal).await,
            Command::Pilot(pilot) => self.start_pilot(&pilot).await,
            Command::Stop(stop) => self.stop(&stop).await,
            Command::Setup(setup) => self.store_setup(setup),
        };

        match outcome {
            Ok(()) => {
                info!(command = name, state = %self.state, "[Scheduler] Accepted");
                Self::emit(transport, OutboundEvent::ack(name)).await
            }
            Err(reason) => {
                warn!(command = name, reason = %reason, "[Scheduler] Rejected");
                Self::emit(transport, OutboundEvent::nack(name, &reason)).await
            }
        }
    }

    /// Resolve a command's execution instant against current device time.
    async fn resolve(&self, timing: TimingSpec) -> Result<HwTime, String> {
        let now = self.radio.time_now().await.map_err(|e| {
            warn!(error = %e, "[Scheduler] Device time unavailable");
            "radio-error".to_string()
        })?;
        timing
            .resolve(now, self.config.timing.asap_lead())
            .map_err(|e| {
                warn!(error = %e, "[Scheduler] Execution time rejected");
                e.reason()
            })
    }

    fn check_waveform(waveform: Option<&str>) -> Result<(), String> {
        match waveform {
            Some(w) if !KNOWN_WAVEFORMS.contains(&w.to_ascii_lowercase().as_str()) => {
                Err("unknown-waveform".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Requested capture and burst lengths are bounded by `timing.max_capture_ms`.
    fn check_duration(
        &self,
        command: &'static str,
        duration: Option<Duration>,
    ) -> Result<(), String> {
        match duration {
            Some(d) if d > self.config.timing.max_capture() => {
                let err = CommandError::InvalidArgument {
                    command,
                    arg: "duration_ms".to_string(),
                    value: d.as_millis().to_string(),
                };
                warn!(
                    error = %err,
                    max_ms = self.config.timing.max_capture_ms,
                    "[Scheduler] Duration rejected"
                );
                Err(err.reason())
            }
            _ => Ok(()),
        }
    }

    fn tile_weights(&self, id: &str) -> Result<TileWeights, String> {
        match self.weights.require(id) {
            Ok(weights) => Ok(weights),
            Err(_) if id == self.tile => Ok(TileWeights::unity(&self.tile)),
            Err(_) => Err("unknown-weights".to_string()),
        }
    }

    fn spawn_activity<F>(&mut self, kind: ActivityKind, cancel: CancellationToken, work: F)
    where
        F: std::future::Future<Output = ActivityOutcome> + Send + 'static,
    {
        self.active = Some(Activity {
            kind,
            cancel,
            handle: tokio::spawn(work),
        });
    }

    // ========================================================================
    // SYNC
    // ========================================================================

    fn start_sync(&mut self, session: SessionId) {
        if let Ok(mut waiter) = self.waiter.try_lock() {
            waiter.clear();
        }
        match MeasurementLog::open(&self.config.node.data_dir, &self.tile, &session) {
            Ok(log) => {
                info!(path = %log.path().display(), "[Scheduler] Measurement log ready");
                self.log = Some(log);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "[Scheduler] Measurement log unavailable, results will not be persisted"
                );
                self.log = None;
            }
        }

        let cancel = CancellationToken::new();
        let work = sync_sequence(
            Arc::clone(&self.aligner),
            Arc::clone(&self.tuner),
            Arc::clone(&self.radio),
            Arc::clone(&self.waiter),
            Arc::clone(&self.config),
            cancel.clone(),
        );
        self.spawn_activity(ActivityKind::Sync, cancel, async move {
            ActivityOutcome::Synced(work.await)
        });

        if !self.trigger.fire(session.clone()) {
            warn!(session = %session, "[Scheduler] Sync signal already pending");
        }
        self.session = None;
        self.state = NodeState::Syncing;
    }

    // ========================================================================
    // CAL / PILOT
    // ========================================================================

    fn current_session(&self) -> SessionId {
        self.session
            .clone()
            .unwrap_or_else(|| SessionId::new("unsynced"))
    }

    async fn start_calibration(&mut self, cal: &CalCommand) -> Result<(), String> {
        self.check_duration("CAL", cal.duration)?;
        let at = self.resolve(cal.timing).await?;
        let duration = cal.duration.unwrap_or_else(|| self.config.timing.capture_time());
        let session = self.current_session();
        let pipeline = Arc::clone(&self.pipeline);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        info!(
            at = %at,
            duration_ms = duration.as_millis(),
            "[Scheduler] Loopback measurement scheduled"
        );
        self.spawn_activity(ActivityKind::Measure(cal.mode), cancel, async move {
            ActivityOutcome::Measured(
                pipeline
                    .measure_loopback(&session, at, duration, &token)
                    .await,
            )
        });
        self.state = NodeState::Measuring;
        Ok(())
    }

    async fn start_pilot(&mut self, pilot: &PilotCommand) -> Result<(), String> {
        self.check_duration("PILOT", pilot.duration)?;
        Self::check_waveform(pilot.waveform.as_deref())?;
        let role = PilotRole {
            transmit: pilot.tx_tiles.includes(&self.tile),
            receive: pilot.rx_tiles.includes(&self.tile),
        };
        let at = self.resolve(pilot.timing).await?;
        let duration = pilot
            .duration
            .unwrap_or_else(|| self.config.timing.capture_time());
        let session = self.current_session();
        let pipeline = Arc::clone(&self.pipeline);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        info!(
            at = %at,
            transmit = role.transmit,
            receive = role.receive,
            "[Scheduler] Pilot scheduled"
        );
        self.spawn_activity(
            ActivityKind::Measure(MeasurementMode::Pilot),
            cancel,
            async move {
                ActivityOutcome::Measured(
                    pipeline
                        .measure_pilot(&session, at, duration, role, &token)
                        .await,
                )
            },
        );
        self.state = NodeState::Measuring;
        Ok(())
    }

    // ========================================================================
    // START / STOP
    // ========================================================================

    async fn start_stream(&mut self, start: StartCommand) -> Result<(), String> {
        self.check_duration("START", start.duration)?;
        let waveform = start.waveform.or_else(|| self.defaults.waveform.clone());
        Self::check_waveform(waveform.as_deref())?;
        let direction = start
            .direction
            .or(self.defaults.direction)
            .unwrap_or(Direction::Tx);
        let weights_id = start
            .weights
            .or_else(|| self.defaults.weights.clone())
            .unwrap_or_else(|| self.tile.clone());
        let weights = self.tile_weights(&weights_id)?;
        let at = self.resolve(start.timing).await?;
        let duration = match start.mode {
            StartMode::Burst => Some(
                start
                    .duration
                    .unwrap_or_else(|| self.config.timing.tx_time()),
            ),
            StartMode::Continuous => None,
        };

        let cancel = CancellationToken::new();
        let work = stream_activity(
            Arc::clone(&self.radio),
            Arc::clone(&self.config),
            direction,
            at,
            duration,
            weights,
            cancel.clone(),
        );
        info!(
            at = %at,
            direction = %direction,
            mode = ?start.mode,
            weights = %weights_id,
            "[Scheduler] Stream scheduled"
        );
        self.spawn_activity(ActivityKind::Stream(direction), cancel, async move {
            ActivityOutcome::Streamed {
                direction,
                result: work.await,
            }
        });
        self.state = NodeState::Transmitting;
        Ok(())
    }

    async fn stop(&mut self, stop: &StopCommand) -> Result<(), String> {
        self.pending_stops.retain(|h| !h.is_finished());
        let Some(active) = self.active.as_ref() else {
            debug!("[Scheduler] STOP with nothing running");
            return Ok(());
        };
        let covered = match active.kind {
            ActivityKind::Stream(direction) => stop.scope.covers(direction),
            ActivityKind::Measure(_) => stop.scope == StopScope::Both,
            ActivityKind::Sync => false,
        };
        if !covered {
            debug!(
                kind = ?active.kind,
                scope = ?stop.scope,
                "[Scheduler] STOP does not cover running activity"
            );
            return Ok(());
        }
        let token = active.cancel.clone();

        if stop.timing == TimingSpec::Asap {
            token.cancel();
            return Ok(());
        }
        let now = self.radio.time_now().await.map_err(|_| "radio-error".to_string())?;
        let at = stop
            .timing
            .resolve(now, self.config.timing.asap_lead())
            .map_err(|e| e.reason())?;
        let delay = at.duration_since(now).unwrap_or_default();
        debug!(at = %at, "[Scheduler] STOP scheduled");
        self.pending_stops.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        }));
        Ok(())
    }

    // ========================================================================
    // ABORT
    // ========================================================================

    async fn abort(&mut self) {
        self.halt().await;
        self.state = NodeState::Stopped;
        info!("[Scheduler] Aborted, last setup retained");
    }

    /// Cancel pending schedules and the running activity, joining it within the grace period.
    async fn halt(&mut self) {
        for pending in self.pending_stops.drain(..) {
            pending.abort();
        }
        let Some(mut activity) = self.active.take() else {
            return;
        };
        activity.cancel.cancel();

        let timing = &self.config.timing;
        let grace = timing.join_grace() + timing.scheduling_slack();
        let joined = tokio::time::timeout(grace, &mut activity.handle).await;
        let clean = matches!(joined, Ok(Ok(_)));
        if joined.is_err() {
            error!(
                kind = ?activity.kind,
                grace_ms = grace.as_millis(),
                "[Scheduler] Activity did not stop in time, aborting"
            );
            activity.handle.abort();
        }
        if !clean && activity.kind == ActivityKind::Measure(MeasurementMode::Loopback) {
            match self.switch.disable().await {
                Ok(()) => info!("[Scheduler] Loopback switch forced to reset"),
                Err(e) => error!(error = %e, "[Scheduler] Failed to reset loopback switch"),
            }
        }
    }

    // ========================================================================
    // STATUS / SETUP
    // ========================================================================

    async fn status(&self, query: StatusQuery) -> Result<OutboundEvent, RadioError> {
        let mut event = OutboundEvent::new("STATUS").field("query", query);
        match query {
            StatusQuery::Time => {
                let now = self.radio.time_now().await?;
                event = event.field("time", format!("{:.6}", now.as_secs()));
            }
            StatusQuery::State => {
                event = event.field("state", self.state).field("tile", &self.tile);
                if let Some(session) = &self.session {
                    event = event.field("session", session);
                }
                if let Some(result) = &self.last_result {
                    event = event
                        .field("last_phase", format!("{:.6}", result.phase_difference))
                        .field("last_degraded", result.degraded);
                }
            }
            StatusQuery::Setup => {
                if let Some(setup) = &self.setup {
                    for (key, value) in setup.fields() {
                        event = event.field(&key, value);
                    }
                }
                event = event.field("freq", self.config.radio.center_frequency);
                if let Some(tune) = &self.last_tune {
                    event = event.field("lo_locked", tune.is_ready());
                }
                match self.switch.is_engaged().await {
                    Ok(engaged) => event = event.field("loopback", engaged),
                    Err(e) => warn!(error = %e, "[Scheduler] Loopback switch state unavailable"),
                }
                if let Some(w) = &self.defaults.waveform {
                    event = event.field("waveform", w);
                }
                if let Some(w) = &self.defaults.weights {
                    event = event.field("weights", w);
                }
                if let Some(d) = self.defaults.direction {
                    event = event.field("direction", d);
                }
            }
        }
        Ok(event)
    }

    fn store_setup(&mut self, setup: SetupCommand) -> Result<(), String> {
        Self::check_waveform(setup.waveform.as_deref())?;
        if let Some(id) = &setup.weights {
            self.tile_weights(id)?;
        }
        if setup.waveform.is_some() {
            self.defaults.waveform = setup.waveform;
        }
        if setup.weights.is_some() {
            self.defaults.weights = setup.weights;
        }
        if setup.direction.is_some() {
            self.defaults.direction = setup.direction;
        }
        debug!(defaults = ?self.defaults, "[Scheduler] Experiment defaults stored");
        Ok(())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    async fn record_result<T>(
        &mut self,
        result: CalibrationResult,
        transport: &mut T,
    ) -> Result<(), TransportError>
    where
        T: CommandTransport + ?Sized,
    {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&result) {
                warn!(error = %e, "[Scheduler] Failed to append measurement log");
            }
        }
        let event = OutboundEvent::new("cal-done")
            .field("mode", result.mode)
            .field("phase", format!("{:.6}", result.phase_difference))
            .field("degraded", result.degraded);
        self.last_result = Some(result);
        Self::emit(transport, event).await
    }

    async fn finish<T>(
        &mut self,
        kind: ActivityKind,
        joined: Result<ActivityOutcome, JoinError>,
        transport: &mut T,
    ) -> Result<(), TransportError>
    where
        T: CommandTransport + ?Sized,
    {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(kind = ?kind, error = %e, "[Scheduler] Activity task failed");
                self.state = if kind == ActivityKind::Sync {
                    NodeState::Idle
                } else {
                    NodeState::Ready
                };
                let event = OutboundEvent::nack(kind.command(), "internal-error");
                return Self::emit(transport, event).await;
            }
        };

        match outcome {
            ActivityOutcome::Synced(Ok(summary)) => {
                info!(
                    session = %summary.session,
                    time = %summary.time,
                    tuned_at = %summary.tune.at,
                    "[Scheduler] Synchronized and tuned"
                );
                self.state = NodeState::Ready;
                let event = OutboundEvent::new("synced")
                    .field("session", &summary.session)
                    .field("time", format!("{:.6}", summary.time.as_secs()));
                self.session = Some(summary.session);
                self.last_tune = Some(summary.tune);
                Self::emit(transport, event).await
            }
            ActivityOutcome::Synced(Err(e)) => {
                error!(error = %e, "[Scheduler] Sync sequence failed");
                self.state = NodeState::Idle;
                Self::emit(transport, OutboundEvent::nack("SYNC", e.reason())).await
            }
            ActivityOutcome::Measured(Ok(report)) => {
                self.state = NodeState::Ready;
                info!(
                    mode = %report.mode,
                    tx_samples = report.tx_samples,
                    rx_samples = report.rx_samples,
                    degraded = report.degraded,
                    "[Scheduler] Measurement finished"
                );
                if report.result.is_none() {
                    let event =
                        OutboundEvent::new("pilot-done").field("samples", report.tx_samples);
                    return Self::emit(transport, event).await;
                }
                Ok(())
            }
            ActivityOutcome::Measured(Err(CalibrationError::Cancelled)) => {
                info!(kind = ?kind, "[Scheduler] Measurement stopped");
                self.state = NodeState::Ready;
                Ok(())
            }
            ActivityOutcome::Measured(Err(e)) => {
                error!(error = %e, "[Scheduler] Measurement failed");
                self.state = NodeState::Ready;
                let reason = ActivityError::from(e).reason();
                Self::emit(transport, OutboundEvent::nack(kind.command(), reason)).await
            }
            ActivityOutcome::Streamed { direction, result } => {
                self.state = NodeState::Ready;
                match result {
                    Ok(samples) => {
                        info!(direction = %direction, samples, "[Scheduler] Stream finished");
                        let name = match direction {
                            Direction::Tx => "tx-done",
                            Direction::Rx => "rx-done",
                        };
                        let event = OutboundEvent::new(name).field("samples", samples);
                        Self::emit(transport, event).await
                    }
                    Err(e) => {
                        error!(direction = %direction, error = %e, "[Scheduler] Stream failed");
                        Self::emit(transport, OutboundEvent::nack("START", e.reason())).await
                    }
                }
            }
        }
    }
}

// ============================================================================
// Activity Bodies
// ============================================================================

/// Time zero on the PPS edge, then a timed tune `begin_time` later.
async fn sync_sequence(
    aligner: Arc<TimeAlignmentCoordinator>,
    tuner: Arc<TuningEngine>,
    radio: Arc<dyn RadioDevice>,
    waiter: Arc<Mutex<SyncWaiter>>,
    config: Arc<NodeConfig>,
    cancel: CancellationToken,
) -> Result<SyncSummary, ActivityError> {
    let timing = &config.timing;
    let aligned = {
        let mut waiter = waiter.lock().await;
        aligner
            .align_to_shared_zero(&mut waiter, timing.sync_timeout(), &cancel)
            .await?
    };

    let at = radio.time_now().await? + timing.begin_time();
    let tune = tokio::select! {
        tune = tuner.tune_all(config.radio.center_frequency, &config.radio.channels, at) => tune?,
        () = cancel.cancelled() => return Err(ActivityError::Cancelled),
    };
    if !tune.is_ready() {
        return Err(ActivityError::LoNotLocked {
            rx: tune.rx_lock,
            tx: tune.tx_lock,
        });
    }
    Ok(SyncSummary {
        session: aligned.session,
        time: aligned.time,
        tune,
    })
}

/// START: a weighted tone burst or a receive capture, bounded or until STOP.
async fn stream_activity(
    radio: Arc<dyn RadioDevice>,
    config: Arc<NodeConfig>,
    direction: Direction,
    at: HwTime,
    duration: Option<Duration>,
    weights: TileWeights,
    cancel: CancellationToken,
) -> Result<u64, ActivityError> {
    let channels = config.radio.channels.clone();
    let timing = &config.timing;

    match direction {
        Direction::Tx => {
            let handles = radio.open_tx_stream(&channels).await?;
            let amplitudes = vec![config.calibration.tx_amplitude; channels.len()];
            let tone = ReferenceTone::random(&amplitudes, &mut rand::thread_rng())
                .weighted(&channels, &weights);
            let limit = duration.map(|d| {
                burst_samples(d, config.radio.sample_rate, handles.stream.max_samples_per_packet())
            });

            let mut burst = BurstState::new(cancel.child_token());
            burst.spawn_transmit(handles.stream, tone, at, limit);
            burst.spawn_monitor(handles.events, Duration::from_millis(defaults::TX_EVENT_POLL_MS));

            match duration {
                Some(d) => {
                    let now = radio.time_now().await?;
                    let wait = d
                        + at.duration_since(now).unwrap_or_default()
                        + timing.scheduling_slack();
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = cancel.cancelled() => {}
                    }
                }
                None => cancel.cancelled().await,
            }

            let outcome = burst.shutdown(timing.join_grace()).await;
            if let Some(events) = outcome.events {
                if events.errors() > 0 {
                    warn!(
                        underflows = events.underflows,
                        time_errors = events.time_errors,
                        "[Scheduler] Tx errors during stream"
                    );
                }
            }
            match outcome.transmit {
                Some(sent) => Ok(sent?),
                None => Err(ActivityError::Incomplete),
            }
        }
        Direction::Rx => {
            let mut rx = radio.open_rx_stream(&channels).await?;
            if let Some(d) = duration {
                let capture = rx.receive(at, d, &cancel).await?;
                return Ok(capture.len() as u64);
            }

            let window = Duration::from_millis(defaults::RX_CONTINUOUS_WINDOW_MS);
            let mut start = at;
            let mut total: u64 = 0;
            loop {
                let capture = rx.receive(start, window, &cancel).await?;
                total += capture.len() as u64;
                if capture.truncated || cancel.is_cancelled() {
                    break;
                }
                start = start + window;
                let now = radio.time_now().await?;
                if start < now {
                    debug!(gap_s = now - start, "[Scheduler] Continuous capture fell behind");
                    start = now + timing.asap_lead();
                }
            }
            Ok(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelWeight;
    use crate::radio::{bring_up, RegisterSwitch, SimOptions, SimRadio};
    use crate::transport::{ChannelTransport, ControllerHandle};

    const WAIT: Duration = Duration::from_secs(30);

    struct Node {
        sim: Arc<SimRadio>,
        ctl: ControllerHandle,
        shutdown: CancellationToken,
        task: JoinHandle<Result<(), SchedulerError>>,
        data_dir: tempfile::TempDir,
    }

    async fn node() -> Node {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.node.tile = "tile-a".into();
        config.node.data_dir = dir.path().to_path_buf();
        config.radio.sample_rate = 100e3;
        let config = Arc::new(config);

        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let radio: Arc<dyn RadioDevice> = sim.clone();
        let setup = bring_up(&radio, &config).await.unwrap();
        let cal = &config.calibration;
        let switch = Arc::new(RegisterSwitch::new(
            radio.clone(),
            cal.switch_bank,
            cal.switch_addr,
            cal.switch_loopback_value,
            cal.switch_reset_value,
        ));
        let weights = WeightsTable::from_entries([(
            "tile-b".to_string(),
            vec![ChannelWeight {
                ch: 0,
                phase: 0.5,
                ampl: 0.5,
            }],
        )]);

        let scheduler = CommandScheduler::new(radio, switch, config, weights, Some(setup));
        let (mut transport, ctl) = ChannelTransport::pair(64);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { scheduler.run(&mut transport, token).await });
        Node {
            sim,
            ctl,
            shutdown,
            task,
            data_dir: dir,
        }
    }

    async fn synced() -> Node {
        let mut node = node().await;
        node.ctl.send_line("SYNC abc").await.unwrap();
        assert_eq!(node.ctl.wait_for("ACK", WAIT).await.unwrap().args[0], "SYNC");
        let synced = node.ctl.wait_for("synced", WAIT).await.unwrap();
        assert_eq!(synced.value("session"), Some("abc"));
        node
    }

    async fn state(node: &mut Node) -> String {
        node.ctl.send_line("STATUS STATE").await.unwrap();
        let status = node.ctl.wait_for("STATUS", WAIT).await.unwrap();
        status.value("state").unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_before_sync_is_refused() {
        let mut node = node().await;
        node.ctl.send_line("CAL delay_ms=1000 mode=LB").await.unwrap();
        let nack = node.ctl.next_event(WAIT).await.unwrap();
        assert_eq!(nack.to_string(), "NACK CAL reason=state-IDLE");
        assert!(node.sim.bursts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_tiles_get_not_targeted() {
        let mut node = synced().await;
        node.ctl.send_line("START tiles=tile-x").await.unwrap();
        let nack = node.ctl.next_event(WAIT).await.unwrap();
        assert_eq!(nack.value("reason"), Some("not-targeted"));
        assert_eq!(state(&mut node).await, "READY");
    }

    #[tokio::test(start_paused = true)]
    async fn tx_burst_reports_samples() {
        let mut node = synced().await;
        node.ctl
            .send_line("START delay_ms=500 mode=BURST direction=tx duration_ms=1000")
            .await
            .unwrap();
        assert_eq!(node.ctl.next_event(WAIT).await.unwrap().to_string(), "ACK START");
        assert_eq!(state(&mut node).await, "TRANSMITTING");

        let done = node.ctl.wait_for("tx-done", WAIT).await.unwrap();
        assert_eq!(done.value("samples"), Some("100000"));
        let burst = &node.sim.bursts()[0];
        assert!(!burst.late);
        assert!((burst.amplitudes[0] - 0.8).abs() < 1e-6);
        assert_eq!(state(&mut node).await, "READY");
    }

    #[tokio::test(start_paused = true)]
    async fn weights_of_another_tile_are_applied() {
        let mut node = synced().await;
        node.ctl.send_line("SETUP weights=tile-b").await.unwrap();
        assert_eq!(node.ctl.next_event(WAIT).await.unwrap().to_string(), "ACK SETUP");
        node.ctl
            .send_line("START delay_ms=200 duration_ms=100")
            .await
            .unwrap();
        node.ctl.wait_for("tx-done", WAIT).await.unwrap();
        let burst = &node.sim.bursts()[0];
        assert!((burst.amplitudes[0] - 0.4).abs() < 1e-6);
        assert!((burst.amplitudes[1] - 0.8).abs() < 1e-6);

        node.ctl.send_line("START weights=nobody").await.unwrap();
        let nack = node.ctl.next_event(WAIT).await.unwrap();
        assert_eq!(nack.value("reason"), Some("unknown-weights"));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_rx_runs_until_stop() {
        let mut node = synced().await;
        node.ctl
            .send_line("START mode=CONTINUOUS direction=rx delay_ms=100")
            .await
            .unwrap();
        node.ctl.wait_for("ACK", WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(state(&mut node).await, "TRANSMITTING");

        node.ctl.send_line("STOP direction=tx").await.unwrap();
        node.ctl.wait_for("ACK", WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state(&mut node).await, "TRANSMITTING");

        node.ctl.send_line("STOP direction=rx").await.unwrap();
        let done = node.ctl.wait_for("rx-done", WAIT).await.unwrap();
        let samples: u64 = done.value("samples").unwrap().parse().unwrap();
        assert!(samples >= 200_000, "got {samples}");
        assert_eq!(state(&mut node).await, "READY");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_stop_ends_continuous_tx() {
        let mut node = synced().await;
        node.ctl
            .send_line("START mode=CONTINUOUS delay_ms=100")
            .await
            .unwrap();
        node.ctl.wait_for("ACK", WAIT).await.unwrap();
        node.ctl.send_line("STOP delay_ms=1000").await.unwrap();
        node.ctl.wait_for("ACK", WAIT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(node.ctl.try_next_event().is_none());
        let done = node.ctl.wait_for("tx-done", WAIT).await.unwrap();
        let samples: u64 = done.value("samples").unwrap().parse().unwrap();
        assert!(samples > 50_000 && samples < 150_000, "got {samples}");
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_time_and_setup() {
        let mut node = synced().await;
        node.ctl.send_line("STATUS query=TIME").await.unwrap();
        let time: f64 = node
            .ctl
            .wait_for("STATUS", WAIT)
            .await
            .unwrap()
            .value("time")
            .unwrap()
            .parse()
            .unwrap();
        assert!(time > 5.0 && time < 10.0, "got {time}");

        node.ctl.send_line("STATUS SETUP").await.unwrap();
        let setup = node.ctl.wait_for("STATUS", WAIT).await.unwrap();
        assert_eq!(setup.value("rate"), Some("100000"));
        assert_eq!(setup.value("lo_locked"), Some("true"));
        assert_eq!(setup.value("loopback"), Some("false"));
    }

    #[tokio::test(start_paused = true)]
    async fn cal_result_is_logged_and_reported() {
        let mut node = synced().await;
        node.ctl.send_line("CAL delay_ms=1000 mode=LB duration_ms=1000").await.unwrap();
        node.ctl.wait_for("ACK", WAIT).await.unwrap();
        let done = node.ctl.wait_for("cal-done", WAIT).await.unwrap();
        assert_eq!(done.value("degraded"), Some("false"));

        node.shutdown.cancel();
        node.task.await.unwrap().unwrap();
        let log =
            std::fs::read_to_string(node.data_dir.path().join("data_tile-a_abc.txt")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_hangup_ends_scheduler() {
        let node = node().await;
        drop(node.ctl);
        node.task.await.unwrap().unwrap();
    }
}
