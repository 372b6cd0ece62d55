//! Burst activities and their shared quit signal.
//!
//! A measurement runs up to three activities against one future device time:
//! the transmit burst, the tx metadata monitor and the receive capture. They
//! live in a [`BurstState`] created per measurement; `shutdown` raises quit
//! and joins every activity, aborting whatever outlives the grace period.

use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::waveform::ReferenceTone;
use crate::radio::{
    HwTime, RadioResult, RxCapture, RxStream, Sample, TxEventKind, TxEventSource, TxMetadata,
    TxStream,
};

// ============================================================================
// Transmit
// ============================================================================

/// Stream `tone` starting at `at` until `limit` samples were sent or quit fires.
///
/// Always finishes with an end-of-burst packet of one zero sample per channel.
/// Returns the number of samples sent per channel (excluding end-of-burst).
pub async fn transmit_burst(
    stream: &mut dyn TxStream,
    tone: &ReferenceTone,
    at: HwTime,
    limit: Option<u64>,
    quit: &CancellationToken,
) -> RadioResult<u64> {
    let packet = stream.max_samples_per_packet();
    let buffers = tone.buffers(packet);
    let mut metadata = TxMetadata::timed_start(at);
    let mut sent: u64 = 0;

    while limit.map_or(true, |l| sent < l) {
        let n = tokio::select! {
            biased;
            () = quit.cancelled() => break,
            n = stream.send(&buffers, &metadata) => n?,
        };
        sent += n as u64;
        metadata = TxMetadata::continuation();
    }

    let eob = vec![vec![Sample::new(0.0, 0.0)]; stream.channels().len()];
    stream.send(&eob, &TxMetadata::end_of_burst()).await?;
    debug!(samples = sent, "[Burst] Transmit finished");
    Ok(sent)
}

// ============================================================================
// Metadata Monitor
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxEventCounts {
    pub burst_acks: u32,
    pub underflows: u32,
    pub sequence_errors: u32,
    pub time_errors: u32,
}

impl TxEventCounts {
    pub const fn errors(&self) -> u32 {
        self.underflows + self.sequence_errors + self.time_errors
    }
}

/// Surface tx-side errors until quit, then drain for one more poll.
pub async fn monitor_tx_events(
    events: &mut dyn TxEventSource,
    poll: Duration,
    quit: &CancellationToken,
) -> TxEventCounts {
    let mut counts = TxEventCounts::default();
    let mut draining = false;
    loop {
        let event = tokio::select! {
            biased;
            () = quit.cancelled(), if !draining => {
                draining = true;
                continue;
            }
            event = events.recv_event(poll) => event,
        };
        match event {
            Ok(Some(event)) => {
                match event.kind {
                    TxEventKind::BurstAck => counts.burst_acks += 1,
                    TxEventKind::Underflow => counts.underflows += 1,
                    TxEventKind::SequenceError => counts.sequence_errors += 1,
                    TxEventKind::TimeError => counts.time_errors += 1,
                }
                if event.kind.is_error() {
                    warn!(
                        kind = ?event.kind,
                        channel = event.channel,
                        time = ?event.time,
                        "[Burst] Tx metadata error"
                    );
                }
            }
            Ok(None) if draining => break,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "[Burst] Tx event channel failed");
                break;
            }
        }
    }
    counts
}

// ============================================================================
// Burst State
// ============================================================================

#[derive(Debug)]
pub enum ActivityReport {
    Transmit(RadioResult<u64>),
    Monitor(TxEventCounts),
    Receive(RadioResult<RxCapture>),
}

/// What came back from the activities after shutdown.
#[derive(Debug, Default)]
pub struct BurstOutcome {
    pub transmit: Option<RadioResult<u64>>,
    pub events: Option<TxEventCounts>,
    pub capture: Option<RadioResult<RxCapture>>,
    /// Activities aborted after the grace period expired.
    pub aborted: usize,
}

/// Quit signal plus the activity handles of one measurement.
pub struct BurstState {
    quit: CancellationToken,
    activities: JoinSet<ActivityReport>,
}

impl BurstState {
    pub fn new(quit: CancellationToken) -> Self {
        Self {
            quit,
            activities: JoinSet::new(),
        }
    }

    pub fn spawn_transmit(
        &mut self,
        mut stream: Box<dyn TxStream>,
        tone: ReferenceTone,
        at: HwTime,
        limit: Option<u64>,
    ) {
        let quit = self.quit.clone();
        self.activities.spawn(async move {
            ActivityReport::Transmit(transmit_burst(stream.as_mut(), &tone, at, limit, &quit).await)
        });
    }

    pub fn spawn_monitor(&mut self, mut events: Box<dyn TxEventSource>, poll: Duration) {
        let quit = self.quit.clone();
        self.activities.spawn(async move {
            ActivityReport::Monitor(monitor_tx_events(events.as_mut(), poll, &quit).await)
        });
    }

    pub fn spawn_receive(
        &mut self,
        mut stream: Box<dyn RxStream>,
        start: HwTime,
        duration: Duration,
    ) {
        let quit = self.quit.clone();
        self.activities.spawn(async move {
            ActivityReport::Receive(stream.receive(start, duration, &quit).await)
        });
    }

    /// Raise quit and join every activity, aborting stragglers after `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> BurstOutcome {
        self.quit.cancel();
        let mut outcome = BurstOutcome::default();

        let joined = tokio::time::timeout(grace, async {
            while let Some(joined) = self.activities.join_next().await {
                Self::record(&mut outcome, joined);
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                remaining = self.activities.len(),
                grace_ms = grace.as_millis(),
                "[Burst] Activities outlived grace period, aborting"
            );
            outcome.aborted = self.activities.len();
            self.activities.abort_all();
            while let Some(joined) = self.activities.join_next().await {
                Self::record(&mut outcome, joined);
            }
        }
        outcome
    }

    fn record(
        outcome: &mut BurstOutcome,
        joined: Result<ActivityReport, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(ActivityReport::Transmit(r)) => outcome.transmit = Some(r),
            Ok(ActivityReport::Monitor(c)) => outcome.events = Some(c),
            Ok(ActivityReport::Receive(r)) => outcome.capture = Some(r),
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "[Burst] Activity panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{Direction, RadioDevice, SimOptions, SimRadio};

    #[tokio::test(start_paused = true)]
    async fn limited_burst_ends_with_eob() {
        let sim = SimRadio::new(SimOptions::default());
        let handles = sim.open_tx_stream(&[0, 1]).await.unwrap();
        let (mut stream, mut events) = (handles.stream, handles.events);
        let at = sim.time_now().await.unwrap() + Duration::from_millis(100);
        let tone = ReferenceTone::new(vec![0.0, 0.8], vec![0.0, 1.0]);

        let quit = CancellationToken::new();
        let sent = transmit_burst(stream.as_mut(), &tone, at, Some(5_000), &quit)
            .await
            .unwrap();
        assert_eq!(sent, 5_000);
        let bursts = sim.bursts();
        assert_eq!(bursts.len(), 1);
        assert!(bursts[0].end.is_some());

        quit.cancel();
        let counts = monitor_tx_events(events.as_mut(), Duration::from_millis(10), &quit).await;
        assert_eq!(counts.burst_acks, 1);
        assert_eq!(counts.errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_joins_all_activities() {
        let sim = SimRadio::new(SimOptions::default());
        sim.set_rate(Direction::Rx, 0, 10_000.0).await.unwrap();
        let handles = sim.open_tx_stream(&[0]).await.unwrap();
        let rx = sim.open_rx_stream(&[0]).await.unwrap();
        let at = sim.time_now().await.unwrap() + Duration::from_millis(200);

        let mut state = BurstState::new(CancellationToken::new());
        state.spawn_transmit(handles.stream, ReferenceTone::new(vec![0.8], vec![0.0]), at, None);
        state.spawn_monitor(handles.events, Duration::from_millis(10));
        state.spawn_receive(rx, at, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(700)).await;
        let outcome = state.shutdown(Duration::from_secs(2)).await;
        assert_eq!(outcome.aborted, 0);
        assert!(outcome.transmit.unwrap().unwrap() > 0);
        assert_eq!(outcome.events.unwrap().burst_acks, 1);
        let capture = outcome.capture.unwrap().unwrap();
        assert!(capture.truncated);
        assert!(capture.len() < 10_000);
    }
}
