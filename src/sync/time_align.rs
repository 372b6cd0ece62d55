//! PPS time alignment.
//!
//! The command layer delivers the SYNC signal through a single-slot channel
//! ([`sync_channel`]); the coordinator blocks on it, then arms a time reset
//! on the next PPS edge and holds for the settle margin so every tile has
//! latched the same zero before anything else is issued.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::radio::{HwTime, RadioDevice, RadioError, TimeSource};

/// Measurement session identifier carried by SYNC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Sync Signal
// ============================================================================

/// Create the sync signal pair. At most one signal is pending at a time.
pub fn sync_channel() -> (SyncTrigger, SyncWaiter) {
    let (tx, rx) = mpsc::channel(1);
    (SyncTrigger(tx), SyncWaiter(rx))
}

#[derive(Debug, Clone)]
pub struct SyncTrigger(mpsc::Sender<SessionId>);

impl SyncTrigger {
    /// Deliver the signal. Returns `false` if one is already pending.
    pub fn fire(&self, session: SessionId) -> bool {
        self.0.try_send(session).is_ok()
    }
}

#[derive(Debug)]
pub struct SyncWaiter(mpsc::Receiver<SessionId>);

impl SyncWaiter {
    /// Block until the signal arrives. `None` on timeout or when every trigger is gone.
    pub async fn wait(&mut self, timeout: Duration) -> Option<SessionId> {
        tokio::time::timeout(timeout, self.0.recv()).await.ok().flatten()
    }

    /// Discard a signal left over from an abandoned sequence.
    pub fn clear(&mut self) {
        while self.0.try_recv().is_ok() {}
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Outcome of a completed alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSession {
    pub session: SessionId,
    /// Device time read right after the settle margin.
    pub time: HwTime,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no sync signal within {0:?}")]
    SignalTimeout(Duration),

    #[error("time alignment cancelled")]
    Cancelled,

    #[error("time reset did not latch (device time {0} after settle)")]
    NotLatched(HwTime),

    #[error(transparent)]
    Radio(#[from] RadioError),
}

pub struct TimeAlignmentCoordinator {
    radio: Arc<dyn RadioDevice>,
    settle: Duration,
}

impl TimeAlignmentCoordinator {
    pub fn new(radio: Arc<dyn RadioDevice>, settle: Duration) -> Self {
        Self { radio, settle }
    }

    /// Wait for the sync signal, then latch device time zero on the next PPS edge.
    ///
    /// Order: signal, PPS time source, reset armed for the next edge, settle.
    /// Never sets the time immediately.
    pub async fn align_to_shared_zero(
        &self,
        waiter: &mut SyncWaiter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AlignedSession, SyncError> {
        let session = tokio::select! {
            signal = waiter.wait(timeout) => signal.ok_or(SyncError::SignalTimeout(timeout))?,
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
        };
        info!(session = %session, "[TimeAlign] Sync signal received");

        self.radio.set_time_source(TimeSource::External).await?;
        self.radio.set_time_next_pps(HwTime::ZERO).await?;
        debug!(settle_ms = self.settle.as_millis(), "[TimeAlign] Reset armed, settling");

        tokio::select! {
            () = tokio::time::sleep(self.settle) => {}
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
        }

        let time = self.radio.time_now().await?;
        if time < HwTime::ZERO || time.as_secs() > self.settle.as_secs_f64() {
            return Err(SyncError::NotLatched(time));
        }
        info!(session = %session, time = %time, "[TimeAlign] Time zero latched");

        Ok(AlignedSession { session, time })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{SimOptions, SimRadio};

    #[tokio::test(start_paused = true)]
    async fn aligns_on_pps_edge_after_signal() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let coordinator = TimeAlignmentCoordinator::new(sim.clone(), Duration::from_secs(2));
        let (trigger, mut waiter) = sync_channel();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(trigger.fire(SessionId::new("abc")));

        let aligned = coordinator
            .align_to_shared_zero(&mut waiter, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(aligned.session.as_str(), "abc");
        // Edge at 1.0 s of sim time, read at 2.25 s.
        assert!((aligned.time.as_secs() - 1.25).abs() < 1e-6, "{}", aligned.time);
        assert_eq!(sim.time_source(), TimeSource::External);

        let later = sim.time_now().await.unwrap();
        assert!(later >= aligned.time);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sim.time_now().await.unwrap() > later);
    }

    #[tokio::test(start_paused = true)]
    async fn second_signal_is_refused_while_one_is_pending() {
        let (trigger, mut waiter) = sync_channel();
        assert!(trigger.fire(SessionId::new("one")));
        assert!(!trigger.fire(SessionId::new("two")));
        waiter.clear();
        assert!(trigger.fire(SessionId::new("three")));
        assert_eq!(
            waiter.wait(Duration::from_millis(1)).await,
            Some(SessionId::new("three"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_signal_times_out() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let coordinator = TimeAlignmentCoordinator::new(sim.clone(), Duration::from_secs(2));
        let (_trigger, mut waiter) = sync_channel();

        let err = coordinator
            .align_to_shared_zero(
                &mut waiter,
                Duration::from_millis(500),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SignalTimeout(_)));
        assert_eq!(sim.pps_resets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_settle() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let coordinator = TimeAlignmentCoordinator::new(sim, Duration::from_secs(2));
        let (trigger, mut waiter) = sync_channel();
        trigger.fire(SessionId::new("abc"));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });
        let err = coordinator
            .align_to_shared_zero(&mut waiter, Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
