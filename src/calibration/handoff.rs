//! Single-slot result handoff.
//!
//! Capacity one: a producer finishing a second measurement while the first
//! result is still pending waits instead of overwriting it.

use tokio::sync::mpsc;

use super::{CalibrationError, CalibrationResult};

pub fn result_slot() -> (ResultPublisher, ResultReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ResultPublisher(tx), ResultReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct ResultPublisher(mpsc::Sender<CalibrationResult>);

impl ResultPublisher {
    /// Put a result into the slot, waiting while it is occupied.
    pub async fn publish(&self, result: CalibrationResult) -> Result<(), CalibrationError> {
        self.0
            .send(result)
            .await
            .map_err(|_| CalibrationError::HandoffClosed)
    }
}

#[derive(Debug)]
pub struct ResultReceiver(mpsc::Receiver<CalibrationResult>);

impl ResultReceiver {
    /// Wait for the next result. `None` once every publisher is gone.
    pub async fn take(&mut self) -> Option<CalibrationResult> {
        self.0.recv().await
    }

    pub fn try_take(&mut self) -> Option<CalibrationResult> {
        self.0.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::MeasurementMode;
    use crate::radio::HwTime;
    use crate::sync::SessionId;
    use std::time::Duration;

    fn result(phase: f64) -> CalibrationResult {
        CalibrationResult {
            session: SessionId::new("abc"),
            mode: MeasurementMode::Loopback,
            reference_phase: 0.0,
            measured_phase: phase,
            phase_difference: phase,
            amplitude: None,
            captured_at: HwTime::from_secs(7.0),
            recorded_at: chrono::Utc::now(),
            degraded: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_publish_blocks_until_first_is_taken() {
        let (publisher, mut receiver) = result_slot();
        publisher.publish(result(0.1)).await.unwrap();

        let second = publisher.clone();
        let pending = tokio::spawn(async move { second.publish(result(0.2)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(receiver.take().await.map(|r| r.phase_difference), Some(0.1));
        pending.await.unwrap().unwrap();
        assert_eq!(receiver.try_take().map(|r| r.phase_difference), Some(0.2));
        assert!(receiver.try_take().is_none());
    }

    #[tokio::test]
    async fn publish_fails_once_receiver_is_gone() {
        let (publisher, receiver) = result_slot();
        drop(receiver);
        assert!(matches!(
            publisher.publish(result(0.0)).await,
            Err(CalibrationError::HandoffClosed)
        ));
    }
}
