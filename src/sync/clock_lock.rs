//! Reference clock lock confirmation.
//!
//! Selects the reference input, then polls every board's `ref_locked` sensor
//! against one shared deadline. A board that does not lock in time is a
//! recoverable outcome (`false`); the caller decides whether to abort.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::radio::{ClockSource, RadioDevice};

pub struct ClockLockManager {
    radio: Arc<dyn RadioDevice>,
    poll_interval: Duration,
}

impl ClockLockManager {
    pub fn new(radio: Arc<dyn RadioDevice>, poll_interval: Duration) -> Self {
        Self {
            radio,
            poll_interval,
        }
    }

    /// Select `source` and wait until every board reports its reference locked.
    ///
    /// Boards are checked in order; the first board still unlocked at the
    /// deadline fails the whole confirmation. The last poll happens no later
    /// than the deadline itself.
    pub async fn confirm_lock(&self, source: ClockSource, timeout: Duration) -> bool {
        if let Err(e) = self.radio.set_clock_source(source).await {
            warn!(error = %e, ?source, "[ClockLock] Failed to select clock source");
            return false;
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let boards = self.radio.num_boards();

        for board in 0..boards {
            loop {
                match self.radio.ref_locked(board).await {
                    Ok(true) => {
                        debug!(board, "[ClockLock] Reference locked");
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(board, error = %e, "[ClockLock] Sensor read failed");
                        return false;
                    }
                }

                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        board,
                        timeout_ms = timeout.as_millis(),
                        "[ClockLock] Failed to lock to external reference"
                    );
                    return false;
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        }

        info!(
            boards,
            elapsed_ms = started.elapsed().as_millis(),
            ?source,
            "[ClockLock] Reference locked on all boards"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{SimOptions, SimRadio};

    const POLL: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn locks_as_soon_as_sensor_reports() {
        let sim = Arc::new(SimRadio::new(SimOptions {
            ref_lock_delay: Some(Duration::from_millis(5)),
            ..SimOptions::default()
        }));
        let manager = ClockLockManager::new(sim.clone(), POLL);

        let started = Instant::now();
        assert!(manager.confirm_lock(ClockSource::External, Duration::from_secs(1)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5));
        assert!(elapsed <= Duration::from_millis(5) + POLL);
        assert_eq!(sim.clock_source(), ClockSource::External);
    }

    #[tokio::test(start_paused = true)]
    async fn never_locking_times_out_without_overshoot() {
        let sim = Arc::new(SimRadio::new(SimOptions {
            ref_lock_delay: None,
            ..SimOptions::default()
        }));
        let manager = ClockLockManager::new(sim, Duration::from_millis(7));

        for timeout_ms in [1, 10, 250, 1000] {
            let timeout = Duration::from_millis(timeout_ms);
            let started = Instant::now();
            assert!(!manager.confirm_lock(ClockSource::External, timeout).await);
            let elapsed = started.elapsed();
            assert!(elapsed >= timeout, "{elapsed:?} < {timeout:?}");
            assert!(elapsed <= timeout + Duration::from_millis(7));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_unlocked_board_fails_all() {
        let sim = Arc::new(SimRadio::new(SimOptions {
            boards: 3,
            unlockable_board: Some(2),
            ..SimOptions::default()
        }));
        let manager = ClockLockManager::new(sim, POLL);
        assert!(!manager.confirm_lock(ClockSource::External, Duration::from_millis(100)).await);
    }
}
