//! Append-only measurement log.
//!
//! One file per SYNC session, `data_<tile>_<session>.txt`, one CSV line per
//! calibration result:
//!
//! ```text
//! utc_timestamp,hw_time_s,mode,phase_rad,phase_deg,amplitude,degraded
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::calibration::CalibrationResult;
use crate::sync::SessionId;

const HEADER: &str = "utc_timestamp,hw_time_s,mode,phase_rad,phase_deg,amplitude,degraded";

#[derive(Debug, Error)]
#[error("measurement log I/O error ({}): {source}", .path.display())]
pub struct LogError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug)]
pub struct MeasurementLog {
    path: PathBuf,
    file: File,
}

impl MeasurementLog {
    pub fn file_name(tile: &str, session: &SessionId) -> String {
        format!("data_{tile}_{session}.txt")
    }

    /// Open (or continue) the log of `session`. The header is written once.
    pub fn open(dir: &Path, tile: &str, session: &SessionId) -> Result<Self, LogError> {
        let path = dir.join(Self::file_name(tile, session));
        let err = |source| LogError {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(err)?;
        if file.metadata().map_err(err)?.len() == 0 {
            writeln!(file, "{HEADER}").map_err(err)?;
        }
        debug!(path = %path.display(), "[MeasurementLog] Opened");
        Ok(Self { path, file })
    }

    pub fn append(&mut self, result: &CalibrationResult) -> Result<(), LogError> {
        let amplitude = result
            .amplitude
            .map_or_else(String::new, |a| format!("{a:.6}"));
        writeln!(
            self.file,
            "{},{:.6},{},{:.6},{:.3},{},{}",
            result.recorded_at.to_rfc3339(),
            result.captured_at.as_secs(),
            result.mode,
            result.phase_difference,
            result.phase_degrees(),
            amplitude,
            result.degraded
        )
        .and_then(|()| self.file.flush())
        .map_err(|source| LogError {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
