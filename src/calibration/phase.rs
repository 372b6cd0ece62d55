//! Dominant-bin phase extraction using rustfft
//!
//! Both captures are transformed over the same window. The bin with the
//! largest magnitude in the reference spectrum is taken as the tone bin, and
//! the phase difference is read at that bin:
//!
//! ```text
//! k    = argmax |FFT(ref)|
//! diff = wrap(arg(FFT(meas)[k]) - arg(FFT(ref)[k]))      in (-π, π]
//! ```
//!
//! The result is only meaningful when both sequences were captured over the
//! identical time window.

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use thiserror::Error;

use crate::radio::Sample;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("empty capture")]
    Empty,

    #[error("capture lengths differ (reference {reference}, measured {measured})")]
    LengthMismatch { reference: usize, measured: usize },

    #[error("reference capture carries no signal")]
    NoSignal,
}

/// Phase and magnitude at the tone bin of both captures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseEstimate {
    pub bin: usize,
    pub reference_phase: f64,
    pub measured_phase: f64,
    /// `measured_phase - reference_phase`, wrapped to (-π, π]
    pub difference: f64,
    pub reference_magnitude: f64,
    pub measured_magnitude: f64,
}

impl PhaseEstimate {
    pub fn amplitude_ratio(&self) -> f64 {
        self.measured_magnitude / self.reference_magnitude
    }
}

/// Stateless estimator; plans a forward FFT of the capture length per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseEstimator;

impl PhaseEstimator {
    pub const fn new() -> Self {
        Self
    }

    pub fn estimate(
        &self,
        reference: &[Sample],
        measured: &[Sample],
    ) -> Result<PhaseEstimate, PhaseError> {
        if reference.is_empty() || measured.is_empty() {
            return Err(PhaseError::Empty);
        }
        if reference.len() != measured.len() {
            return Err(PhaseError::LengthMismatch {
                reference: reference.len(),
                measured: measured.len(),
            });
        }

        let ref_spectrum = spectrum(reference);
        let meas_spectrum = spectrum(measured);

        let (bin, peak) = ref_spectrum
            .iter()
            .enumerate()
            .fold((0, 0.0_f64), |(best, best_mag), (i, c)| {
                let mag = c.norm();
                if mag > best_mag {
                    (i, mag)
                } else {
                    (best, best_mag)
                }
            });
        if peak <= 0.0 {
            return Err(PhaseError::NoSignal);
        }

        let reference_phase = ref_spectrum[bin].arg();
        let measured_phase = meas_spectrum[bin].arg();
        Ok(PhaseEstimate {
            bin,
            reference_phase,
            measured_phase,
            difference: wrap_phase(measured_phase - reference_phase),
            reference_magnitude: peak,
            measured_magnitude: meas_spectrum[bin].norm(),
        })
    }

    /// Signed phase difference in radians.
    pub fn estimate_phase(
        &self,
        reference: &[Sample],
        measured: &[Sample],
    ) -> Result<f64, PhaseError> {
        Ok(self.estimate(reference, measured)?.difference)
    }
}

fn spectrum(samples: &[Sample]) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .map(|s| Complex::new(f64::from(s.re), f64::from(s.im)))
        .collect();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(buffer.len()).process(&mut buffer);
    buffer
}

/// Wrap an angle into (-π, π].
pub fn wrap_phase(angle: f64) -> f64 {
    let mut wrapped = angle % TAU;
    if wrapped > PI {
        wrapped -= TAU;
    } else if wrapped <= -PI {
        wrapped += TAU;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn tone(len: usize, cycles: f64, phase: f64, amplitude: f32) -> Vec<Sample> {
        (0..len)
            .map(|n| {
                let theta = TAU * cycles * n as f64 / len as f64 + phase;
                Sample::from_polar(amplitude, theta as f32)
            })
            .collect()
    }

    #[test]
    fn identical_sequences_have_zero_difference() {
        let x = tone(1024, 37.0, 1.2, 0.5);
        let est = PhaseEstimator::new().estimate(&x, &x).unwrap();
        assert_eq!(est.bin, 37);
        assert_eq!(est.difference, 0.0);
    }

    #[test]
    fn recovers_known_shift() {
        let reference = tone(2000, 2.0, 0.3, 0.5);
        let measured = tone(2000, 2.0, 0.3 + 0.7, 0.25);
        let est = PhaseEstimator::new().estimate(&reference, &measured).unwrap();
        assert!((est.difference - 0.7).abs() < 1e-4, "{}", est.difference);
        assert!((est.amplitude_ratio() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn off_bin_tone_still_yields_shift() {
        let reference = tone(1000, 12.37, -2.0, 1.0);
        let measured = tone(1000, 12.37, -2.0 - 1.1, 1.0);
        let diff = PhaseEstimator::new().estimate_phase(&reference, &measured).unwrap();
        assert!((diff + 1.1).abs() < 1e-4, "{diff}");
    }

    #[test]
    fn difference_is_wrapped() {
        let reference = tone(512, 8.0, -3.0, 1.0);
        let measured = tone(512, 8.0, 3.0, 1.0);
        let diff = PhaseEstimator::new().estimate_phase(&reference, &measured).unwrap();
        assert!((diff - (6.0 - TAU)).abs() < 1e-4, "{diff}");
        assert!(diff > -PI && diff <= PI);
    }

    #[test]
    fn shared_window_offset_leaves_difference_unchanged() {
        let long_ref = tone(4096, 64.0, 0.1, 1.0);
        let long_meas = tone(4096, 64.0, 0.1 + 0.9, 1.0);
        let est = PhaseEstimator::new();

        let aligned = est.estimate_phase(&long_ref[..2048], &long_meas[..2048]).unwrap();
        let shifted = est
            .estimate_phase(&long_ref[100..2148], &long_meas[100..2148])
            .unwrap();
        assert!((aligned - shifted).abs() < 1e-4);

        // Different windows break it.
        let skewed = est
            .estimate_phase(&long_ref[..2048], &long_meas[100..2148])
            .unwrap();
        assert!((aligned - skewed).abs() > 0.1);
    }

    #[test]
    fn rejects_bad_input() {
        let est = PhaseEstimator::new();
        assert_eq!(est.estimate(&[], &[]), Err(PhaseError::Empty));
        let a = tone(8, 1.0, 0.0, 1.0);
        let b = tone(9, 1.0, 0.0, 1.0);
        assert_eq!(
            est.estimate(&a, &b),
            Err(PhaseError::LengthMismatch {
                reference: 8,
                measured: 9
            })
        );
        let silent = vec![Sample::new(0.0, 0.0); 8];
        assert_eq!(est.estimate(&silent, &a), Err(PhaseError::NoSignal));
    }

    #[test]
    fn wrap_phase_edges() {
        assert!((wrap_phase(PI) - PI).abs() < 1e-12);
        assert!((wrap_phase(-PI) - PI).abs() < 1e-12);
        assert!((wrap_phase(2.5 * PI) - 0.5 * PI).abs() < 1e-9);
        assert!((wrap_phase(-1.75 * PI) - 0.25 * PI).abs() < 1e-9);
        assert!((wrap_phase(0.25) - 0.25).abs() < 1e-12);
    }
}
