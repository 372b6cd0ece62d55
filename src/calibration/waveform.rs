//! Reference transmit waveform.
//!
//! A constant-envelope tone per channel, `amplitude[c] * exp(j * phase[c])`,
//! repeated in packets of the stream's maximum size. The phase of every
//! channel is drawn once per invocation.

use rand::Rng;
use std::f64::consts::TAU;
use std::time::Duration;

use crate::config::TileWeights;
use crate::radio::Sample;

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTone {
    pub amplitudes: Vec<f64>,
    pub phases: Vec<f64>,
}

impl ReferenceTone {
    /// Fixed phases, mostly for tests.
    pub fn new(amplitudes: Vec<f64>, phases: Vec<f64>) -> Self {
        Self { amplitudes, phases }
    }

    /// Uniform random phase in [0, 2π) per channel.
    pub fn random<R: Rng + ?Sized>(amplitudes: &[f64], rng: &mut R) -> Self {
        Self {
            amplitudes: amplitudes.to_vec(),
            phases: amplitudes.iter().map(|_| rng.gen_range(0.0..TAU)).collect(),
        }
    }

    /// Apply per-channel tx weights; `channels[i]` is the device channel of entry `i`.
    pub fn weighted(mut self, channels: &[usize], weights: &TileWeights) -> Self {
        for (i, &ch) in channels.iter().enumerate().take(self.amplitudes.len()) {
            let w = weights.channel(ch);
            self.amplitudes[i] *= w.ampl;
            self.phases[i] += w.phase;
        }
        self
    }

    /// One packet: `len` samples per channel.
    #[allow(clippy::cast_possible_truncation)]
    pub fn buffers(&self, len: usize) -> Vec<Vec<Sample>> {
        self.amplitudes
            .iter()
            .zip(&self.phases)
            .map(|(&a, &p)| vec![Sample::from_polar(a as f32, p as f32); len])
            .collect()
    }
}

/// Burst length in samples for `duration` at `rate`, rounded up to whole packets.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn burst_samples(duration: Duration, rate: f64, packet: usize) -> u64 {
    let samples = (duration.as_secs_f64() * rate).ceil() as u64;
    let packet = packet.max(1) as u64;
    samples.div_ceil(packet) * packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelWeight;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn random_phases_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let tone = ReferenceTone::random(&[0.0, 0.8], &mut rng);
        assert!(tone.phases.iter().all(|p| (0.0..TAU).contains(p)));

        let buffers = tone.buffers(16);
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].len(), 16);
        assert!(buffers[0].iter().all(|s| s.norm() == 0.0));
        assert!((buffers[1][0].norm() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn weights_scale_and_rotate_matching_channel() {
        let weights = TileWeights {
            tile: "tile-a".into(),
            weights: vec![ChannelWeight {
                ch: 1,
                phase: 0.5,
                ampl: 0.5,
            }],
        };
        let tone = ReferenceTone::new(vec![0.8, 0.8], vec![0.1, 0.1]).weighted(&[0, 1], &weights);
        assert!((tone.amplitudes[0] - 0.8).abs() < 1e-12);
        assert!((tone.amplitudes[1] - 0.4).abs() < 1e-12);
        assert!((tone.phases[1] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn burst_length_rounds_up_to_packets() {
        assert_eq!(burst_samples(Duration::from_millis(10), 1e6, 1000), 10_000);
        assert_eq!(burst_samples(Duration::from_micros(10_500), 1e6, 1000), 11_000);
    }
}
