//! Energy-based speech detection: RMS threshold + hangover counter.
//!
//! 1. Compute RMS of the incoming chunk.
//! 2. RMS ≥ `threshold` → speech, reset hangover counter.
//! 3. RMS < `threshold` with hangover remaining → still speech (prevents
//!    clipping syllable endings).
//! 4. Otherwise → not speech.

use super::SpeechDetector;

/// A simple energy-based speech detector.
#[derive(Debug, Clone)]
pub struct EnergyDetector {
    /// RMS amplitude threshold. Typical range 0.01–0.05 for a quiet mic.
    threshold: f32,
    /// Below-threshold chunks still reported as speech after real speech.
    hangover_chunks: u32,
    /// Current hangover countdown.
    hangover_counter: u32,
}

impl EnergyDetector {
    pub fn new(threshold: f32, hangover_chunks: u32) -> Self {
        Self {
            threshold,
            hangover_chunks,
            hangover_counter: 0,
        }
    }

    /// Root-mean-square of a sample slice.
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new(0.02, 8)
    }
}

impl SpeechDetector for EnergyDetector {
    fn is_speech(&mut self, frames: &[f32]) -> bool {
        let rms = Self::rms(frames);

        if rms >= self.threshold {
            self.hangover_counter = self.hangover_chunks;
            true
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
