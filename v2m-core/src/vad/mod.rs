//! Speech activity detection.
//!
//! `SpeechDetector` is the plug-in point: the energy detector is the
//! default, and any neural VAD can be swapped in without touching the
//! streaming transcriber.

pub mod energy;

pub use energy::EnergyDetector;

/// Trait for all speech detectors.
///
/// Implementors may be stateful (hangover counters, RNN hidden states).
pub trait SpeechDetector: Send + 'static {
    /// Classify a chunk of 16 kHz mono samples as speech or not.
    fn is_speech(&mut self, frames: &[f32]) -> bool;

    /// Reset any internal state between segments.
    fn reset(&mut self);
}
