//! Speech recognizer abstraction.
//!
//! `SpeechModel` decouples the worker from any specific backend (stub echo,
//! whisper.cpp, a future ONNX engine). `&mut self` on `transcribe`
//! intentionally expresses that decoders are stateful — KV caches, beam
//! state — and all mutation is serialised on the worker thread.

pub mod stub;

#[cfg(feature = "whisper")]
pub mod whisper;

#[cfg(feature = "whisper")]
pub use whisper::WhisperModel;

pub use stub::StubModel;

use crate::error::Result;

/// Where the recognizer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// GPU / NPU context.
    Accelerator,
    Cpu,
}

/// Numeric precision of the loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeKind {
    Float16,
    Int8,
}

/// What to load, and where.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Model name or on-disk path, backend-interpreted.
    pub model: String,
    pub device: Device,
    pub compute: ComputeKind,
    /// Recognition language; `None` means auto-detect.
    pub language: Option<String>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            model: "distil-large-v3".into(),
            device: Device::Accelerator,
            compute: ComputeKind::Float16,
            language: None,
        }
    }
}

/// Whether a decode is a low-latency preview or the authoritative pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMode {
    /// Best-effort streaming preview; may be revised or discarded.
    Provisional,
    /// Emitted once at segment commit.
    Final,
}

/// Decoding parameters for a single inference.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub mode: InferenceMode,
    /// 1 selects greedy decoding.
    pub beam_size: u32,
    pub temperature: f32,
    /// Skip silence-only regions inside the decoder where supported.
    pub vad_filter: bool,
    /// Rolling context fed as the decoder's initial prompt. While set, the
    /// decoder's own condition-on-previous-text must stay disabled so the
    /// context is not applied twice.
    pub initial_prompt: Option<String>,
    /// Long-form decode: windows decoded per state, `None` = standard path.
    pub batch_size: Option<u32>,
}

impl DecodeRequest {
    /// The fast settings used for streaming previews.
    pub fn provisional(initial_prompt: Option<String>) -> Self {
        Self {
            mode: InferenceMode::Provisional,
            beam_size: 1,
            temperature: 0.0,
            vad_filter: true,
            initial_prompt,
            batch_size: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.mode == InferenceMode::Final
    }
}

/// Contract for recognition backends.
pub trait SpeechModel: Send + 'static {
    /// Transcribe 16 kHz mono f32 audio into recognized text spans.
    ///
    /// May return an empty list when no speech is recognized.
    fn transcribe(&mut self, audio: &[f32], request: &DecodeRequest) -> Result<Vec<String>>;

    /// Reset decoder state between segments.
    fn reset(&mut self) {}
}

/// Constructs a backend for a given spec. The worker owns one of these and
/// re-invokes it after keep-warm unloads and for device fallback.
pub trait ModelLoader: Send + 'static {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn SpeechModel>>;
}

impl<F> ModelLoader for F
where
    F: Fn(&ModelSpec) -> Result<Box<dyn SpeechModel>> + Send + 'static,
{
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn SpeechModel>> {
        self(spec)
    }
}
