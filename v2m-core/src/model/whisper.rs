//! Whisper backend over whisper.cpp (`whisper-rs`).
//!
//! One `WhisperContext` holds the weights; a fresh `WhisperState` is created
//! per decode so segment boundaries never leak decoder state between
//! sessions. The accelerator/CPU choice maps to `use_gpu` at context load.

use std::path::Path;

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::error::{Result, V2mError};
use crate::model::{DecodeRequest, Device, ModelLoader, ModelSpec, SpeechModel};

/// Samples per long-form decode window (30 s at 16 kHz — the encoder's
/// receptive field).
const WINDOW_SAMPLES: usize = 30 * 16_000;

pub struct WhisperModel {
    ctx: WhisperContext,
    language: Option<String>,
    n_threads: i32,
}

impl WhisperModel {
    /// Load model weights from `model_path`.
    ///
    /// # Errors
    /// Returns `V2mError::ModelLoadError` when the file is missing or the
    /// context cannot be created on the requested device.
    pub fn load(model_path: &Path, spec: &ModelSpec) -> Result<Self> {
        if !model_path.exists() {
            return Err(V2mError::ModelLoadError(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let mut params = WhisperContextParameters::default();
        params.use_gpu(spec.device == Device::Accelerator);

        let ctx = WhisperContext::new_with_params(
            model_path.to_str().unwrap_or_default(),
            params,
        )
        .map_err(|e| V2mError::ModelLoadError(e.to_string()))?;

        info!(
            model = %model_path.display(),
            device = ?spec.device,
            compute = ?spec.compute,
            "whisper model loaded"
        );

        Ok(Self {
            ctx,
            language: spec.language.clone(),
            n_threads: (std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4) as i32)
                .min(8),
        })
    }

    fn decode_params<'a>(&'a self, request: &'a DecodeRequest) -> FullParams<'a, 'a> {
        let strategy = if request.beam_size <= 1 {
            SamplingStrategy::Greedy { best_of: 1 }
        } else {
            SamplingStrategy::BeamSearch {
                beam_size: request.beam_size as i32,
                patience: -1.0,
            }
        };

        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.n_threads);
        params.set_translate(false);
        params.set_temperature(request.temperature);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(request.vad_filter);
        if let Some(lang) = self.language.as_deref() {
            params.set_language(Some(lang));
        }
        if let Some(prompt) = request.initial_prompt.as_deref() {
            params.set_initial_prompt(prompt);
            // The prompt already carries the rolling context; conditioning on
            // previously decoded text as well would apply it twice.
            params.set_no_context(true);
        }
        params
    }

    fn decode_window(&self, audio: &[f32], request: &DecodeRequest) -> Result<Vec<String>> {
        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| V2mError::InferenceError(e.to_string()))?;

        state
            .full(self.decode_params(request), audio)
            .map_err(|e| V2mError::InferenceError(e.to_string()))?;

        let n_segments = state.full_n_segments();
        let mut spans = Vec::new();
        for i in 0..n_segments {
            if let Some(segment) = state.get_segment(i) {
                let text = segment
                    .to_str_lossy()
                    .map_err(|e| V2mError::InferenceError(e.to_string()))?;
                let text = text.trim().to_string();
                if !text.is_empty() {
                    spans.push(text);
                }
            }
        }
        Ok(spans)
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe(&mut self, audio: &[f32], request: &DecodeRequest) -> Result<Vec<String>> {
        if audio.is_empty() {
            return Ok(vec![]);
        }

        let Some(batch) = request.batch_size.filter(|_| audio.len() > WINDOW_SAMPLES) else {
            return self.decode_window(audio, request);
        };

        // Long-form path: decode fixed windows, `batch` windows per group.
        let batch = batch.max(1) as usize;
        let windows: Vec<&[f32]> = audio.chunks(WINDOW_SAMPLES).collect();
        debug!(
            windows = windows.len(),
            batch, "long-form decode via windowed batches"
        );

        let mut spans = Vec::new();
        for group in windows.chunks(batch) {
            for window in group {
                spans.extend(self.decode_window(window, request)?);
            }
        }
        Ok(spans)
    }
}

/// Loader resolving the model name to a ggml file under the models dir.
pub struct WhisperLoader {
    /// Directory holding `ggml-<name>.bin` files.
    pub models_dir: std::path::PathBuf,
}

impl ModelLoader for WhisperLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn SpeechModel>> {
        let path = if spec.model.ends_with(".bin") {
            std::path::PathBuf::from(&spec.model)
        } else {
            self.models_dir.join(format!("ggml-{}.bin", spec.model))
        };
        Ok(Box::new(WhisperModel::load(&path, spec)?))
    }
}
