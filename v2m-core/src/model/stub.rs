//! `StubModel` — placeholder backend that echoes metadata without real
//! inference. Lets the full capture → segment → daemon path be exercised
//! end-to-end on machines without model files.

use tracing::debug;

use crate::error::Result;
use crate::model::{DecodeRequest, InferenceMode, ModelLoader, ModelSpec, SpeechModel};

/// Echo-style stub model.
///
/// For every non-trivial chunk it emits:
/// - provisional: `"…"`
/// - final: `"[captured <secs>s]"`
pub struct StubModel;

impl StubModel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for StubModel {
    fn transcribe(&mut self, audio: &[f32], request: &DecodeRequest) -> Result<Vec<String>> {
        if audio.len() < 160 {
            return Ok(vec![]);
        }

        let spans = match request.mode {
            InferenceMode::Provisional => vec!["\u{2026}".to_string()],
            InferenceMode::Final => {
                vec![format!("[captured {:.1}s]", audio.len() as f32 / 16_000.0)]
            }
        };
        Ok(spans)
    }

    fn reset(&mut self) {
        debug!("StubModel::reset");
    }
}

/// Loader that always produces a fresh `StubModel`.
pub struct StubLoader;

impl ModelLoader for StubLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn SpeechModel>> {
        debug!(model = spec.model.as_str(), "loading stub model");
        Ok(Box::new(StubModel::new()))
    }
}
