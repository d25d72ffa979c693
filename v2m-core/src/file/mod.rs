//! Batch transcription of on-disk media.
//!
//! Audio is normalized by an external `ffmpeg` subprocess to raw 32-bit
//! float little-endian, 16 kHz mono, streamed over stdout into memory —
//! no temp files. The normalized audio is routed through the same model
//! worker as the streaming path, so at most one inference runs at a time.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    error::{Result, V2mError},
    model::{DecodeRequest, InferenceMode},
    stream::FinalDecode,
    worker::{InferenceJob, WorkerHandle},
};

/// Containers that only need normalization.
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "m4a", "aac", "aiff"];

/// Containers that need the video stream stripped.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm"];

const AUDIO_TIMEOUT: Duration = Duration::from_secs(120);
const VIDEO_TIMEOUT: Duration = Duration::from_secs(300);

/// Above this duration the batched decode path is selected.
const BATCH_THRESHOLD_SECS: f64 = 30.0;
const BATCH_SIZE: u32 = 16;

const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Dispatch by file extension.
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Raw f32le bytes → samples. A trailing partial sample is discarded.
pub fn samples_from_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Batched decode for long-form audio, standard path otherwise.
pub fn batch_for_duration(duration_secs: f64) -> Option<u32> {
    (duration_secs > BATCH_THRESHOLD_SECS).then_some(BATCH_SIZE)
}

pub struct FileTranscriber {
    worker: WorkerHandle,
    decode: FinalDecode,
    /// Transcoder executable, `ffmpeg` unless overridden.
    transcoder: String,
}

impl FileTranscriber {
    pub fn new(worker: WorkerHandle, decode: FinalDecode) -> Self {
        Self {
            worker,
            decode,
            transcoder: "ffmpeg".into(),
        }
    }

    pub fn with_transcoder(mut self, transcoder: impl Into<String>) -> Self {
        self.transcoder = transcoder.into();
        self
    }

    /// Transcribe an audio or video file into one concatenated transcript.
    ///
    /// # Errors
    /// - `V2mError::ValidationError` for missing files or unsupported
    ///   extensions.
    /// - `V2mError::TranscoderError` when ffmpeg is missing, exits non-zero
    ///   or exceeds its timeout.
    /// - `V2mError::ModelLoadError` / `V2mError::InferenceError` from the
    ///   worker.
    pub async fn transcribe_file(&self, path: &Path) -> Result<String> {
        if !path.exists() {
            return Err(V2mError::ValidationError(format!(
                "file not found: {}",
                path.display()
            )));
        }
        let kind = media_kind(path).ok_or_else(|| {
            V2mError::ValidationError(format!(
                "unsupported format: {:?} (supported: {} / {})",
                path.extension().unwrap_or_default(),
                AUDIO_EXTENSIONS.join(", "),
                VIDEO_EXTENSIONS.join(", "),
            ))
        })?;

        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        info!(file = %path.display(), file_size, kind = ?kind, "transcribing file");

        let extract_started = Instant::now();
        let samples = self.extract_samples(path, kind).await?;
        let extract_secs = extract_started.elapsed().as_secs_f64();

        let duration_secs = samples.len() as f64 / SAMPLE_RATE as f64;
        let batch_size = batch_for_duration(duration_secs);
        debug!(
            duration_secs = format_args!("{duration_secs:.1}"),
            batched = batch_size.is_some(),
            "audio normalized"
        );

        let request = DecodeRequest {
            mode: InferenceMode::Final,
            beam_size: self.decode.beam_size,
            temperature: self.decode.temperature,
            vad_filter: self.decode.vad_filter,
            initial_prompt: None,
            batch_size,
        };

        let infer_started = Instant::now();
        let spans = self
            .worker
            .run_inference(InferenceJob {
                audio: samples,
                request,
            })
            .await?;
        let infer_secs = infer_started.elapsed().as_secs_f64();

        let text = spans
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let rtf = if duration_secs > 0.0 {
            infer_secs / duration_secs
        } else {
            0.0
        };
        info!(
            file = %path.display(),
            file_size,
            duration_secs = format_args!("{duration_secs:.1}"),
            extract_secs = format_args!("{extract_secs:.2}"),
            infer_secs = format_args!("{infer_secs:.2}"),
            rtf = format_args!("{rtf:.3}"),
            chars = text.len(),
            "file transcription complete"
        );

        Ok(text)
    }

    /// Run the transcoder and collect normalized samples from its stdout.
    async fn extract_samples(&self, path: &Path, kind: MediaKind) -> Result<Vec<f32>> {
        let mut cmd = Command::new(&self.transcoder);
        cmd.arg("-i").arg(path);
        if kind == MediaKind::Video {
            cmd.arg("-vn");
        }
        cmd.args([
            "-acodec",
            "pcm_f32le",
            "-ar",
            "16000",
            "-ac",
            "1",
            "-f",
            "f32le",
            "-loglevel",
            "error",
            "pipe:1",
        ]);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let timeout = match kind {
            MediaKind::Audio => AUDIO_TIMEOUT,
            MediaKind::Video => VIDEO_TIMEOUT,
        };

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                V2mError::TranscoderError(format!(
                    "transcoder timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| V2mError::TranscoderError(format!("failed to run transcoder: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(V2mError::TranscoderError(format!(
                "transcoder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(samples_from_f32le(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn audio_extensions_dispatch_to_audio() {
        for ext in ["wav", "mp3", "flac", "ogg", "m4a", "aac", "aiff"] {
            let path = PathBuf::from(format!("clip.{ext}"));
            assert_eq!(media_kind(&path), Some(MediaKind::Audio), "{ext}");
        }
    }

    #[test]
    fn video_extensions_dispatch_to_video() {
        for ext in ["mp4", "mov", "mkv", "avi", "webm"] {
            let path = PathBuf::from(format!("clip.{ext}"));
            assert_eq!(media_kind(&path), Some(MediaKind::Video), "{ext}");
        }
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        assert_eq!(media_kind(Path::new("notes.txt")), None);
        assert_eq!(media_kind(Path::new("noext")), None);
    }

    #[test]
    fn dispatch_is_case_insensitive() {
        assert_eq!(media_kind(Path::new("CLIP.WAV")), Some(MediaKind::Audio));
        assert_eq!(media_kind(Path::new("clip.MkV")), Some(MediaKind::Video));
    }

    #[test]
    fn f32le_decoding_round_trips() {
        let samples = [0.0f32, 0.5, -0.25, 1.0];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(samples_from_f32le(&bytes), samples);
    }

    #[test]
    fn f32le_decoding_drops_trailing_partial_sample() {
        let mut bytes = 1.0f32.to_le_bytes().to_vec();
        bytes.push(0xAB);
        assert_eq!(samples_from_f32le(&bytes), vec![1.0]);
    }

    #[test]
    fn long_audio_selects_batched_path() {
        assert_eq!(batch_for_duration(45.0), Some(BATCH_SIZE));
        assert_eq!(batch_for_duration(30.0), None);
        assert_eq!(batch_for_duration(3.0), None);
    }
}
