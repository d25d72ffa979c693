//! `AudioRecorder` — the capture facade.
//!
//! A pure capture primitive: it owns the open stream, the session ring and
//! the device-rate → 16 kHz conversion, and exposes exactly four operations
//! (`start`, `stop`, `read_chunk`, `wait_for_data`). Segmentation, VAD and
//! inference live in the streaming transcriber, which only *drives reads*
//! through a borrowed reference — the recorder never owns that lifecycle.

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::{
    audio::{
        capture::{CaptureBackend, CaptureHandle, CaptureRequest, CpalBackend, OpenCapture},
        ring::RingConsumer,
    },
    error::{Result, V2mError},
};

/// Device-rate samples rubato consumes per block.
const RESAMPLE_BLOCK: usize = 1024;

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Sample rate delivered to consumers (Hz). The model wants 16 000.
    pub target_sample_rate: u32,
    /// Safety bound on a single session; the ring and the session buffer
    /// are sized from this.
    pub max_session_secs: u32,
    /// Preferred input device name.
    pub preferred_device: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            max_session_secs: 600,
            preferred_device: None,
        }
    }
}

/// Captured audio returned by `stop`.
#[derive(Debug, Clone)]
pub struct AudioBlob {
    /// Mono f32 samples in [-1.0, 1.0] at `sample_rate`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBlob {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Write the canonical WAV encoding: RIFF/WAVE, PCM (format 1), mono,
    /// 16-bit signed little-endian at `sample_rate`.
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .map_err(|e| V2mError::Io(std::io::Error::other(e)))?;
        for &sample in &self.samples {
            let quantized = (sample.clamp(-1.0, 1.0) * 32_767.0) as i16;
            writer
                .write_sample(quantized)
                .map_err(|e| V2mError::Io(std::io::Error::other(e)))?;
        }
        writer
            .finalize()
            .map_err(|e| V2mError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

/// Pulls device-rate samples off the ring and hands them on at the target
/// rate. With matching rates the ring is drained straight through; otherwise
/// drained samples queue up until rubato has a full block, and the
/// sub-block remainder waits for the next drain.
struct RateAdapter {
    /// `None` when the device already captures at the target rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Device-rate samples not yet resampled (always < one block after a
    /// drain).
    queued: Vec<f32>,
    /// Rubato's per-block output, `[1][output_frames_max]`.
    block_out: Vec<Vec<f32>>,
}

impl RateAdapter {
    fn new(capture_rate: u32, target_rate: u32) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                queued: Vec::new(),
                block_out: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / capture_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            RESAMPLE_BLOCK,
            1,
        )
        .map_err(|e| V2mError::CaptureUnavailable(format!("resampler init: {e}")))?;

        info!(capture_rate, target_rate, "resampling capture stream");
        let block_out = vec![vec![0f32; resampler.output_frames_max()]];
        Ok(Self {
            resampler: Some(resampler),
            queued: Vec::new(),
            block_out,
        })
    }

    /// Drain everything readable from `consumer`, appending target-rate
    /// samples to `out`. Returns the number of samples appended.
    fn drain(&mut self, consumer: &mut RingConsumer, out: &mut Vec<f32>) -> usize {
        let before = out.len();

        let Some(resampler) = self.resampler.as_mut() else {
            consumer.pop_available(out);
            return out.len() - before;
        };

        consumer.pop_available(&mut self.queued);

        let mut fed = 0;
        while self.queued.len() - fed >= RESAMPLE_BLOCK {
            let block = &self.queued[fed..fed + RESAMPLE_BLOCK];
            match resampler.process_into_buffer(&[block], &mut self.block_out, None) {
                Ok((_consumed, produced)) => {
                    out.extend_from_slice(&self.block_out[0][..produced]);
                }
                Err(e) => error!(error = %e, "resampler block failed — dropping block"),
            }
            fed += RESAMPLE_BLOCK;
        }
        self.queued.drain(..fed);

        out.len() - before
    }
}

struct CaptureSession {
    handle: CaptureHandle,
    consumer: RingConsumer,
    adapter: RateAdapter,
    /// Everything read this session at the target rate, bounded by
    /// `max_session_samples` (oldest dropped beyond that).
    captured: Vec<f32>,
    max_session_samples: usize,
    /// Overrun total already reported, so each warn logs only the delta.
    overruns_reported: u64,
}

/// High-level audio recorder with pluggable capture backends.
pub struct AudioRecorder {
    config: RecorderConfig,
    backends: Vec<Box<dyn CaptureBackend>>,
    session: Mutex<Option<CaptureSession>>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AudioRecorder {
    /// Recorder backed by the default cpal backend.
    pub fn new(config: RecorderConfig) -> Self {
        Self::with_backends(config, vec![Box::new(CpalBackend)])
    }

    /// Recorder with an explicit backend list, tried in order on `start`.
    pub fn with_backends(config: RecorderConfig, backends: Vec<Box<dyn CaptureBackend>>) -> Self {
        Self {
            config,
            backends,
            session: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Register an additional fallback backend.
    pub fn register_fallback(&mut self, backend: Box<dyn CaptureBackend>) {
        self.backends.push(backend);
    }

    /// Open the capture stream.
    ///
    /// Backends are tried in registration order; the first that opens wins.
    ///
    /// # Errors
    /// - `V2mError::AlreadyRecording` if a session is active.
    /// - `V2mError::CaptureUnavailable` when every backend failed.
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(V2mError::AlreadyRecording);
        }

        self.running.store(true, Ordering::SeqCst);
        let request = CaptureRequest {
            preferred_device: self.config.preferred_device.clone(),
            session_capacity_secs: self.config.max_session_secs,
            running: Arc::clone(&self.running),
            notify: Arc::clone(&self.notify),
        };

        let mut last_error: Option<V2mError> = None;
        for backend in &self.backends {
            match backend.open(&request) {
                Ok(OpenCapture {
                    handle,
                    consumer,
                    sample_rate,
                }) => {
                    let adapter =
                        RateAdapter::new(sample_rate, self.config.target_sample_rate)?;
                    let max_session_samples = (self.config.target_sample_rate as usize)
                        .saturating_mul(self.config.max_session_secs as usize);
                    info!(
                        backend = backend.name(),
                        sample_rate, "capture started"
                    );
                    *session = Some(CaptureSession {
                        handle,
                        consumer,
                        adapter,
                        captured: Vec::new(),
                        max_session_samples,
                        overruns_reported: 0,
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "capture backend failed");
                    last_error = Some(e);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Err(match last_error {
            Some(V2mError::CaptureUnavailable(msg)) => V2mError::CaptureUnavailable(msg),
            Some(other) => V2mError::CaptureUnavailable(other.to_string()),
            None => V2mError::CaptureUnavailable("no capture backend registered".into()),
        })
    }

    /// Stop the stream and return the session audio at the target rate.
    ///
    /// May return an empty blob. With `save_path`, the canonical WAV is
    /// written before returning.
    ///
    /// # Errors
    /// - `V2mError::NotRecording` if no session is active.
    pub fn stop(&self, save_path: Option<&Path>) -> Result<AudioBlob> {
        let mut slot = self.session.lock();
        let mut session = slot.take().ok_or(V2mError::NotRecording)?;
        drop(slot);

        self.running.store(false, Ordering::SeqCst);
        // Release anyone parked in wait_for_data.
        self.notify.notify_waiters();
        session.handle.shutdown();

        // Drain whatever the callback delivered before the stream closed.
        drain_session(&mut session);
        report_overruns(&mut session);

        let blob = AudioBlob {
            samples: std::mem::take(&mut session.captured),
            sample_rate: self.config.target_sample_rate,
        };
        info!(
            samples = blob.samples.len(),
            duration_secs = format_args!("{:.2}", blob.duration_secs()),
            "capture stopped"
        );

        if let Some(path) = save_path {
            blob.write_wav(path)?;
            info!(path = %path.display(), "session WAV written");
        }

        Ok(blob)
    }

    /// Non-blocking: return whatever is currently available at the target
    /// rate (possibly empty).
    pub fn read_chunk(&self) -> Vec<f32> {
        let mut slot = self.session.lock();
        let Some(session) = slot.as_mut() else {
            return Vec::new();
        };
        let chunk = drain_session(session);
        report_overruns(session);
        chunk
    }

    /// Completes when at least one new sample is available or the stream
    /// has stopped. Returns `false` once stopped.
    pub async fn wait_for_data(&self) -> bool {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            {
                let slot = self.session.lock();
                match slot.as_ref() {
                    Some(session) if !session.consumer.is_empty() => return true,
                    Some(_) => {}
                    None => return false,
                }
            }
            self.notify.notified().await;
        }
    }

    /// `true` while a capture session is open.
    pub fn is_recording(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total samples lost to ring overruns in the current session.
    pub fn overrun_count(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.consumer.overrun_count())
            .unwrap_or(0)
    }
}

/// Pull all ring data through the rate adapter and into the session buffer.
/// Returns the newly converted samples.
fn drain_session(session: &mut CaptureSession) -> Vec<f32> {
    let mut chunk = Vec::new();
    session.adapter.drain(&mut session.consumer, &mut chunk);
    if !chunk.is_empty() {
        append_bounded(&mut session.captured, &chunk, session.max_session_samples);
    }
    chunk
}

/// Append to the session buffer, dropping the oldest samples past the cap.
fn append_bounded(buf: &mut Vec<f32>, samples: &[f32], max_len: usize) {
    if max_len == 0 || samples.is_empty() {
        return;
    }
    if samples.len() >= max_len {
        buf.clear();
        buf.extend_from_slice(&samples[samples.len() - max_len..]);
        return;
    }
    let needed = buf.len().saturating_add(samples.len());
    if needed > max_len {
        buf.drain(..needed - max_len);
    }
    buf.extend_from_slice(samples);
}

fn report_overruns(session: &mut CaptureSession) {
    let total = session.consumer.overrun_count();
    if total > session.overruns_reported {
        let dropped = total - session.overruns_reported;
        session.overruns_reported = total;
        warn!(
            dropped,
            total,
            "{}",
            V2mError::CaptureOverrun { dropped }
        );
    }
}
