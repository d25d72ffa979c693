//! Central orchestrator — the single façade the server talks to.
//!
//! Owns the recording session singleton, the event broadcast channel and
//! the desktop/LLM ports. Heavy services (model worker, recorder, LLM
//! client) are lazy: first use instantiates, so daemon startup is bounded
//! by process launch, not model load.

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use v2m_core::{
    audio::{AudioRecorder, RecorderConfig},
    events::StreamEvent,
    model::ModelLoader,
    stream::StreamingTranscriber,
    vad::EnergyDetector,
    worker::{ModelWorker, WorkerConfig, WorkerHandle},
    FileTranscriber, Result, SessionOutcome, V2mError,
};

use crate::config::Settings;
use crate::desktop::{Clipboard, Notifier};
use crate::llm::{LlmBackend, LlmOutcome, LlmPort};

/// Broadcast capacity: events buffered for slow subscribers.
const EVENT_CHANNEL_CAP: usize = 256;

/// Result of `/toggle`, `/start`, `/stop`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleResult {
    Started,
    /// `None` when no voice was detected.
    Stopped(Option<String>),
}

/// Snapshot for `/status` — produced without any I/O.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub recording: bool,
    pub model_loaded: bool,
}

impl StatusSnapshot {
    pub fn state(&self) -> &'static str {
        if self.recording {
            "recording"
        } else {
            "idle"
        }
    }
}

struct ActiveSession {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<SessionOutcome>,
}

pub struct Orchestrator {
    settings: Settings,
    events: broadcast::Sender<StreamEvent>,
    /// Flipped once at shutdown so event subscribers disconnect and the
    /// server can drain.
    closing: watch::Sender<bool>,
    is_recording: AtomicBool,
    session: tokio::sync::Mutex<Option<ActiveSession>>,

    worker: OnceLock<WorkerHandle>,
    recorder: OnceLock<Arc<AudioRecorder>>,
    transcriber: OnceLock<Arc<StreamingTranscriber>>,
    file_transcriber: OnceLock<Arc<FileTranscriber>>,
    llm: Mutex<Option<Arc<LlmBackend>>>,

    clipboard: Arc<dyn Clipboard>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        clipboard: Arc<dyn Clipboard>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let (closing, _) = watch::channel(false);
        Self {
            settings,
            events,
            closing,
            is_recording: AtomicBool::new(false),
            session: tokio::sync::Mutex::new(None),
            worker: OnceLock::new(),
            recorder: OnceLock::new(),
            transcriber: OnceLock::new(),
            file_transcriber: OnceLock::new(),
            llm: Mutex::new(None),
            clipboard,
            notifier,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn closing_watch(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Ask event subscribers to disconnect so graceful shutdown can drain.
    pub fn close_subscribers(&self) {
        let _ = self.closing.send(true);
    }

    // ── Lazy services ────────────────────────────────────────────────────

    fn worker(&self) -> &WorkerHandle {
        self.worker.get_or_init(|| {
            ModelWorker::spawn(
                WorkerConfig {
                    spec: self.settings.model_spec(),
                    keep_warm: self.settings.keep_warm_secs.map(Duration::from_secs),
                },
                model_loader(),
            )
        })
    }

    fn recorder(&self) -> Arc<AudioRecorder> {
        Arc::clone(self.recorder.get_or_init(|| {
            Arc::new(AudioRecorder::new(RecorderConfig {
                target_sample_rate: 16_000,
                max_session_secs: self.settings.config.transcription.streaming.max_session_secs,
                preferred_device: None,
            }))
        }))
    }

    fn transcriber(&self) -> Arc<StreamingTranscriber> {
        Arc::clone(self.transcriber.get_or_init(|| {
            Arc::new(StreamingTranscriber::new(
                self.settings.stream_config(),
                self.worker().clone(),
                self.events.clone(),
            ))
        }))
    }

    fn file_transcriber(&self) -> Arc<FileTranscriber> {
        Arc::clone(self.file_transcriber.get_or_init(|| {
            Arc::new(FileTranscriber::new(
                self.worker().clone(),
                self.settings.stream_config().final_decode,
            ))
        }))
    }

    fn llm(&self) -> Result<Arc<LlmBackend>> {
        let mut slot = self.llm.lock();
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let backend = Arc::new(LlmBackend::from_config(&self.settings.config.llm)?);
        info!(backend = backend.name(), "llm backend initialised");
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Load the model in the background at startup (unless lazy).
    pub async fn warmup(&self) -> Result<()> {
        self.worker().warm_up().await
    }

    /// Start a recording session.
    ///
    /// # Errors
    /// - `V2mError::AlreadyRecording` when one is active.
    /// - `V2mError::CaptureUnavailable` when no backend can open the mic.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(V2mError::AlreadyRecording);
        }

        let recorder = self.recorder();
        {
            let recorder = Arc::clone(&recorder);
            tokio::task::spawn_blocking(move || recorder.start())
                .await
                .map_err(|e| V2mError::CaptureUnavailable(format!("capture start task: {e}")))??;
        }

        let streaming = &self.settings.config.transcription.streaming;
        let detector = Box::new(EnergyDetector::new(
            streaming.energy_threshold,
            streaming.energy_hangover_chunks,
        ));
        let transcriber = self.transcriber();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            transcriber.run(&recorder, detector, stop_rx).await
        });

        if let Err(e) = std::fs::write(&self.settings.config.paths.recording_flag, b"") {
            warn!(error = %e, "could not create recording flag");
        }
        self.notifier.notify("🎤 v2m", "grabación iniciada...");

        *session = Some(ActiveSession { stop_tx, task });
        self.is_recording.store(true, Ordering::SeqCst);
        info!("recording started");
        Ok(())
    }

    /// Stop the active session and return the finalized transcript.
    ///
    /// The transcript is copied to the clipboard when non-empty; `None`
    /// means no voice was detected.
    ///
    /// # Errors
    /// - `V2mError::NotRecording` when idle.
    pub async fn stop(&self) -> Result<Option<String>> {
        let mut slot = self.session.lock().await;
        let session = slot.take().ok_or(V2mError::NotRecording)?;

        if self.settings.config.paths.recording_flag.exists() {
            if let Err(e) = std::fs::remove_file(&self.settings.config.paths.recording_flag) {
                warn!(error = %e, "could not remove recording flag");
            }
        }
        self.notifier.notify("⚡ v2m", "procesando...");

        // The session drains its pending final before returning, so every
        // event is dispatched before this response.
        let _ = session.stop_tx.send(true);
        let outcome = match session.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "streaming session task failed");
                SessionOutcome::default()
            }
        };

        let recorder = self.recorder();
        let save_path = self.settings.config.paths.audio_file.clone();
        let stop_result = tokio::task::spawn_blocking(move || {
            recorder.stop(save_path.as_deref())
        })
        .await;
        match stop_result {
            Ok(Ok(blob)) => {
                info!(
                    duration_secs = format_args!("{:.1}", blob.duration_secs()),
                    "capture released"
                );
            }
            Ok(Err(e)) => warn!(error = %e, "recorder stop failed"),
            Err(e) => warn!(error = %e, "recorder stop task failed"),
        }

        self.is_recording.store(false, Ordering::SeqCst);
        drop(slot);

        if outcome.text.trim().is_empty() {
            self.notifier.notify("❌ v2m", "no se detectó voz en el audio");
            info!("session finished with no voice detected");
            return Ok(None);
        }

        let text = outcome.text;
        {
            let clipboard = Arc::clone(&self.clipboard);
            let text = text.clone();
            let _ = tokio::task::spawn_blocking(move || clipboard.copy(&text)).await;
        }
        let preview: String = text.chars().take(80).collect();
        self.notifier.notify("✅ v2m — copiado", &preview);
        info!(
            segments = outcome.committed_segments,
            chars = text.len(),
            "transcript copied to clipboard"
        );
        Ok(Some(text))
    }

    /// Total: idle → start, recording → stop.
    pub async fn toggle(&self) -> Result<ToggleResult> {
        if self.is_recording.load(Ordering::SeqCst) {
            self.stop().await.map(ToggleResult::Stopped)
        } else {
            self.start().await.map(|_| ToggleResult::Started)
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            recording: self.is_recording.load(Ordering::SeqCst),
            // A worker that was never created has nothing resident.
            model_loaded: self
                .worker
                .get()
                .map(WorkerHandle::model_loaded)
                .unwrap_or(false),
        }
    }

    // ── Post-processing ──────────────────────────────────────────────────

    /// Refine text through the LLM port. The refined text — or, on
    /// fallback, the original — always lands on the clipboard so the user
    /// keeps something pasteable either way.
    pub async fn process_text(&self, text: &str) -> LlmOutcome {
        let refined = match self.llm() {
            Ok(backend) => backend.refine(text).await,
            Err(e) => Err(e),
        };

        match refined {
            Ok(refined) => {
                let clipboard = Arc::clone(&self.clipboard);
                let payload = refined.clone();
                let _ = tokio::task::spawn_blocking(move || clipboard.copy(&payload)).await;
                let preview: String = refined.chars().take(80).collect();
                self.notifier.notify("✅ llm — copiado", &preview);
                LlmOutcome::Refined(refined)
            }
            Err(e) => {
                warn!(error = %e, "llm refinement failed — falling back to original text");
                let clipboard = Arc::clone(&self.clipboard);
                let payload = text.to_string();
                let _ = tokio::task::spawn_blocking(move || clipboard.copy(&payload)).await;
                self.notifier
                    .notify("⚠️ llm falló", "usando texto original...");
                LlmOutcome::Fallback {
                    reason: e.to_string(),
                    original: text.to_string(),
                }
            }
        }
    }

    /// Translate text through the LLM port. No clipboard side effect.
    pub async fn translate_text(&self, text: &str, target_lang: &str) -> Result<String> {
        let backend = self.llm()?;
        let translated = backend.translate(text, target_lang).await?;
        self.notifier.notify(
            &format!("✅ traducción ({target_lang})"),
            &translated.chars().take(80).collect::<String>(),
        );
        Ok(translated)
    }

    /// Transcribe an on-disk media file through the shared worker.
    pub async fn transcribe_file(&self, path: &Path) -> Result<String> {
        self.file_transcriber().transcribe_file(path).await
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Safe from signal handling: every subordinate failure is swallowed
    /// and logged.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.close_subscribers();
        if self.is_recording.load(Ordering::SeqCst) {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "stop during shutdown failed");
            }
        }
        if let Some(worker) = self.worker.get() {
            let worker = worker.clone();
            let joined = tokio::task::spawn_blocking(move || worker.shutdown()).await;
            if let Err(e) = joined {
                warn!(error = %e, "worker shutdown task failed");
            }
        }
        if self.settings.config.paths.recording_flag.exists() {
            let _ = std::fs::remove_file(&self.settings.config.paths.recording_flag);
        }
        info!("orchestrator shutdown complete");
    }
}

/// Recognizer for this build: whisper.cpp when the feature is on, the echo
/// stub otherwise.
fn model_loader() -> Box<dyn ModelLoader> {
    #[cfg(feature = "whisper")]
    {
        let models_dir = dirs::data_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("v2m")
            .join("models");
        Box::new(v2m_core::WhisperLoader { models_dir })
    }
    #[cfg(not(feature = "whisper"))]
    {
        Box::new(
            |_spec: &v2m_core::ModelSpec| -> Result<Box<dyn v2m_core::SpeechModel>> {
                Ok(Box::new(v2m_core::model::StubModel::new()))
            },
        )
    }
}
