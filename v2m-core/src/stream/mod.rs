//! Commit-and-flush streaming transcription.
//!
//! ## Session state machine
//!
//! ```text
//! Idle ──speech──► Speech ──silence──► Trailing ──silence ≥ commit──► commit ─► Idle
//!   ▲                 ▲                   │
//!   └─────────────────┴──────speech───────┘
//! ```
//!
//! Each tick is driven by `wait_for_data` → `read_chunk` on the borrowed
//! recorder. Provisional inferences (greedy, throttled) give live feedback
//! while a segment accumulates; the commit submits the authoritative final
//! inference, emits `transcription_update{final:true}`, rolls the
//! `ContextWindow` forward and releases the segment's audio.
//!
//! Finals are emitted strictly in commit order: a pending final is always
//! completed before the next one is submitted. Provisionals for a newer
//! segment may flow while an earlier final is still decoding.

pub mod context;

pub use context::ContextWindow;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
    audio::AudioRecorder,
    error::{Result, V2mError},
    events::StreamEvent,
    model::{DecodeRequest, InferenceMode},
    vad::SpeechDetector,
    worker::{InferenceJob, WorkerHandle},
};

/// Decode settings for the authoritative final pass.
#[derive(Debug, Clone)]
pub struct FinalDecode {
    pub beam_size: u32,
    pub temperature: f32,
    pub vad_filter: bool,
}

impl Default for FinalDecode {
    fn default() -> Self {
        Self {
            beam_size: 2,
            temperature: 0.0,
            vad_filter: true,
        }
    }
}

/// Streaming transcriber configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub sample_rate: u32,
    /// Silence needed inside `Trailing` before a segment commits.
    pub silence_commit_ms: u64,
    /// Minimum wall-clock spacing between provisional inferences.
    pub provisional_interval_ms: u64,
    /// Segments shorter than this are neither previewed nor committed.
    pub min_segment_ms: u64,
    /// Capture chunks retained before speech onset.
    pub pre_roll_chunks: usize,
    /// Rolling prompt cap in characters.
    pub context_window_chars: usize,
    pub final_decode: FinalDecode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            silence_commit_ms: 800,
            provisional_interval_ms: 500,
            min_segment_ms: 500,
            pre_roll_chunks: 3,
            context_window_chars: 200,
            final_decode: FinalDecode::default(),
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    /// Finalized spans joined by a single space; empty when no voice was
    /// detected.
    pub text: String,
    pub committed_segments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Speech,
    Trailing,
}

pub struct StreamingTranscriber {
    config: StreamConfig,
    worker: WorkerHandle,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamingTranscriber {
    pub fn new(
        config: StreamConfig,
        worker: WorkerHandle,
        events: broadcast::Sender<StreamEvent>,
    ) -> Self {
        Self {
            config,
            worker,
            events,
        }
    }

    /// Drive one recording session until `stop` flips.
    ///
    /// The recorder is only read from — its lifecycle belongs to the caller.
    pub async fn run(
        &self,
        recorder: &AudioRecorder,
        detector: Box<dyn SpeechDetector>,
        stop: watch::Receiver<bool>,
    ) -> SessionOutcome {
        let mut session = Session::new(&self.config, &self.worker, &self.events, detector);
        session.run(recorder, stop).await
    }
}

type PendingResult = oneshot::Receiver<Result<Vec<String>>>;

struct Session<'a> {
    config: &'a StreamConfig,
    worker: &'a WorkerHandle,
    events: &'a broadcast::Sender<StreamEvent>,
    detector: Box<dyn SpeechDetector>,

    phase: Phase,
    /// Monotonic id; provisional results for an older segment are discarded.
    segment_seq: u64,
    segment: Vec<f32>,
    pre_roll: VecDeque<Vec<f32>>,
    silence_samples: usize,

    context: ContextWindow,
    finals: Vec<String>,
    committed_segments: usize,

    pending_provisional: Option<(u64, PendingResult)>,
    last_provisional_text: Option<String>,
    last_provisional_at: Option<Instant>,
    pending_final: Option<PendingResult>,
}

impl<'a> Session<'a> {
    fn new(
        config: &'a StreamConfig,
        worker: &'a WorkerHandle,
        events: &'a broadcast::Sender<StreamEvent>,
        detector: Box<dyn SpeechDetector>,
    ) -> Self {
        Self {
            config,
            worker,
            events,
            detector,
            phase: Phase::Idle,
            segment_seq: 0,
            segment: Vec::new(),
            pre_roll: VecDeque::with_capacity(config.pre_roll_chunks),
            silence_samples: 0,
            context: ContextWindow::new(config.context_window_chars),
            finals: Vec::new(),
            committed_segments: 0,
            pending_provisional: None,
            last_provisional_text: None,
            last_provisional_at: None,
            pending_final: None,
        }
    }

    async fn run(
        &mut self,
        recorder: &AudioRecorder,
        mut stop: watch::Receiver<bool>,
    ) -> SessionOutcome {
        info!("streaming session started");

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                has_data = recorder.wait_for_data() => {
                    if !has_data {
                        break;
                    }
                }
                _ = stop.changed() => continue,
            }

            let chunk = recorder.read_chunk();
            self.poll_inflight();
            if chunk.is_empty() {
                continue;
            }
            self.tick(chunk).await;
        }

        // Stop: the pending provisional is cancelled — the worker may still
        // finish it, but its result is discarded.
        self.pending_provisional = None;

        if self.phase != Phase::Idle {
            if self.segment_duration_ms() >= self.config.min_segment_ms {
                info!(
                    samples = self.segment.len(),
                    "stop with active segment — committing"
                );
                self.commit().await;
            } else {
                debug!(
                    samples = self.segment.len(),
                    "stop with sub-minimum segment — discarding"
                );
                self.segment.clear();
            }
        }

        // Events for this session are fully dispatched before we return.
        if let Some(pending) = self.pending_final.take() {
            self.finish_final(pending).await;
        }

        let outcome = SessionOutcome {
            text: self.finals.join(" "),
            committed_segments: self.committed_segments,
        };
        info!(
            committed_segments = outcome.committed_segments,
            chars = outcome.text.len(),
            "streaming session finished"
        );
        outcome
    }

    async fn tick(&mut self, chunk: Vec<f32>) {
        // Pre-roll tracks the last N chunks regardless of speech state.
        if self.pre_roll.len() == self.config.pre_roll_chunks {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(chunk.clone());

        let is_speech = self.detector.is_speech(&chunk);

        match self.phase {
            Phase::Idle => {
                if is_speech {
                    self.begin_segment();
                }
            }
            Phase::Speech => {
                if is_speech {
                    self.segment.extend_from_slice(&chunk);
                    self.maybe_submit_provisional();
                } else {
                    self.segment.extend_from_slice(&chunk);
                    self.silence_samples = chunk.len();
                    self.phase = Phase::Trailing;
                }
            }
            Phase::Trailing => {
                self.segment.extend_from_slice(&chunk);
                if is_speech {
                    self.silence_samples = 0;
                    self.phase = Phase::Speech;
                } else {
                    self.silence_samples += chunk.len();
                    if self.silence_ms() >= self.config.silence_commit_ms {
                        if self.segment_duration_ms() >= self.config.min_segment_ms {
                            self.commit().await;
                        } else {
                            debug!(
                                samples = self.segment.len(),
                                "sub-minimum segment after silence — discarding"
                            );
                            self.segment.clear();
                            self.detector.reset();
                            self.phase = Phase::Idle;
                        }
                        self.silence_samples = 0;
                    }
                }
            }
        }
    }

    /// Idle → Speech, pre-roll prepended so word onsets are not clipped.
    fn begin_segment(&mut self) {
        self.segment.clear();
        for buffered in &self.pre_roll {
            self.segment.extend_from_slice(buffered);
        }
        self.segment_seq += 1;
        self.silence_samples = 0;
        self.last_provisional_text = None;
        self.last_provisional_at = None;
        self.phase = Phase::Speech;
        debug!(
            segment = self.segment_seq,
            pre_roll_samples = self.segment.len(),
            "speech started"
        );
    }

    fn maybe_submit_provisional(&mut self) {
        if self.segment_duration_ms() < self.config.min_segment_ms {
            return;
        }
        let interval = Duration::from_millis(self.config.provisional_interval_ms);
        if let Some(last) = self.last_provisional_at {
            if last.elapsed() < interval {
                return;
            }
        }
        if self.pending_provisional.is_some() {
            return;
        }

        let job = InferenceJob {
            audio: self.segment.clone(),
            request: DecodeRequest::provisional(
                self.context.as_prompt().map(str::to_owned),
            ),
        };
        match self.worker.submit(job) {
            Ok(rx) => {
                self.pending_provisional = Some((self.segment_seq, rx));
                self.last_provisional_at = Some(Instant::now());
            }
            Err(V2mError::Displaced) => {
                // A final occupies the queue; previews yield.
            }
            Err(e) => debug!(error = %e, "provisional submission failed"),
        }
    }

    /// Drain completed in-flight inferences without suspending the tick.
    fn poll_inflight(&mut self) {
        if let Some((seq, mut rx)) = self.pending_provisional.take() {
            match rx.try_recv() {
                Ok(result) => self.handle_provisional(seq, result),
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.pending_provisional = Some((seq, rx));
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    debug!("provisional reply channel closed");
                }
            }
        }

        if let Some(mut rx) = self.pending_final.take() {
            match rx.try_recv() {
                Ok(result) => self.handle_final(result),
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.pending_final = Some(rx);
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    error!("final reply channel closed");
                    self.handle_final(Err(V2mError::InferenceError(
                        "final reply channel closed".into(),
                    )));
                }
            }
        }
    }

    fn handle_provisional(&mut self, seq: u64, result: Result<Vec<String>>) {
        // Late result for a committed/flushed segment: no event.
        if seq != self.segment_seq || self.phase == Phase::Idle {
            debug!(segment = seq, "discarding provisional for flushed segment");
            return;
        }
        match result {
            Ok(spans) => {
                let text = join_spans(&spans);
                if text.is_empty() {
                    return;
                }
                // Two identical provisionals in a row: the second stays quiet.
                if self.last_provisional_text.as_deref() == Some(text.as_str()) {
                    return;
                }
                let _ = self.events.send(StreamEvent::provisional(text.clone()));
                self.last_provisional_text = Some(text);
            }
            Err(V2mError::Displaced) => {}
            Err(e) => debug!(error = %e, "provisional inference failed"),
        }
    }

    /// Commit-and-flush: finalize the current segment.
    async fn commit(&mut self) {
        // Finals are emitted in commit order — complete the previous one
        // (and its ContextWindow update) before building the next prompt.
        if let Some(pending) = self.pending_final.take() {
            self.finish_final(pending).await;
        }

        // Moving the buffer releases the segment's frames (zero retention).
        let audio = std::mem::take(&mut self.segment);
        let duration_ms = audio.len() as u64 * 1000 / self.config.sample_rate as u64;

        let request = DecodeRequest {
            mode: InferenceMode::Final,
            beam_size: self.config.final_decode.beam_size,
            temperature: self.config.final_decode.temperature,
            vad_filter: self.config.final_decode.vad_filter,
            initial_prompt: self.context.as_prompt().map(str::to_owned),
            batch_size: None,
        };

        debug!(
            segment = self.segment_seq,
            duration_ms, "committing segment"
        );

        match self.worker.submit(InferenceJob { audio, request }) {
            Ok(rx) => self.pending_final = Some(rx),
            Err(e) => {
                error!(error = %e, "final submission failed");
                self.handle_final(Err(e));
            }
        }

        self.committed_segments += 1;
        self.pending_provisional = None;
        self.last_provisional_text = None;
        self.last_provisional_at = None;
        self.pre_roll.clear();
        self.detector.reset();
        self.phase = Phase::Idle;
    }

    async fn finish_final(&mut self, rx: PendingResult) {
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(V2mError::InferenceError(
                "model worker dropped the final job".into(),
            )),
        };
        self.handle_final(result);
    }

    /// A final result always advances the ContextWindow (non-empty text) or
    /// leaves it untouched (empty / failed) — never both.
    fn handle_final(&mut self, result: Result<Vec<String>>) {
        let text = match result {
            Ok(spans) => join_spans(&spans),
            Err(e) => {
                error!(error = %e, "final inference failed — segment treated as empty");
                String::new()
            }
        };

        let _ = self.events.send(StreamEvent::final_text(text.clone()));

        if text.is_empty() {
            warn!("final inference produced empty text");
            return;
        }
        self.context.push(&text);
        self.finals.push(text);
    }

    fn segment_duration_ms(&self) -> u64 {
        self.segment.len() as u64 * 1000 / self.config.sample_rate as u64
    }

    fn silence_ms(&self) -> u64 {
        self.silence_samples as u64 * 1000 / self.config.sample_rate as u64
    }
}

fn join_spans(spans: &[String]) -> String {
    spans
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
