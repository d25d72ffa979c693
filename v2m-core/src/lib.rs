//! # v2m-core
//!
//! Streaming voice-to-text engine for the v2m daemon.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioRecorder → SPSC ring → StreamingTranscriber (event loop)
//!                                               │        ▲
//!                                        InferenceJob     │ results
//!                                               ▼        │
//!                                      ModelWorker (dedicated thread)
//!                                               │
//!                              broadcast::Sender<StreamEvent>
//! ```
//!
//! The capture callback is wait-free. Inference is serialised onto one
//! worker thread shared by the streaming and file paths. The transcriber
//! runs on the cooperative event loop and never blocks it for more than a
//! tick.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod error;
pub mod events;
pub mod file;
pub mod model;
pub mod stream;
pub mod vad;
pub mod worker;

// Convenience re-exports for downstream crates
pub use audio::{AudioBlob, AudioRecorder, RecorderConfig};
pub use error::{Result, V2mError};
pub use events::StreamEvent;
pub use file::FileTranscriber;
pub use model::{DecodeRequest, Device, InferenceMode, ModelLoader, ModelSpec, SpeechModel};
pub use stream::{SessionOutcome, StreamConfig, StreamingTranscriber};
pub use worker::{InferenceJob, ModelWorker, WorkerConfig, WorkerHandle};

#[cfg(feature = "whisper")]
pub use model::whisper::{WhisperLoader, WhisperModel};
