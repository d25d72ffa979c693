use thiserror::Error;

/// All errors produced by the v2m engine.
///
/// Kind names are stable — they are surfaced verbatim in daemon responses
/// and log lines.
#[derive(Debug, Error)]
pub enum V2mError {
    #[error("CaptureUnavailable: {0}")]
    CaptureUnavailable(String),

    #[error("CaptureOverrun: {dropped} samples dropped")]
    CaptureOverrun { dropped: u64 },

    #[error("ModelLoadError: {0}")]
    ModelLoadError(String),

    #[error("InferenceError: {0}")]
    InferenceError(String),

    /// A queued provisional lost its worker slot to a final. Internal to the
    /// streaming path — callers treat it as a silent discard.
    #[error("Displaced: provisional job superseded by a final")]
    Displaced,

    #[error("TranscoderError: {0}")]
    TranscoderError(String),

    #[error("ValidationError: {0}")]
    ValidationError(String),

    #[error("AlreadyRecording")]
    AlreadyRecording,

    #[error("NotRecording")]
    NotRecording,

    #[error("LLMError: {0}")]
    LlmError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl V2mError {
    /// Stable kind name for responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            V2mError::CaptureUnavailable(_) => "CaptureUnavailable",
            V2mError::CaptureOverrun { .. } => "CaptureOverrun",
            V2mError::ModelLoadError(_) => "ModelLoadError",
            V2mError::InferenceError(_) => "InferenceError",
            V2mError::Displaced => "Displaced",
            V2mError::TranscoderError(_) => "TranscoderError",
            V2mError::ValidationError(_) => "ValidationError",
            V2mError::AlreadyRecording => "AlreadyRecording",
            V2mError::NotRecording => "NotRecording",
            V2mError::LlmError(_) => "LLMError",
            V2mError::Io(_) => "IO",
            V2mError::Other(_) => "Other",
        }
    }
}

pub type Result<T> = std::result::Result<T, V2mError>;
