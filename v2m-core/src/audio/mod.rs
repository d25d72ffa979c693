//! Audio capture pipeline: ring buffer, capture backends, recorder facade.

pub mod capture;
pub mod recorder;
pub mod ring;

pub use capture::{CaptureBackend, CaptureHandle, CaptureRequest, CpalBackend, OpenCapture};
pub use recorder::{AudioBlob, AudioRecorder, RecorderConfig};
