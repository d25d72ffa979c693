//! Capture backends.
//!
//! # Design constraints
//!
//! The input callback runs on an OS audio thread at elevated priority. It
//! **must not** allocate per call, block on a mutex, or perform I/O. The
//! cpal backend satisfies that by downmixing into a reused scratch buffer
//! and writing straight into the ring producer, whose `push` is wait-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each open stream therefore lives on a dedicated keeper thread
//! that builds it, reports the outcome back to the caller, and parks until
//! the stop signal arrives so the stream is dropped on its home thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::{
    audio::ring::RingConsumer,
    error::{Result, V2mError},
};

/// Everything a backend needs to open a stream.
pub struct CaptureRequest {
    /// Preferred input device name; `None` selects automatically.
    pub preferred_device: Option<String>,
    /// Ring capacity, expressed in seconds at the device's capture rate.
    pub session_capacity_secs: u32,
    /// Cleared to make the callback a no-op before the stream is dropped.
    pub running: Arc<AtomicBool>,
    /// Woken once per callback delivery so `wait_for_data` can resume.
    pub notify: Arc<Notify>,
}

/// A successfully opened capture stream.
pub struct OpenCapture {
    pub handle: CaptureHandle,
    pub consumer: RingConsumer,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

/// A source of microphone audio.
///
/// The recorder tries its registered backends in order; the first one that
/// opens wins. This is the seam a fallback capture engine plugs into.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn open(&self, request: &CaptureRequest) -> Result<OpenCapture>;
}

/// Handle to an open stream. Dropping it (or calling `shutdown`) releases
/// the OS device on the stream's home thread.
pub struct CaptureHandle {
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    keeper: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Handle for streams with no keeper thread (test backends).
    pub fn detached() -> Self {
        Self {
            stop_tx: None,
            keeper: None,
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(keeper) = self.keeper.take() {
            if keeper.join().is_err() {
                error!("capture keeper thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Default backend: cpal over the system audio host.
pub struct CpalBackend;

#[cfg(feature = "audio-cpal")]
impl CaptureBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open(&self, request: &CaptureRequest) -> Result<OpenCapture> {
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(u32, RingConsumer)>>();
        // Keeper thread owns the !Send stream for its whole lifetime.
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let preferred = request.preferred_device.clone();
        let capacity_secs = request.session_capacity_secs.max(1);
        let running = Arc::clone(&request.running);
        let notify = Arc::clone(&request.notify);

        let keeper = std::thread::Builder::new()
            .name("v2m-capture".into())
            .spawn(move || {
                let stream = match cpal_open_stream(
                    preferred.as_deref(),
                    capacity_secs,
                    running,
                    notify,
                ) {
                    Ok((stream, rate, consumer)) => {
                        let _ = open_tx.send(Ok((rate, consumer)));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                // Park until stop; the stream drops on this thread.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| V2mError::CaptureUnavailable(format!("keeper thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok((sample_rate, consumer))) => Ok(OpenCapture {
                handle: CaptureHandle {
                    stop_tx: Some(stop_tx),
                    keeper: Some(keeper),
                },
                consumer,
                sample_rate,
            }),
            Ok(Err(e)) => {
                let _ = keeper.join();
                Err(e)
            }
            Err(_) => Err(V2mError::CaptureUnavailable(
                "capture thread died before reporting".into(),
            )),
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl CaptureBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open(&self, _request: &CaptureRequest) -> Result<OpenCapture> {
        Err(V2mError::CaptureUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Pick an input by name: the preferred device when present, otherwise the
/// system default — unless that default looks like a loopback/system-output
/// capture, in which case the most microphone-like entry wins.
#[cfg(feature = "audio-cpal")]
fn select_input_index(
    names: &[String],
    preferred: Option<&str>,
    default_name: Option<&str>,
) -> usize {
    if let Some(idx) = preferred.and_then(|p| names.iter().position(|n| n.as_str() == p)) {
        return idx;
    }
    if preferred.is_some() {
        warn!(
            preferred = preferred.unwrap_or_default(),
            "preferred input device not found, falling back"
        );
    }

    let default_idx = default_name.and_then(|d| names.iter().position(|n| n.as_str() == d));
    if let Some(idx) = default_idx {
        if !looks_like_loopback(&names[idx]) {
            return idx;
        }
        warn!(
            default = names[idx].as_str(),
            "default input looks like a loopback capture — picking a microphone instead"
        );
    }

    names
        .iter()
        .enumerate()
        .filter(|(_, name)| !looks_like_loopback(name))
        .max_by_key(|(_, name)| mic_likeness(name))
        .map(|(idx, _)| idx)
        .or(default_idx)
        .unwrap_or(0)
}

/// Names under which systems expose their own output as an "input".
/// Recording one of these transcribes the speakers, not the user.
#[cfg(feature = "audio-cpal")]
fn looks_like_loopback(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    [
        "monitor of",
        "loopback",
        "stereo mix",
        "what u hear",
        "what you hear",
        "speakers (",
        "headphones (",
    ]
    .iter()
    .any(|marker| name.contains(marker))
}

/// How many microphone-ish words a device name carries. Coarse on purpose:
/// it only breaks ties among non-loopback candidates.
#[cfg(feature = "audio-cpal")]
fn mic_likeness(name: &str) -> usize {
    let name = name.to_ascii_lowercase();
    [
        "microphone",
        "mic",
        "headset",
        "array",
        "usb",
        "webcam",
        "line in",
        "input",
    ]
    .iter()
    .filter(|hint| name.contains(*hint))
    .count()
}

#[cfg(feature = "audio-cpal")]
fn cpal_open_stream(
    preferred: Option<&str>,
    capacity_secs: u32,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
) -> Result<(cpal::Stream, u32, RingConsumer)> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, StreamConfig};

    use crate::audio::ring::create_ring;

    let host = cpal::default_host();
    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| V2mError::CaptureUnavailable(e.to_string()))?
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            (name, device)
        })
        .collect();
    if devices.is_empty() {
        return Err(V2mError::CaptureUnavailable(
            "no input devices found".into(),
        ));
    }

    let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let selected_idx = select_input_index(&names, preferred, default_name.as_deref());

    let (selected_name, device) = &devices[selected_idx];
    info!(device = selected_name.as_str(), "opening input device");

    let supported = device
        .default_input_config()
        .map_err(|e| V2mError::CaptureUnavailable(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(sample_rate, channels, "audio config selected");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let capacity = (sample_rate as usize).saturating_mul(capacity_secs as usize);
    let (mut producer, consumer) = create_ring(capacity);

    let ch = channels as usize;
    let mut mix_buf: Vec<f32> = Vec::new();
    let err_fn = |err: cpal::StreamError| error!("audio stream error: {err}");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                if ch == 1 {
                    producer.push(data);
                } else {
                    downmix(data, ch, &mut mix_buf, |s| s);
                    producer.push(&mix_buf);
                }
                notify.notify_one();
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                downmix(data, ch, &mut mix_buf, |s| s as f32 / 32_768.0);
                producer.push(&mix_buf);
                notify.notify_one();
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                downmix(data, ch, &mut mix_buf, |s| {
                    (s as f32 - 32_768.0) / 32_768.0
                });
                producer.push(&mix_buf);
                notify.notify_one();
            },
            err_fn,
            None,
        ),
        fmt => {
            return Err(V2mError::CaptureUnavailable(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| V2mError::CaptureUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| V2mError::CaptureUnavailable(e.to_string()))?;

    Ok((stream, sample_rate, consumer))
}

/// Interleaved multi-channel frames → mono into a reused scratch buffer.
#[cfg(feature = "audio-cpal")]
fn downmix<T: Copy>(data: &[T], channels: usize, out: &mut Vec<f32>, convert: impl Fn(T) -> f32) {
    let frames = data.len() / channels;
    out.clear();
    out.resize(frames, 0.0);
    for (frame, slot) in out.iter_mut().enumerate() {
        let base = frame * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += convert(data[base + c]);
        }
        *slot = sum / channels as f32;
    }
}

#[cfg(all(test, feature = "audio-cpal"))]
mod tests {
    use super::{downmix, looks_like_loopback, select_input_index};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn preferred_device_wins_when_present() {
        let devices = names(&[
            "HDA Intel PCH ALC287 Analog",
            "Blue Snowball USB Microphone",
        ]);
        let idx = select_input_index(&devices, Some("Blue Snowball USB Microphone"), None);
        assert_eq!(idx, 1);
    }

    #[test]
    fn default_device_is_used_when_it_is_a_real_input() {
        let devices = names(&[
            "Webcam C920 Analog Stereo",
            "HDA Intel PCH ALC287 Analog",
        ]);
        let idx = select_input_index(&devices, None, Some("HDA Intel PCH ALC287 Analog"));
        assert_eq!(idx, 1);
    }

    #[test]
    fn loopback_default_is_skipped_for_a_microphone() {
        let devices = names(&[
            "Monitor of Built-in Audio Analog Stereo",
            "Blue Snowball USB Microphone",
            "Webcam C920 Analog Stereo",
        ]);
        let idx = select_input_index(
            &devices,
            None,
            Some("Monitor of Built-in Audio Analog Stereo"),
        );
        // The USB microphone carries more microphone hints than the webcam.
        assert_eq!(idx, 1);
    }

    #[test]
    fn missing_preferred_falls_through_to_default() {
        let devices = names(&["HDA Intel PCH ALC287 Analog"]);
        let idx = select_input_index(
            &devices,
            Some("Unplugged Headset"),
            Some("HDA Intel PCH ALC287 Analog"),
        );
        assert_eq!(idx, 0);
    }

    #[test]
    fn all_loopback_devices_fall_back_to_the_default() {
        let devices = names(&[
            "Monitor of HDMI Output",
            "Stereo Mix (Realtek Audio)",
        ]);
        let idx = select_input_index(&devices, None, Some("Stereo Mix (Realtek Audio)"));
        assert_eq!(idx, 1);
    }

    #[test]
    fn loopback_markers_cover_common_spellings() {
        assert!(looks_like_loopback("Monitor of Built-in Audio"));
        assert!(looks_like_loopback("Stereo Mix (Realtek Audio)"));
        assert!(looks_like_loopback("Speakers (High Definition Audio)"));
        assert!(!looks_like_loopback("Blue Snowball USB Microphone"));
        assert!(!looks_like_loopback("HDA Intel PCH ALC287 Analog"));
    }

    #[test]
    fn downmix_averages_interleaved_channels() {
        let mut out = Vec::new();
        // Two stereo frames: (0.2, 0.4) and (-1.0, 1.0).
        downmix(&[0.2f32, 0.4, -1.0, 1.0], 2, &mut out, |s| s);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
    }
}
