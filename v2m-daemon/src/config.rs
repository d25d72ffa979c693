//! Daemon configuration.
//!
//! Sources, highest priority first: CLI flags, `V2M_*` environment
//! variables, `config.toml`, built-in defaults. The file is optional and a
//! malformed file degrades to defaults with a warning — the daemon must
//! come up for the hotkey flow even when the config is broken.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use v2m_core::model::{ComputeKind, Device, ModelSpec};
use v2m_core::stream::{FinalDecode, StreamConfig};

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Idle seconds before the model is released; `None` keeps it resident.
    pub keep_warm_secs: Option<u64>,
    /// Skip the startup warmup and load on first use.
    pub lazy_load: bool,
    pub config: Config,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8765,
            keep_warm_secs: Some(300),
            lazy_load: false,
            config: Config::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub transcription: TranscriptionConfig,
    pub llm: LlmConfig,
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Durable signal consumed by external scripts while recording.
    pub recording_flag: PathBuf,
    pub pid_file: PathBuf,
    /// Optional WAV destination for the captured session.
    pub audio_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let runtime = runtime_dir();
        Self {
            recording_flag: runtime.join("v2m_recording.pid"),
            pid_file: runtime.join("v2m_daemon.pid"),
            audio_file: None,
        }
    }
}

/// Best-effort per-user runtime directory.
fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(std::env::temp_dir)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub backend: String,
    pub lazy_load: bool,
    pub whisper: WhisperConfig,
    pub streaming: StreamingConfig,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: "whisper".into(),
            lazy_load: false,
            whisper: WhisperConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub model: String,
    /// Recognition language, `auto` enables detection.
    pub language: String,
    /// `cuda` / `accelerator` or `cpu`.
    pub device: String,
    /// `float16` or `int8`.
    pub compute_type: String,
    pub beam_size: u32,
    pub best_of: u32,
    pub temperature: f32,
    pub vad_filter: bool,
    pub vad_parameters: VadParameters,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "distil-large-v3".into(),
            language: "auto".into(),
            device: "cuda".into(),
            compute_type: "float16".into(),
            beam_size: 2,
            best_of: 2,
            temperature: 0.0,
            vad_filter: true,
            vad_parameters: VadParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadParameters {
    pub threshold: f32,
    pub min_speech_duration_ms: u32,
    pub min_silence_duration_ms: u32,
}

impl Default for VadParameters {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub silence_commit_ms: u64,
    pub provisional_interval_ms: u64,
    pub min_segment_ms: u64,
    pub pre_roll_chunks: usize,
    pub context_window_chars: usize,
    pub max_session_secs: u32,
    /// RMS threshold for the energy speech detector.
    pub energy_threshold: f32,
    pub energy_hangover_chunks: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            silence_commit_ms: 800,
            provisional_interval_ms: 500,
            min_segment_ms: 500,
            pre_roll_chunks: 3,
            context_window_chars: 200,
            max_session_secs: 600,
            energy_threshold: 0.02,
            energy_hangover_chunks: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackendKind {
    Local,
    Gemini,
    Ollama,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackendKind,
    pub local: LocalLlmConfig,
    pub ollama: OllamaConfig,
    pub gemini: GeminiConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackendKind::Local,
            local: LocalLlmConfig::default(),
            ollama: OllamaConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalLlmConfig {
    /// OpenAI-compatible local server (llama.cpp `server`).
    pub host: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LocalLlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:8080".into(),
            model: "local".into(),
            temperature: 0.3,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
    pub keep_alive: String,
    pub temperature: f32,
    pub translation_temperature: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".into(),
            model: "gemma2:2b".into(),
            keep_alive: "5m".into(),
            temperature: 0.0,
            translation_temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_input_chars: usize,
    pub request_timeout_secs: u64,
    pub api_key: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-1.5-flash-latest".into(),
            temperature: 0.3,
            max_tokens: 2048,
            max_input_chars: 6000,
            request_timeout_secs: 30,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub expire_time_ms: u32,
    pub auto_dismiss: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            expire_time_ms: 3000,
            auto_dismiss: true,
        }
    }
}

impl Settings {
    /// Load the TOML file (if any), then fold in the environment. CLI flags
    /// are applied afterwards by the caller.
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut settings = Settings {
            config: Config::load(config_path),
            ..Settings::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    /// Fold in `V2M_*` environment variables through an injectable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("V2M_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("V2M_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = port.as_str(), "ignoring invalid V2M_PORT"),
            }
        }
        if let Some(model) = lookup("V2M_MODEL") {
            self.config.transcription.whisper.model = model;
        }
        if let Some(device) = lookup("V2M_DEVICE") {
            self.config.transcription.whisper.device = device;
        }
        if let Some(compute) = lookup("V2M_COMPUTE_TYPE") {
            self.config.transcription.whisper.compute_type = compute;
        }
        if let Some(lazy) = lookup("V2M_LAZY_LOAD") {
            self.lazy_load = is_truthy(&lazy);
        }
        if self.config.llm.gemini.api_key.is_none() {
            self.config.llm.gemini.api_key = lookup("GEMINI_API_KEY");
        }
    }

    /// Model spec for the worker, resolved from the whisper section.
    pub fn model_spec(&self) -> ModelSpec {
        let whisper = &self.config.transcription.whisper;
        ModelSpec {
            model: whisper.model.clone(),
            device: parse_device(&whisper.device),
            compute: parse_compute(&whisper.compute_type),
            language: match whisper.language.as_str() {
                "auto" | "" => None,
                lang => Some(lang.to_string()),
            },
        }
    }

    /// Streaming transcriber config resolved from the streaming section.
    pub fn stream_config(&self) -> StreamConfig {
        let whisper = &self.config.transcription.whisper;
        let streaming = &self.config.transcription.streaming;
        StreamConfig {
            sample_rate: 16_000,
            silence_commit_ms: streaming.silence_commit_ms,
            provisional_interval_ms: streaming.provisional_interval_ms,
            min_segment_ms: streaming.min_segment_ms,
            pre_roll_chunks: streaming.pre_roll_chunks,
            context_window_chars: streaming.context_window_chars,
            final_decode: FinalDecode {
                beam_size: whisper.beam_size,
                temperature: whisper.temperature,
                vad_filter: whisper.vad_filter,
            },
        }
    }

    pub fn lazy(&self) -> bool {
        self.lazy_load || self.config.transcription.lazy_load
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path(),
        };
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Config::default();
        };
        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed config.toml — using defaults");
                Config::default()
            }
        }
    }
}

fn default_config_path() -> PathBuf {
    let local = PathBuf::from("config.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("v2m")
        .join("config.toml")
}

pub fn parse_device(raw: &str) -> Device {
    match raw.trim().to_ascii_lowercase().as_str() {
        "cpu" => Device::Cpu,
        _ => Device::Accelerator,
    }
}

pub fn parse_compute(raw: &str) -> ComputeKind {
    match raw.trim().to_ascii_lowercase().as_str() {
        "int8" => ComputeKind::Int8,
        _ => ComputeKind::Float16,
    }
}

/// `1`, `true` and `yes` (any case) enable a flag.
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 8765);

        let streaming = &settings.config.transcription.streaming;
        assert_eq!(streaming.silence_commit_ms, 800);
        assert_eq!(streaming.provisional_interval_ms, 500);
        assert_eq!(streaming.min_segment_ms, 500);
        assert_eq!(streaming.pre_roll_chunks, 3);
        assert_eq!(streaming.context_window_chars, 200);
        assert_eq!(streaming.max_session_secs, 600);
    }

    #[test]
    fn toml_sections_parse() {
        let raw = r#"
            [transcription.whisper]
            model = "small"
            language = "es"
            device = "cpu"

            [transcription.whisper.vad_parameters]
            threshold = 0.4

            [transcription.streaming]
            silence_commit_ms = 650

            [llm]
            backend = "ollama"

            [llm.ollama]
            model = "qwen2.5:3b"

            [notifications]
            expire_time_ms = 1500
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.transcription.whisper.model, "small");
        assert_eq!(config.transcription.whisper.language, "es");
        assert!((config.transcription.whisper.vad_parameters.threshold - 0.4).abs() < 1e-6);
        assert_eq!(config.transcription.streaming.silence_commit_ms, 650);
        // Untouched sections keep their defaults.
        assert_eq!(config.transcription.streaming.pre_roll_chunks, 3);
        assert_eq!(config.llm.backend, LlmBackendKind::Ollama);
        assert_eq!(config.llm.ollama.model, "qwen2.5:3b");
        assert_eq!(config.notifications.expire_time_ms, 1500);
    }

    #[test]
    fn env_overrides_toml_values() {
        let mut settings = Settings::default();
        settings.config.transcription.whisper.model = "from-toml".into();

        settings.apply_env(|key| match key {
            "V2M_HOST" => Some("0.0.0.0".into()),
            "V2M_PORT" => Some("9000".into()),
            "V2M_MODEL" => Some("from-env".into()),
            "V2M_DEVICE" => Some("cpu".into()),
            "V2M_LAZY_LOAD" => Some("yes".into()),
            _ => None,
        });

        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.config.transcription.whisper.model, "from-env");
        assert_eq!(settings.model_spec().device, Device::Cpu);
        assert!(settings.lazy());
    }

    #[test]
    fn invalid_port_env_is_ignored() {
        let mut settings = Settings::default();
        settings.apply_env(|key| (key == "V2M_PORT").then(|| "not-a-port".into()));
        assert_eq!(settings.port, 8765);
    }

    #[test]
    fn gemini_key_from_env_does_not_override_config() {
        let mut settings = Settings::default();
        settings.config.llm.gemini.api_key = Some("from-config".into());
        settings.apply_env(|key| (key == "GEMINI_API_KEY").then(|| "from-env".into()));
        assert_eq!(settings.config.llm.gemini.api_key.as_deref(), Some("from-config"));

        let mut unset = Settings::default();
        unset.apply_env(|key| (key == "GEMINI_API_KEY").then(|| "from-env".into()));
        assert_eq!(unset.config.llm.gemini.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn truthiness_accepts_documented_spellings() {
        for value in ["1", "true", "yes", "TRUE", "Yes"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "no", "", "on"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn device_and_compute_parsing() {
        assert_eq!(parse_device("cpu"), Device::Cpu);
        assert_eq!(parse_device("cuda"), Device::Accelerator);
        assert_eq!(parse_device("accelerator"), Device::Accelerator);
        assert_eq!(parse_compute("int8"), ComputeKind::Int8);
        assert_eq!(parse_compute("float16"), ComputeKind::Float16);
    }

    #[test]
    fn stream_config_carries_whisper_decode_settings() {
        let mut settings = Settings::default();
        settings.config.transcription.whisper.beam_size = 5;
        settings.config.transcription.whisper.temperature = 0.2;
        let stream = settings.stream_config();
        assert_eq!(stream.final_decode.beam_size, 5);
        assert!((stream.final_decode.temperature - 0.2).abs() < 1e-6);
    }
}
