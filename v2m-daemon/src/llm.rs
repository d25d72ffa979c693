//! LLM post-processing port.
//!
//! Backends form a closed enumeration selected by configuration — adding a
//! backend means adding a variant, not a registry. Every variant speaks
//! HTTP through one async surface; nothing here blocks the event loop.
//!
//! Fallback is data, not control flow: the orchestrator receives
//! `LlmOutcome::Fallback` with the original text instead of an exception to
//! catch.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use v2m_core::{Result, V2mError};

use crate::config::{GeminiConfig, LlmBackendKind, LlmConfig, LocalLlmConfig, OllamaConfig};

const REFINE_SYSTEM_PROMPT: &str =
    "Eres un editor experto. Corrige gramática y coherencia del texto. \
     Devuelve SOLO el texto corregido, sin explicaciones.";

fn translate_system_prompt(target_lang: &str) -> String {
    format!(
        "Eres un traductor experto. Traduce el siguiente texto al idioma '{target_lang}'. \
         Devuelve SOLO el texto traducido, sin explicaciones ni notas adicionales."
    )
}

/// Single awaitable surface over every backend.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn refine(&self, text: &str) -> Result<String>;
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String>;
}

/// Result of post-processing as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmOutcome {
    Refined(String),
    /// Backend failed; the caller gets the original text back with the
    /// failure reason for the user-visible message.
    Fallback { reason: String, original: String },
}

/// Closed backend enumeration.
pub enum LlmBackend {
    Local(LocalClient),
    Ollama(OllamaClient),
    Gemini(GeminiClient),
}

impl LlmBackend {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let backend = match config.backend {
            LlmBackendKind::Local => LlmBackend::Local(LocalClient::new(config.local.clone())?),
            LlmBackendKind::Ollama => {
                LlmBackend::Ollama(OllamaClient::new(config.ollama.clone())?)
            }
            LlmBackendKind::Gemini => {
                LlmBackend::Gemini(GeminiClient::new(config.gemini.clone())?)
            }
        };
        Ok(backend)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LlmBackend::Local(_) => "local",
            LlmBackend::Ollama(_) => "ollama",
            LlmBackend::Gemini(_) => "gemini",
        }
    }
}

#[async_trait]
impl LlmPort for LlmBackend {
    async fn refine(&self, text: &str) -> Result<String> {
        match self {
            LlmBackend::Local(client) => client.chat(REFINE_SYSTEM_PROMPT, text, None).await,
            LlmBackend::Ollama(client) => client.chat(REFINE_SYSTEM_PROMPT, text, None).await,
            LlmBackend::Gemini(client) => client.generate(REFINE_SYSTEM_PROMPT, text).await,
        }
    }

    async fn translate(&self, text: &str, target_lang: &str) -> Result<String> {
        let system = translate_system_prompt(target_lang);
        match self {
            LlmBackend::Local(client) => client.chat(&system, text, None).await,
            LlmBackend::Ollama(client) => {
                let temperature = client.config.translation_temperature;
                client.chat(&system, text, Some(temperature)).await
            }
            LlmBackend::Gemini(client) => client.generate(&system, text).await,
        }
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| V2mError::LlmError(format!("http client: {e}")))
}

/// llama.cpp `server` (OpenAI-compatible chat completions).
pub struct LocalClient {
    config: LocalLlmConfig,
    client: reqwest::Client,
}

impl LocalClient {
    pub fn new(config: LocalLlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(60)?,
            config,
        })
    }

    async fn chat(&self, system: &str, text: &str, temperature: Option<f32>) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config.host.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": text},
            ],
            "temperature": temperature.unwrap_or(self.config.temperature),
            "max_tokens": self.config.max_tokens,
        });

        let response: Value = send_json(&self.client, &url, &body, "local").await?;
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| V2mError::LlmError("local: malformed chat response".into()))
    }
}

/// Ollama `/api/chat`.
pub struct OllamaClient {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(60)?,
            config,
        })
    }

    async fn chat(&self, system: &str, text: &str, temperature: Option<f32>) -> Result<String> {
        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": text},
            ],
            "stream": false,
            "keep_alive": self.config.keep_alive,
            "options": {
                "temperature": temperature.unwrap_or(self.config.temperature),
            },
        });

        info!(model = self.config.model.as_str(), "ollama request");
        let response: Value = send_json(&self.client, &url, &body, "ollama").await?;
        response["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| V2mError::LlmError("ollama: malformed chat response".into()))
    }
}

/// Google Gemini `generateContent`.
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.request_timeout_secs)?,
            config,
        })
    }

    async fn generate(&self, system: &str, text: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| V2mError::LlmError("gemini: GEMINI_API_KEY not configured".into()))?;

        if text.chars().count() > self.config.max_input_chars {
            return Err(V2mError::LlmError(format!(
                "gemini: input exceeds {} characters",
                self.config.max_input_chars
            )));
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/{}:generateContent?key={}",
            self.config.model, api_key
        );
        let body = json!({
            "contents": [{"parts": [{"text": format!("{system}\n\n{text}")}]}],
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_tokens,
            },
        });

        let response: Value = send_json(&self.client, &url, &body, "gemini").await?;
        response["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| V2mError::LlmError("gemini: malformed generate response".into()))
    }
}

async fn send_json(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    backend: &str,
) -> Result<Value> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| V2mError::LlmError(format!("{backend}: request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        warn!(backend, %status, "llm backend returned an error");
        return Err(V2mError::LlmError(format!(
            "{backend}: http {status}: {}",
            detail.chars().take(200).collect::<String>()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| V2mError::LlmError(format!("{backend}: invalid json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_follow_config_kind() {
        let mut config = LlmConfig::default();
        config.backend = LlmBackendKind::Ollama;
        assert_eq!(LlmBackend::from_config(&config).unwrap().name(), "ollama");

        config.backend = LlmBackendKind::Gemini;
        assert_eq!(LlmBackend::from_config(&config).unwrap().name(), "gemini");

        config.backend = LlmBackendKind::Local;
        assert_eq!(LlmBackend::from_config(&config).unwrap().name(), "local");
    }

    #[tokio::test]
    async fn gemini_without_key_fails_with_llm_error() {
        let client = GeminiClient::new(GeminiConfig::default()).unwrap();
        let err = client.generate("system", "hola").await.unwrap_err();
        assert!(matches!(err, V2mError::LlmError(_)));
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[tokio::test]
    async fn gemini_rejects_oversized_input() {
        let client = GeminiClient::new(GeminiConfig {
            api_key: Some("test-key".into()),
            max_input_chars: 10,
            ..GeminiConfig::default()
        })
        .unwrap();
        let err = client
            .generate("system", "texto demasiado largo para el límite")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn translate_prompt_names_the_target_language() {
        let prompt = translate_system_prompt("english");
        assert!(prompt.contains("'english'"));
    }
}
