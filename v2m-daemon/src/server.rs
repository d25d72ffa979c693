//! HTTP + WebSocket control plane.
//!
//! Every actionable endpoint answers the same envelope:
//! `{status: "idle"|"recording"|"error", message, text?}`. Handler
//! failures stay HTTP 200 with `status = "error"` — only a malformed
//! request itself gets a 4xx from the extractor layer.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use v2m_core::{StreamEvent, V2mError};

use crate::llm::LlmOutcome;
use crate::orchestrator::{Orchestrator, ToggleResult};

/// Payload cap for `/llm/*` text bodies.
const MAX_TEXT_CHARS: usize = 10_000;

/// Heartbeat cadence on `/ws/events`.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

type AppState = Arc<Orchestrator>;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Envelope {
    fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
            text: None,
        }
    }

    fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn error(err: &V2mError) -> Self {
        Self::new("error", err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    state: &'static str,
    recording: bool,
    model_loaded: bool,
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct TranslateRequest {
    text: String,
    target_lang: String,
}

#[derive(Debug, Deserialize)]
struct TranscribeFileRequest {
    path: String,
}

pub fn router(orchestrator: AppState) -> Router {
    Router::new()
        .route("/toggle", post(toggle))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/transcribe/file", post(transcribe_file))
        .route("/llm/process", post(llm_process))
        .route("/llm/translate", post(llm_translate))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/ws/events", get(ws_events))
        .with_state(orchestrator)
}

/// Bind and serve until `shutdown` resolves.
///
/// # Errors
/// Returns the bind error separately so the caller can map it to its own
/// exit code.
pub async fn serve(
    orchestrator: AppState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::result::Result<(), ServeError> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(ServeError::Bind)?;
    info!(addr = addr.as_str(), "daemon listening");

    // Open event sockets must be told to close, otherwise graceful
    // shutdown would wait on them forever.
    let signal_state = Arc::clone(&orchestrator);
    let signal = async move {
        shutdown.await;
        signal_state.close_subscribers();
    };

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(signal)
        .await
        .map_err(ServeError::Serve)
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn toggle(State(state): State<AppState>) -> Json<Envelope> {
    match state.toggle().await {
        Ok(ToggleResult::Started) => Json(Envelope::new("recording", "grabación iniciada")),
        Ok(ToggleResult::Stopped(Some(text))) => {
            Json(Envelope::new("idle", "transcripción copiada al portapapeles").with_text(text))
        }
        Ok(ToggleResult::Stopped(None)) => {
            Json(Envelope::new("idle", "no se detectó voz en el audio"))
        }
        Err(e) => Json(Envelope::error(&e)),
    }
}

async fn start(State(state): State<AppState>) -> Json<Envelope> {
    match state.start().await {
        Ok(()) => Json(Envelope::new("recording", "grabación iniciada")),
        Err(V2mError::AlreadyRecording) => Json(Envelope::new(
            "recording",
            "AlreadyRecording: la grabación ya está activa — ignorado",
        )),
        Err(e) => Json(Envelope::error(&e)),
    }
}

async fn stop(State(state): State<AppState>) -> Json<Envelope> {
    match state.stop().await {
        Ok(Some(text)) => {
            Json(Envelope::new("idle", "transcripción copiada al portapapeles").with_text(text))
        }
        Ok(None) => Json(Envelope::new("idle", "no se detectó voz en el audio")),
        Err(V2mError::NotRecording) => Json(Envelope::new(
            "idle",
            "NotRecording: no hay grabación activa — ignorado",
        )),
        Err(e) => Json(Envelope::error(&e)),
    }
}

async fn transcribe_file(
    State(state): State<AppState>,
    Json(request): Json<TranscribeFileRequest>,
) -> Json<Envelope> {
    let current = state.status().state().to_string();
    match state
        .transcribe_file(std::path::Path::new(&request.path))
        .await
    {
        Ok(text) => Json(Envelope::new(&current, "archivo transcrito").with_text(text)),
        Err(e) => Json(Envelope::error(&e)),
    }
}

async fn llm_process(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Json<Envelope> {
    if let Err(e) = validate_text(&request.text) {
        return Json(Envelope::error(&e));
    }

    let current = state.status().state().to_string();
    match state.process_text(&request.text).await {
        LlmOutcome::Refined(text) => {
            Json(Envelope::new(&current, "texto refinado y copiado").with_text(text))
        }
        LlmOutcome::Fallback { reason, original } => Json(
            Envelope::new(
                &current,
                format!("llm falló ({reason}); se copió el texto original"),
            )
            .with_text(original),
        ),
    }
}

async fn llm_translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> Json<Envelope> {
    if let Err(e) = validate_text(&request.text) {
        return Json(Envelope::error(&e));
    }
    if let Err(e) = validate_language(&request.target_lang) {
        return Json(Envelope::error(&e));
    }

    let current = state.status().state().to_string();
    match state
        .translate_text(&request.text, &request.target_lang)
        .await
    {
        Ok(text) => Json(Envelope::new(&current, "texto traducido").with_text(text)),
        Err(e) => Json(Envelope::error(&e)),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let snapshot = state.status();
    Json(StatusBody {
        state: snapshot.state(),
        recording: snapshot.recording,
        model_loaded: snapshot.model_loaded,
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Event stream ─────────────────────────────────────────────────────────

async fn ws_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: AppState) {
    info!("event subscriber connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.subscribe_events();
    let mut closing = state.closing_watch();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        if *closing.borrow() {
            break;
        }
        tokio::select! {
            _ = closing.changed() => continue,
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                let event = StreamEvent::Heartbeat {
                    timestamp: unix_timestamp(),
                    state: state.status().state().to_string(),
                };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                // Client keepalives are consumed; close or error evicts.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(other)) => debug!(?other, "ignoring client frame"),
            }
        }
    }
    info!("event subscriber disconnected");
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &StreamEvent,
) -> std::result::Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            return Ok(());
        }
    };
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Validation ───────────────────────────────────────────────────────────

/// Target languages match `^[A-Za-z \-]{2,20}$`.
fn validate_language(lang: &str) -> v2m_core::Result<()> {
    let len = lang.chars().count();
    let charset_ok = lang
        .chars()
        .all(|c| c.is_ascii_alphabetic() || c == ' ' || c == '-');
    if (2..=20).contains(&len) && charset_ok {
        Ok(())
    } else {
        Err(V2mError::ValidationError(format!(
            "invalid target language: {lang:?}"
        )))
    }
}

fn validate_text(text: &str) -> v2m_core::Result<()> {
    if text.trim().is_empty() {
        return Err(V2mError::ValidationError("text must not be empty".into()));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(V2mError::ValidationError(format!(
            "text exceeds {MAX_TEXT_CHARS} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::desktop::{NullClipboard, NullNotifier};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_router() -> Router {
        let mut settings = Settings::default();
        let dir = std::env::temp_dir().join(format!("v2m-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        settings.config.paths.recording_flag = dir.join("recording.flag");
        settings.config.paths.pid_file = dir.join("daemon.pid");
        router(Arc::new(Orchestrator::new(
            settings,
            Arc::new(NullClipboard),
            Arc::new(NullNotifier),
        )))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let response = test_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_idle_without_io() {
        let response = test_router()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["recording"], false);
        assert_eq!(body["model_loaded"], false);
    }

    #[tokio::test]
    async fn stop_while_idle_is_idempotent() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "idle");
        assert!(body["message"].as_str().unwrap().contains("NotRecording"));
        assert!(body.get("text").is_none());
    }

    #[tokio::test]
    async fn translate_rejects_invalid_language() {
        let response = test_router()
            .oneshot(post_json(
                "/llm/translate",
                serde_json::json!({"text": "hola", "target_lang": "en!!"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("ValidationError"));
    }

    #[tokio::test]
    async fn process_rejects_oversized_text() {
        let huge = "a".repeat(MAX_TEXT_CHARS + 1);
        let response = test_router()
            .oneshot(post_json(
                "/llm/process",
                serde_json::json!({"text": huge}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn transcribe_file_rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not audio").unwrap();

        let response = test_router()
            .oneshot(post_json(
                "/transcribe/file",
                serde_json::json!({"path": path.to_str().unwrap()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("unsupported format"));
    }

    #[tokio::test]
    async fn transcribe_file_reports_missing_files() {
        let response = test_router()
            .oneshot(post_json(
                "/transcribe/file",
                serde_json::json!({"path": "/nonexistent/clip.wav"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_client_error() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/llm/process")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test]
    fn language_pattern_accepts_names_and_rejects_injection() {
        assert!(validate_language("english").is_ok());
        assert!(validate_language("zh-Hans").is_ok());
        assert!(validate_language("pt BR").is_ok());
        assert!(validate_language("e").is_err());
        assert!(validate_language("").is_err());
        assert!(validate_language("english; drop table").is_err());
        assert!(validate_language(&"x".repeat(21)).is_err());
    }

    #[test]
    fn text_validation_enforces_bounds() {
        assert!(validate_text("hola").is_ok());
        assert!(validate_text("").is_err());
        assert!(validate_text("   ").is_err());
        assert!(validate_text(&"a".repeat(MAX_TEXT_CHARS)).is_ok());
        assert!(validate_text(&"a".repeat(MAX_TEXT_CHARS + 1)).is_err());
    }

    #[test]
    fn envelope_skips_absent_text() {
        let json = serde_json::to_value(Envelope::new("idle", "ok")).unwrap();
        assert!(json.get("text").is_none());
        let json =
            serde_json::to_value(Envelope::new("idle", "ok").with_text("hola")).unwrap();
        assert_eq!(json["text"], "hola");
    }
}
