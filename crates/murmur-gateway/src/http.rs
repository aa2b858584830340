//! Request/response endpoints: one-shot voice chat, synthesis, voice list.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use murmur_core::conversation::Message;
use murmur_core::error::MurmurError;

use crate::state::GatewayState;

const AUDIO_FIELD: &str = "audio_file";
const DEFAULT_VOICE: &str = "en-US-natalie";

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(rename = "voiceId", default = "default_voice_id")]
    pub voice_id: String,
}

fn default_voice_id() -> String {
    DEFAULT_VOICE.to_string()
}

/// `POST /agent/chat/{session_id}`: transcribe, reply, synthesize.
pub async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    multipart: Multipart,
) -> Response {
    state.evict_idle_sessions().await;
    match run_chat(&state, &session_id, multipart).await {
        Ok(audio_url) => Json(json!({ "audio_url": audio_url })).into_response(),
        Err(e) => {
            error!(session_id = %session_id, kind = e.kind(), %e, "Chat request failed, sending fallback audio");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(e.kind());
            fallback_response(&state).await
        }
    }
}

async fn run_chat(state: &GatewayState, session_id: &str, multipart: Multipart) -> Result<String, MurmurError> {
    let (stt, llm, tts) = state.providers.ensure_complete()?;
    let audio = read_audio_field(multipart).await?;

    let transcript = stt.transcribe(audio).await.map_err(MurmurError::provider)?;
    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        return Err(MurmurError::Provider("No speech detected".into()));
    }

    let position = state.store.append(session_id, Message::user(transcript.clone()));
    let history = state.store.prompt_history(session_id, position);
    let reply = llm
        .complete(&transcript, &history)
        .await
        .map_err(MurmurError::provider)?;
    let reply = reply.trim().to_string();
    if reply.is_empty() {
        return Err(MurmurError::Provider("Language model returned an empty reply".into()));
    }
    state.store.append(session_id, Message::assistant(reply.clone()));

    let voice = state
        .config
        .tts()
        .default_voice
        .unwrap_or_else(default_voice_id);
    let url = tts
        .synthesize_url(&reply, &voice)
        .await
        .map_err(MurmurError::provider)?;
    info!(session_id, chars = reply.len(), "Chat reply synthesized");
    Ok(url)
}

async fn read_audio_field(mut multipart: Multipart) -> Result<Vec<u8>, MurmurError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| MurmurError::Protocol(format!("multipart error: {e}")))?
    {
        if field.name() != Some(AUDIO_FIELD) {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| MurmurError::Protocol(format!("failed to read upload: {e}")))?;
        if data.is_empty() {
            return Err(MurmurError::Protocol("empty audio upload".into()));
        }
        return Ok(data.to_vec());
    }
    Err(MurmurError::Protocol(format!("missing `{AUDIO_FIELD}` field")))
}

async fn fallback_response(state: &GatewayState) -> Response {
    let path = state.config.fallback_audio_path();
    match tokio::fs::read(&path).await {
        Ok(audio) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "audio/mpeg"), (header::HeaderName::from_static("x-error"), "true")],
            audio,
        )
            .into_response(),
        Err(e) => {
            warn!(path = %path.display(), %e, "Fallback audio unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Service unavailable and fallback audio missing" })),
            )
                .into_response()
        }
    }
}

/// `POST /tts`: synthesize text to a hosted audio URL.
pub async fn tts_handler(State(state): State<Arc<GatewayState>>, Json(request): Json<TtsRequest>) -> Response {
    let Some(tts) = state.providers.tts.clone() else {
        return error_response("Speech synthesis API key not configured");
    };
    match tts.synthesize_url(&request.text, &request.voice_id).await {
        Ok(url) => Json(json!({ "audio_url": url })).into_response(),
        Err(e) => {
            error!(error = %format!("{e:#}"), "TTS request failed");
            error_response(&format!("{e:#}"))
        }
    }
}

/// `GET /voices`: voices offered by the synthesis provider.
pub async fn voices_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let Some(tts) = state.providers.tts.clone() else {
        return error_response("Speech synthesis API key not configured");
    };
    match tts.list_voices().await {
        Ok(voices) => Json(json!({ "voices": voices })).into_response(),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Voice listing failed");
            error_response(&format!("{e:#}"))
        }
    }
}

fn error_response(message: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get, post};
    use murmur_core::config::Config;
    use murmur_providers::{TextToSpeech, VoiceInfo};
    use tower::ServiceExt;

    use crate::state::Providers;

    struct UrlTts;

    #[async_trait]
    impl TextToSpeech for UrlTts {
        fn id(&self) -> &str {
            "url"
        }

        async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn synthesize_url(&self, text: &str, voice_id: &str) -> anyhow::Result<String> {
            if text.is_empty() {
                anyhow::bail!("text is required");
            }
            Ok(format!("https://audio.test/{voice_id}.mp3"))
        }

        async fn list_voices(&self) -> anyhow::Result<Vec<VoiceInfo>> {
            Ok(vec![VoiceInfo {
                voice_id: "en-US-natalie".into(),
                display_name: Some("Natalie".into()),
                locale: None,
                gender: None,
                available_styles: Vec::new(),
            }])
        }
    }

    fn app(config: Config, providers: Providers) -> Router {
        let state = Arc::new(GatewayState::new(Arc::new(config), providers));
        Router::new()
            .route("/agent/chat/{session_id}", post(chat_handler))
            .route("/tts", post(tts_handler))
            .route("/voices", get(voices_handler))
            .with_state(state)
    }

    fn with_tts() -> Providers {
        Providers {
            tts: Some(Arc::new(UrlTts)),
            ..Providers::default()
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_tts_defaults_voice() {
        let resp = app(Config::default(), with_tts())
            .oneshot(
                Request::post("/tts")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text":"Hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["audio_url"], "https://audio.test/en-US-natalie.mp3");
    }

    #[tokio::test]
    async fn test_tts_provider_error_is_500() {
        let resp = app(Config::default(), with_tts())
            .oneshot(
                Request::post("/tts")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text":"","voiceId":"en-UK-hazel"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("text is required"));
    }

    #[tokio::test]
    async fn test_voices_without_tts_is_500() {
        let resp = app(Config::default(), Providers::default())
            .oneshot(Request::get("/voices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_chat_without_providers_serves_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let fallback = tmp.path().join("fallback.mp3");
        std::fs::write(&fallback, b"ID3fallback").unwrap();
        let config = Config::from_json5(&format!(
            r#"{{ server: {{ fallback_audio: "{}" }} }}"#,
            fallback.display().to_string().replace('\\', "/")
        ))
        .unwrap();

        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"audio_file\"; filename=\"a.webm\"\r\n\
             Content-Type: audio/webm\r\n\r\nabc\r\n--{boundary}--\r\n"
        );
        let resp = app(config, Providers::default())
            .oneshot(
                Request::post("/agent/chat/s1")
                    .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-error"], "true");
        assert_eq!(resp.headers()["content-type"], "audio/mpeg");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ID3fallback");
    }

    #[tokio::test]
    async fn test_chat_without_fallback_is_503() {
        let config = Config::from_json5(r#"{ server: { fallback_audio: "/nonexistent/fallback.mp3" } }"#).unwrap();
        let resp = app(config, Providers::default())
            .oneshot(
                Request::post("/agent/chat/s1")
                    .header("content-type", "multipart/form-data; boundary=B")
                    .body(Body::from("--B--\r\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
