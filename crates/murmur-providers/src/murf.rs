//! Murf speech synthesis.
//!
//! Reply chunks use the streaming endpoint and are collected into one audio
//! buffer per fragment. The request/response surface uses `speech/generate`,
//! which returns a URL to the hosted file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::debug;

use murmur_core::config::TtsConfig;

use crate::{TextToSpeech, VoiceInfo};

const DEFAULT_BASE_URL: &str = "https://api.murf.ai";
const DEFAULT_STREAM_VOICE: &str = "en-US-ariana";
const DEFAULT_VOICE: &str = "en-US-natalie";
const DEFAULT_STYLE: &str = "Conversational";

pub struct MurfProvider {
    api_key: String,
    base_url: String,
    stream_voice: String,
    default_voice: String,
    style: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    style: &'a str,
    format: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    format: &'a str,
    volume: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    audio_file: Option<String>,
}

impl MurfProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_voice: DEFAULT_STREAM_VOICE.to_string(),
            default_voice: DEFAULT_VOICE.to_string(),
            style: DEFAULT_STYLE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from config. `None` when no API key resolves.
    pub fn from_config(config: &TtsConfig) -> Option<Self> {
        let mut provider = Self::new(config.resolve_api_key()?);
        if let Some(base) = &config.base_url {
            provider.base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(voice) = &config.stream_voice {
            provider.stream_voice = voice.clone();
        }
        if let Some(voice) = &config.default_voice {
            provider.default_voice = voice.clone();
        }
        if let Some(style) = &config.style {
            provider.style = style.clone();
        }
        Some(provider)
    }

    /// Voice used when a request does not name one.
    pub fn default_voice(&self) -> &str {
        &self.default_voice
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> anyhow::Result<reqwest::Response> {
        let resp = request.header("api-key", &self.api_key).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Murf {what} error {status}: {body}");
        }
        Ok(resp)
    }
}

#[async_trait]
impl TextToSpeech for MurfProvider {
    fn id(&self) -> &str {
        "murf"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let body = StreamRequest {
            text,
            voice_id: &self.stream_voice,
            style: &self.style,
            format: "MP3",
        };
        let request = self
            .client
            .post(format!("{}/v1/speech/stream", self.base_url))
            .json(&body);
        let resp = self.send(request, "stream").await?;

        let mut audio = Vec::new();
        let mut chunks = resp.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            audio.extend_from_slice(&chunk?);
        }
        if audio.is_empty() {
            anyhow::bail!("Murf returned no audio");
        }
        debug!(chars = text.len(), bytes = audio.len(), "Synthesized fragment");
        Ok(audio)
    }

    async fn synthesize_url(&self, text: &str, voice_id: &str) -> anyhow::Result<String> {
        let voice_id = if voice_id.is_empty() { self.default_voice.as_str() } else { voice_id };
        let body = GenerateRequest {
            text,
            voice_id,
            format: "MP3",
            volume: "100%",
        };
        let request = self
            .client
            .post(format!("{}/v1/speech/generate", self.base_url))
            .json(&body);
        let parsed: GenerateResponse = self.send(request, "generate").await?.json().await?;
        parsed
            .audio_file
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Murf response has no audioFile"))
    }

    async fn list_voices(&self) -> anyhow::Result<Vec<VoiceInfo>> {
        let request = self.client.get(format!("{}/v1/speech/voices", self.base_url));
        Ok(self.send(request, "voices").await?.json().await?)
    }
}
