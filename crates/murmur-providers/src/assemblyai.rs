//! AssemblyAI speech-to-text.
//!
//! Streaming uses the v3 realtime websocket: binary PCM frames go up, JSON
//! `Begin` / `Turn` / `Termination` messages come down. File transcription
//! uses the v2 REST upload + transcript polling flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use murmur_core::config::SttConfig;

use crate::{SpeechToText, SttHandle, SttSession, TurnEvent};

const DEFAULT_STREAMING_HOST: &str = "streaming.assemblyai.com";
const DEFAULT_BASE_URL: &str = "https://api.assemblyai.com";

/// How long the writer waits for `Termination` after sending `Terminate`.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLLS: u32 = 300;

pub struct AssemblyAiProvider {
    api_key: String,
    streaming_url: String,
    base_url: String,
    client: reqwest::Client,
}

impl AssemblyAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            streaming_url: format!("wss://{DEFAULT_STREAMING_HOST}"),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from config. `None` when no API key resolves.
    pub fn from_config(config: &SttConfig) -> Option<Self> {
        let mut provider = Self::new(config.resolve_api_key()?);
        if let Some(host) = &config.streaming_host {
            provider.streaming_url = if host.contains("://") {
                host.trim_end_matches('/').to_string()
            } else {
                format!("wss://{host}")
            };
        }
        if let Some(base) = &config.base_url {
            provider.base_url = base.trim_end_matches('/').to_string();
        }
        Some(provider)
    }

    fn streaming_endpoint(&self, sample_rate: u32) -> String {
        format!(
            "{}/v3/ws?sample_rate={sample_rate}&format_turns=true&encoding=pcm_s16le",
            self.streaming_url
        )
    }

    async fn upload(&self, audio: Vec<u8>) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/v2/upload", self.base_url))
            .header("authorization", &self.api_key)
            .header("content-type", "application/octet-stream")
            .body(audio)
            .send()
            .await?;
        let body: UploadResponse = checked_json(resp, "upload").await?;
        Ok(body.upload_url)
    }
}

// --- Realtime messages ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamingMessage {
    Begin {
        #[serde(default)]
        id: Option<String>,
    },
    Turn {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        turn_is_formatted: bool,
    },
    Termination {
        #[serde(default)]
        audio_duration_seconds: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

/// Parse one realtime message. Returns the turn event it carries, if any,
/// and whether the server ended the session.
fn parse_streaming_message(text: &str) -> anyhow::Result<(Option<TurnEvent>, bool)> {
    let message: StreamingMessage = serde_json::from_str(text)?;
    Ok(match message {
        StreamingMessage::Begin { id } => {
            info!(session = id.as_deref().unwrap_or("-"), "Transcription session started");
            (None, false)
        }
        StreamingMessage::Turn {
            transcript,
            end_of_turn,
            turn_is_formatted,
        } => {
            trace!(end_of_turn, turn_is_formatted, "Transcription turn");
            (Some(TurnEvent { transcript, end_of_turn }), false)
        }
        StreamingMessage::Termination { audio_duration_seconds } => {
            info!(?audio_duration_seconds, "Transcription session terminated");
            (None, true)
        }
        StreamingMessage::Unknown => (None, false),
    })
}

enum Outgoing {
    Audio(Vec<u8>),
    Terminate,
}

struct AssemblyAiSession {
    tx: mpsc::UnboundedSender<Outgoing>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

#[async_trait]
impl SttSession for AssemblyAiSession {
    async fn feed(&self, audio: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("transcription session is closed");
        }
        self.tx
            .send(Outgoing::Audio(audio.to_vec()))
            .map_err(|_| anyhow::anyhow!("transcription stream has ended"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.tx.send(Outgoing::Terminate).is_err() {
            self.cancel.cancel();
        }
        Ok(())
    }
}

impl Drop for AssemblyAiSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl SpeechToText for AssemblyAiProvider {
    fn id(&self) -> &str {
        "assemblyai"
    }

    async fn open(&self, sample_rate: u32) -> anyhow::Result<SttHandle> {
        let mut request = self.streaming_endpoint(sample_rate).into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&self.api_key)?);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = ws.split();
        debug!(sample_rate, "Connected to AssemblyAI streaming");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TurnEvent>();
        let cancel = CancellationToken::new();

        // Writer: audio frames up, then Terminate
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = out_rx.recv() => next,
                };
                match next {
                    Some(Outgoing::Audio(bytes)) => {
                        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                            warn!(%e, "Failed to forward audio to AssemblyAI");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                    Some(Outgoing::Terminate) | None => {
                        let terminate = json!({ "type": "Terminate" }).to_string();
                        if sink.send(Message::Text(terminate.into())).await.is_ok() {
                            let _ = tokio::time::timeout(TERMINATE_GRACE, writer_cancel.cancelled()).await;
                        }
                        let _ = sink.close().await;
                        writer_cancel.cancel();
                        break;
                    }
                }
            }
        });

        // Reader: JSON messages down, turn events out
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => match parse_streaming_message(text.as_str()) {
                        Ok((Some(event), _)) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Ok((None, true)) => break,
                        Ok((None, false)) => {}
                        Err(e) => debug!(%e, "Ignoring unparseable AssemblyAI message"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "AssemblyAI closed the stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%e, "AssemblyAI stream error");
                        break;
                    }
                    None => break,
                }
            }
            reader_cancel.cancel();
        });

        Ok(SttHandle {
            session: Box::new(AssemblyAiSession {
                tx: out_tx,
                cancel,
                closed: AtomicBool::new(false),
            }),
            events: event_rx,
        })
    }

    async fn transcribe(&self, audio: Vec<u8>) -> anyhow::Result<String> {
        debug!(bytes = audio.len(), "Uploading audio for transcription");
        let upload_url = self.upload(audio).await?;

        let resp = self
            .client
            .post(format!("{}/v2/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .json(&json!({ "audio_url": upload_url }))
            .send()
            .await?;
        let mut transcript: Transcript = checked_json(resp, "transcript").await?;

        for _ in 0..MAX_POLLS {
            match transcript.status.as_str() {
                "completed" => return Ok(transcript.text.unwrap_or_default().trim().to_string()),
                "error" => anyhow::bail!(
                    "Transcription failed: {}",
                    transcript.error.unwrap_or_else(|| "unknown error".into())
                ),
                _ => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            let resp = self
                .client
                .get(format!("{}/v2/transcript/{}", self.base_url, transcript.id))
                .header("authorization", &self.api_key)
                .send()
                .await?;
            transcript = checked_json(resp, "transcript poll").await?;
        }
        anyhow::bail!("Transcription {} did not complete in time", transcript.id)
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct Transcript {
    id: String,
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn checked_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> anyhow::Result<T> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("AssemblyAI {what} error {status}: {body}");
    }
    Ok(resp.json().await?)
}
