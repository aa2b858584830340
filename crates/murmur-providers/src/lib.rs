//! Provider abstraction for the three external engines a voice session needs.
//!
//! - [`SpeechToText`] turns a live audio stream into [`TurnEvent`]s.
//! - [`LanguageModel`] turns a prompt plus history into text fragments.
//! - [`TextToSpeech`] turns a text fragment into audio bytes or a hosted URL.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use murmur_core::conversation::Message;

pub mod assemblyai;
pub mod gemini;
pub mod murf;
pub mod sse;
pub mod tools;

// --- Speech to text ---

/// One transcription update for the current turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnEvent {
    pub transcript: String,
    pub end_of_turn: bool,
}

/// A live transcription session. Audio goes in through [`SttSession::feed`],
/// turn events come out of the receiver in [`SttHandle`].
#[async_trait]
pub trait SttSession: Send + Sync {
    async fn feed(&self, audio: &[u8]) -> anyhow::Result<()>;

    /// Ask the engine to terminate the session. Safe to call more than once.
    async fn close(&self) -> anyhow::Result<()>;
}

pub struct SttHandle {
    pub session: Box<dyn SttSession>,
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn id(&self) -> &str;

    /// Open a streaming session for raw 16-bit PCM at `sample_rate`.
    async fn open(&self, sample_rate: u32) -> anyhow::Result<SttHandle>;

    /// Transcribe one complete audio file.
    async fn transcribe(&self, audio: Vec<u8>) -> anyhow::Result<String>;
}

// --- Language model ---

/// Lazy, finite, non-restartable sequence of reply fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// Engine that only produces a complete reply.
#[async_trait]
pub trait MonolithicModel: Send + Sync {
    fn id(&self) -> &str;

    async fn reply(&self, prompt: &str, history: &[Message]) -> anyhow::Result<String>;
}

/// Engine that produces a reply incrementally.
#[async_trait]
pub trait StreamingModel: Send + Sync {
    fn id(&self) -> &str;

    async fn reply_stream(&self, prompt: &str, history: &[Message]) -> anyhow::Result<FragmentStream>;
}

/// A language model with its generation mode fixed at configuration time.
#[derive(Clone)]
pub enum LanguageModel {
    Monolithic(Arc<dyn MonolithicModel>),
    Streaming(Arc<dyn StreamingModel>),
}

impl LanguageModel {
    pub fn id(&self) -> &str {
        match self {
            Self::Monolithic(m) => m.id(),
            Self::Streaming(m) => m.id(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// Reply as a fragment stream. A monolithic reply becomes a single
    /// fragment; an empty one becomes an empty stream.
    pub async fn fragments(&self, prompt: &str, history: &[Message]) -> anyhow::Result<FragmentStream> {
        match self {
            Self::Streaming(model) => model.reply_stream(prompt, history).await,
            Self::Monolithic(model) => {
                let text = model.reply(prompt, history).await?;
                let fragments: Vec<anyhow::Result<String>> = if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Ok(text)]
                };
                Ok(Box::pin(futures::stream::iter(fragments)))
            }
        }
    }

    /// Collect the full reply regardless of mode.
    pub async fn complete(&self, prompt: &str, history: &[Message]) -> anyhow::Result<String> {
        match self {
            Self::Monolithic(model) => model.reply(prompt, history).await,
            Self::Streaming(model) => {
                let mut stream = model.reply_stream(prompt, history).await?;
                let mut text = String::new();
                while let Some(fragment) = stream.next().await {
                    text.push_str(&fragment?);
                }
                Ok(text)
            }
        }
    }
}

// --- Text to speech ---

/// A voice offered by the synthesis provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceInfo {
    pub voice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_styles: Vec<String>,
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn id(&self) -> &str;

    /// Synthesize `text` with the streaming voice and return the audio bytes.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;

    /// Synthesize `text` and return a URL to the hosted audio file.
    async fn synthesize_url(&self, text: &str, voice_id: &str) -> anyhow::Result<String>;

    async fn list_voices(&self) -> anyhow::Result<Vec<VoiceInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(&'static str);

    #[async_trait]
    impl MonolithicModel for Canned {
        fn id(&self) -> &str {
            "canned"
        }

        async fn reply(&self, _prompt: &str, _history: &[Message]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Chunked(Vec<&'static str>);

    #[async_trait]
    impl StreamingModel for Chunked {
        fn id(&self) -> &str {
            "chunked"
        }

        async fn reply_stream(&self, _prompt: &str, _history: &[Message]) -> anyhow::Result<FragmentStream> {
            let items: Vec<anyhow::Result<String>> =
                self.0.iter().map(|s| Ok(s.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn test_monolithic_reply_is_single_fragment() {
        let model = LanguageModel::Monolithic(Arc::new(Canned("Hello there")));
        assert!(!model.is_streaming());
        let fragments: Vec<String> = model
            .fragments("hi", &[])
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hello there".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_monolithic_reply_has_no_fragments() {
        let model = LanguageModel::Monolithic(Arc::new(Canned("")));
        let mut stream = model.fragments("hi", &[]).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_complete_collects_stream() {
        let model = LanguageModel::Streaming(Arc::new(Chunked(vec!["Hello", " ", "there"])));
        assert_eq!(model.id(), "chunked");
        assert_eq!(model.complete("hi", &[]).await.unwrap(), "Hello there");
    }

    #[test]
    fn test_voice_info_deser() {
        let json = r#"{"voiceId":"en-US-natalie","displayName":"Natalie (F)","locale":"en-US","gender":"Female","availableStyles":["Promo","Narration"],"accent":"US"}"#;
        let voice: VoiceInfo = serde_json::from_str(json).unwrap();
        assert_eq!(voice.voice_id, "en-US-natalie");
        assert_eq!(voice.available_styles.len(), 2);
        let back = serde_json::to_value(&voice).unwrap();
        assert_eq!(back["displayName"], "Natalie (F)");
    }
}
