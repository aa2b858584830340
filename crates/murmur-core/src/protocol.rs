//! Voice socket wire protocol.
//!
//! Clients send raw binary audio frames, a JSON session announcement, or the
//! literal text `EOF`. The server answers with tagged JSON envelopes, all of
//! which pass through one ordered send path per connection.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::MurmurError;

/// Text frame that ends the inbound audio stream.
pub const EOF_SENTINEL: &str = "EOF";

/// Server -> client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    Transcription {
        text: String,
        is_final: bool,
        end_of_turn: bool,
    },
    TurnEnd {
        message: String,
    },
    LlmResponseText {
        text: String,
    },
    AudioChunk {
        chunk_index: u32,
        /// Base64-encoded audio bytes.
        audio: String,
        is_final: bool,
    },
    AudioComplete {
        message: String,
        total_chunks: u32,
    },
}

impl OutboundMessage {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Transcript update; `is_final` mirrors the end-of-turn flag.
    pub fn transcription(text: impl Into<String>, end_of_turn: bool) -> Self {
        Self::Transcription {
            text: text.into(),
            is_final: end_of_turn,
            end_of_turn,
        }
    }

    pub fn turn_end() -> Self {
        Self::TurnEnd {
            message: "User stopped talking".into(),
        }
    }

    pub fn llm_text(text: impl Into<String>) -> Self {
        Self::LlmResponseText { text: text.into() }
    }

    pub fn audio_chunk(chunk_index: u32, audio: &[u8]) -> Self {
        Self::AudioChunk {
            chunk_index,
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
            is_final: false,
        }
    }

    pub fn audio_complete(total_chunks: u32) -> Self {
        Self::AudioComplete {
            message: "Audio streaming completed".into(),
            total_chunks,
        }
    }

    /// The envelope's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Transcription { .. } => "transcription",
            Self::TurnEnd { .. } => "turn_end",
            Self::LlmResponseText { .. } => "llm_response_text",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::AudioComplete { .. } => "audio_complete",
        }
    }
}

/// JSON control messages accepted on the voice socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Session { session_id: String },
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextFrame {
    /// The client declares which conversation this connection belongs to.
    Session(String),
    /// End of the inbound stream.
    Eof,
}

impl TextFrame {
    /// Decode an inbound text frame.
    ///
    /// Anything that is neither `EOF` nor a known control message is a
    /// protocol error; callers drop it and keep the connection open.
    pub fn parse(text: &str) -> Result<Self, MurmurError> {
        if text == EOF_SENTINEL {
            return Ok(Self::Eof);
        }
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Session { session_id }) => {
                let session_id = session_id.trim();
                if session_id.is_empty() {
                    return Err(MurmurError::Protocol("empty session_id".into()));
                }
                Ok(Self::Session(session_id.to_string()))
            }
            Err(e) => Err(MurmurError::Protocol(format!("unrecognized text frame: {e}"))),
        }
    }
}
