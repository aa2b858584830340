use thiserror::Error;

#[derive(Debug, Error)]
pub enum MurmurError {
    /// Missing credential or unusable config. Fatal to session start.
    #[error("Config error: {0}")]
    Config(String),

    /// An STT, LLM or TTS call failed. Recovered at the smallest scope.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Malformed inbound frame. Dropped, the connection continues.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client connection went away.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MurmurError {
    /// Wrap a provider failure, keeping the full error chain in the message.
    pub fn provider(err: impl std::fmt::Display) -> Self {
        Self::Provider(format!("{err:#}"))
    }

    /// Short label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Provider(_) => "provider",
            Self::Protocol(_) => "protocol",
            Self::Transport(_) => "transport",
            Self::Session(_) => "session",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, MurmurError>;
