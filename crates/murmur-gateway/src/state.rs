//! Gateway shared state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::info;

use murmur_core::config::Config;
use murmur_core::conversation::ConversationStore;
use murmur_core::error::MurmurError;
use murmur_providers::assemblyai::AssemblyAiProvider;
use murmur_providers::gemini::GeminiProvider;
use murmur_providers::murf::MurfProvider;
use murmur_providers::tools::ToolBox;
use murmur_providers::{LanguageModel, SpeechToText, TextToSpeech};

/// The three engines a voice session needs. A missing one means its
/// credential did not resolve.
#[derive(Clone, Default)]
pub struct Providers {
    pub stt: Option<Arc<dyn SpeechToText>>,
    pub llm: Option<LanguageModel>,
    pub tts: Option<Arc<dyn TextToSpeech>>,
}

impl Providers {
    /// Build the AssemblyAI, Gemini and Murf adapters from config.
    pub fn from_config(config: &Config) -> Self {
        let llm_config = config.llm();
        let stt = AssemblyAiProvider::from_config(&config.stt()).map(|p| Arc::new(p) as Arc<dyn SpeechToText>);
        let tools = ToolBox::from_config(&config.tools());
        let tools_enabled = tools.is_some();
        let llm = GeminiProvider::from_config(&llm_config).map(|p| {
            let p = match tools {
                Some(tools) => p.with_tools(tools),
                None => p,
            };
            p.into_language_model(llm_config.streaming)
        });
        let tts = MurfProvider::from_config(&config.tts()).map(|p| Arc::new(p) as Arc<dyn TextToSpeech>);

        info!(
            stt = stt.is_some(),
            llm = llm.is_some(),
            tts = tts.is_some(),
            streaming = llm_config.streaming,
            tools = tools_enabled,
            "Providers configured"
        );
        Self { stt, llm, tts }
    }

    /// All three engines, or the first missing credential as a config error.
    pub fn ensure_complete(
        &self,
    ) -> Result<(Arc<dyn SpeechToText>, LanguageModel, Arc<dyn TextToSpeech>), MurmurError> {
        let stt = self
            .stt
            .clone()
            .ok_or_else(|| MurmurError::Config("Transcription API key not configured".into()))?;
        let llm = self
            .llm
            .clone()
            .ok_or_else(|| MurmurError::Config("Language model API key not configured".into()))?;
        let tts = self
            .tts
            .clone()
            .ok_or_else(|| MurmurError::Config("Speech synthesis API key not configured".into()))?;
        Ok((stt, llm, tts))
    }
}

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub store: Arc<ConversationStore>,
    pub providers: Providers,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub conn_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, providers: Providers) -> Self {
        Self {
            config,
            store: Arc::new(ConversationStore::new()),
            providers,
            connections: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    /// Build state with providers taken from config.
    pub fn from_config(config: Arc<Config>) -> Self {
        let providers = Providers::from_config(&config);
        Self::new(config, providers)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub async fn register_connection(&self, conn_id: &str, session_id: &str) {
        self.connections.write().await.insert(
            conn_id.to_string(),
            ConnectionState {
                conn_id: conn_id.to_string(),
                session_id: session_id.to_string(),
                connected_at: Utc::now(),
            },
        );
    }

    pub async fn set_connection_session(&self, conn_id: &str, session_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(conn_id) {
            conn.session_id = session_id.to_string();
        }
    }

    pub async fn remove_connection(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drop conversations idle longer than the configured timeout. Sessions
    /// bound to a live voice connection are kept.
    pub async fn evict_idle_sessions(&self) -> usize {
        let Some(max_idle) = self.config.idle_session_timeout() else {
            return 0;
        };
        let Some(cutoff) = TimeDelta::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };
        let live: HashSet<String> = self
            .connections
            .read()
            .await
            .values()
            .map(|c| c.session_id.clone())
            .collect();
        self.store.evict_idle(cutoff, |id| live.contains(id))
    }
}
