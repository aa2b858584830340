//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Murmur configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<ProvidersConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Audio served by `/agent/chat` when the voice pipeline fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_audio: Option<String>,
}

fn default_port() -> u16 {
    8000
}

// --- Provider credentials ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,
}

/// Speech-to-text (AssemblyAI) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Streaming host (default: "streaming.assemblyai.com").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_host: Option<String>,

    /// REST base URL for file transcription (default: "https://api.assemblyai.com").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| env_secret("ASSEMBLYAI_API_KEY"))
    }
}

/// Language model (Gemini) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model id (default: "gemini-2.5-flash").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Use incremental generation. Chosen once at startup.
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Override for the built-in persona prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: None,
            model: None,
            base_url: None,
            streaming: true,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| env_secret("GEMINI_API_KEY"))
    }
}

/// Text-to-speech (Murf) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Voice used for streamed reply chunks (default: "en-US-ariana").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_voice: Option<String>,

    /// Voice used for hosted-URL synthesis (default: "en-US-natalie").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Speaking style (default: "Conversational").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| env_secret("MURF_API_KEY"))
    }
}

/// Language-model tools: web search (SerpAPI) and news (NewsAPI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Offer the tools to the model at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub serp_api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub serp_api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub serp_base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub news_api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub news_api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub news_base_url: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serp_api_key: None,
            serp_api_key_env: None,
            serp_base_url: None,
            news_api_key: None,
            news_api_key_env: None,
            news_base_url: None,
        }
    }
}

impl ToolsConfig {
    pub fn resolve_serp_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.serp_api_key, &self.serp_api_key_env)
            .or_else(|| env_secret("SERP_API_KEY"))
    }

    pub fn resolve_news_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.news_api_key, &self.news_api_key_env)
            .or_else(|| env_secret("NEWS_API_KEY"))
    }
}

fn default_true() -> bool {
    true
}

// --- Streaming session tuning ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Minimum gap between two accepted finalized turns.
    #[serde(default = "default_dedup_cooldown_ms")]
    pub dedup_cooldown_ms: u64,

    /// Turns whose trimmed text is this short or shorter are ignored.
    #[serde(default = "default_min_turn_chars")]
    pub min_turn_chars: usize,

    /// Bounded wait of the outbound send loop.
    #[serde(default = "default_send_poll_interval_ms")]
    pub send_poll_interval_ms: u64,

    /// Sample rate announced to the transcription engine.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Conversations with no new message for this long are dropped. Voice
    /// sessions with a live connection are never dropped. 0 keeps everything.
    #[serde(default = "default_idle_session_secs")]
    pub idle_session_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dedup_cooldown_ms: default_dedup_cooldown_ms(),
            min_turn_chars: default_min_turn_chars(),
            send_poll_interval_ms: default_send_poll_interval_ms(),
            sample_rate: default_sample_rate(),
            idle_session_secs: default_idle_session_secs(),
        }
    }
}

fn default_dedup_cooldown_ms() -> u64 {
    1500
}

fn default_min_turn_chars() -> usize {
    3
}

fn default_send_poll_interval_ms() -> u64 {
    100
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_idle_session_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the fragment queue between the LLM and TTS workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on a single synthesis call.
    #[serde(default = "default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            synthesis_timeout_ms: default_synthesis_timeout_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    32
}

fn default_synthesis_timeout_ms() -> u64 {
    15_000
}

/// Local copy of inbound microphone audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Target directory (default: `~/.murmur/uploads`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(default = "default_max_bytes_per_stream")]
    pub max_bytes_per_stream: u64,

    /// Recordings kept on disk; older ones are pruned.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            max_bytes_per_stream: default_max_bytes_per_stream(),
            max_files: default_max_files(),
        }
    }
}

fn default_max_bytes_per_stream() -> u64 {
    50 * 1024 * 1024
}

fn default_max_files() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "murmur_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    env_var.as_deref().and_then(env_secret)
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Substitute `${ENV_VAR}` patterns with their environment values (empty if unset).
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::MurmurError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file. A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::from_json5(&raw)
    }

    /// Parse config text, substituting `${ENV_VAR}` references first.
    pub fn from_json5(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| crate::error::MurmurError::Config(e.to_string()))
    }

    /// Default config file location: `~/.murmur/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port).unwrap_or(8000)
    }

    pub fn bind(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn fallback_audio_path(&self) -> PathBuf {
        self.server
            .as_ref()
            .and_then(|s| s.fallback_audio.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("fallback.mp3"))
    }

    pub fn stt(&self) -> SttConfig {
        self.providers
            .as_ref()
            .and_then(|p| p.stt.clone())
            .unwrap_or_default()
    }

    pub fn llm(&self) -> LlmConfig {
        self.providers
            .as_ref()
            .and_then(|p| p.llm.clone())
            .unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.providers
            .as_ref()
            .and_then(|p| p.tts.clone())
            .unwrap_or_default()
    }

    pub fn tools(&self) -> ToolsConfig {
        self.providers
            .as_ref()
            .and_then(|p| p.tools.clone())
            .unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        self.pipeline.clone().unwrap_or_default()
    }

    pub fn recording(&self) -> RecordingConfig {
        self.recording.clone().unwrap_or_default()
    }

    pub fn recording_dir(&self) -> PathBuf {
        self.recording
            .as_ref()
            .and_then(|r| r.dir.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("uploads"))
    }

    pub fn dedup_cooldown(&self) -> Duration {
        Duration::from_millis(self.session().dedup_cooldown_ms)
    }

    pub fn send_poll_interval(&self) -> Duration {
        Duration::from_millis(self.session().send_poll_interval_ms)
    }

    /// `None` when idle conversations are kept forever.
    pub fn idle_session_timeout(&self) -> Option<Duration> {
        match self.session().idle_session_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline().synthesis_timeout_ms)
    }

    /// Get a config value by dotted path (e.g. "server.port", "providers.llm.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.stt().resolve_api_key().is_none() {
            warnings.push("Transcription (AssemblyAI) has no API key configured".to_string());
        }
        if self.llm().resolve_api_key().is_none() {
            warnings.push("Language model (Gemini) has no API key configured".to_string());
        }
        if self.tts().resolve_api_key().is_none() {
            warnings.push("Speech synthesis (Murf) has no API key configured".to_string());
        }

        if self.server.as_ref().is_some_and(|s| s.port == 0) {
            errors.push("Server port cannot be 0".to_string());
        }
        if self.pipeline().queue_capacity == 0 {
            errors.push("pipeline.queue_capacity must be at least 1".to_string());
        }
        if self.session().sample_rate == 0 {
            errors.push("session.sample_rate cannot be 0".to_string());
        }
        if self.session().send_poll_interval_ms == 0 {
            errors.push("session.send_poll_interval_ms must be at least 1".to_string());
        }

        if let Some(path) = self.server.as_ref().and_then(|s| s.fallback_audio.as_ref()) {
            if !Path::new(path).exists() {
                warnings.push(format!("Fallback audio file not found: {path}"));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Murmur data: `~/.murmur/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".murmur")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port(), 8000);
        assert_eq!(config.bind(), "127.0.0.1");
        assert_eq!(config.dedup_cooldown(), Duration::from_millis(1500));
        assert_eq!(config.session().min_turn_chars, 3);
        assert_eq!(config.send_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.pipeline().queue_capacity, 32);
        assert!(config.llm().streaming);
        assert!(!config.recording().enabled);
    }

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name is unique to this test
        unsafe { std::env::set_var("TEST_MURMUR_SUBST_KEY", "sk-test-123") };
        let config = Config::from_json5(
            r#"{ providers: { llm: { api_key: "${TEST_MURMUR_SUBST_KEY}" } } }"#,
        )
        .unwrap();
        assert_eq!(config.llm().api_key.as_deref(), Some("sk-test-123"));
        unsafe { std::env::remove_var("TEST_MURMUR_SUBST_KEY") };
    }

    #[test]
    fn test_missing_env_var_substitutes_empty() {
        let config = Config::from_json5(
            r#"{ providers: { tts: { api_key: "${NONEXISTENT_MURMUR_VAR}" } } }"#,
        )
        .unwrap();
        assert_eq!(config.tts().api_key.as_deref(), Some(""));
    }

    #[test]
    fn test_resolve_secret_field_priority() {
        // SAFETY: test-only, variable name is unique to this test
        unsafe { std::env::set_var("TEST_MURMUR_SECRET", "from-env") };
        let env = Some("TEST_MURMUR_SECRET".to_string());
        assert_eq!(resolve_secret_field(&None, &env), Some("from-env".into()));
        assert_eq!(
            resolve_secret_field(&Some("direct".into()), &env),
            Some("direct".into())
        );
        // Empty direct value falls through to the env var
        assert_eq!(
            resolve_secret_field(&Some(String::new()), &env),
            Some("from-env".into())
        );
        unsafe { std::env::remove_var("TEST_MURMUR_SECRET") };
        assert_eq!(resolve_secret_field(&None, &env), None);
    }

    #[test]
    fn test_session_tuning_deser() {
        let config = Config::from_json5(
            r#"{
                session: { dedup_cooldown_ms: 500, min_turn_chars: 5 },
                pipeline: { queue_capacity: 4 },
            }"#,
        )
        .unwrap();
        assert_eq!(config.dedup_cooldown(), Duration::from_millis(500));
        assert_eq!(config.session().min_turn_chars, 5);
        // Unset fields keep their defaults
        assert_eq!(config.session().sample_rate, 16000);
        assert_eq!(config.pipeline().queue_capacity, 4);
        assert_eq!(config.synthesis_timeout(), Duration::from_millis(15_000));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::from_json5(r#"{ logging: {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.server.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ server: { port: 9100, bind: "0.0.0.0" } }"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port(), 9100);
        assert_eq!(config.bind(), "0.0.0.0");
    }

    #[test]
    fn test_invalid_json5_is_config_error() {
        let err = Config::from_json5("{ server: ").unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_get_path() {
        let config = Config::from_json5(r#"{ providers: { llm: { model: "gemini-x" } } }"#).unwrap();
        assert_eq!(
            config.get_path("providers.llm.model"),
            Some(serde_json::json!("gemini-x"))
        );
        assert!(config.get_path("providers.nope").is_none());
    }

    #[test]
    fn test_validate_errors() {
        let config = Config::from_json5(
            r#"{ server: { port: 0 }, pipeline: { queue_capacity: 0 } }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("port")));
        assert!(errors.iter().any(|e| e.contains("queue_capacity")));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = Config::from_json5(r#"{ session: { send_poll_interval_ms: 0 } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("send_poll_interval_ms"));

        let (_warnings, errors) = Config::default().validate();
        assert!(errors.is_empty());
    }

    #[test]
    fn test_tools_config() {
        let tools = Config::default().tools();
        assert!(tools.enabled);

        let config = Config::from_json5(
            r#"{ providers: { tools: { enabled: false, serp_api_key: "serp-k", news_base_url: "http://localhost:1" } } }"#,
        )
        .unwrap();
        let tools = config.tools();
        assert!(!tools.enabled);
        assert_eq!(tools.resolve_serp_api_key().as_deref(), Some("serp-k"));
        assert_eq!(tools.news_base_url.as_deref(), Some("http://localhost:1"));
    }

    #[test]
    fn test_validate_warns_on_missing_keys() {
        let config = Config::from_json5(
            r#"{ providers: {
                stt: { api_key_env: "MURMUR_TEST_UNSET_STT" },
                llm: { api_key: "set" },
            } }"#,
        )
        .unwrap();
        let (warnings, _errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("AssemblyAI")) || std::env::var("ASSEMBLYAI_API_KEY").is_ok());
        assert!(!warnings.iter().any(|w| w.contains("Gemini")));
    }
}
