//! Configuration for the voice agent, read from the environment.
//!
//! Every knob recognized by the server is an environment variable. Vendor
//! credentials are required at startup; everything else has a default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Top-level configuration for the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// External hostname used when building callback URLs.
    pub server_host: String,
    /// Journal + memory database file path.
    pub db_path: PathBuf,
    /// Whether the call-recording path is enabled.
    pub recording_enabled: bool,
    /// Destination number for human handoff (`transfer_call`).
    pub transfer_number: Option<String>,
    /// Display/grouping timezone (IANA name).
    pub timezone: String,
    /// Calls shorter than this skip persistence entirely.
    pub minimum_call_duration_secs: u64,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            server_host: "localhost".to_owned(),
            db_path: PathBuf::from("wren.db"),
            recording_enabled: false,
            transfer_number: None,
            timezone: "America/Los_Angeles".to_owned(),
            minimum_call_duration_secs: 2,
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
        }
    }
}

/// Speech-to-text vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Vendor API key.
    pub api_key: String,
    /// Websocket endpoint base (`wss://...`).
    pub endpoint: String,
    /// Vendor model tag.
    pub model: String,
    /// Silence window before the vendor emits `UtteranceEnd`.
    pub utterance_end_ms: u32,
    /// Vendor endpointing window in ms.
    pub endpointing_ms: u32,
    /// Maximum reconnection attempts before the session is declared down.
    pub max_retries: u32,
    /// Initial reconnection delay.
    pub initial_retry_delay_ms: u64,
    /// Reconnection delay cap.
    pub max_retry_delay_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "wss://api.deepgram.com/v1/listen".to_owned(),
            model: "nova-2".to_owned(),
            utterance_end_ms: 1000,
            endpointing_ms: 200,
            max_retries: 5,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 8_000,
        }
    }
}

/// Language model vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Vendor API key.
    pub api_key: String,
    /// HTTP endpoint base (no trailing `/v1`).
    pub endpoint: String,
    /// Model identifier sent in requests.
    pub model: String,
    /// Single-character delimiter splitting the reply into spoken segments.
    pub segment_delimiter: char,
    /// Token budget per turn.
    pub max_tokens: u32,
    /// Overall bound on one streaming turn.
    pub turn_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "https://api.openai.com".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            segment_delimiter: '\u{2022}',
            max_tokens: 600,
            turn_timeout: Duration::from_secs(60),
        }
    }
}

/// Text-to-speech vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Vendor API key.
    pub api_key: String,
    /// HTTP endpoint base.
    pub endpoint: String,
    /// Voice model tag.
    pub voice_model: String,
    /// Throttling target; the pacer never exceeds this rate.
    pub max_requests_per_second: f64,
    /// Baseline inter-request delay in ms.
    pub request_spacing_ms: u64,
    /// Consecutive failures that trip the circuit breaker.
    pub breaker_threshold: u32,
    /// OPEN → HALF_OPEN delay in ms.
    pub breaker_recovery_ms: u64,
    /// Per-attempt synthesis deadline.
    pub request_timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "https://api.deepgram.com".to_owned(),
            voice_model: "aura-asteria-en".to_owned(),
            max_requests_per_second: 2.0,
            request_spacing_ms: 200,
            breaker_threshold: 3,
            breaker_recovery_ms: 30_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a config error when a required credential is missing or a
    /// numeric variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("PORT")? {
            config.port = port;
        }
        if let Ok(host) = std::env::var("SERVER") {
            config.server_host = host;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(enabled) = env_parse::<bool>("RECORDING_ENABLED")? {
            config.recording_enabled = enabled;
        }
        if let Ok(number) = std::env::var("TRANSFER_NUMBER") {
            config.transfer_number = Some(number);
        }
        if let Ok(tz) = std::env::var("TIMEZONE") {
            config.timezone = tz;
        }
        if let Some(secs) = env_parse::<u64>("MINIMUM_CALL_DURATION_SECONDS")? {
            config.minimum_call_duration_secs = secs;
        }

        config.stt.api_key = require_env("STT_KEY")?;
        config.llm.api_key = require_env("LLM_KEY")?;
        config.tts.api_key = require_env("TTS_KEY")?;

        if let Ok(url) = std::env::var("STT_URL") {
            config.stt.endpoint = url;
        }
        if let Ok(url) = std::env::var("LLM_URL") {
            config.llm.endpoint = url;
        }
        if let Ok(url) = std::env::var("TTS_URL") {
            config.tts.endpoint = url;
        }
        if let Ok(voice) = std::env::var("VOICE_MODEL") {
            config.tts.voice_model = voice;
        }

        if let Some(n) = env_parse::<u32>("STT_MAX_RETRIES")? {
            config.stt.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("STT_INITIAL_RETRY_DELAY_MS")? {
            config.stt.initial_retry_delay_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("STT_MAX_RETRY_DELAY_MS")? {
            config.stt.max_retry_delay_ms = ms;
        }

        if let Some(rps) = env_parse::<f64>("TTS_MAX_REQUESTS_PER_SECOND")? {
            if rps <= 0.0 {
                return Err(AgentError::Config(
                    "TTS_MAX_REQUESTS_PER_SECOND must be positive".to_owned(),
                ));
            }
            config.tts.max_requests_per_second = rps;
        }
        if let Some(ms) = env_parse::<u64>("TTS_REQUEST_SPACING_MS")? {
            config.tts.request_spacing_ms = ms;
        }
        if let Some(n) = env_parse::<u32>("TTS_CIRCUIT_BREAKER_THRESHOLD")? {
            config.tts.breaker_threshold = n;
        }
        if let Some(ms) = env_parse::<u64>("TTS_CIRCUIT_RECOVERY_TIME_MS")? {
            config.tts.breaker_recovery_ms = ms;
        }

        Ok(config)
    }

    /// Effective baseline spacing between TTS requests.
    ///
    /// The larger of the configured spacing and the spacing implied by the
    /// requests-per-second ceiling.
    pub fn tts_baseline_spacing(&self) -> Duration {
        let from_rate = (1000.0 / self.tts.max_requests_per_second).ceil() as u64;
        Duration::from_millis(self.tts.request_spacing_ms.max(from_rate))
    }
}

/// Read a required environment variable, failing with a config error.
fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AgentError::Config(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

/// Parse an optional environment variable, failing only on bad syntax.
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AgentError::Config(format!("could not parse {name}={raw}"))),
        Err(_) => Ok(None),
    }
}
