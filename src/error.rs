//! Error types for the wren call pipeline.

/// Top-level error type for the telephony voice agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Telephony websocket or frame error.
    #[error("telephony error: {0}")]
    Telephony(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model completion error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Memory store error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Conversation journal error.
    #[error("journal error: {0}")]
    Journal(String),

    /// Configuration error (missing credentials, bad values).
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Cooperative cancellation observed.
    #[error("cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
