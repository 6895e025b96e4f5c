//! Error types for the conversation engine.

/// Top-level error type for the streaming conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Configuration error (bad backend address, missing persona, unknown profile).
    #[error("config error: {0}")]
    Config(String),

    /// Speech-to-text backend error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model backend error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech backend error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl SpeechError {
    /// Whether this error should end the session rather than the current turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
