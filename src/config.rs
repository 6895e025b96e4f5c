//! Configuration types for the conversation engine.
//!
//! An [`AppConfig`] holds one or more named [`ProfileConfig`]s (for example
//! `dev` on a CPU-only laptop and `prod` on a GPU host). Sessions receive the
//! resolved profile explicitly; nothing here is cached process-wide.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SpeechError};

/// Top-level configuration: transport settings plus named profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Profile used when the caller does not name one.
    pub default_profile: String,
    /// Transport-level settings.
    pub transport: TransportConfig,
    /// Named pipeline profiles.
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_profile: "dev".to_owned(),
            transport: TransportConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Profile names are taken from the table keys. A file with no profiles is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or defines no profiles.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpeechError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or defines no profiles.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| SpeechError::Config(e.to_string()))?;
        if config.profiles.is_empty() {
            return Err(SpeechError::Config(
                "no profiles defined in configuration file".to_owned(),
            ));
        }
        for (name, profile) in &mut config.profiles {
            profile.name.clone_from(name);
        }
        Ok(config)
    }

    /// Resolve a profile by name, falling back to `default_profile`.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the known profiles if the target is missing.
    pub fn profile(&self, name: Option<&str>) -> Result<&ProfileConfig> {
        let target = name.unwrap_or(&self.default_profile);
        self.profiles.get(target).ok_or_else(|| {
            let known = self.profiles.keys().cloned().collect::<Vec<_>>().join(", ");
            SpeechError::Config(format!(
                "unknown profile '{target}'. Known profiles: {known}"
            ))
        })
    }
}

/// Transport-level configuration consumed by the session owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Prefix outbound audio with a WAV header.
    pub add_wav_header: bool,
    /// Idle timeout after which the session is stopped (None = never).
    pub session_timeout_secs: Option<u64>,
}

/// Per-profile pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Profile name (filled from the table key on load).
    #[serde(skip)]
    pub name: String,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Barge-in behavior while the assistant is speaking.
    pub barge_in: BargeInConfig,
}

/// Barge-in configuration (user interrupts assistant by speaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether inbound audio may interrupt assistant speech.
    pub enabled: bool,
    /// Ignore inbound audio for this long after assistant speech starts (ms).
    ///
    /// Filters speaker leakage right at playback start when no echo
    /// cancellation is available. 0 disables the holdoff.
    pub assistant_start_holdoff_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            assistant_start_holdoff_ms: 0,
        }
    }
}

/// How the recognizer is driven.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttMode {
    /// Forward chunks to a long-lived streaming recognition call.
    #[default]
    Streaming,
    /// Accumulate audio and send fixed-size batches for offline recognition.
    Buffered,
}

/// How end-of-utterance is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EouDetection {
    /// The backend embeds a marker token in recognized text.
    Marker,
    /// No audio for `timeout_ms` closes the utterance.
    Silence {
        /// Silence duration that ends an utterance.
        timeout_ms: u64,
    },
}

impl Default for EouDetection {
    fn default() -> Self {
        Self::Marker
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Recognition server address.
    pub server_url: String,
    /// Streaming or buffered recognition.
    pub mode: SttMode,
    /// BCP-47 language code.
    pub language_code: String,
    /// Input sample rate (16-bit mono PCM).
    pub sample_rate_hz: u32,
    /// Marker the backend embeds in text at the end of an utterance.
    pub end_of_utterance_token: String,
    /// Optional prompt passed to the recognizer to bias decoding.
    pub initial_prompt: Option<String>,
    /// Text prepended to every emitted transcript.
    pub prepend_prompt: String,
    /// Text appended to every emitted transcript.
    pub append_prompt: String,
    /// Buffered mode: batch size in milliseconds of audio.
    pub buffer_ms: u32,
    /// Buffered mode: hard ceiling in milliseconds of audio.
    pub max_buffer_ms: u32,
    /// End-of-utterance detection strategy.
    pub eou_detection: EouDetection,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/inference".to_owned(),
            mode: SttMode::Streaming,
            language_code: "en-US".to_owned(),
            sample_rate_hz: 16_000,
            end_of_utterance_token: "<EOU>".to_owned(),
            initial_prompt: None,
            prepend_prompt: String::new(),
            append_prompt: String::new(),
            buffer_ms: 2000,
            max_buffer_ms: 8000,
            eou_detection: EouDetection::Marker,
        }
    }
}

impl SttConfig {
    /// Check values that would otherwise fail per chunk.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(SpeechError::Config("stt.sample_rate_hz must be > 0".into()));
        }
        if self.mode == SttMode::Buffered && (self.buffer_ms == 0 || self.max_buffer_ms == 0) {
            return Err(SpeechError::Config(
                "stt.buffer_ms and stt.max_buffer_ms must be > 0 in buffered mode".into(),
            ));
        }
        if let EouDetection::Silence { timeout_ms: 0 } = self.eou_detection {
            return Err(SpeechError::Config(
                "stt.eou_detection.timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat backend host.
    pub host: String,
    /// Persona / system prompt file.
    pub persona_path: PathBuf,
    /// Accelerator memory needed to route to the large model.
    pub min_vram_gb: u64,
    /// Explicit model name; bypasses routing.
    pub model_override: Option<String>,
    /// Model used when enough accelerator memory is available.
    pub large_model: String,
    /// Fallback model for small or CPU-only hosts.
    pub small_model: String,
    /// Maximum chained tool-call rounds per user turn.
    pub tool_call_limit: u32,
    /// Timeout for establishing a chat request.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_owned(),
            persona_path: PathBuf::from("config/persona_default.md"),
            min_vram_gb: 12,
            model_override: None,
            large_model: "qwen3:14b".to_owned(),
            small_model: "gemma2:2b".to_owned(),
            tool_call_limit: 3,
            request_timeout_secs: 30,
        }
    }
}

/// How assistant text is fed to synthesis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsMode {
    /// Every token goes straight into one live synthesis connection.
    #[default]
    Continuous,
    /// Tokens are buffered and flushed as one-shot synthesis calls.
    Burst,
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis server WebSocket address.
    pub server_url: String,
    /// Voice identifier (server default when unset).
    pub voice: Option<String>,
    /// Continuous or burst synthesis.
    pub mode: TtsMode,
    /// Burst mode: flush when `.`, `!` or `?` is buffered.
    pub flush_on_punctuation: bool,
    /// Burst mode: flush when this many characters are buffered (0 disables).
    pub flush_char_threshold: usize,
    /// Output sample rate of synthesized audio.
    pub sample_rate_hz: u32,
    /// Connection timeout.
    pub connect_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8020/ws".to_owned(),
            voice: None,
            mode: TtsMode::Continuous,
            flush_on_punctuation: true,
            flush_char_threshold: 120,
            sample_rate_hz: 24_000,
            connect_timeout_ms: 5000,
        }
    }
}
