//! Message types passed between pipeline stages.

use bytes::Bytes;

use crate::llm::ToolCall;

/// A chunk of raw inbound audio from the transport.
///
/// 16-bit little-endian PCM, mono, at the profile's STT sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Raw PCM bytes.
    pub data: Bytes,
}

impl AudioChunk {
    /// Wrap raw PCM bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// A recognition result produced by the speech backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptSegment {
    /// Recognized text, with any end-of-utterance marker removed once normalized.
    pub text: String,
    /// Whether the backend considers this text stable.
    pub is_final: bool,
    /// Whether the user's spoken turn ends with this segment.
    pub end_of_utterance: bool,
}

impl TranscriptSegment {
    /// A final segment with the given text.
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            end_of_utterance: false,
        }
    }

    /// A non-final (partial) segment with the given text.
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            end_of_utterance: false,
        }
    }
}

/// Events flowing downstream through the pipeline.
///
/// Every stage receives the full set and forwards the kinds it does not
/// consume, so the final receiver (the transport) observes transcripts,
/// assistant text, interruptions and audio in stage order.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Raw inbound audio.
    AudioIn(AudioChunk),
    /// A normalized transcript fragment.
    Transcript(TranscriptSegment),
    /// The user's turn is complete.
    EndOfUtterance,
    /// An incremental fragment of assistant text.
    AssistantToken(String),
    /// The model requested a tool invocation.
    ToolCall(ToolCall),
    /// The user barged in; `epoch` is the interrupt generation it belongs to.
    Interruption {
        /// Interrupt epoch after this interruption was raised.
        epoch: u64,
    },
    /// Synthesized assistant audio.
    AudioOut(Bytes),
    /// The assistant's turn finished without interruption.
    EndOfTurn,
}

impl PipelineEvent {
    /// Short kind name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioIn(_) => "audio_in",
            Self::Transcript(_) => "transcript",
            Self::EndOfUtterance => "end_of_utterance",
            Self::AssistantToken(_) => "assistant_token",
            Self::ToolCall(_) => "tool_call",
            Self::Interruption { .. } => "interruption",
            Self::AudioOut(_) => "audio_out",
            Self::EndOfTurn => "end_of_turn",
        }
    }
}

/// Control signals sent to the barge-in coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Synthesized audio started flowing. `epoch` is the interrupt epoch the
    /// synthesis stream was started under.
    AssistantSpeechStart {
        /// Interrupt epoch at stream start.
        epoch: u64,
    },
    /// Synthesized audio stopped.
    AssistantSpeechEnd {
        /// Whether the stream was cut short by an interruption.
        interrupted: bool,
    },
    /// Explicit interruption requested by the transport.
    Interrupt,
    /// Forget speaking state without raising an interruption.
    Reset,
}
