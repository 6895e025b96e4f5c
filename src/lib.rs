//! Parley: a streaming voice conversation engine.
//!
//! Inbound audio flows through a chain of independent stages connected by
//! bounded channels:
//!
//! barge-in → STT → turn controller (LLM + tools) → synthesis → transport
//!
//! - **Barge-in**: interrupts the assistant when the user starts speaking
//! - **STT**: streams or batches audio to a recognizer and detects end of utterance
//! - **Turn controller**: runs one model turn per utterance, invoking tools in a bounded loop
//! - **Synthesis**: feeds assistant text to a speech synthesizer, continuously or in bursts
//!
//! A [`Session`] owns one conversation; the backends behind each stage are
//! traits, so recognizers, models and synthesizers can be swapped freely.

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod stt;
pub mod tools;
pub mod tts;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{AppConfig, ProfileConfig};
pub use error::{Result, SpeechError};
pub use pipeline::{AudioChunk, Backends, PipelineEvent, Session};
