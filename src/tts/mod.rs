//! Text-to-speech capability and the synthesis bridge.
//!
//! A [`TtsBackend`] turns text into a stream of audio chunks, either from a
//! live text stream (continuous mode) or one text at a time (burst mode).
//! [`bridge::SynthBridge`] decides what to send and when.

pub mod bridge;
pub mod websocket;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::error::Result;

pub use bridge::SynthBridge;
pub use websocket::WebSocketTts;

/// A boxed stream of text to synthesize.
pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A boxed stream of synthesized audio (16-bit PCM mono).
pub type SpeechStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Speech synthesis capability.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize text as it arrives. Audio ends once `texts` ends and the
    /// backend has drained.
    async fn synthesize_stream(&self, texts: TextStream) -> Result<SpeechStream>;

    /// Synthesize one complete text.
    async fn synthesize_once(&self, text: &str) -> Result<SpeechStream>;

    /// Abort every synthesis in flight.
    async fn cancel(&self);
}
