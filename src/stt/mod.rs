//! Speech-to-text capability and the transcript bridge.
//!
//! A [`SpeechBackend`] turns audio into [`TranscriptSegment`]s either as a
//! long-lived stream or as one-shot batches. [`recognition_stream`] hides
//! that choice behind a single segment stream so [`bridge::SttBridge`] is
//! mode-agnostic. Blocking recognizers are adapted with
//! [`worker::ThreadedRecognizer`].

pub mod bridge;
pub mod http;
pub mod worker;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::config::{SttConfig, SttMode};
use crate::error::Result;
use crate::pipeline::messages::TranscriptSegment;

pub use bridge::SttBridge;
pub use http::HttpRecognizer;
pub use worker::{BlockingRecognizer, ThreadedRecognizer};

/// A boxed stream of raw PCM chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// A boxed stream of recognition results.
pub type SegmentStream = Pin<Box<dyn Stream<Item = TranscriptSegment> + Send>>;

/// Speech recognition capability.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Recognize a live audio stream. The returned stream ends after `audio`
    /// ends and all pending results have been delivered.
    async fn stream_recognize(&self, audio: AudioStream) -> Result<SegmentStream>;

    /// Recognize one buffered batch of audio.
    async fn recognize_batch(&self, audio: Bytes) -> Result<Vec<TranscriptSegment>>;
}

/// Strip the end-of-utterance `marker` from a segment and raise its flag.
///
/// Text is trimmed. A segment carrying the marker is also final.
pub fn strip_marker(segment: TranscriptSegment, marker: &str) -> TranscriptSegment {
    let found = !marker.is_empty() && segment.text.contains(marker);
    let text = if found {
        segment.text.replace(marker, "")
    } else {
        segment.text
    };
    let end_of_utterance = segment.end_of_utterance || found;
    TranscriptSegment {
        text: text.trim().to_owned(),
        is_final: segment.is_final || end_of_utterance,
        end_of_utterance,
    }
}

/// Milliseconds of 16-bit mono audio held in `len` bytes.
pub fn pcm_duration_ms(len: usize, sample_rate_hz: u32) -> u64 {
    let bytes_per_sec = u64::from(sample_rate_hz) * 2;
    if bytes_per_sec == 0 {
        return 0;
    }
    len as u64 * 1000 / bytes_per_sec
}

/// Drive `backend` over `audio` in the configured mode.
///
/// Streaming mode forwards chunks as they arrive. Buffered mode batches audio
/// until `buffer_ms` (or the `max_buffer_ms` ceiling) is reached and flushes
/// any remainder when `audio` ends; empty buffers are never sent. Backend
/// errors are logged and end the affected batch or stream.
pub fn recognition_stream(
    backend: Arc<dyn SpeechBackend>,
    config: &SttConfig,
    audio: AudioStream,
) -> SegmentStream {
    match config.mode {
        SttMode::Streaming => Box::pin(async_stream::stream! {
            match backend.stream_recognize(audio).await {
                Ok(mut segments) => {
                    while let Some(segment) = segments.next().await {
                        yield segment;
                    }
                }
                Err(e) => warn!(error = %e, "streaming recognition failed to start"),
            }
        }),
        SttMode::Buffered => {
            let rate = config.sample_rate_hz;
            let threshold_ms = u64::from(config.buffer_ms);
            let ceiling_ms = u64::from(config.max_buffer_ms);
            Box::pin(async_stream::stream! {
                let mut audio = audio;
                let mut buffer = BytesMut::new();
                while let Some(chunk) = audio.next().await {
                    buffer.extend_from_slice(&chunk);
                    let held = pcm_duration_ms(buffer.len(), rate);
                    if held >= threshold_ms || held >= ceiling_ms {
                        let batch = buffer.split().freeze();
                        debug!(held_ms = held, bytes = batch.len(), "flushing audio batch");
                        for segment in recognize_logged(backend.as_ref(), batch).await {
                            yield segment;
                        }
                    }
                }
                if !buffer.is_empty() {
                    let batch = buffer.split().freeze();
                    debug!(bytes = batch.len(), "flushing final audio batch");
                    for segment in recognize_logged(backend.as_ref(), batch).await {
                        yield segment;
                    }
                }
            })
        }
    }
}

async fn recognize_logged(backend: &dyn SpeechBackend, batch: Bytes) -> Vec<TranscriptSegment> {
    match backend.recognize_batch(batch).await {
        Ok(segments) => segments,
        Err(e) => {
            warn!(error = %e, "batch recognition failed");
            Vec::new()
        }
    }
}
