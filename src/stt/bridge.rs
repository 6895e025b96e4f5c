//! STT stage: feeds inbound audio to recognition and emits transcripts.
//!
//! Recognition starts lazily on the first audio chunk of a turn. The audio
//! ingestion queue is closed exactly once when the turn ends (silence
//! timeout or end of input); the recognition stream is then drained to
//! completion before a new one may start, so at most one recognition is
//! live at a time. All events other than inbound audio pass through
//! unchanged.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{SegmentStream, SpeechBackend, recognition_stream, strip_marker};
use crate::config::{EouDetection, SttConfig};
use crate::error::Result;
use crate::pipeline::messages::{AudioChunk, PipelineEvent, TranscriptSegment};

/// Speech-to-text pipeline stage.
pub struct SttBridge {
    backend: Arc<dyn SpeechBackend>,
    config: SttConfig,
}

impl SttBridge {
    /// Create the stage.
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` is invalid.
    pub fn new(backend: Arc<dyn SpeechBackend>, config: SttConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    /// Run until `input` closes, `output` closes or `cancel` fires.
    pub async fn run(
        self,
        input: mpsc::Receiver<PipelineEvent>,
        output: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        let silence = match self.config.eou_detection {
            EouDetection::Silence { timeout_ms } => Some(Duration::from_millis(timeout_ms)),
            EouDetection::Marker => None,
        };
        let mut stage = Stage {
            backend: self.backend,
            config: self.config,
            input,
            output,
            cancel,
            silence,
            ingest: None,
            segments: None,
            silence_deadline: None,
            text_since_eou: false,
        };
        stage.run().await;
        debug!("stt stage stopped");
    }
}

struct Stage {
    backend: Arc<dyn SpeechBackend>,
    config: SttConfig,
    input: mpsc::Receiver<PipelineEvent>,
    output: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
    silence: Option<Duration>,
    ingest: Option<mpsc::UnboundedSender<Bytes>>,
    segments: Option<SegmentStream>,
    silence_deadline: Option<Instant>,
    text_since_eou: bool,
}

async fn next_segment(segments: &mut Option<SegmentStream>) -> Option<TranscriptSegment> {
    match segments {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Stage {
    async fn run(&mut self) {
        loop {
            let alive = tokio::select! {
                biased;
                () = self.cancel.cancelled() => false,
                segment = next_segment(&mut self.segments) => match segment {
                    Some(segment) => self.on_segment(segment).await,
                    None => {
                        debug!("recognition stream ended");
                        self.segments = None;
                        self.ingest = None;
                        true
                    }
                },
                () = sleep_until_opt(self.silence_deadline) => {
                    self.silence_deadline = None;
                    self.on_silence().await
                }
                event = self.input.recv() => match event {
                    Some(PipelineEvent::AudioIn(chunk)) => self.on_audio(chunk).await,
                    Some(other) => self.emit(other).await,
                    None => {
                        self.finish_recognition().await;
                        false
                    }
                },
            };
            if !alive {
                break;
            }
        }
        self.close_recognition().await;
    }

    async fn on_audio(&mut self, chunk: AudioChunk) -> bool {
        if let Some(timeout) = self.silence {
            self.silence_deadline = Some(Instant::now() + timeout);
        }
        if self.ingest.is_none() && !self.start_recognition().await {
            return false;
        }
        let Some(ingest) = &self.ingest else {
            return true;
        };
        if let Err(rejected) = ingest.send(chunk.data) {
            // The recognition ended on its own; restart and hand it the chunk.
            debug!("recognition closed its audio queue, restarting");
            if !self.finish_recognition().await || !self.start_recognition().await {
                return false;
            }
            if let Some(ingest) = &self.ingest {
                if ingest.send(rejected.0).is_err() {
                    debug!("fresh recognition refused the chunk, dropping it");
                }
            }
        }
        true
    }

    /// Start a new recognition, draining the previous one first.
    async fn start_recognition(&mut self) -> bool {
        if self.segments.is_some() && !self.finish_recognition().await {
            return false;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let audio = Box::pin(UnboundedReceiverStream::new(rx));
        self.segments = Some(recognition_stream(
            Arc::clone(&self.backend),
            &self.config,
            audio,
        ));
        self.ingest = Some(tx);
        info!(mode = ?self.config.mode, "recognition started");
        true
    }

    /// Close the ingestion queue and emit every remaining segment.
    ///
    /// On cancellation the unfinished recognition is left in place for
    /// [`Stage::close_recognition`].
    async fn finish_recognition(&mut self) -> bool {
        // Dropping the only sender closes the queue.
        self.ingest = None;
        let Some(mut segments) = self.segments.take() else {
            return true;
        };
        loop {
            let segment = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                segment = segments.next() => match segment {
                    Some(segment) => Some(segment),
                    None => return true,
                },
            };
            let delivered = match segment {
                Some(segment) => self.on_segment(segment).await,
                None => false,
            };
            if !delivered {
                self.segments = Some(segments);
                return false;
            }
        }
    }

    /// Close the ingestion queue and wait for the recognition to end,
    /// discarding its segments. Worker-backed recognizers join their
    /// threads before their stream ends, so nothing outlives the stage.
    async fn close_recognition(&mut self) {
        self.ingest = None;
        let Some(mut segments) = self.segments.take() else {
            return;
        };
        let mut discarded = 0usize;
        while segments.next().await.is_some() {
            discarded += 1;
        }
        debug!(discarded, "recognition closed");
    }

    async fn on_silence(&mut self) -> bool {
        debug!("silence timeout, closing utterance");
        if !self.finish_recognition().await {
            return false;
        }
        if self.text_since_eou {
            self.text_since_eou = false;
            return self.emit(PipelineEvent::EndOfUtterance).await;
        }
        true
    }

    async fn on_segment(&mut self, segment: TranscriptSegment) -> bool {
        let segment = strip_marker(segment, &self.config.end_of_utterance_token);
        if !segment.text.is_empty() {
            let text = format!(
                "{}{}{}",
                self.config.prepend_prompt, segment.text, self.config.append_prompt
            )
            .trim()
            .to_owned();
            self.text_since_eou = true;
            let transcript = TranscriptSegment { text, ..segment };
            if !self.emit(PipelineEvent::Transcript(transcript)).await {
                return false;
            }
        }
        if segment.end_of_utterance {
            self.text_since_eou = false;
            return self.emit(PipelineEvent::EndOfUtterance).await;
        }
        true
    }

    async fn emit(&mut self, event: PipelineEvent) -> bool {
        self.output.send(event).await.is_ok()
    }
}
