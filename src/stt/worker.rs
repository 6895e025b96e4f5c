//! Adapter running a blocking recognizer on a dedicated worker thread.
//!
//! Audio is handed to the worker through a crossbeam queue and results come
//! back over a bounded tokio channel, so arrival order is preserved on both
//! sides. The worker polls its queue at a short bounded interval to notice
//! cancellation, and the returned segment stream joins the worker before it
//! ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AudioStream, SegmentStream, SpeechBackend};
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::TranscriptSegment;

/// How often the worker wakes to check for cancellation while idle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

const SEGMENT_QUEUE: usize = 64;

/// A recognizer whose calls block the calling thread (network or compute).
pub trait BlockingRecognizer: Send + Sync + 'static {
    /// Recognize audio pulled from `audio` until it is exhausted.
    ///
    /// `emit` delivers each segment in order and returns `false` once nobody
    /// is listening, at which point the recognizer should stop.
    ///
    /// # Errors
    ///
    /// Returns an error if recognition fails; segments emitted so far stand.
    fn recognize_stream(
        &self,
        audio: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(TranscriptSegment) -> bool,
    ) -> Result<()>;

    /// Recognize one batch of audio.
    ///
    /// # Errors
    ///
    /// Returns an error if recognition fails.
    fn recognize_batch(&self, audio: &[u8]) -> Result<Vec<TranscriptSegment>>;
}

/// Exposes a [`BlockingRecognizer`] as an async [`SpeechBackend`].
pub struct ThreadedRecognizer<R> {
    inner: Arc<R>,
}

impl<R: BlockingRecognizer> ThreadedRecognizer<R> {
    /// Wrap `recognizer`.
    pub fn new(recognizer: R) -> Self {
        Self {
            inner: Arc::new(recognizer),
        }
    }
}

/// Iterator over the worker's audio queue that ends when the sender closes
/// or the token is cancelled.
struct QueueIter {
    rx: Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Iterator for QueueIter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => return Some(chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[async_trait]
impl<R: BlockingRecognizer> SpeechBackend for ThreadedRecognizer<R> {
    async fn stream_recognize(&self, audio: AudioStream) -> Result<SegmentStream> {
        let (audio_tx, audio_rx) = crossbeam_channel::unbounded::<Bytes>();
        let (segment_tx, mut segment_rx) = mpsc::channel::<TranscriptSegment>(SEGMENT_QUEUE);
        let cancel = CancellationToken::new();

        let forward_cancel = cancel.clone();
        let forwarder = tokio::spawn(async move {
            let mut audio = audio;
            loop {
                tokio::select! {
                    () = forward_cancel.cancelled() => break,
                    chunk = audio.next() => match chunk {
                        Some(chunk) => {
                            if audio_tx.send(chunk).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Dropping the sender is the end-of-audio sentinel for the worker.
            drop(audio_tx);
        });

        let inner = Arc::clone(&self.inner);
        let mut queue = QueueIter {
            rx: audio_rx,
            cancel: cancel.clone(),
        };
        let worker = tokio::task::spawn_blocking(move || {
            let mut emit = |segment: TranscriptSegment| segment_tx.blocking_send(segment).is_ok();
            if let Err(e) = inner.recognize_stream(&mut queue, &mut emit) {
                warn!(error = %e, "recognition worker failed");
            }
            debug!("recognition worker finished");
        });

        let guard = cancel.drop_guard();
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            while let Some(segment) = segment_rx.recv().await {
                yield segment;
            }
            if let Err(e) = forwarder.await {
                warn!(error = %e, "audio forwarder task failed");
            }
            if let Err(e) = worker.await {
                warn!(error = %e, "recognition worker panicked");
            }
        }))
    }

    async fn recognize_batch(&self, audio: Bytes) -> Result<Vec<TranscriptSegment>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.recognize_batch(&audio))
            .await
            .map_err(|e| SpeechError::Stt(format!("recognition worker panicked: {e}")))?
    }
}
