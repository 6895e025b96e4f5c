//! Scripted in-memory backends shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::{Result, SpeechError};
use crate::llm::{ChatDelta, ChatStream, LlmBackend, Message, ToolDefinition};
use crate::pipeline::messages::{PipelineEvent, TranscriptSegment};
use crate::stt::{AudioStream, SegmentStream, SpeechBackend};
use crate::tts::{SpeechStream, TextStream, TtsBackend};

/// Receive the next event or fail the test after one second.
pub async fn next_event(rx: &mut mpsc::Receiver<PipelineEvent>) -> PipelineEvent {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

/// Assert nothing arrives within `wait`.
pub async fn assert_quiet(rx: &mut mpsc::Receiver<PipelineEvent>, wait: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

// ── Speech recognition ────────────────────────────────────────

/// Recognizer fake.
///
/// Streaming: each received chunk releases the next scripted segment.
/// Unreleased segments carry over to the next recognition stream.
/// Batch: answers one final segment whose text is the batch length.
#[derive(Default)]
pub struct ScriptedRecognizer {
    script: Arc<Mutex<VecDeque<TranscriptSegment>>>,
    batches: Mutex<Vec<usize>>,
    streamed: Arc<AtomicUsize>,
    stream_calls: AtomicUsize,
    fail_stream_start: Mutex<usize>,
}

impl ScriptedRecognizer {
    /// Batch-mode fake echoing batch lengths.
    pub fn echo_lengths() -> Self {
        Self::default()
    }

    /// Streaming fake releasing `segments` one per chunk.
    pub fn with_stream(segments: Vec<TranscriptSegment>) -> Self {
        Self {
            script: Arc::new(Mutex::new(segments.into())),
            ..Self::default()
        }
    }

    /// Fail the next `n` stream starts.
    pub fn fail_next_starts(self, n: usize) -> Self {
        *self.fail_stream_start.lock().unwrap() = n;
        self
    }

    /// Sizes of every batch recognized, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    /// Total bytes received by streaming recognition.
    pub fn streamed_bytes(&self) -> usize {
        self.streamed.load(Ordering::SeqCst)
    }

    /// Number of streaming recognitions started.
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechBackend for ScriptedRecognizer {
    async fn stream_recognize(&self, audio: AudioStream) -> Result<SegmentStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.fail_stream_start.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SpeechError::Stt("recognizer unavailable".into()));
            }
        }
        let script = Arc::clone(&self.script);
        let streamed = Arc::clone(&self.streamed);
        Ok(Box::pin(async_stream::stream! {
            let mut audio = audio;
            while let Some(chunk) = audio.next().await {
                streamed.fetch_add(chunk.len(), Ordering::SeqCst);
                let next = script.lock().unwrap().pop_front();
                if let Some(segment) = next {
                    yield segment;
                }
            }
        }))
    }

    async fn recognize_batch(&self, audio: Bytes) -> Result<Vec<TranscriptSegment>> {
        self.batches.lock().unwrap().push(audio.len());
        Ok(vec![TranscriptSegment::final_text(audio.len().to_string())])
    }
}

// ── Language model ────────────────────────────────────────────

/// One step of a scripted chat round.
#[derive(Debug, Clone)]
pub enum Step {
    /// Yield a delta.
    Delta(ChatDelta),
    /// Yield an error and end.
    Fail(String),
    /// Sleep before the next step.
    Pause(Duration),
    /// Never yield again.
    Hang,
}

/// Chat backend replaying scripted rounds, one per `stream_chat` call.
///
/// Once the script is exhausted every call yields an empty stream.
#[derive(Default)]
pub struct ScriptedLlm {
    rounds: Mutex<VecDeque<Vec<Step>>>,
    calls: Mutex<Vec<(String, Vec<Message>, usize)>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl ScriptedLlm {
    /// Fake replaying `rounds`.
    pub fn new(rounds: Vec<Vec<Step>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            ..Self::default()
        }
    }

    /// A round streaming `tokens` as text deltas.
    pub fn text_round(tokens: &[&str]) -> Vec<Step> {
        tokens
            .iter()
            .map(|t| Step::Delta(ChatDelta::text(*t)))
            .collect()
    }

    /// Message histories sent so far, one per call.
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().iter().map(|c| c.1.clone()).collect()
    }

    /// Models requested so far.
    pub fn models(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
    }

    /// Tool counts advertised per call.
    pub fn tool_counts(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(|c| c.2).collect()
    }

    /// Highest number of simultaneously open chat streams.
    pub fn max_live_streams(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

/// Decrements a live counter when dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(live: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_owned(), messages.to_vec(), tools.len()));
        let steps = self.rounds.lock().unwrap().pop_front().unwrap_or_default();
        let guard = LiveGuard::enter(&self.live, &self.max_live);
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for step in steps {
                match step {
                    Step::Delta(delta) => yield Ok(delta),
                    Step::Fail(msg) => {
                        yield Err(SpeechError::Llm(msg));
                        return;
                    }
                    Step::Pause(d) => tokio::time::sleep(d).await,
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        }))
    }
}

// ── Speech synthesis ──────────────────────────────────────────

/// Synthesizer fake: every text item becomes `frames` audio chunks holding
/// the text bytes, spaced `frame_delay` apart.
pub struct ScriptedTts {
    frames: usize,
    frame_delay: Duration,
    once_calls: Mutex<Vec<String>>,
    streamed: Arc<Mutex<Vec<Vec<String>>>>,
    cancels: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl Default for ScriptedTts {
    fn default() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl ScriptedTts {
    /// Fake emitting `frames` chunks per text, `frame_delay` apart.
    pub fn new(frames: usize, frame_delay: Duration) -> Self {
        Self {
            frames,
            frame_delay,
            once_calls: Mutex::new(Vec::new()),
            streamed: Arc::new(Mutex::new(Vec::new())),
            cancels: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Texts passed to one-shot synthesis, in order.
    pub fn once_calls(&self) -> Vec<String> {
        self.once_calls.lock().unwrap().clone()
    }

    /// Texts received per continuous stream, in order.
    pub fn streamed_texts(&self) -> Vec<Vec<String>> {
        self.streamed.lock().unwrap().clone()
    }

    /// Number of `cancel` calls.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Synthesis streams currently open.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open synthesis streams.
    pub fn max_live_streams(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TtsBackend for ScriptedTts {
    async fn synthesize_stream(&self, texts: TextStream) -> Result<SpeechStream> {
        let guard = LiveGuard::enter(&self.live, &self.max_live);
        let (frames, delay) = (self.frames, self.frame_delay);
        let log = Arc::clone(&self.streamed);
        let index = {
            let mut all = log.lock().unwrap();
            all.push(Vec::new());
            all.len() - 1
        };
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            let mut texts = texts;
            while let Some(text) = texts.next().await {
                log.lock().unwrap()[index].push(text.clone());
                for _ in 0..frames {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    yield Bytes::from(text.clone().into_bytes());
                }
            }
        }))
    }

    async fn synthesize_once(&self, text: &str) -> Result<SpeechStream> {
        self.once_calls.lock().unwrap().push(text.to_owned());
        let guard = LiveGuard::enter(&self.live, &self.max_live);
        let (frames, delay) = (self.frames, self.frame_delay);
        let text = text.to_owned();
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for _ in 0..frames {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Bytes::from(text.clone().into_bytes());
            }
        }))
    }

    async fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}
