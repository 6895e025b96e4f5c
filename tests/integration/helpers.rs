//! Shared fakes and session builders for integration tests.
//!
//! The recognizer fake treats inbound audio bytes as UTF-8 text, so a test can
//! "speak" by sending `b"turn on the lights <EOU>"` as one chunk. All-zero
//! chunks are silence and recognize as nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parley::config::ProfileConfig;
use parley::llm::{ChatDelta, ChatStream, LlmBackend, MemoryRouter, Message, ToolDefinition};
use parley::pipeline::TranscriptSegment;
use parley::stt::{AudioStream, BlockingRecognizer, SegmentStream, SpeechBackend};
use parley::tools::ToolRegistry;
use parley::tts::{SpeechStream, TextStream, TtsBackend};
use parley::{AudioChunk, Backends, PipelineEvent, Session};
use tokio::sync::mpsc;

/// Decrements a live counter when dropped.
struct Live(Arc<AtomicUsize>);

impl Live {
    fn enter(live: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn decode(audio: &[u8]) -> Option<String> {
    if audio.iter().all(|b| *b == 0) {
        return None;
    }
    let text: Vec<u8> = audio.iter().copied().filter(|b| *b != 0).collect();
    String::from_utf8(text).ok()
}

// ─── Recognition ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct TextRecognizer {
    batches: Mutex<Vec<usize>>,
}

impl TextRecognizer {
    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechBackend for TextRecognizer {
    async fn stream_recognize(&self, audio: AudioStream) -> parley::Result<SegmentStream> {
        Ok(Box::pin(audio.filter_map(|chunk| async move {
            decode(&chunk).map(TranscriptSegment::final_text)
        })))
    }

    async fn recognize_batch(&self, audio: Bytes) -> parley::Result<Vec<TranscriptSegment>> {
        self.batches.lock().unwrap().push(audio.len());
        Ok(decode(&audio)
            .map(TranscriptSegment::final_text)
            .into_iter()
            .collect())
    }
}

/// Blocking recognizer that takes `delay` per chunk, for the worker adapter.
pub(crate) struct SlowTextRecognizer {
    delay: Duration,
    finished: Arc<AtomicBool>,
}

impl SlowTextRecognizer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once `recognize_stream` has returned.
    pub(crate) fn finished(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }
}

impl BlockingRecognizer for SlowTextRecognizer {
    fn recognize_stream(
        &self,
        audio: &mut dyn Iterator<Item = Bytes>,
        emit: &mut dyn FnMut(TranscriptSegment) -> bool,
    ) -> parley::Result<()> {
        for chunk in audio {
            std::thread::sleep(self.delay);
            if let Some(text) = decode(&chunk) {
                if !emit(TranscriptSegment::final_text(text)) {
                    break;
                }
            }
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn recognize_batch(&self, audio: &[u8]) -> parley::Result<Vec<TranscriptSegment>> {
        std::thread::sleep(self.delay);
        Ok(decode(audio)
            .map(TranscriptSegment::final_text)
            .into_iter()
            .collect())
    }
}

// ─── Language model ───────────────────────────────────────────────────────────

/// Replays one scripted round per chat call, pausing `delay` before each delta.
#[derive(Default)]
pub(crate) struct RoundsLlm {
    rounds: Mutex<VecDeque<Vec<ChatDelta>>>,
    delay: Duration,
    calls: Mutex<Vec<Vec<Message>>>,
    models: Mutex<Vec<String>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl RoundsLlm {
    pub(crate) fn new(rounds: Vec<Vec<ChatDelta>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            ..Self::default()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn text(tokens: &[&str]) -> Vec<ChatDelta> {
        tokens.iter().map(|t| ChatDelta::text(*t)).collect()
    }

    pub(crate) fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    /// Model named by each chat call, in order.
    pub(crate) fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }

    pub(crate) fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for RoundsLlm {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> parley::Result<ChatStream> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.models.lock().unwrap().push(model.to_owned());
        let deltas = self.rounds.lock().unwrap().pop_front().unwrap_or_default();
        let live = Live::enter(&self.live, &self.max_live);
        let delay = self.delay;
        Ok(Box::pin(async_stream::stream! {
            let _live = live;
            for delta in deltas {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(delta);
            }
        }))
    }
}

// ─── Synthesis ────────────────────────────────────────────────────────────────

/// Every text becomes `frames` audio chunks carrying the text, `delay` apart.
pub(crate) struct EchoTts {
    frames: usize,
    delay: Duration,
    once_calls: Mutex<Vec<String>>,
    cancels: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl EchoTts {
    pub(crate) fn new(frames: usize, delay: Duration) -> Self {
        Self {
            frames,
            delay,
            once_calls: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn once_calls(&self) -> Vec<String> {
        self.once_calls.lock().unwrap().clone()
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    fn frames(&self, text: String, live: Live) -> SpeechStream {
        let (frames, delay) = (self.frames, self.delay);
        Box::pin(async_stream::stream! {
            let _live = live;
            for _ in 0..frames {
                tokio::time::sleep(delay).await;
                yield Bytes::from(text.clone().into_bytes());
            }
        })
    }
}

#[async_trait]
impl TtsBackend for EchoTts {
    async fn synthesize_stream(&self, texts: TextStream) -> parley::Result<SpeechStream> {
        let live = Live::enter(&self.live, &self.max_live);
        let (frames, delay) = (self.frames, self.delay);
        Ok(Box::pin(async_stream::stream! {
            let _live = live;
            let mut texts = texts;
            while let Some(text) = texts.next().await {
                for _ in 0..frames {
                    tokio::time::sleep(delay).await;
                    yield Bytes::from(text.clone().into_bytes());
                }
            }
        }))
    }

    async fn synthesize_once(&self, text: &str) -> parley::Result<SpeechStream> {
        self.once_calls.lock().unwrap().push(text.to_owned());
        let live = Live::enter(&self.live, &self.max_live);
        Ok(self.frames(text.to_owned(), live))
    }

    async fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

/// A profile whose persona lives in `dir`, pinned to model "test-model".
pub(crate) fn profile(dir: &tempfile::TempDir) -> ProfileConfig {
    let persona = dir.path().join("persona.md");
    std::fs::write(&persona, "You are a concise voice assistant.").unwrap();
    let mut profile = ProfileConfig {
        name: "it".into(),
        ..ProfileConfig::default()
    };
    profile.llm.persona_path = persona;
    profile.llm.model_override = Some("test-model".into());
    profile
}

pub(crate) fn backends(
    speech: Arc<impl SpeechBackend + 'static>,
    llm: Arc<RoundsLlm>,
    tts: Arc<EchoTts>,
    tools: ToolRegistry,
) -> Backends {
    Backends {
        speech,
        llm,
        tts,
        tools: Arc::new(tools),
        router: Arc::new(MemoryRouter::with_probe(|| None)),
    }
}

pub(crate) fn start(profile: ProfileConfig, backends: Backends) -> (Session, mpsc::Receiver<PipelineEvent>) {
    let mut session = Session::new(profile, backends).unwrap();
    let events = session.start().unwrap();
    (session, events)
}

/// Speak `text` as one audio chunk.
pub(crate) async fn say(session: &Session, text: &str) {
    session
        .send_audio(AudioChunk::new(text.as_bytes().to_vec()))
        .await
        .unwrap();
}

pub(crate) async fn next(events: &mut mpsc::Receiver<PipelineEvent>) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Collect events up to and including the next `EndOfTurn`.
pub(crate) async fn until_end_of_turn(
    events: &mut mpsc::Receiver<PipelineEvent>,
) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next(events).await;
        let done = event == PipelineEvent::EndOfTurn;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub(crate) fn audio_count(events: &[PipelineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::AudioOut(_)))
        .count()
}

pub(crate) fn assistant_text(events: &[PipelineEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::AssistantToken(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}
