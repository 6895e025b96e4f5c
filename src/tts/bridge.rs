//! Synthesis stage: turns assistant tokens into outbound audio.
//!
//! Continuous mode feeds every token into one live synthesis stream that is
//! opened on the first token of a turn and drained at end of turn. Burst
//! mode buffers tokens and flushes them as one-shot synthesis calls, one at
//! a time. Either way a single synthesis task is live at any instant.
//!
//! On interruption the buffer is discarded, the backend is told to cancel,
//! and the task is awaited before the stage moves on. Tokens and end-of-turn
//! events still in flight from the interrupted turn are dropped until the
//! in-band interruption event arrives.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SpeechStream, TextStream, TtsBackend};
use crate::config::{TtsConfig, TtsMode};
use crate::error::Result;
use crate::pipeline::interrupt::InterruptListener;
use crate::pipeline::messages::{ControlEvent, PipelineEvent};

const FLUSH_PUNCTUATION: [char; 3] = ['.', '!', '?'];

/// Whether a burst buffer holding `text` should be flushed now.
pub fn should_flush(text: &str, config: &TtsConfig) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    if config.flush_on_punctuation && text.contains(FLUSH_PUNCTUATION) {
        return true;
    }
    config.flush_char_threshold > 0 && text.chars().count() >= config.flush_char_threshold
}

/// Text-to-speech pipeline stage.
pub struct SynthBridge {
    backend: Arc<dyn TtsBackend>,
    config: TtsConfig,
    listener: InterruptListener,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl SynthBridge {
    /// Create the stage. Speech start/stop is reported on `control`.
    pub fn new(
        backend: Arc<dyn TtsBackend>,
        config: TtsConfig,
        listener: InterruptListener,
        control: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            backend,
            config,
            listener,
            control,
        }
    }

    /// Run until `input` closes, `output` closes or `cancel` fires.
    ///
    /// When `input` closes, buffered text is flushed and in-flight audio
    /// drained before returning.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<PipelineEvent>,
        output: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        info!(mode = ?self.config.mode, "synthesis bridge started");
        let acked_epoch = self.listener.epoch();
        let mut stage = Stage {
            backend: self.backend,
            config: self.config,
            listener: self.listener,
            control: self.control,
            output,
            cancel,
            buffer: String::new(),
            text_tx: None,
            task: None,
            spoke: false,
            acked_epoch,
        };

        loop {
            let alive = tokio::select! {
                biased;
                () = stage.cancel.cancelled() => break,
                epoch = stage.listener.interrupted() => {
                    debug!(epoch, "interrupt observed");
                    stage.abort().await;
                    true
                }
                event = input.recv() => match event {
                    Some(event) => stage.on_event(event).await,
                    None => {
                        stage.end_turn().await;
                        break;
                    }
                },
            };
            if !alive {
                break;
            }
        }

        stage.abort().await;
        info!("synthesis bridge stopped");
    }
}

/// A running synthesis whose audio is being forwarded.
struct Synthesis {
    /// Resolves to whether any audio was forwarded.
    handle: JoinHandle<bool>,
    cancel: CancellationToken,
}

enum Request {
    Stream(TextStream),
    Once(String),
}

struct Stage {
    backend: Arc<dyn TtsBackend>,
    config: TtsConfig,
    listener: InterruptListener,
    control: mpsc::UnboundedSender<ControlEvent>,
    output: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
    /// Burst-mode text awaiting a flush.
    buffer: String,
    /// Continuous-mode feed into the live synthesis stream.
    text_tx: Option<mpsc::UnboundedSender<String>>,
    task: Option<Synthesis>,
    /// Audio went out during the current turn.
    spoke: bool,
    /// Latest interrupt epoch whose in-band event has been seen.
    acked_epoch: u64,
}

impl Stage {
    /// Tokens raised before an interruption reached us in-band.
    fn is_stale(&self) -> bool {
        self.listener.epoch() > self.acked_epoch
    }

    async fn on_event(&mut self, event: PipelineEvent) -> bool {
        match event {
            PipelineEvent::AssistantToken(token) => {
                if self.is_stale() {
                    debug!("dropping token from interrupted turn");
                    return true;
                }
                // Synthesis may wait on the previous burst, and a barge-in
                // can land meanwhile.
                if !self.on_token(&token).await || self.is_stale() {
                    debug!("token overtaken by an interruption");
                    return true;
                }
                self.forward(PipelineEvent::AssistantToken(token)).await
            }
            PipelineEvent::EndOfTurn => {
                if self.is_stale() {
                    debug!("dropping end of interrupted turn");
                    return true;
                }
                if !self.end_turn().await {
                    debug!("turn interrupted while draining");
                    return true;
                }
                self.forward(PipelineEvent::EndOfTurn).await
            }
            PipelineEvent::ToolCall(call) => {
                if self.is_stale() {
                    return true;
                }
                self.forward(PipelineEvent::ToolCall(call)).await
            }
            PipelineEvent::Interruption { epoch } => {
                self.abort().await;
                self.acked_epoch = self.acked_epoch.max(epoch);
                self.forward(PipelineEvent::Interruption { epoch }).await
            }
            other => self.forward(other).await,
        }
    }

    /// Returns `false` if an interruption cut the token's synthesis short.
    async fn on_token(&mut self, token: &str) -> bool {
        match self.config.mode {
            TtsMode::Continuous => {
                if !token.is_empty() {
                    return self.feed(token.to_owned()).await;
                }
                true
            }
            TtsMode::Burst => {
                self.buffer.push_str(token);
                if should_flush(&self.buffer, &self.config) && !self.flush().await {
                    debug!("burst dropped, interrupted while the previous one drained");
                    return false;
                }
                true
            }
        }
    }

    /// Continuous mode: push text into the live stream, opening one if needed.
    /// Returns `false` if interrupted while the previous stream drained.
    async fn feed(&mut self, mut text: String) -> bool {
        if let Some(tx) = &self.text_tx {
            match tx.send(text) {
                Ok(()) => return true,
                Err(returned) => text = returned.0,
            }
        }
        // The previous stream ended on its own; collect it first.
        if !self.await_task().await {
            return false;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(text).is_err() {
            return true;
        }
        debug!("opening synthesis stream");
        self.text_tx = Some(tx);
        let texts: TextStream = Box::pin(UnboundedReceiverStream::new(rx));
        self.start(Request::Stream(texts));
        true
    }

    /// Burst mode: hand the buffered text to a one-shot synthesis.
    /// Returns `false` if interrupted while the previous burst drained.
    async fn flush(&mut self) -> bool {
        let text = self.buffer.trim().to_owned();
        self.buffer.clear();
        if text.is_empty() {
            return true;
        }
        if !self.await_task().await {
            return false;
        }
        debug!(chars = text.len(), "flushing burst");
        self.start(Request::Once(text));
        true
    }

    fn start(&mut self, request: Request) {
        let token = self.cancel.child_token();
        let sink = AudioSink {
            output: self.output.clone(),
            control: self.control.clone(),
            epoch: self.acked_epoch,
            cancel: token.clone(),
        };
        let backend = Arc::clone(&self.backend);
        let handle = tokio::spawn(async move {
            let opened = tokio::select! {
                biased;
                () = sink.cancel.cancelled() => return false,
                opened = open(backend.as_ref(), request) => opened,
            };
            match opened {
                Ok(speech) => sink.pump(speech).await,
                Err(e) => {
                    warn!(error = %e, "synthesis failed to start");
                    false
                }
            }
        });
        self.task = Some(Synthesis {
            handle,
            cancel: token,
        });
    }

    /// Wait for the running synthesis to finish.
    ///
    /// Returns `false` if an interruption arrived meanwhile; the synthesis
    /// has then been aborted.
    async fn await_task(&mut self) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        let finished = tokio::select! {
            biased;
            epoch = self.listener.interrupted() => {
                debug!(epoch, "interrupted while draining synthesis");
                None
            }
            spoke = &mut task.handle => Some(spoke),
        };
        match finished {
            Some(spoke) => {
                self.task = None;
                self.spoke |= joined(spoke);
                true
            }
            None => {
                self.abort().await;
                false
            }
        }
    }

    /// Finish the current turn's synthesis. Returns `false` if it was
    /// interrupted instead.
    async fn end_turn(&mut self) -> bool {
        match self.config.mode {
            TtsMode::Continuous => {
                // Closing the feed is the end-of-stream marker.
                self.text_tx = None;
            }
            TtsMode::Burst => {
                if !self.flush().await {
                    return false;
                }
            }
        }
        if !self.await_task().await {
            return false;
        }
        if std::mem::take(&mut self.spoke) {
            self.notify(ControlEvent::AssistantSpeechEnd { interrupted: false });
        }
        true
    }

    /// Drop pending text and stop any running synthesis.
    async fn abort(&mut self) {
        self.buffer.clear();
        self.text_tx = None;
        let mut spoke = std::mem::take(&mut self.spoke);
        if let Some(task) = self.task.take() {
            self.backend.cancel().await;
            task.cancel.cancel();
            spoke |= joined(task.handle.await);
            debug!("synthesis aborted");
        }
        if spoke {
            self.notify(ControlEvent::AssistantSpeechEnd { interrupted: true });
        }
    }

    fn notify(&self, event: ControlEvent) {
        if self.control.send(event).is_err() {
            debug!(?event, "control receiver gone");
        }
    }

    async fn forward(&self, event: PipelineEvent) -> bool {
        self.output.send(event).await.is_ok()
    }
}

async fn open(backend: &dyn TtsBackend, request: Request) -> Result<SpeechStream> {
    match request {
        Request::Stream(texts) => backend.synthesize_stream(texts).await,
        Request::Once(text) => backend.synthesize_once(&text).await,
    }
}

fn joined(result: std::result::Result<bool, tokio::task::JoinError>) -> bool {
    result.unwrap_or_else(|e| {
        warn!(error = %e, "synthesis task failed");
        false
    })
}

/// Where a synthesis task sends its audio.
struct AudioSink {
    output: mpsc::Sender<PipelineEvent>,
    control: mpsc::UnboundedSender<ControlEvent>,
    /// Interrupt epoch the synthesis was started under.
    epoch: u64,
    cancel: CancellationToken,
}

impl AudioSink {
    /// Forward audio until the stream ends or the task is cancelled.
    /// Returns whether any audio went out.
    async fn pump(&self, mut speech: SpeechStream) -> bool {
        let mut started = false;
        loop {
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                chunk = speech.next() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            if chunk.is_empty() {
                continue;
            }
            if !started {
                started = true;
                let event = ControlEvent::AssistantSpeechStart { epoch: self.epoch };
                if self.control.send(event).is_err() {
                    debug!("control receiver gone, speech start not reported");
                }
            }
            let sent = tokio::select! {
                biased;
                () = self.cancel.cancelled() => false,
                sent = self.output.send(PipelineEvent::AudioOut(chunk)) => sent.is_ok(),
            };
            if !sent {
                break;
            }
        }
        started
    }
}
