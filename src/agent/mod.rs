//! Turn controller: accumulates user utterances and runs one model turn at a time.
//!
//! The controller is a pipeline stage. It consumes transcript and
//! end-of-utterance events, forwards them (and everything else) downstream,
//! and spawns a [`ToolLoop`] task per user turn. The conversation history is
//! owned here; a turn's messages are appended only after its task has been
//! joined, so the history never sees half of a cancelled round.
//!
//! Utterances that complete while a turn is still generating are queued and
//! started in order once the current turn ends.

pub mod loop_engine;

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{LlmBackend, Message, ModelRoute};
use crate::pipeline::interrupt::InterruptListener;
use crate::pipeline::messages::PipelineEvent;
use crate::tools::ToolRegistry;

pub use loop_engine::{DEPTH_LIMIT_NOTICE, StopReason, ToolLoop, TurnOutcome};

/// Settings for a [`TurnController`].
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Picks the model for each generation round.
    pub route: ModelRoute,
    /// Maximum chained tool-call rounds per user turn.
    pub tool_call_limit: u32,
    /// Persona text placed first in the history.
    pub system_prompt: Option<String>,
}

struct ActiveTurn {
    handle: JoinHandle<TurnOutcome>,
    cancel: CancellationToken,
}

/// Pipeline stage owning the conversation history.
pub struct TurnController {
    engine: Arc<ToolLoop>,
    history: Vec<Message>,
    utterance: String,
    queued: VecDeque<String>,
    listener: InterruptListener,
    /// Highest interrupt epoch already forwarded downstream.
    forwarded_epoch: u64,
}

impl TurnController {
    /// Create a controller. `listener` reports barge-in interruptions.
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        tools: Arc<ToolRegistry>,
        settings: TurnSettings,
        listener: InterruptListener,
    ) -> Self {
        let history = settings
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .map(Message::system)
            .into_iter()
            .collect();
        let forwarded_epoch = listener.epoch();
        Self {
            engine: Arc::new(ToolLoop::new(
                llm,
                tools,
                settings.route,
                settings.tool_call_limit,
            )),
            history,
            utterance: String::new(),
            queued: VecDeque::new(),
            listener,
            forwarded_epoch,
        }
    }

    /// Conversation history committed so far.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Run until `input` closes or `cancel` fires; returns the final history.
    ///
    /// When `input` closes, a turn in progress (and any queued utterance) is
    /// allowed to finish first.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<PipelineEvent>,
        output: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Vec<Message> {
        info!(history = self.history.len(), "turn controller started");
        let mut active: Option<ActiveTurn> = None;
        let mut input_open = true;

        loop {
            if !input_open && active.is_none() {
                break;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                epoch = self.listener.interrupted() => {
                    debug!(epoch, "interrupt observed");
                    self.cancel_active(&mut active).await;
                }
                outcome = join(&mut active) => {
                    active = None;
                    self.commit(outcome);
                    self.start_next(&mut active, &output, &cancel);
                }
                event = input.recv(), if input_open => match event {
                    Some(event) => {
                        if !self.on_event(event, &mut active, &output, &cancel).await {
                            break;
                        }
                    }
                    None => {
                        debug!("input closed");
                        input_open = false;
                    }
                },
            }
        }

        self.cancel_active(&mut active).await;
        info!(messages = self.history.len(), "turn controller stopped");
        self.history
    }

    async fn on_event(
        &mut self,
        event: PipelineEvent,
        active: &mut Option<ActiveTurn>,
        output: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        match event {
            PipelineEvent::Transcript(segment) => {
                if segment.is_final && !segment.text.trim().is_empty() {
                    if !self.utterance.is_empty() {
                        self.utterance.push(' ');
                    }
                    self.utterance.push_str(segment.text.trim());
                }
                output.send(PipelineEvent::Transcript(segment)).await.is_ok()
            }
            PipelineEvent::EndOfUtterance => {
                let text = std::mem::take(&mut self.utterance);
                if output.send(PipelineEvent::EndOfUtterance).await.is_err() {
                    return false;
                }
                if !text.is_empty() {
                    self.queued.push_back(text);
                    self.start_next(active, output, cancel);
                }
                true
            }
            PipelineEvent::Interruption { epoch } => {
                self.cancel_active(active).await;
                self.forwarded_epoch = self.forwarded_epoch.max(epoch);
                if output.send(PipelineEvent::Interruption { epoch }).await.is_err() {
                    return false;
                }
                self.start_next(active, output, cancel);
                true
            }
            other => output.send(other).await.is_ok(),
        }
    }

    /// Start the oldest queued utterance if nothing is generating and every
    /// raised interruption has already been forwarded downstream.
    fn start_next(
        &mut self,
        active: &mut Option<ActiveTurn>,
        output: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) {
        if active.is_some() || self.listener.epoch() > self.forwarded_epoch {
            return;
        }
        let Some(text) = self.queued.pop_front() else {
            return;
        };
        info!(chars = text.len(), queued = self.queued.len(), "starting turn");
        self.history.push(Message::user(text));

        let token = cancel.child_token();
        let engine = Arc::clone(&self.engine);
        let context = self.history.clone();
        let output = output.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move { engine.run(context, &output, &task_token).await });
        *active = Some(ActiveTurn {
            handle,
            cancel: token,
        });
    }

    async fn cancel_active(&mut self, active: &mut Option<ActiveTurn>) {
        let Some(mut turn) = active.take() else {
            return;
        };
        turn.cancel.cancel();
        let outcome = joined(&mut turn.handle).await;
        debug!(stop = ?outcome.stop, "turn cancelled");
        self.commit(outcome);
    }

    fn commit(&mut self, outcome: TurnOutcome) {
        debug!(
            stop = ?outcome.stop,
            depth = outcome.depth,
            messages = outcome.messages.len(),
            "committing turn"
        );
        self.history.extend(outcome.messages);
    }
}

/// Resolves when the active turn finishes; pending when there is none.
async fn join(active: &mut Option<ActiveTurn>) -> TurnOutcome {
    match active {
        Some(turn) => joined(&mut turn.handle).await,
        None => pending().await,
    }
}

async fn joined(handle: &mut JoinHandle<TurnOutcome>) -> TurnOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "turn task failed");
            TurnOutcome {
                messages: Vec::new(),
                stop: StopReason::Failed,
                depth: 0,
            }
        }
    }
}
