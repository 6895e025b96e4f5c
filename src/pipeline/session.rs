//! A live conversation: the pipeline stages wired together.
//!
//! ```text
//! transport ─▶ barge-in ─▶ stt ─▶ turn controller ─▶ synthesis ─▶ transport
//!                 ▲                                      │
//!                 └──────────── speech start/end ────────┘
//! ```
//!
//! [`Session::new`] validates configuration and loads the persona, so every
//! configuration error surfaces before a turn starts. The routing policy is
//! consulted again before each generation round.
//! [`Session::start`] spawns the stages; [`Session::stop`] cancels them and
//! returns the conversation history.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::barge_in::BargeInCoordinator;
use super::messages::{AudioChunk, ControlEvent, PipelineEvent};
use crate::agent::{TurnController, TurnSettings};
use crate::config::ProfileConfig;
use crate::error::{Result, SpeechError};
use crate::llm::{LlmBackend, Message, ModelRoute, RoutingPolicy, load_persona};
use crate::stt::{SpeechBackend, SttBridge};
use crate::tools::ToolRegistry;
use crate::tts::{SynthBridge, TtsBackend};

const AUDIO_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 128;

/// Backend capabilities a session runs against.
#[derive(Clone)]
pub struct Backends {
    /// Speech recognition.
    pub speech: Arc<dyn SpeechBackend>,
    /// Chat completion.
    pub llm: Arc<dyn LlmBackend>,
    /// Speech synthesis.
    pub tts: Arc<dyn TtsBackend>,
    /// Tools offered to the model.
    pub tools: Arc<ToolRegistry>,
    /// Model selection.
    pub router: Arc<dyn RoutingPolicy>,
}

struct Running {
    input: Option<mpsc::Sender<PipelineEvent>>,
    control: mpsc::UnboundedSender<ControlEvent>,
    activity: watch::Sender<Instant>,
    stages: Vec<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    turns: JoinHandle<Vec<Message>>,
}

/// One live conversation.
pub struct Session {
    profile: ProfileConfig,
    backends: Backends,
    model: String,
    system_prompt: String,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
    running: Option<Running>,
}

impl Session {
    /// Prepare a session for `profile`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the STT settings are invalid or the persona
    /// file cannot be read.
    pub fn new(profile: ProfileConfig, backends: Backends) -> Result<Self> {
        profile.stt.validate()?;
        let system_prompt = load_persona(&profile.llm.persona_path)?;
        let model = backends.router.select_model(&profile);
        info!(profile = %profile.name, model = %model, "session configured");
        Ok(Self {
            profile,
            backends,
            model,
            system_prompt,
            idle_timeout: None,
            cancel: CancellationToken::new(),
            running: None,
        })
    }

    /// Stop the session after `timeout` without inbound audio.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Model the router picked when the session was configured.
    ///
    /// Later turns may use a different model if the policy changes its mind.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the stages are running.
    pub fn is_running(&self) -> bool {
        self.running.is_some() && !self.cancel.is_cancelled()
    }

    /// Spawn the pipeline and return the outbound event stream.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if the session was already started or stopped.
    pub fn start(&mut self) -> Result<mpsc::Receiver<PipelineEvent>> {
        if self.running.is_some() || self.cancel.is_cancelled() {
            return Err(SpeechError::Pipeline("session already started".into()));
        }
        let stt = SttBridge::new(Arc::clone(&self.backends.speech), self.profile.stt.clone())?;

        let (input_tx, input_rx) = mpsc::channel(AUDIO_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (barge_tx, barge_rx) = mpsc::channel(AUDIO_CHANNEL_SIZE);
        let (stt_tx, stt_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (turn_tx, turn_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let coordinator = BargeInCoordinator::new(self.profile.barge_in.clone());
        let turns = TurnController::new(
            Arc::clone(&self.backends.llm),
            Arc::clone(&self.backends.tools),
            TurnSettings {
                route: ModelRoute::new(
                    Arc::clone(&self.backends.router),
                    self.profile.clone(),
                ),
                tool_call_limit: self.profile.llm.tool_call_limit,
                system_prompt: Some(self.system_prompt.clone()),
            },
            coordinator.listener(),
        );
        let synth = SynthBridge::new(
            Arc::clone(&self.backends.tts),
            self.profile.tts.clone(),
            coordinator.listener(),
            control_tx.clone(),
        );

        let cancel = &self.cancel;
        let stages = vec![
            tokio::spawn(coordinator.run(input_rx, control_rx, barge_tx, cancel.clone())),
            tokio::spawn(stt.run(barge_rx, stt_tx, cancel.clone())),
            tokio::spawn(synth.run(turn_rx, out_tx, cancel.clone())),
        ];
        let turns = tokio::spawn(turns.run(stt_rx, turn_tx, cancel.clone()));

        let (activity, activity_rx) = watch::channel(Instant::now());
        let watchdog = self
            .idle_timeout
            .map(|timeout| tokio::spawn(idle_watchdog(timeout, activity_rx, cancel.clone())));

        info!(profile = %self.profile.name, "session started");
        self.running = Some(Running {
            input: Some(input_tx),
            control: control_tx,
            activity,
            stages,
            watchdog,
            turns,
        });
        Ok(out_rx)
    }

    /// Feed one chunk of inbound audio.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the session is not running.
    pub async fn send_audio(&self, chunk: AudioChunk) -> Result<()> {
        let running = self.running()?;
        let input = running
            .input
            .as_ref()
            .ok_or_else(|| SpeechError::Channel("session input ended".into()))?;
        running.activity.send_replace(Instant::now());
        input
            .send(PipelineEvent::AudioIn(chunk))
            .await
            .map_err(|_| SpeechError::Channel("session input closed".into()))
    }

    /// Interrupt the assistant as if the user had barged in.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the session is not running.
    pub fn interrupt(&self) -> Result<()> {
        self.running()?
            .control
            .send(ControlEvent::Interrupt)
            .map_err(|_| SpeechError::Channel("session control closed".into()))
    }

    /// Signal that no more audio will arrive. Stages finish the current
    /// turn, then the outbound stream ends.
    pub fn end_input(&mut self) {
        if let Some(running) = self.running.as_mut() {
            running.input = None;
        }
    }

    /// Cancel every stage, wait for them and return the conversation history.
    pub async fn stop(&mut self) -> Vec<Message> {
        self.cancel.cancel();
        let Some(running) = self.running.take() else {
            return Vec::new();
        };
        join_stages(running.stages, running.watchdog).await;
        let history = running.turns.await.unwrap_or_else(|e| {
            warn!(error = %e, "turn controller failed");
            Vec::new()
        });
        info!(messages = history.len(), "session stopped");
        history
    }

    /// End input, let the stages drain the current turn, then return the
    /// conversation history.
    pub async fn join(&mut self) -> Vec<Message> {
        let Some(mut running) = self.running.take() else {
            return Vec::new();
        };
        running.input = None;
        let history = running.turns.await.unwrap_or_else(|e| {
            warn!(error = %e, "turn controller failed");
            Vec::new()
        });
        drop(running.control);
        drop(running.activity);
        join_stages(running.stages, running.watchdog).await;
        self.cancel.cancel();
        history
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .filter(|_| !self.cancel.is_cancelled())
            .ok_or_else(|| SpeechError::Channel("session is not running".into()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn join_stages(stages: Vec<JoinHandle<()>>, watchdog: Option<JoinHandle<()>>) {
    for stage in stages.into_iter().chain(watchdog) {
        if let Err(e) = stage.await {
            warn!(error = %e, "stage task failed");
        }
    }
}

/// Cancel the session once no audio has arrived for `timeout`.
async fn idle_watchdog(
    timeout: Duration,
    mut activity: watch::Receiver<Instant>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = *activity.borrow_and_update() + timeout;
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {
                info!(timeout_secs = timeout.as_secs(), "session idle; stopping");
                cancel.cancel();
                return;
            }
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
