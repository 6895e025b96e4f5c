//! Barge-in coordinator: the first stage of the pipeline.
//!
//! Tracks whether the assistant is speaking. While it is, the first inbound
//! audio chunk raises an interruption: the shared interrupt epoch is bumped
//! (so every stage cancels immediately) and an in-band
//! [`PipelineEvent::Interruption`] is emitted ahead of the audio. Speaking
//! state is cleared at once, so one burst of user audio yields exactly one
//! interruption. Audio itself is forwarded untouched.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::interrupt::{InterruptListener, InterruptSignal};
use super::messages::{ControlEvent, PipelineEvent};
use crate::config::BargeInConfig;

/// Pipeline stage owning the assistant-speaking flag and the interrupt signal.
#[derive(Debug)]
pub struct BargeInCoordinator {
    config: BargeInConfig,
    signal: InterruptSignal,
    speaking: bool,
    speech_started: Option<Instant>,
}

impl BargeInCoordinator {
    /// Create a coordinator; the assistant starts silent.
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            signal: InterruptSignal::new(),
            speaking: false,
            speech_started: None,
        }
    }

    /// A listener for interruptions raised by this coordinator.
    pub fn listener(&self) -> InterruptListener {
        self.signal.subscribe()
    }

    /// Whether the assistant is currently considered to be speaking.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Run until `input` closes, `output` closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<PipelineEvent>,
        mut control: mpsc::UnboundedReceiver<ControlEvent>,
        output: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        info!(enabled = self.config.enabled, "barge-in coordinator started");
        let mut control_open = true;
        loop {
            let alive = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = control.recv(), if control_open => match event {
                    Some(event) => self.on_control(event, &output).await,
                    None => {
                        control_open = false;
                        true
                    }
                },
                event = input.recv() => match event {
                    Some(event) => self.on_input(event, &output).await,
                    None => break,
                },
            };
            if !alive {
                break;
            }
        }
        info!(epoch = self.signal.epoch(), "barge-in coordinator stopped");
    }

    async fn on_control(&mut self, event: ControlEvent, output: &mpsc::Sender<PipelineEvent>) -> bool {
        match event {
            ControlEvent::AssistantSpeechStart { epoch } => {
                if epoch < self.signal.epoch() {
                    debug!(epoch, current = self.signal.epoch(), "ignoring stale speech start");
                } else {
                    self.speaking = true;
                    self.speech_started = Some(Instant::now());
                    debug!(epoch, "assistant speaking");
                }
                true
            }
            ControlEvent::AssistantSpeechEnd { interrupted } => {
                debug!(interrupted, "assistant stopped speaking");
                self.speaking = false;
                true
            }
            ControlEvent::Interrupt => self.interrupt(output).await,
            ControlEvent::Reset => {
                self.speaking = false;
                true
            }
        }
    }

    async fn on_input(&mut self, event: PipelineEvent, output: &mpsc::Sender<PipelineEvent>) -> bool {
        let barge_in = matches!(event, PipelineEvent::AudioIn(_))
            && self.speaking
            && self.config.enabled
            && !self.within_holdoff();
        if barge_in && !self.interrupt(output).await {
            return false;
        }
        output.send(event).await.is_ok()
    }

    async fn interrupt(&mut self, output: &mpsc::Sender<PipelineEvent>) -> bool {
        self.speaking = false;
        self.speech_started = None;
        let epoch = self.signal.raise();
        info!(epoch, "barge-in");
        output.send(PipelineEvent::Interruption { epoch }).await.is_ok()
    }

    fn within_holdoff(&self) -> bool {
        let Some(started) = self.speech_started else {
            return false;
        };
        let holdoff = Duration::from_millis(self.config.assistant_start_holdoff_ms);
        !holdoff.is_zero() && started.elapsed() < holdoff
    }
}
