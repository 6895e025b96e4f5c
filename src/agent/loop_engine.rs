//! Bounded model/tool-call loop for one user turn.
//!
//! [`ToolLoop::run`] streams a completion, forwards tokens as they arrive,
//! executes any requested tool calls through the registry and continues
//! until the model answers without tool calls, the depth limit is hit, the
//! backend fails, or the turn is cancelled.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{LlmBackend, Message, ModelRoute, ToolCall, ToolDefinition};
use crate::pipeline::messages::PipelineEvent;
use crate::tools::ToolRegistry;

/// Spoken when the model asks for more tool rounds than allowed.
pub const DEPTH_LIMIT_NOTICE: &str = "I'm unable to complete further tool calls right now.";

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without further tool calls.
    Completed,
    /// The model requested tool calls past the configured depth.
    DepthLimit,
    /// The backend failed to start or broke mid-stream.
    Failed,
    /// The turn was interrupted or the pipeline shut down.
    Cancelled,
}

/// Result of one turn: the messages to append to the conversation.
///
/// Only whole rounds are included. A round cut short by cancellation or a
/// backend failure contributes nothing.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Messages produced by completed rounds, in order.
    pub messages: Vec<Message>,
    /// Why the loop stopped.
    pub stop: StopReason,
    /// Tool rounds executed.
    pub depth: u32,
}

impl TurnOutcome {
    fn new(messages: Vec<Message>, stop: StopReason, depth: u32) -> Self {
        Self {
            messages,
            stop,
            depth,
        }
    }
}

/// Text and tool calls collected from one streamed completion.
#[derive(Debug, Default)]
struct RoundAccumulator {
    text: String,
    tool_calls: Vec<ToolCall>,
}

/// Drives the model/tool-call loop.
pub struct ToolLoop {
    llm: Arc<dyn LlmBackend>,
    tools: Arc<ToolRegistry>,
    route: ModelRoute,
    tool_call_limit: u32,
}

impl ToolLoop {
    /// Create a loop with at most `tool_call_limit` tool rounds per turn.
    ///
    /// `route` picks the model again for every generation round.
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        tools: Arc<ToolRegistry>,
        route: ModelRoute,
        tool_call_limit: u32,
    ) -> Self {
        Self {
            llm,
            tools,
            route,
            tool_call_limit,
        }
    }

    /// Run one turn over `context`, the full conversation so far.
    ///
    /// Tokens, tool calls and the closing [`PipelineEvent::EndOfTurn`] are
    /// sent on `output`. Nothing further is sent once `cancel` fires; a
    /// closed `output` is treated the same way.
    pub async fn run(
        &self,
        mut context: Vec<Message>,
        output: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let tools = self.tools.schemas();
        let mut committed = Vec::new();
        let mut depth = 0u32;

        loop {
            let round = match self.stream_round(&context, &tools, output, cancel).await {
                Ok(round) => round,
                Err(StopReason::Cancelled) => {
                    return TurnOutcome::new(committed, StopReason::Cancelled, depth);
                }
                Err(stop) => return self.finish(committed, stop, depth, output, cancel).await,
            };
            let text = round.text.trim().to_owned();

            if round.tool_calls.is_empty() {
                if !text.is_empty() {
                    committed.push(Message::assistant(text));
                }
                return self
                    .finish(committed, StopReason::Completed, depth, output, cancel)
                    .await;
            }

            let request = Message::assistant_with_tool_calls(text, round.tool_calls.clone());
            if depth >= self.tool_call_limit {
                info!(
                    depth,
                    limit = self.tool_call_limit,
                    calls = round.tool_calls.len(),
                    "tool-call depth limit reached"
                );
                committed.push(request);
                let notice = PipelineEvent::AssistantToken(DEPTH_LIMIT_NOTICE.to_owned());
                if !emit(output, cancel, notice).await {
                    return TurnOutcome::new(committed, StopReason::Cancelled, depth);
                }
                return self
                    .finish(committed, StopReason::DepthLimit, depth, output, cancel)
                    .await;
            }

            let mut round_messages = vec![request];
            for call in &round.tool_calls {
                debug!(tool = %call.name, id = %call.id, depth, "invoking tool");
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return TurnOutcome::new(committed, StopReason::Cancelled, depth);
                    }
                    result = self.tools.invoke(&call.name, call.argument_map()) => result,
                };
                round_messages.push(Message::tool_result(&call.id, &call.name, result));
            }
            context.extend(round_messages.iter().cloned());
            committed.extend(round_messages);
            depth += 1;
        }
    }

    async fn stream_round(
        &self,
        context: &[Message],
        tools: &[ToolDefinition],
        output: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> Result<RoundAccumulator, StopReason> {
        let model = self.route.select();
        debug!(model = %model, "generation round");
        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StopReason::Cancelled),
            started = self.llm.stream_chat(&model, context, tools) => started,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                warn!(model = %model, error = %e, "chat request failed");
                return Err(StopReason::Failed);
            }
        };

        let mut round = RoundAccumulator::default();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StopReason::Cancelled),
                next = stream.next() => next,
            };
            let delta = match next {
                None => break,
                Some(Ok(delta)) => delta,
                Some(Err(e)) => {
                    warn!(model = %model, error = %e, "chat stream failed");
                    return Err(StopReason::Failed);
                }
            };
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                round.text.push_str(&text);
                if !emit(output, cancel, PipelineEvent::AssistantToken(text)).await {
                    return Err(StopReason::Cancelled);
                }
            }
            for call in delta.tool_calls {
                debug!(tool = %call.name, id = %call.id, "model requested tool");
                if !emit(output, cancel, PipelineEvent::ToolCall(call.clone())).await {
                    return Err(StopReason::Cancelled);
                }
                round.tool_calls.push(call);
            }
        }
        Ok(round)
    }

    async fn finish(
        &self,
        committed: Vec<Message>,
        stop: StopReason,
        depth: u32,
        output: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        if !emit(output, cancel, PipelineEvent::EndOfTurn).await {
            return TurnOutcome::new(committed, StopReason::Cancelled, depth);
        }
        debug!(?stop, depth, messages = committed.len(), "turn finished");
        TurnOutcome::new(committed, stop, depth)
    }
}

/// Send `event` unless `cancel` fires first. `false` means stop.
async fn emit(
    output: &mpsc::Sender<PipelineEvent>,
    cancel: &CancellationToken,
    event: PipelineEvent,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = output.send(event) => sent.is_ok(),
    }
}
