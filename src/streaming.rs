use crate::adapters::tools::captured_rows;
use crate::adapters::{AgentEvent, AgentMessage};
use crate::errors::{AppError, AppResult};
use crate::models::{AgentTurnResult, QueryRequest, QueryResult, StepEvent, StreamEvent};
use crate::runner::{as_turn_failure, parse_turn_blocking, RunnerCore};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const REPLAY_CHUNK_CHARS: usize = 80;
const INPUT_PREVIEW_CHARS: usize = 200;
const OUTPUT_PREVIEW_CHARS: usize = 150;
const CODE_FENCE: &str = "```";

/// Maps agent progress onto client events and keeps what reconciliation needs.
///
/// Once the model starts writing its JSON payload (an opening brace or a code
/// fence), raw deltas stop being forwarded for the rest of the run.
#[derive(Debug, Default)]
pub struct StreamingAdapter {
    step: usize,
    streamed_content: bool,
    in_payload: bool,
    final_messages: Vec<AgentMessage>,
    tool_results: Vec<QueryResult>,
}

impl StreamingAdapter {
    pub fn on_event(&mut self, event: AgentEvent) -> Option<StreamEvent> {
        match event {
            AgentEvent::ToolStarted { name, input } => {
                self.step += 1;
                Some(StreamEvent::Step(StepEvent::ToolCall {
                    step: self.step,
                    tool: name,
                    input: preview(&input, INPUT_PREVIEW_CHARS),
                }))
            }
            AgentEvent::ToolFinished { name, output } => {
                if let Some(rows) = captured_rows(&name, &output) {
                    self.tool_results.push(rows);
                }
                Some(StreamEvent::Step(StepEvent::ToolResult {
                    step: self.step,
                    tool: name,
                    preview: preview(&output, OUTPUT_PREVIEW_CHARS),
                }))
            }
            AgentEvent::ContentDelta(delta) => self.on_delta(delta),
            AgentEvent::TurnFinished(message) => {
                self.final_messages.push(message);
                None
            }
            AgentEvent::Unknown(raw) => {
                tracing::debug!(chars = raw.chars().count(), "ignoring unrecognized agent event");
                None
            }
        }
    }

    fn on_delta(&mut self, delta: String) -> Option<StreamEvent> {
        if self.in_payload || delta.is_empty() {
            return None;
        }
        let marker = [delta.find('{'), delta.find(CODE_FENCE)]
            .into_iter()
            .flatten()
            .min();
        let visible = match marker {
            None => delta,
            Some(index) => {
                self.in_payload = true;
                delta[..index].to_string()
            }
        };
        if visible.is_empty() {
            return None;
        }
        self.streamed_content = true;
        Some(StreamEvent::Content { delta: visible })
    }

    pub fn streamed_content(&self) -> bool {
        self.streamed_content
    }

    pub async fn into_turn(self, prior_style: Option<&Map<String, Value>>) -> AppResult<AgentTurnResult> {
        if self.final_messages.is_empty() {
            return Err(AppError::Upstream("Agent returned no messages".to_string()));
        }
        parse_turn_blocking(self.final_messages, self.tool_results, prior_style.cloned()).await
    }
}

/// Splits a reply into fixed-size pieces for clients that never saw it stream.
pub fn replay_chunks(message: &str) -> Vec<String> {
    let chars: Vec<char> = message.chars().collect();
    chars
        .chunks(REPLAY_CHUNK_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

enum Flow {
    Finished,
    Disconnected,
}

/// Runs one incremental query, sending events into `sink`. `done` is always the
/// last event unless the consumer disconnected first, in which case nothing
/// more is sent.
pub async fn drive(runner: Arc<RunnerCore>, request: QueryRequest, sink: mpsc::Sender<StreamEvent>) {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    tracing::info!(request_id = %request_id, "processing streaming query");

    match stream_turn(&runner, &request, &sink, started).await {
        Ok(Flow::Finished) => {}
        Ok(Flow::Disconnected) => {
            tracing::info!(request_id = %request_id, "stream consumer disconnected");
            return;
        }
        Err(error) => {
            tracing::error!(request_id = %request_id, error = %error, "agent stream failed");
            let detail = error.detail();
            if sink.send(StreamEvent::Error { detail }).await.is_err() {
                return;
            }
        }
    }
    let _ = sink.send(StreamEvent::Done).await;
}

async fn stream_turn(
    runner: &RunnerCore,
    request: &QueryRequest,
    sink: &mpsc::Sender<StreamEvent>,
    started: Instant,
) -> AppResult<Flow> {
    let agent = runner.agent();
    let agent_request = runner.agent_request(request);
    agent.validate(&agent_request)?;
    let mut events = agent.stream(agent_request);
    let mut adapter = StreamingAdapter::default();

    loop {
        let next = tokio::select! {
            _ = sink.closed() => return Ok(Flow::Disconnected),
            next = events.next() => next,
        };
        let Some(event) = next else {
            break;
        };
        if let Some(outgoing) = adapter.on_event(event.map_err(as_turn_failure)?) {
            if sink.send(outgoing).await.is_err() {
                return Ok(Flow::Disconnected);
            }
        }
    }

    let streamed = adapter.streamed_content();
    let prior_style = request.current_chaos.as_ref();
    let turn = adapter.into_turn(prior_style).await?;
    let response = runner.respond(turn, prior_style, started).await;

    if !streamed {
        for delta in replay_chunks(&response.assistant_message) {
            if sink.send(StreamEvent::Content { delta }).await.is_err() {
                return Ok(Flow::Disconnected);
            }
        }
    }
    if sink.send(StreamEvent::Result(Box::new(response))).await.is_err() {
        return Ok(Flow::Disconnected);
    }
    Ok(Flow::Finished)
}
