use super::tools::ToolBox;
use super::{AgentEvent, AgentEventStream, AgentMessage, AgentRequest, AgentRuntime, ToolCall};
use crate::errors::{AppError, AppResult};
use crate::harness::line_buffer::{LineBuffer, SseLine};
use crate::settings::LlmSettings;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const MAX_SSE_BUFFER_BYTES: usize = 2_000_000;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const MAX_ERROR_BODY_CHARS: usize = 500;
const MAX_TOOL_CALLS_PER_REPLY: usize = 64;

type EventSender = mpsc::Sender<AppResult<AgentEvent>>;

/// Tool-calling agent over an OpenAI-compatible `/chat/completions` endpoint.
///
/// Each step sends the whole conversation, executes any requested tool calls and
/// feeds their output back. The run ends on the first reply without tool calls
/// or fails once `max_steps` replies have been spent.
#[derive(Clone)]
pub struct ChatCompletionsRuntime {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_steps: usize,
    tools: ToolBox,
}

impl ChatCompletionsRuntime {
    pub fn new(settings: &LlmSettings, api_key: &str, tools: ToolBox) -> AppResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|error| AppError::Config(format!("failed to build HTTP client: {}", error)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_steps: settings.max_steps.max(1),
            tools,
        })
    }

    fn payload(&self, conversation: &[Value], stream: bool) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": conversation,
            "tools": ToolBox::definitions(),
            "stream": stream,
        })
    }

    async fn post(&self, payload: &Value) -> AppResult<reqwest::Response> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(AppError::Upstream(format!(
                "chat completion returned {}: {}",
                status, body
            )));
        }
        Ok(response)
    }

    async fn complete(&self, conversation: &[Value]) -> AppResult<Reply> {
        let response: Value = self.post(&self.payload(conversation, false)).await?.json().await?;
        let message = response
            .pointer("/choices/0/message")
            .ok_or_else(|| AppError::Upstream("chat completion returned no choices".to_string()))?;
        Ok(Reply::from_message(message))
    }

    /// `None` means the consumer went away mid-reply.
    async fn complete_streaming(
        &self,
        conversation: &[Value],
        events: &EventSender,
    ) -> AppResult<Option<Reply>> {
        let response = self.post(&self.payload(conversation, true)).await?;
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new(Some(MAX_SSE_BUFFER_BYTES));
        let mut reply = StreamedReply::default();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if line == SseLine::Done {
                    break 'read;
                }
                if let Some(event) = reply.apply(&line) {
                    if events.send(Ok(event)).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
        if let Some(event) = lines.flush().and_then(|line| reply.apply(&line)) {
            if events.send(Ok(event)).await.is_err() {
                return Ok(None);
            }
        }

        let overflowed = lines.consume_overflowed_bytes();
        if overflowed > 0 {
            tracing::warn!(overflowed, "dropped oversized chat completion stream line");
        }
        Ok(Some(reply.finish()))
    }

    async fn react_loop(
        &self,
        request: &AgentRequest,
        events: Option<&EventSender>,
    ) -> AppResult<Vec<AgentMessage>> {
        let mut conversation = vec![
            json!({ "role": "system", "content": request.system_prompt }),
            json!({ "role": "user", "content": request.message }),
        ];
        let mut transcript = Vec::new();

        for step in 0..self.max_steps {
            let reply = match events {
                Some(events) => match self.complete_streaming(&conversation, events).await? {
                    Some(reply) => reply,
                    None => return Ok(transcript),
                },
                None => self.complete(&conversation).await?,
            };
            tracing::debug!(step, tool_calls = reply.tool_calls.len(), "agent step completed");

            conversation.push(reply.as_conversation_entry());
            let Reply { text, tool_calls } = reply;
            let message = AgentMessage::Assistant {
                text,
                tool_calls: tool_calls.clone(),
            };
            transcript.push(message.clone());
            if !emit(events, AgentEvent::TurnFinished(message)).await {
                return Ok(transcript);
            }
            if tool_calls.is_empty() {
                return Ok(transcript);
            }

            for call in tool_calls {
                let started = AgentEvent::ToolStarted {
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                };
                if !emit(events, started).await {
                    return Ok(transcript);
                }

                let output = self.tools.call(&call.name, &call.arguments).await;
                let finished = AgentEvent::ToolFinished {
                    name: call.name.clone(),
                    output: output.clone(),
                };
                conversation.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": output,
                }));
                transcript.push(AgentMessage::Tool {
                    call_id: call.id,
                    name: call.name,
                    content: output,
                });
                if !emit(events, finished).await {
                    return Ok(transcript);
                }
            }
        }

        Err(AppError::Upstream(format!(
            "agent did not finish within {} steps",
            self.max_steps
        )))
    }
}

#[async_trait]
impl AgentRuntime for ChatCompletionsRuntime {
    async fn run(&self, request: &AgentRequest) -> AppResult<Vec<AgentMessage>> {
        self.validate(request)?;
        self.react_loop(request, None).await
    }

    fn stream(&self, request: AgentRequest) -> AgentEventStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let runtime = self.clone();
        tokio::spawn(async move {
            let outcome = match runtime.validate(&request) {
                Ok(()) => runtime.react_loop(&request, Some(&tx)).await.map(|_| ()),
                Err(error) => Err(error),
            };
            if let Err(error) = outcome {
                let _ = tx.send(Err(error)).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

/// `false` once the consumer has hung up; always `true` without a consumer.
async fn emit(events: Option<&EventSender>, event: AgentEvent) -> bool {
    match events {
        Some(events) => events.send(Ok(event)).await.is_ok(),
        None => true,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Reply {
    text: String,
    tool_calls: Vec<ToolCall>,
}

impl Reply {
    fn from_message(message: &Value) -> Self {
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .enumerate()
                    .map(|(index, call)| ToolCall {
                        id: call
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{}", index)),
                        name: call
                            .pointer("/function/name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: call
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            text: content_text(message.get("content")),
            tool_calls,
        }
    }

    fn as_conversation_entry(&self) -> Value {
        let content = if self.text.is_empty() {
            Value::Null
        } else {
            Value::String(self.text.clone())
        };
        let mut entry = json!({ "role": "assistant", "content": content });
        if !self.tool_calls.is_empty() {
            entry["tool_calls"] = self
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments },
                    })
                })
                .collect();
        }
        entry
    }
}

/// Message content may be a plain string or a list of typed parts.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match part {
                Value::String(text) => text.clone(),
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[derive(Debug, Default)]
struct StreamedReply {
    text: String,
    tool_calls: Vec<ToolCall>,
}

impl StreamedReply {
    /// Folds one SSE payload into the reply, returning the event to forward.
    fn apply(&mut self, line: &SseLine) -> Option<AgentEvent> {
        let SseLine::Data(raw) = line else {
            return None;
        };
        let Ok(chunk) = serde_json::from_str::<Value>(raw) else {
            return Some(AgentEvent::Unknown(raw.clone()));
        };
        let Some(delta) = chunk.pointer("/choices/0/delta") else {
            return Some(AgentEvent::Unknown(raw.clone()));
        };

        let mut rejected = false;
        if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, fragment) in fragments.iter().enumerate() {
                let index = match fragment.get("index") {
                    None => Some(position),
                    Some(index) => index.as_u64().and_then(|index| usize::try_from(index).ok()),
                };
                // Calls arrive in order; an index may only extend the list by one.
                let Some(index) = index
                    .filter(|index| *index <= self.tool_calls.len() && *index < MAX_TOOL_CALLS_PER_REPLY)
                else {
                    tracing::warn!(known = self.tool_calls.len(), "ignoring out-of-order tool call fragment");
                    rejected = true;
                    continue;
                };
                if self.tool_calls.len() == index {
                    self.tool_calls.push(ToolCall {
                        id: format!("call_{}", self.tool_calls.len()),
                        name: String::new(),
                        arguments: String::new(),
                    });
                }
                let call = &mut self.tool_calls[index];
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    call.id = id.to_string();
                }
                if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                    call.name.push_str(name);
                }
                if let Some(arguments) = fragment.pointer("/function/arguments").and_then(Value::as_str) {
                    call.arguments.push_str(arguments);
                }
            }
        }

        let content = content_text(delta.get("content"));
        if content.is_empty() {
            return rejected.then(|| AgentEvent::Unknown(raw.clone()));
        }
        self.text.push_str(&content);
        Some(AgentEvent::ContentDelta(content))
    }

    fn finish(self) -> Reply {
        Reply {
            text: self.text,
            tool_calls: self
                .tool_calls
                .into_iter()
                .filter(|call| !call.name.is_empty())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{content_text, Reply, StreamedReply};
    use crate::adapters::{AgentEvent, ToolCall};
    use crate::harness::line_buffer::SseLine;
    use serde_json::json;

    fn data(value: serde_json::Value) -> SseLine {
        SseLine::Data(value.to_string())
    }

    #[test]
    fn reads_final_message_with_tool_calls() {
        let reply = Reply::from_message(&json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_a",
                "type": "function",
                "function": {"name": "run_query", "arguments": "{\"sql\":\"SELECT 1\"}"}
            }]
        }));
        assert_eq!(reply.text, "");
        assert_eq!(
            reply.tool_calls,
            vec![ToolCall {
                id: "call_a".to_string(),
                name: "run_query".to_string(),
                arguments: "{\"sql\":\"SELECT 1\"}".to_string(),
            }]
        );

        let entry = reply.as_conversation_entry();
        assert_eq!(entry["content"], json!(null));
        assert_eq!(entry["tool_calls"][0]["function"]["name"], json!("run_query"));
    }

    #[test]
    fn content_parts_are_joined() {
        assert_eq!(
            content_text(Some(&json!(["a", {"type": "text", "text": "b"}]))),
            "a\nb"
        );
        assert_eq!(content_text(None), "");
    }

    #[test]
    fn streamed_deltas_accumulate_text_and_tool_calls() {
        let mut reply = StreamedReply::default();
        assert_eq!(
            reply.apply(&data(json!({"choices": [{"delta": {"content": "Hel"}}]}))),
            Some(AgentEvent::ContentDelta("Hel".to_string()))
        );
        assert_eq!(
            reply.apply(&data(json!({"choices": [{"delta": {"content": "lo"}}]}))),
            Some(AgentEvent::ContentDelta("lo".to_string()))
        );
        assert_eq!(
            reply.apply(&data(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "run_query", "arguments": "{\"sql\":"}}
            ]}}]}))),
            None
        );
        reply.apply(&data(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"SELECT 1\"}"}}
        ]}}]})));
        assert!(matches!(
            reply.apply(&SseLine::Data("not json".to_string())),
            Some(AgentEvent::Unknown(_))
        ));
        assert!(matches!(
            reply.apply(&data(json!({"usage": {"total_tokens": 3}}))),
            Some(AgentEvent::Unknown(_))
        ));

        let finished = reply.finish();
        assert_eq!(finished.text, "Hello");
        assert_eq!(finished.tool_calls.len(), 1);
        assert_eq!(finished.tool_calls[0].id, "call_1");
        assert_eq!(finished.tool_calls[0].arguments, "{\"sql\":\"SELECT 1\"}");
    }

    #[test]
    fn tool_call_fragments_cannot_skip_ahead() {
        let mut reply = StreamedReply::default();
        assert!(matches!(
            reply.apply(&data(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 5_000_000, "function": {"name": "run_query"}}
            ]}}]}))),
            Some(AgentEvent::Unknown(_))
        ));
        assert!(reply.tool_calls.is_empty());

        reply.apply(&data(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_a", "function": {"name": "get_schema", "arguments": "{}"}}
        ]}}]})));
        assert!(matches!(
            reply.apply(&data(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 2, "function": {"name": "run_query"}}
            ]}}]}))),
            Some(AgentEvent::Unknown(_))
        ));
        assert_eq!(reply.tool_calls.len(), 1);

        for index in 1..100u64 {
            reply.apply(&data(json!({"choices": [{"delta": {"tool_calls": [
                {"index": index, "function": {"name": "get_schema"}}
            ]}}]})));
        }
        assert_eq!(reply.tool_calls.len(), 64);
    }
}
