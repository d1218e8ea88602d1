pub mod openai;
pub mod prompts;
pub mod tools;

use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    Assistant { text: String, tool_calls: Vec<ToolCall> },
    Tool { call_id: String, name: String, content: String },
}

/// Progress of one agent run, mapped from the vendor's event vocabulary at the
/// runtime boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    ToolStarted { name: String, input: String },
    ToolFinished { name: String, output: String },
    ContentDelta(String),
    TurnFinished(AgentMessage),
    Unknown(String),
}

pub type AgentEventStream = Pin<Box<dyn Stream<Item = AppResult<AgentEvent>> + Send>>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn validate(&self, request: &AgentRequest) -> AppResult<()> {
        if request.message.trim().is_empty() {
            return Err(AppError::InvalidRequest("Message cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Runs the agent to completion and returns every message it produced.
    async fn run(&self, request: &AgentRequest) -> AppResult<Vec<AgentMessage>>;

    /// Runs the agent and reports progress as it happens. Dropping the stream
    /// stops the run.
    fn stream(&self, request: AgentRequest) -> AgentEventStream;
}
