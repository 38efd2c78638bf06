//! LLM provider abstraction.
//!
//! One capability: given (system prompt, conversation, tool declarations),
//! return (assistant text, tool calls, finish reason). The concrete wire
//! binding lives in [`openai`].

pub mod openai;

use async_trait::async_trait;

use crate::error::LlmError;

/// A tool declared to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One message in the conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    /// Set on `role=tool` messages to key the result to its call.
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool calls.
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_call_id: None,
            tool_calls,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool call requested by the model. Arguments are the raw JSON string
/// from the wire.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One model turn.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
}

/// The chat-completion capability the tool-use loop drives.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatTurn, LlmError>;
}
