use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Api, Model};
use crate::now_ms;

/// Closed set of reasons an assistant turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolUse => "toolUse",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    /// Error and abort end a turn without a usable response.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
    /// Vendor item id used to replay the block (Responses API message id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_signature: Option<String>,
}

impl TextContent {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            text_signature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    /// Base64 payload.
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingContent {
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Set when the complete argument text failed a strict JSON parse.
    #[serde(skip)]
    pub argument_error: Option<String>,
}

impl ToolCall {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            argument_error: None,
        }
    }
}

/// Content accepted in user turns and tool results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UserContent {
    Text(TextContent),
    Image(ImageContent),
}

impl UserContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextContent::new(text))
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(content) => Some(&content.text),
            Self::Image(_) => None,
        }
    }
}

/// One streaming unit of assistant output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text(TextContent),
    Thinking(ThinkingContent),
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    #[serde(default)]
    pub web_search: f64,
    pub total: f64,
}

/// Token counters for one response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub web_search_requests: u64,
    pub cost: Cost,
}

impl Usage {
    /// Sum of the four token components.
    #[must_use]
    pub fn component_sum(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
    }

    pub fn recompute_total(&mut self) {
        self.total_tokens = self.component_sum();
    }

    /// Merges a partial update; absent counters keep the previously observed value.
    pub fn apply(&mut self, update: &UsageUpdate) {
        if let Some(input) = update.input {
            self.input = input;
        }
        if let Some(output) = update.output {
            self.output = output;
        }
        if let Some(cache_read) = update.cache_read {
            self.cache_read = cache_read;
        }
        if let Some(cache_write) = update.cache_write {
            self.cache_write = cache_write;
        }
        if let Some(requests) = update.web_search_requests {
            self.web_search_requests = requests;
        }
        self.recompute_total();
    }
}

/// Usage report where `None` means the vendor did not send that counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageUpdate {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub cache_read: Option<u64>,
    pub cache_write: Option<u64>,
    pub web_search_requests: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: Vec<UserContent>,
    pub timestamp: i64,
}

impl UserMessage {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![UserContent::text(text)],
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: Api,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Vendor-native response id, threaded into the next turn for continuity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// Empty in-progress message attributed to `model`.
    #[must_use]
    pub fn empty(model: &Model) -> Self {
        Self {
            content: Vec::new(),
            api: model.api,
            provider: model.provider.clone(),
            model: model.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            response_id: None,
            timestamp: now_ms(),
        }
    }

    /// Structurally valid, content-free message describing a failed turn.
    #[must_use]
    pub fn failed(model: &Model, reason: StopReason, error: impl Into<String>) -> Self {
        let mut message = Self::empty(model);
        message.stop_reason = reason;
        message.error_message = Some(error.into());
        message
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    /// Concatenated text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<UserContent>,
    #[serde(default)]
    pub details: Value,
    pub is_error: bool,
    pub timestamp: i64,
}

impl ToolResultMessage {
    /// Error-flagged result carrying a single text explanation.
    #[must_use]
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![UserContent::text(text)],
            details: Value::Null,
            is_error: true,
            timestamp: now_ms(),
        }
    }

    /// Text parts joined by newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(UserContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Conversation history item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User(UserMessage::text(text))
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "toolResult",
        }
    }

    #[must_use]
    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(message) => Some(message),
            _ => None,
        }
    }
}

impl From<UserMessage> for Message {
    fn from(message: UserMessage) -> Self {
        Self::User(message)
    }
}

impl From<AssistantMessage> for Message {
    fn from(message: AssistantMessage) -> Self {
        Self::Assistant(message)
    }
}

impl From<ToolResultMessage> for Message {
    fn from(message: ToolResultMessage) -> Self {
        Self::ToolResult(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn usage_update_keeps_previous_counters_when_absent() {
        let mut usage = Usage::default();
        usage.apply(&UsageUpdate {
            input: Some(120),
            output: Some(1),
            cache_read: Some(30),
            cache_write: Some(7),
            web_search_requests: None,
        });
        usage.apply(&UsageUpdate {
            output: Some(48),
            ..UsageUpdate::default()
        });

        assert_eq!(usage.input, 120);
        assert_eq!(usage.output, 48);
        assert_eq!(usage.cache_read, 30);
        assert_eq!(usage.cache_write, 7);
        assert_eq!(usage.total_tokens, 120 + 48 + 30 + 7);
    }

    #[test]
    fn message_serializes_with_role_and_block_tags() {
        let message = Message::ToolResult(ToolResultMessage {
            tool_call_id: "call_1".to_string(),
            tool_name: "read".to_string(),
            content: vec![UserContent::text("ok")],
            details: json!({"bytes": 2}),
            is_error: false,
            timestamp: 5,
        });

        let value = serde_json::to_value(&message).expect("message serializes");
        assert_eq!(value["role"], "toolResult");
        assert_eq!(value["toolCallId"], "call_1");
        assert_eq!(value["content"][0]["type"], "text");

        let block = serde_json::to_value(ContentBlock::ToolCall(ToolCall::new(
            "call_1",
            "read",
            json!({"path": "a"}),
        )))
        .expect("block serializes");
        assert_eq!(block["type"], "toolCall");
        assert_eq!(block["arguments"]["path"], "a");
    }

    #[test]
    fn stop_reason_failure_covers_error_and_abort_only() {
        assert!(StopReason::Error.is_failure());
        assert!(StopReason::Aborted.is_failure());
        assert!(!StopReason::Stop.is_failure());
        assert!(!StopReason::ToolUse.is_failure());
        assert_eq!(StopReason::ToolUse.as_str(), "toolUse");
    }
}
