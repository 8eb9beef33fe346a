use agent_provider::{
    event_stream, AssistantMessage, AssistantMessageEvent, EventSink, EventStream, Message,
    ToolResultMessage,
};
use serde::Serialize;
use serde_json::Value;

use crate::tool::AgentToolResult;

/// Loop-level event. `AgentEnd` is terminal and carries every message the run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<Message>,
    },
    TurnStart,
    TurnEnd {
        message: AssistantMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    MessageStart {
        message: Message,
    },
    MessageUpdate {
        message: AssistantMessage,
        assistant_event: AssistantMessageEvent,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        partial_result: AgentToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: AgentToolResult,
        is_error: bool,
    },
}

impl AgentEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd { .. })
    }

    #[must_use]
    pub fn final_messages(&self) -> Option<Vec<Message>> {
        match self {
            Self::AgentEnd { messages } => Some(messages.clone()),
            _ => None,
        }
    }
}

pub type AgentEventSink = EventSink<AgentEvent>;
pub type AgentEventStream = EventStream<AgentEvent, Vec<Message>>;

#[must_use]
pub fn agent_event_stream() -> (AgentEventSink, AgentEventStream) {
    event_stream(AgentEvent::is_terminal, AgentEvent::final_messages)
}
