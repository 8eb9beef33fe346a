//! Owner of one in-progress assistant message.
//!
//! Adapters feed vendor events into a [`MessageBuilder`] keyed by the vendor's
//! block index. The builder enforces the block lifecycle (not started, open,
//! closed), publishes an owned snapshot with every event, and guarantees that
//! exactly one terminal event is emitted with no block left open.

use tracing::warn;

use crate::event::AssistantMessageEvent;
use crate::event_stream::AssistantMessageEventSink;
use crate::json::StreamingJson;
use crate::message::{
    AssistantMessage, ContentBlock, StopReason, TextContent, ThinkingContent, ToolCall, Usage,
};
use crate::model::Model;

#[derive(Debug)]
struct Slot {
    index: u64,
    open: bool,
    arguments: Option<StreamingJson>,
}

#[derive(Debug)]
pub struct MessageBuilder {
    message: AssistantMessage,
    slots: Vec<Slot>,
    sink: AssistantMessageEventSink,
    started: bool,
}

impl MessageBuilder {
    #[must_use]
    pub fn new(model: &Model, sink: AssistantMessageEventSink) -> Self {
        Self {
            message: AssistantMessage::empty(model),
            slots: Vec::new(),
            sink,
            started: false,
        }
    }

    /// Emits the `start` event once; later calls are no-ops.
    pub fn start(&mut self) {
        if std::mem::replace(&mut self.started, true) {
            return;
        }
        self.sink.push(AssistantMessageEvent::Start {
            partial: self.message.clone(),
        });
    }

    #[must_use]
    pub fn message(&self) -> &AssistantMessage {
        &self.message
    }

    pub fn usage_mut(&mut self) -> &mut Usage {
        &mut self.message.usage
    }

    pub fn set_stop_reason(&mut self, reason: StopReason) {
        self.message.stop_reason = reason;
    }

    #[must_use]
    pub fn stop_reason(&self) -> StopReason {
        self.message.stop_reason
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.message.error_message = Some(message.into());
    }

    pub fn set_response_id(&mut self, id: impl Into<String>) {
        self.message.response_id = Some(id.into());
    }

    /// True when the consumer dropped its half of the stream.
    #[must_use]
    pub fn consumer_gone(&self) -> bool {
        self.sink.is_closed()
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.message.has_tool_calls()
    }

    /// Content position of the open block at `index`.
    #[must_use]
    pub fn open_position(&self, index: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.open && slot.index == index)
    }

    /// Index of the most recently opened block that is still open.
    #[must_use]
    pub fn last_open_index(&self) -> Option<u64> {
        self.slots
            .iter()
            .rev()
            .find(|slot| slot.open)
            .map(|slot| slot.index)
    }

    pub fn open_text(&mut self, index: u64) -> Option<usize> {
        let position = self.open_slot(index, ContentBlock::Text(TextContent::default()), None)?;
        self.sink.push(AssistantMessageEvent::TextStart {
            content_index: position,
            partial: self.message.clone(),
        });
        Some(position)
    }

    pub fn open_thinking(&mut self, index: u64) -> Option<usize> {
        let position =
            self.open_slot(index, ContentBlock::Thinking(ThinkingContent::default()), None)?;
        self.sink.push(AssistantMessageEvent::ThinkingStart {
            content_index: position,
            partial: self.message.clone(),
        });
        Some(position)
    }

    /// Opens a tool call. `initial_arguments` seeds the accumulator (some vendors send a prefix).
    pub fn open_tool_call(
        &mut self,
        index: u64,
        id: impl Into<String>,
        name: impl Into<String>,
        initial_arguments: &str,
    ) -> Option<usize> {
        let mut arguments = StreamingJson::new();
        let value = arguments.push(initial_arguments);
        let block = ContentBlock::ToolCall(ToolCall::new(id, name, value));
        let position = self.open_slot(index, block, Some(arguments))?;
        self.sink.push(AssistantMessageEvent::ToolCallStart {
            content_index: position,
            partial: self.message.clone(),
        });
        Some(position)
    }

    pub fn push_text(&mut self, index: u64, delta: &str) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let ContentBlock::Text(block) = &mut self.message.content[position] else {
            return false;
        };
        block.text.push_str(delta);
        self.sink.push(AssistantMessageEvent::TextDelta {
            content_index: position,
            delta: delta.to_string(),
            partial: self.message.clone(),
        });
        true
    }

    pub fn push_thinking(&mut self, index: u64, delta: &str) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let ContentBlock::Thinking(block) = &mut self.message.content[position] else {
            return false;
        };
        block.thinking.push_str(delta);
        self.sink.push(AssistantMessageEvent::ThinkingDelta {
            content_index: position,
            delta: delta.to_string(),
            partial: self.message.clone(),
        });
        true
    }

    /// Appends to the thinking signature without emitting an event.
    pub fn push_thinking_signature(&mut self, index: u64, delta: &str) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let ContentBlock::Thinking(block) = &mut self.message.content[position] else {
            return false;
        };
        block
            .thinking_signature
            .get_or_insert_with(String::new)
            .push_str(delta);
        true
    }

    pub fn push_tool_arguments(&mut self, index: u64, delta: &str) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let Some(arguments) = self.slots[position].arguments.as_mut() else {
            return false;
        };
        let value = arguments.push(delta);
        if let ContentBlock::ToolCall(call) = &mut self.message.content[position] {
            call.arguments = value;
        }
        self.sink.push(AssistantMessageEvent::ToolCallDelta {
            content_index: position,
            delta: delta.to_string(),
            partial: self.message.clone(),
        });
        true
    }

    /// Replaces the accumulated argument text with a vendor-supplied complete copy.
    pub fn replace_tool_arguments(&mut self, index: u64, text: &str) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let Some(arguments) = self.slots[position].arguments.as_mut() else {
            return false;
        };
        let value = arguments.replace(text);
        if let ContentBlock::ToolCall(call) = &mut self.message.content[position] {
            call.arguments = value;
        }
        true
    }

    /// Overwrites the text of an open text block and sets its signature.
    pub fn set_text(&mut self, index: u64, text: Option<String>, signature: Option<String>) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let ContentBlock::Text(block) = &mut self.message.content[position] else {
            return false;
        };
        if let Some(text) = text {
            block.text = text;
        }
        if signature.is_some() {
            block.text_signature = signature;
        }
        true
    }

    /// Overwrites the text of an open thinking block and sets its signature.
    pub fn set_thinking(
        &mut self,
        index: u64,
        thinking: Option<String>,
        signature: Option<String>,
    ) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        let ContentBlock::Thinking(block) = &mut self.message.content[position] else {
            return false;
        };
        if let Some(thinking) = thinking {
            block.thinking = thinking;
        }
        if signature.is_some() {
            block.thinking_signature = signature;
        }
        true
    }

    /// Closes the open block at `index` and emits its end event.
    ///
    /// Unknown or already-closed indices are ignored.
    pub fn close(&mut self, index: u64) -> bool {
        let Some(position) = self.open_position(index) else {
            return false;
        };
        self.seal(position);
        let partial = self.message.clone();
        let event = match &self.message.content[position] {
            ContentBlock::Text(block) => AssistantMessageEvent::TextEnd {
                content_index: position,
                content: block.text.clone(),
                partial,
            },
            ContentBlock::Thinking(block) => AssistantMessageEvent::ThinkingEnd {
                content_index: position,
                content: block.thinking.clone(),
                partial,
            },
            ContentBlock::ToolCall(call) => AssistantMessageEvent::ToolCallEnd {
                content_index: position,
                tool_call: call.clone(),
                partial,
            },
        };
        self.sink.push(event);
        true
    }

    /// Closes remaining blocks and emits `done`.
    ///
    /// A failure stop reason recorded earlier turns this into [`MessageBuilder::fail`].
    pub fn finish(mut self) -> AssistantMessage {
        let reason = self.message.stop_reason;
        if reason.is_failure() {
            let message = self
                .message
                .error_message
                .clone()
                .unwrap_or_else(|| "provider reported an error stop reason".to_string());
            return self.fail(reason, message);
        }

        let open: Vec<u64> = self
            .slots
            .iter()
            .filter(|slot| slot.open)
            .map(|slot| slot.index)
            .collect();
        for index in open {
            self.close(index);
        }

        self.sink.push(AssistantMessageEvent::Done {
            reason,
            message: self.message.clone(),
        });
        self.message
    }

    /// Seals remaining blocks without end events and emits `error`.
    pub fn fail(mut self, reason: StopReason, error: impl Into<String>) -> AssistantMessage {
        for position in 0..self.slots.len() {
            if self.slots[position].open {
                self.seal(position);
            }
        }
        self.message.stop_reason = reason;
        self.message.error_message = Some(error.into());
        self.sink.push(AssistantMessageEvent::Error {
            reason,
            error: self.message.clone(),
        });
        self.message
    }

    fn open_slot(
        &mut self,
        index: u64,
        block: ContentBlock,
        arguments: Option<StreamingJson>,
    ) -> Option<usize> {
        if self.open_position(index).is_some() {
            warn!(index, "ignoring block start for an index that is already open");
            return None;
        }
        self.message.content.push(block);
        self.slots.push(Slot {
            index,
            open: true,
            arguments,
        });
        Some(self.message.content.len() - 1)
    }

    fn seal(&mut self, position: usize) {
        let slot = &mut self.slots[position];
        slot.open = false;
        let Some(arguments) = slot.arguments.as_ref() else {
            return;
        };
        if let ContentBlock::ToolCall(call) = &mut self.message.content[position] {
            match arguments.finish() {
                Ok(value) => {
                    call.arguments = value;
                    call.argument_error = None;
                }
                Err(error) => {
                    call.arguments = arguments.value();
                    call.argument_error = Some(format!(
                        "invalid JSON arguments for tool '{}': {error}",
                        call.name
                    ));
                }
            }
        }
    }
}
