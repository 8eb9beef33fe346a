//! History helpers shared by the vendor converters.

use std::borrow::Cow;

use agent_provider::{AssistantMessage, Message, Model, ToolResultMessage};

/// Text of the error result stood in for a tool call that never got one.
pub(crate) const MISSING_TOOL_RESULT: &str = "No result provided";

/// Messages that can be replayed to a vendor, paired with their history index.
///
/// Failed or aborted assistant turns are dropped: they may hold half-built
/// blocks and never received tool results. A replayed tool call left without
/// a result gets an error result before the next user or assistant turn (or
/// at the end), since vendors reject a `tool_use` nobody answered. Synthetic
/// results carry the index of the assistant turn that made the call.
pub(crate) fn replayable(messages: &[Message]) -> impl Iterator<Item = (usize, Cow<'_, Message>)> {
    let mut out = Vec::with_capacity(messages.len());
    // (assistant index, call id, tool name) still waiting for a result.
    let mut unanswered: Vec<(usize, &str, &str)> = Vec::new();

    for (index, message) in messages.iter().enumerate() {
        match message {
            Message::Assistant(assistant) if assistant.stop_reason.is_failure() => continue,
            Message::Assistant(assistant) => {
                answer_missing(&mut out, &mut unanswered);
                unanswered.extend(
                    assistant
                        .tool_calls()
                        .map(|call| (index, call.id.as_str(), call.name.as_str())),
                );
            }
            Message::User(_) => answer_missing(&mut out, &mut unanswered),
            Message::ToolResult(result) => {
                unanswered.retain(|(_, id, _)| *id != result.tool_call_id);
            }
        }
        out.push((index, Cow::Borrowed(message)));
    }
    answer_missing(&mut out, &mut unanswered);

    out.into_iter()
}

fn answer_missing<'a>(out: &mut Vec<(usize, Cow<'a, Message>)>, unanswered: &mut Vec<(usize, &str, &str)>) {
    for (index, id, name) in unanswered.drain(..) {
        let result = ToolResultMessage::error(id, name, MISSING_TOOL_RESULT);
        out.push((index, Cow::Owned(Message::ToolResult(result))));
    }
}

/// True when `message` was produced by exactly `model`.
pub(crate) fn same_model(message: &AssistantMessage, model: &Model) -> bool {
    message.provider == model.provider && message.api == model.api && message.model == model.id
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
pub(crate) fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// First `max` characters of an ASCII-sanitized id.
pub(crate) fn truncate_id(id: &str, max: usize) -> &str {
    match id.char_indices().nth(max) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}
