//! Shared core of the Responses-API family: history conversion, tool
//! conversion and the stream processor used by OpenAI, Azure and Codex.

use std::collections::{HashMap, HashSet};

use agent_provider::{
    ContentBlock, Context, MessageBuilder, Message, Model, StopReason, StreamOptions,
    ToolDefinition, UserContent, WebSearchOptions,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::call::{refresh_cost, str_field, u64_field, EventProcessor};
use crate::error::ProviderError;
use crate::history::{replayable, same_model, sanitize_id, truncate_id};

/// Providers whose composite tool-call ids this family knows how to normalize.
pub const OPENAI_TOOL_CALL_PROVIDERS: &[&str] = &["openai", "openai-codex", "opencode"];

pub const INCLUDE_REASONING: &str = "reasoning.encrypted_content";
pub const WEB_SEARCH_INCLUDES: [&str; 2] =
    ["web_search_call.action.sources", "web_search_call.results"];

const MAX_ID_LEN: usize = 64;
const IMAGE_PLACEHOLDER: &str = "(see attached image)";
const TOOL_IMAGES_PREFIX: &str = "Attached image(s) from tool result:";
const JUICE_HINT: &str = "# Juice: 0 !important";

/// Converts the history into Responses `input` items.
///
/// With `include_system_prompt` unset the caller sends the prompt elsewhere
/// (Codex uses `instructions`).
pub fn convert_messages(
    model: &Model,
    context: &Context,
    tool_call_providers: &[&str],
    include_system_prompt: bool,
) -> Vec<Value> {
    let mut input = Vec::new();
    let normalize_ids = tool_call_providers.contains(&model.provider.as_str());
    let replay_id = |id: &str| {
        if normalize_ids {
            normalize_composite_id(id)
        } else {
            id.to_owned()
        }
    };

    if include_system_prompt {
        if let Some(prompt) = context.system_prompt() {
            let role = if model.reasoning { "developer" } else { "system" };
            input.push(json!({"role": role, "content": prompt}));
        }
    }

    for (msg_index, message) in replayable(&context.messages) {
        match message.as_ref() {
            Message::User(user) => {
                let parts = user_parts(&user.content, model);
                if !parts.is_empty() {
                    input.push(json!({"role": "user", "content": parts}));
                }
            }
            Message::Assistant(assistant) => {
                let same = same_model(assistant, model);
                let other_model_same_provider = !same
                    && assistant.provider == model.provider
                    && assistant.api == model.api;

                for block in &assistant.content {
                    match block {
                        ContentBlock::Thinking(thinking) => {
                            let stored = thinking
                                .thinking_signature
                                .as_deref()
                                .filter(|_| same)
                                .and_then(|signature| serde_json::from_str::<Value>(signature).ok());
                            if let Some(item) = stored {
                                input.push(item);
                            }
                        }
                        ContentBlock::Text(text) => {
                            if text.text.is_empty() {
                                continue;
                            }
                            let id = message_item_id(text.text_signature.as_deref(), msg_index);
                            input.push(json!({
                                "type": "message",
                                "role": "assistant",
                                "content": [{"type": "output_text", "text": text.text, "annotations": []}],
                                "status": "completed",
                                "id": id,
                            }));
                        }
                        ContentBlock::ToolCall(call) => {
                            let id = replay_id(&call.id);
                            let (call_id, item_id) = split_composite_id(&id);
                            let mut item = Map::new();
                            item.insert("type".into(), json!("function_call"));
                            if let Some(item_id) = item_id {
                                if !(other_model_same_provider && item_id.starts_with("fc_")) {
                                    item.insert("id".into(), json!(item_id));
                                }
                            }
                            item.insert("call_id".into(), json!(call_id));
                            item.insert("name".into(), json!(call.name));
                            item.insert("arguments".into(), json!(call.arguments.to_string()));
                            input.push(Value::Object(item));
                        }
                    }
                }
            }
            Message::ToolResult(result) => {
                let id = replay_id(&result.tool_call_id);
                let (call_id, _) = split_composite_id(&id);
                let text = result.text();
                let images = if model.supports_images() {
                    image_parts(&result.content)
                } else {
                    Vec::new()
                };
                let output = if !text.is_empty() {
                    text
                } else if !images.is_empty() {
                    IMAGE_PLACEHOLDER.to_owned()
                } else {
                    String::new()
                };
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output,
                }));
                if !images.is_empty() {
                    let mut content = vec![json!({"type": "input_text", "text": TOOL_IMAGES_PREFIX})];
                    content.extend(images);
                    input.push(json!({"role": "user", "content": content}));
                }
            }
        }
    }

    input
}

fn user_parts(content: &[UserContent], model: &Model) -> Vec<Value> {
    content
        .iter()
        .filter_map(|part| match part {
            UserContent::Text(text) if text.text.is_empty() => None,
            UserContent::Text(text) => Some(json!({"type": "input_text", "text": text.text})),
            UserContent::Image(_) if !model.supports_images() => None,
            UserContent::Image(image) => Some(input_image(&image.mime_type, &image.data)),
        })
        .collect()
}

fn image_parts(content: &[UserContent]) -> Vec<Value> {
    content
        .iter()
        .filter_map(|part| match part {
            UserContent::Image(image) => Some(input_image(&image.mime_type, &image.data)),
            UserContent::Text(_) => None,
        })
        .collect()
}

fn input_image(mime_type: &str, data: &str) -> Value {
    json!({
        "type": "input_image",
        "detail": "auto",
        "image_url": format!("data:{mime_type};base64,{data}"),
    })
}

fn message_item_id(signature: Option<&str>, msg_index: usize) -> String {
    let id = match signature.filter(|id| !id.is_empty()) {
        Some(id) => id.to_owned(),
        None => format!("msg_{msg_index}"),
    };
    if id.len() > MAX_ID_LEN {
        format!("msg_{}", short_hash(&id))
    } else {
        id
    }
}

fn split_composite_id(id: &str) -> (&str, Option<&str>) {
    match id.split_once('|') {
        Some((call_id, item_id)) => (call_id, Some(item_id)),
        None => (id, None),
    }
}

/// Normalizes a `call_id|item_id` pair to the vendor's id rules.
///
/// Ids without a `|` are returned unchanged.
pub fn normalize_composite_id(id: &str) -> String {
    let Some((call_id, item_id)) = id.split_once('|') else {
        return id.to_owned();
    };
    let call_id = sanitize_id(call_id);
    let mut item_id = sanitize_id(item_id);
    if !item_id.starts_with("fc") {
        item_id = format!("fc_{item_id}");
    }
    let call_id = truncate_id(&call_id, MAX_ID_LEN).trim_end_matches('_');
    let item_id = truncate_id(&item_id, MAX_ID_LEN).trim_end_matches('_');
    format!("{call_id}|{item_id}")
}

/// Deterministic 53-bit style hash rendered in base 36.
pub(crate) fn short_hash(text: &str) -> String {
    let mut h1: u32 = 0xdead_beef;
    let mut h2: u32 = 0x41c6_ce57;
    for unit in text.encode_utf16() {
        let ch = u32::from(unit);
        h1 = (h1 ^ ch).wrapping_mul(2_654_435_761);
        h2 = (h2 ^ ch).wrapping_mul(1_597_334_677);
    }
    h1 = (h1 ^ (h1 >> 16)).wrapping_mul(2_246_822_507) ^ (h2 ^ (h2 >> 13)).wrapping_mul(3_266_489_909);
    h2 = (h2 ^ (h2 >> 16)).wrapping_mul(2_246_822_507) ^ (h1 ^ (h1 >> 13)).wrapping_mul(3_266_489_909);
    format!("{}{}", base36(h2), base36(h1))
}

fn base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Function tools plus the optional hosted web-search tool.
///
/// `strict` is serialized as given (`false` for OpenAI, `null` for Codex).
pub fn convert_tools(
    tools: &[ToolDefinition],
    strict: Value,
    web_search: Option<&WebSearchOptions>,
) -> Result<Vec<Value>, ProviderError> {
    let mut out: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
                "strict": strict,
            })
        })
        .collect();
    if let Some(search) = web_search {
        out.push(web_search_tool(search)?);
    }
    Ok(out)
}

fn web_search_tool(options: &WebSearchOptions) -> Result<Value, ProviderError> {
    if !options.blocked_domains.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "OpenAI web search does not support blockedDomains. Use allowedDomains instead."
                .to_owned(),
        ));
    }
    let mut tool = Map::new();
    tool.insert("type".into(), json!("web_search"));
    if !options.allowed_domains.is_empty() {
        tool.insert(
            "filters".into(),
            json!({"allowed_domains": options.allowed_domains}),
        );
    }
    if let Some(size) = &options.search_context_size {
        tool.insert("search_context_size".into(), json!(size));
    }
    if let Some(location) = &options.user_location {
        let mut approximate = Map::new();
        approximate.insert("type".into(), json!("approximate"));
        for (key, value) in [
            ("city", &location.city),
            ("country", &location.country),
            ("region", &location.region),
            ("timezone", &location.timezone),
        ] {
            if let Some(value) = value {
                approximate.insert(key.into(), json!(value));
            }
        }
        tool.insert("user_location".into(), Value::Object(approximate));
    }
    Ok(Value::Object(tool))
}

/// Adds `reasoning`/`include` for reasoning models, or the no-reasoning hint for gpt-5 models.
pub fn apply_reasoning(
    body: &mut Map<String, Value>,
    input: &mut Vec<Value>,
    model: &Model,
    options: &StreamOptions,
) {
    if !model.reasoning {
        return;
    }
    let effort = options.reasoning_for(model);
    if effort.is_some() || options.reasoning_summary.is_some() {
        body.insert(
            "reasoning".into(),
            json!({
                "effort": effort.map_or("medium", |level| level.as_str()),
                "summary": options.reasoning_summary.as_deref().unwrap_or("auto"),
            }),
        );
        push_include(body, INCLUDE_REASONING);
    } else if model.name.to_ascii_lowercase().starts_with("gpt-5") {
        input.push(json!({
            "role": "developer",
            "content": [{"type": "input_text", "text": JUICE_HINT}],
        }));
    }
}

pub(crate) fn push_include(body: &mut Map<String, Value>, value: &str) {
    let include = body
        .entry("include")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = include {
        if !items.iter().any(|item| item == value) {
            items.push(json!(value));
        }
    }
}

/// Maps a Responses `status` to a stop reason.
pub fn map_status(status: Option<&str>) -> Result<StopReason, ProviderError> {
    match status {
        None | Some("completed" | "in_progress" | "queued") => Ok(StopReason::Stop),
        Some("incomplete") => Ok(StopReason::Length),
        Some("failed" | "cancelled") => Ok(StopReason::Error),
        Some(other) => Err(ProviderError::UnknownStopReason(other.to_owned())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    OutputText,
    Refusal,
}

/// Applies Responses stream events to a [`MessageBuilder`].
pub struct ResponsesProcessor {
    model: Model,
    service_tier: Option<String>,
    tier_pricing: bool,
    summary_parts: HashSet<u64>,
    message_parts: HashMap<u64, PartKind>,
}

impl ResponsesProcessor {
    pub fn new(model: &Model) -> Self {
        Self {
            model: model.clone(),
            service_tier: None,
            tier_pricing: false,
            summary_parts: HashSet::new(),
            message_parts: HashMap::new(),
        }
    }

    /// Applies service-tier pricing, preferring the tier the response reports.
    #[must_use]
    pub fn with_service_tier_pricing(mut self, requested: Option<String>) -> Self {
        self.tier_pricing = true;
        self.service_tier = requested;
        self
    }

    fn index(&self, builder: &MessageBuilder, event: &Value) -> Option<u64> {
        u64_field(event, "output_index").or_else(|| builder.last_open_index())
    }

    fn output_item_added(&mut self, builder: &mut MessageBuilder, index: u64, item: &Value) {
        match str_field(item, "type") {
            Some("reasoning") => {
                builder.open_thinking(index);
            }
            Some("message") => {
                builder.open_text(index);
            }
            Some("function_call") => {
                let call_id = str_field(item, "call_id").unwrap_or_default();
                let id = match str_field(item, "id") {
                    Some(item_id) => format!("{call_id}|{item_id}"),
                    None => call_id.to_owned(),
                };
                let name = str_field(item, "name").unwrap_or_default();
                let arguments = str_field(item, "arguments").unwrap_or_default();
                builder.open_tool_call(index, id, name, arguments);
            }
            other => debug!(item_type = ?other, "ignoring output item"),
        }
    }

    fn output_item_done(&mut self, builder: &mut MessageBuilder, index: u64, item: &Value) {
        match str_field(item, "type") {
            Some("reasoning") => {
                let summary = item
                    .get("summary")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|part| str_field(part, "text"))
                            .collect::<Vec<_>>()
                            .join("\n\n")
                    })
                    .unwrap_or_default();
                builder.set_thinking(index, Some(summary), Some(item.to_string()));
                self.summary_parts.remove(&index);
            }
            Some("message") => {
                let text = item
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|part| match str_field(part, "type") {
                                Some("output_text") => str_field(part, "text"),
                                Some("refusal") => str_field(part, "refusal"),
                                _ => None,
                            })
                            .collect::<String>()
                    })
                    .unwrap_or_default();
                let id = str_field(item, "id").map(str::to_owned);
                builder.set_text(index, Some(text), id);
                self.message_parts.remove(&index);
            }
            Some("function_call") => {
                if let Some(arguments) = str_field(item, "arguments").filter(|text| !text.is_empty()) {
                    builder.replace_tool_arguments(index, arguments);
                }
            }
            _ => return,
        }
        builder.close(index);
    }

    fn completed(&mut self, builder: &mut MessageBuilder, response: &Value) -> Result<(), ProviderError> {
        if let Some(id) = str_field(response, "id") {
            builder.set_response_id(id);
        }

        if let Some(usage) = response.get("usage").filter(|usage| usage.is_object()) {
            let cached = usage
                .get("input_tokens_details")
                .and_then(|details| u64_field(details, "cached_tokens"))
                .unwrap_or(0);
            let input = u64_field(usage, "input_tokens").unwrap_or(0);
            let output = u64_field(usage, "output_tokens").unwrap_or(0);
            let counters = builder.usage_mut();
            counters.input = input.saturating_sub(cached);
            counters.output = output;
            counters.cache_read = cached;
            counters.cache_write = 0;
            // Native total, which already counts cached input once.
            counters.total_tokens = u64_field(usage, "total_tokens").unwrap_or(input + output);

            let tier = if self.tier_pricing {
                str_field(response, "service_tier")
                    .map(str::to_owned)
                    .or_else(|| self.service_tier.clone())
            } else {
                None
            };
            refresh_cost(builder, &self.model, tier.as_deref());
        }

        let status = str_field(response, "status");
        let mut reason = map_status(status)?;
        if reason == StopReason::Error {
            builder.set_error_message(format!(
                "Response ended with status {}",
                status.unwrap_or("unknown")
            ));
        }
        if reason == StopReason::Stop && builder.has_tool_calls() {
            reason = StopReason::ToolUse;
        }
        builder.set_stop_reason(reason);
        Ok(())
    }
}

impl EventProcessor for ResponsesProcessor {
    fn process(&mut self, builder: &mut MessageBuilder, event: Value) -> Result<(), ProviderError> {
        let kind = str_field(&event, "type").unwrap_or_default();
        match kind {
            "response.created" => {
                if let Some(id) = event.get("response").and_then(|response| str_field(response, "id")) {
                    builder.set_response_id(id);
                }
            }
            "response.output_item.added" => {
                if let (Some(index), Some(item)) = (u64_field(&event, "output_index"), event.get("item")) {
                    self.output_item_added(builder, index, item);
                }
            }
            "response.reasoning_summary_part.added" => {
                if let Some(index) = self.index(builder, &event) {
                    self.summary_parts.insert(index);
                }
            }
            "response.reasoning_summary_text.delta" => {
                if let Some(index) = self.index(builder, &event) {
                    if self.summary_parts.contains(&index) {
                        builder.push_thinking(index, str_field(&event, "delta").unwrap_or_default());
                    }
                }
            }
            "response.reasoning_summary_part.done" => {
                if let Some(index) = self.index(builder, &event) {
                    if self.summary_parts.contains(&index) {
                        builder.push_thinking(index, "\n\n");
                    }
                }
            }
            "response.content_part.added" => {
                if let Some(index) = self.index(builder, &event) {
                    let part = match event.get("part").and_then(|part| str_field(part, "type")) {
                        Some("output_text") => Some(PartKind::OutputText),
                        Some("refusal") => Some(PartKind::Refusal),
                        _ => None,
                    };
                    if let Some(part) = part {
                        self.message_parts.insert(index, part);
                    }
                }
            }
            "response.output_text.delta" | "response.refusal.delta" => {
                let wanted = if kind == "response.output_text.delta" {
                    PartKind::OutputText
                } else {
                    PartKind::Refusal
                };
                if let Some(index) = self.index(builder, &event) {
                    if self.message_parts.get(&index) == Some(&wanted) {
                        builder.push_text(index, str_field(&event, "delta").unwrap_or_default());
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(index) = self.index(builder, &event) {
                    builder.push_tool_arguments(index, str_field(&event, "delta").unwrap_or_default());
                }
            }
            "response.function_call_arguments.done" => {
                if let (Some(index), Some(arguments)) =
                    (self.index(builder, &event), str_field(&event, "arguments"))
                {
                    builder.replace_tool_arguments(index, arguments);
                }
            }
            "response.output_item.done" => {
                if let (Some(index), Some(item)) = (self.index(builder, &event), event.get("item")) {
                    self.output_item_done(builder, index, item);
                }
            }
            "response.completed" => {
                let response = event.get("response").cloned().unwrap_or(Value::Null);
                self.completed(builder, &response)?;
            }
            "error" => {
                let code = str_field(&event, "code").unwrap_or_default();
                let message = str_field(&event, "message").unwrap_or_default();
                return Err(ProviderError::stream_failed(
                    Some(code.to_owned()).filter(|code| !code.is_empty()),
                    format!("Error Code {code}: {message}"),
                ));
            }
            "response.failed" => {
                let message = event
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .and_then(|error| str_field(error, "message"))
                    .unwrap_or("Unknown error");
                return Err(ProviderError::stream_failed(None, message));
            }
            other => debug!(event_type = other, "ignoring responses event"),
        }
        Ok(())
    }
}
