//! Anthropic Messages adapter.

use std::sync::Arc;

use agent_provider::{
    adjust_max_tokens_for_thinking, Api, AssistantMessageEventStream, CacheRetention, ContentBlock,
    Context, Message, MessageBuilder, Model, StopReason, StreamOptions, ThinkingLevel, ToolChoice,
    ToolDefinition, UsageUpdate, UserContent, WebSearchOptions,
};
use llm_transport::{EventTransport, SseTransport, TransportRequest};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::call::{
    extra_headers, refresh_cost, resolve_api_key, retry_override, spawn_call, str_field,
    trimmed_base_url, u64_field, EventProcessor, PreparedCall,
};
use crate::error::ProviderError;
use crate::history::{replayable, same_model, sanitize_id, truncate_id};
use crate::ProviderAdapter;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const FINE_GRAINED_TOOL_STREAMING_BETA: &str = "fine-grained-tool-streaming-2025-05-14";
pub const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
const OAUTH_BETAS: &str = "claude-code-20250219,oauth-2025-04-20";
const CLI_USER_AGENT: &str = "claude-cli/2.1.2 (external, cli)";
const IDENTITY_PROMPT: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
const TOOL_IMAGE_PLACEHOLDER: &str = "(see attached image)";
const MAX_TOOL_ID_LEN: usize = 64;

/// Tool names used for identity-masked (OAuth) calls.
pub const CANONICAL_TOOL_NAMES: [&str; 17] = [
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Grep",
    "Glob",
    "AskUserQuestion",
    "EnterPlanMode",
    "ExitPlanMode",
    "KillShell",
    "NotebookEdit",
    "Skill",
    "Task",
    "TaskOutput",
    "TodoWrite",
    "WebFetch",
    "WebSearch",
];

/// OAuth tokens carry the `sk-ant-oat` marker.
pub fn is_oauth_token(token: &str) -> bool {
    token.contains("sk-ant-oat")
}

/// Canonical spelling of `name` when it is in the vocabulary, else `name` unchanged.
pub fn to_canonical_tool_name(name: &str) -> String {
    CANONICAL_TOOL_NAMES
        .iter()
        .find(|canonical| canonical.eq_ignore_ascii_case(name))
        .map_or_else(|| name.to_owned(), |canonical| (*canonical).to_owned())
}

/// The context tool whose name matches `name` ignoring case, else `name` unchanged.
pub fn from_canonical_tool_name(name: &str, tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .find(|tool| tool.name.eq_ignore_ascii_case(name))
        .map_or_else(|| name.to_owned(), |tool| tool.name.clone())
}

fn supports_adaptive_thinking(model_id: &str) -> bool {
    ["opus-4-6", "opus-4.6", "sonnet-4-6", "sonnet-4.6"]
        .iter()
        .any(|marker| model_id.contains(marker))
}

fn adaptive_effort(level: ThinkingLevel, model_id: &str) -> &'static str {
    match level {
        ThinkingLevel::Minimal | ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => "medium",
        ThinkingLevel::High => "high",
        ThinkingLevel::Xhigh if model_id.contains("opus-4-6") || model_id.contains("opus-4.6") => {
            "max"
        }
        ThinkingLevel::Xhigh => "high",
    }
}

/// Vendor stop reason to the closed set.
pub fn map_stop_reason(reason: &str) -> Result<StopReason, ProviderError> {
    match reason {
        "end_turn" | "pause_turn" | "stop_sequence" => Ok(StopReason::Stop),
        "max_tokens" => Ok(StopReason::Length),
        "tool_use" => Ok(StopReason::ToolUse),
        "refusal" | "sensitive" => Ok(StopReason::Error),
        other => Err(ProviderError::UnknownStopReason(other.to_owned())),
    }
}

fn normalize_tool_call_id(id: &str) -> String {
    truncate_id(&sanitize_id(id), MAX_TOOL_ID_LEN).to_owned()
}

fn cache_control(base_url: &str, retention: CacheRetention) -> Option<Value> {
    match retention {
        CacheRetention::None => None,
        CacheRetention::Long if base_url.contains("api.anthropic.com") => {
            Some(json!({"type": "ephemeral", "ttl": "1h"}))
        }
        _ => Some(json!({"type": "ephemeral"})),
    }
}

/// Streams Anthropic Messages over SSE.
#[derive(Clone)]
pub struct AnthropicAdapter {
    transport: Arc<dyn EventTransport>,
}

impl AnthropicAdapter {
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self::with_transport(Arc::new(SseTransport::new()?)))
    }

    pub fn with_transport(transport: Arc<dyn EventTransport>) -> Self {
        Self { transport }
    }

    fn prepare(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<PreparedCall, ProviderError> {
        let api_key = resolve_api_key(model, options)?;
        let oauth = is_oauth_token(&api_key);
        Ok(PreparedCall {
            transport: Arc::clone(&self.transport),
            request: build_request(model, context, options, &api_key)?,
            processor: Box::new(AnthropicProcessor {
                model: model.clone(),
                tools: if oauth { context.tools.clone() } else { Vec::new() },
                stopped: false,
            }),
        })
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn api(&self) -> Api {
        Api::AnthropicMessages
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<TransportRequest, ProviderError> {
        let api_key = resolve_api_key(model, options)?;
        build_request(model, context, options, &api_key)
    }

    fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AssistantMessageEventStream {
        spawn_call(model, options, self.prepare(model, context, options))
    }
}

fn build_request(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    api_key: &str,
) -> Result<TransportRequest, ProviderError> {
    let oauth = is_oauth_token(api_key);
    let adaptive = model.reasoning && supports_adaptive_thinking(&model.id);

    let mut betas = vec![FINE_GRAINED_TOOL_STREAMING_BETA];
    if !adaptive {
        betas.push(INTERLEAVED_THINKING_BETA);
    }
    let betas = betas.join(",");

    let mut request = TransportRequest::new(
        format!("{}/v1/messages", trimmed_base_url(&model.base_url)),
        build_body(model, context, options, oauth)?,
    )
    .with_header("accept", "application/json")
    .with_header("content-type", "application/json")
    .with_header("anthropic-version", ANTHROPIC_VERSION)
    .with_header("anthropic-dangerous-direct-browser-access", "true");

    request = if oauth {
        request
            .with_header("authorization", format!("Bearer {api_key}"))
            .with_header("anthropic-beta", format!("{OAUTH_BETAS},{betas}"))
            .with_header("user-agent", CLI_USER_AGENT)
            .with_header("x-app", "cli")
    } else {
        request
            .with_header("x-api-key", api_key)
            .with_header("anthropic-beta", betas)
    };

    Ok(request
        .with_headers(extra_headers(model, options))
        .with_retry(retry_override(options)))
}

fn build_body(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    oauth: bool,
) -> Result<Value, ProviderError> {
    let cache = cache_control(&model.base_url, options.resolved_cache_retention());
    let base_max_tokens = options.max_tokens.unwrap_or(model.max_tokens / 3);

    let mut body = Map::new();
    body.insert("model".into(), json!(model.id));
    body.insert(
        "messages".into(),
        Value::Array(convert_messages(model, context, oauth, cache.as_ref())),
    );
    body.insert("max_tokens".into(), json!(base_max_tokens));
    body.insert("stream".into(), json!(true));

    let mut system = Vec::new();
    if oauth {
        system.push(text_block(IDENTITY_PROMPT, cache.as_ref()));
    }
    if let Some(prompt) = context.system_prompt() {
        system.push(text_block(prompt, cache.as_ref()));
    }
    if !system.is_empty() {
        body.insert("system".into(), Value::Array(system));
    }

    if let Some(temperature) = options.temperature {
        body.insert("temperature".into(), json!(temperature));
    }

    let mut tools: Vec<Value> = context
        .tools
        .iter()
        .map(|tool| convert_tool(tool, oauth))
        .collect();
    if let Some(search) = &options.native_tools.web_search {
        tools.push(web_search_tool(search)?);
    }
    if !tools.is_empty() {
        body.insert("tools".into(), Value::Array(tools));
    }

    if model.reasoning {
        if let Some(level) = options.reasoning_for(model) {
            if supports_adaptive_thinking(&model.id) {
                body.insert("thinking".into(), json!({"type": "adaptive"}));
                body.insert(
                    "output_config".into(),
                    json!({"effort": adaptive_effort(level, &model.id)}),
                );
            } else {
                let (max_tokens, budget) = adjust_max_tokens_for_thinking(
                    base_max_tokens,
                    model.max_tokens,
                    level,
                    &options.thinking_budgets,
                );
                body.insert("max_tokens".into(), json!(max_tokens));
                body.insert(
                    "thinking".into(),
                    json!({"type": "enabled", "budget_tokens": budget}),
                );
            }
        }
    }

    if let Some(user_id) = &options.metadata_user_id {
        body.insert("metadata".into(), json!({"user_id": user_id}));
    }

    if let Some(choice) = &options.tool_choice {
        let choice = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Any => json!({"type": "any"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
        };
        body.insert("tool_choice".into(), choice);
    }

    Ok(Value::Object(body))
}

fn text_block(text: &str, cache: Option<&Value>) -> Value {
    let mut block = json!({"type": "text", "text": text});
    if let Some(cache) = cache {
        block["cache_control"] = cache.clone();
    }
    block
}

fn convert_tool(tool: &ToolDefinition, oauth: bool) -> Value {
    let name = if oauth {
        to_canonical_tool_name(&tool.name)
    } else {
        tool.name.clone()
    };
    let properties = tool
        .parameters
        .get("properties")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let required = tool
        .parameters
        .get("required")
        .cloned()
        .unwrap_or_else(|| json!([]));
    json!({
        "name": name,
        "description": tool.description,
        "input_schema": {"type": "object", "properties": properties, "required": required},
    })
}

fn web_search_tool(options: &WebSearchOptions) -> Result<Value, ProviderError> {
    if !options.allowed_domains.is_empty() && !options.blocked_domains.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "Anthropic web search supports allowedDomains or blockedDomains, not both.".to_owned(),
        ));
    }
    let mut tool = Map::new();
    tool.insert("name".into(), json!("web_search"));
    tool.insert("type".into(), json!("web_search_20250305"));
    if !options.allowed_domains.is_empty() {
        tool.insert("allowed_domains".into(), json!(options.allowed_domains));
    }
    if !options.blocked_domains.is_empty() {
        tool.insert("blocked_domains".into(), json!(options.blocked_domains));
    }
    if let Some(max_uses) = options.max_uses {
        tool.insert("max_uses".into(), json!(max_uses));
    }
    if let Some(location) = &options.user_location {
        let mut approximate = json!({"type": "approximate"});
        for (key, value) in [
            ("city", &location.city),
            ("country", &location.country),
            ("region", &location.region),
            ("timezone", &location.timezone),
        ] {
            if let Some(value) = value {
                approximate[key] = json!(value);
            }
        }
        tool.insert("user_location".into(), approximate);
    }
    Ok(Value::Object(tool))
}

/// Converts history to Messages-API turns. Consecutive tool results share one user turn.
fn convert_messages(
    model: &Model,
    context: &Context,
    oauth: bool,
    cache: Option<&Value>,
) -> Vec<Value> {
    let mut turns: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush = |turns: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            turns.push(json!({"role": "user", "content": std::mem::take(pending)}));
        }
    };

    for (_, message) in replayable(&context.messages) {
        match message.as_ref() {
            Message::ToolResult(result) => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": normalize_tool_call_id(&result.tool_call_id),
                    "content": tool_result_content(&result.content, model),
                    "is_error": result.is_error,
                }));
            }
            Message::User(user) => {
                flush(&mut turns, &mut pending_results);
                let blocks: Vec<Value> = user
                    .content
                    .iter()
                    .filter_map(|part| user_block(part, model))
                    .collect();
                if !blocks.is_empty() {
                    turns.push(json!({"role": "user", "content": blocks}));
                }
            }
            Message::Assistant(assistant) => {
                flush(&mut turns, &mut pending_results);
                let same = same_model(assistant, model);
                let blocks: Vec<Value> = assistant
                    .content
                    .iter()
                    .filter_map(|block| assistant_block(block, same, oauth))
                    .collect();
                if !blocks.is_empty() {
                    turns.push(json!({"role": "assistant", "content": blocks}));
                }
            }
        }
    }
    flush(&mut turns, &mut pending_results);

    if let (Some(cache), Some(last)) = (cache, turns.last_mut()) {
        if last["role"] == "user" {
            if let Some(block) = last["content"].as_array_mut().and_then(|blocks| blocks.last_mut()) {
                block["cache_control"] = cache.clone();
            }
        }
    }

    turns
}

fn user_block(part: &UserContent, model: &Model) -> Option<Value> {
    match part {
        UserContent::Text(text) if text.text.trim().is_empty() => None,
        UserContent::Text(text) => Some(json!({"type": "text", "text": text.text})),
        UserContent::Image(_) if !model.supports_images() => None,
        UserContent::Image(image) => Some(image_block(&image.mime_type, &image.data)),
    }
}

fn image_block(mime_type: &str, data: &str) -> Value {
    json!({
        "type": "image",
        "source": {"type": "base64", "media_type": mime_type, "data": data},
    })
}

/// Thinking signatures only verify against the model that wrote them; other
/// models' reasoning is replayed as plain text.
fn assistant_block(block: &ContentBlock, same_model: bool, oauth: bool) -> Option<Value> {
    match block {
        ContentBlock::Text(text) if text.text.trim().is_empty() => None,
        ContentBlock::Text(text) => Some(json!({"type": "text", "text": text.text})),
        ContentBlock::Thinking(thinking) if thinking.thinking.trim().is_empty() => None,
        ContentBlock::Thinking(thinking) => match thinking.thinking_signature.as_deref() {
            Some(signature) if same_model && !signature.trim().is_empty() => Some(json!({
                "type": "thinking",
                "thinking": thinking.thinking,
                "signature": signature,
            })),
            _ => Some(json!({"type": "text", "text": thinking.thinking})),
        },
        ContentBlock::ToolCall(call) => {
            let name = if oauth {
                to_canonical_tool_name(&call.name)
            } else {
                call.name.clone()
            };
            Some(json!({
                "type": "tool_use",
                "id": normalize_tool_call_id(&call.id),
                "name": name,
                "input": call.arguments,
            }))
        }
    }
}

/// Text-only results are a plain string; results with images become blocks.
fn tool_result_content(content: &[UserContent], model: &Model) -> Value {
    let has_images = model.supports_images()
        && content
            .iter()
            .any(|part| matches!(part, UserContent::Image(_)));
    if !has_images {
        let text = content
            .iter()
            .filter_map(UserContent::as_text)
            .collect::<Vec<_>>()
            .join("\n");
        return json!(text);
    }

    let mut blocks: Vec<Value> = content
        .iter()
        .filter_map(|part| user_block(part, model))
        .collect();
    let has_text = blocks.iter().any(|block| block["type"] == "text");
    if !has_text {
        blocks.insert(0, json!({"type": "text", "text": TOOL_IMAGE_PLACEHOLDER}));
    }
    Value::Array(blocks)
}

struct AnthropicProcessor {
    model: Model,
    /// Context tools for reversing identity-masked names; empty when masking is off.
    tools: Vec<ToolDefinition>,
    stopped: bool,
}

impl AnthropicProcessor {
    fn usage_update(usage: &Value, missing_as_zero: bool) -> UsageUpdate {
        let counter = |key: &str| {
            let value = u64_field(usage, key);
            if missing_as_zero {
                Some(value.unwrap_or(0))
            } else {
                value
            }
        };
        UsageUpdate {
            input: counter("input_tokens"),
            output: counter("output_tokens"),
            cache_read: counter("cache_read_input_tokens"),
            cache_write: counter("cache_creation_input_tokens"),
            web_search_requests: usage
                .get("server_tool_use")
                .and_then(|server| u64_field(server, "web_search_requests")),
        }
    }

    fn apply_usage(&self, builder: &mut MessageBuilder, usage: &Value, missing_as_zero: bool) {
        if !usage.is_object() {
            return;
        }
        builder
            .usage_mut()
            .apply(&Self::usage_update(usage, missing_as_zero));
        refresh_cost(builder, &self.model, None);
    }

    fn block_start(&self, builder: &mut MessageBuilder, index: u64, block: &Value) {
        match str_field(block, "type") {
            Some("text") => {
                builder.open_text(index);
            }
            Some("thinking") => {
                builder.open_thinking(index);
            }
            Some("tool_use") => {
                let id = str_field(block, "id").unwrap_or_default();
                let name = str_field(block, "name").unwrap_or_default();
                let name = if self.tools.is_empty() {
                    name.to_owned()
                } else {
                    from_canonical_tool_name(name, &self.tools)
                };
                let initial = match block.get("input") {
                    Some(Value::Object(input)) if !input.is_empty() => {
                        Value::Object(input.clone()).to_string()
                    }
                    _ => String::new(),
                };
                builder.open_tool_call(index, id, name, &initial);
            }
            other => debug!(block_type = ?other, "ignoring content block"),
        }
    }
}

impl EventProcessor for AnthropicProcessor {
    fn process(&mut self, builder: &mut MessageBuilder, event: Value) -> Result<(), ProviderError> {
        match str_field(&event, "type").unwrap_or_default() {
            "message_start" => {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                if let Some(id) = str_field(&message, "id") {
                    builder.set_response_id(id);
                }
                if let Some(usage) = message.get("usage") {
                    self.apply_usage(builder, usage, true);
                }
            }
            "content_block_start" => {
                if let (Some(index), Some(block)) =
                    (u64_field(&event, "index"), event.get("content_block"))
                {
                    self.block_start(builder, index, block);
                }
            }
            "content_block_delta" => {
                let (Some(index), Some(delta)) = (u64_field(&event, "index"), event.get("delta"))
                else {
                    return Ok(());
                };
                match str_field(delta, "type") {
                    Some("text_delta") => {
                        builder.push_text(index, str_field(delta, "text").unwrap_or_default());
                    }
                    Some("thinking_delta") => {
                        builder.push_thinking(index, str_field(delta, "thinking").unwrap_or_default());
                    }
                    Some("input_json_delta") => {
                        builder.push_tool_arguments(
                            index,
                            str_field(delta, "partial_json").unwrap_or_default(),
                        );
                    }
                    Some("signature_delta") => {
                        builder.push_thinking_signature(
                            index,
                            str_field(delta, "signature").unwrap_or_default(),
                        );
                    }
                    other => debug!(delta_type = ?other, "ignoring content block delta"),
                }
            }
            "content_block_stop" => {
                if let Some(index) = u64_field(&event, "index") {
                    builder.close(index);
                }
            }
            "message_delta" => {
                if let Some(reason) = event
                    .get("delta")
                    .and_then(|delta| str_field(delta, "stop_reason"))
                {
                    let mapped = map_stop_reason(reason)?;
                    if mapped == StopReason::Error {
                        builder.set_error_message(format!("Anthropic stopped with reason: {reason}"));
                    }
                    builder.set_stop_reason(mapped);
                }
                if let Some(usage) = event.get("usage") {
                    self.apply_usage(builder, usage, false);
                }
            }
            "message_stop" => self.stopped = true,
            "ping" => {}
            "error" => {
                let error = event.get("error").cloned().unwrap_or(Value::Null);
                let message = str_field(&error, "message").unwrap_or("An unknown error occurred");
                return Err(ProviderError::stream_failed(
                    str_field(&error, "type").map(str::to_owned),
                    message,
                ));
            }
            other => debug!(event_type = other, "ignoring anthropic event"),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ProviderError> {
        if self.stopped {
            Ok(())
        } else {
            Err(ProviderError::Truncated("message_stop"))
        }
    }
}
