//! OpenAI Codex Responses adapter (ChatGPT backend), over SSE or pooled WebSockets.

pub mod headers;
pub mod url;

use std::sync::Arc;

use agent_provider::{
    Api, AssistantMessageEventStream, Context, MessageBuilder, Model, StreamOptions,
    ThinkingLevel, Transport,
};
use llm_transport::{
    EventTransport, FallbackTransport, SseTransport, TransportRequest, WebSocketTransport,
};
use serde_json::{json, Map, Value};

use crate::call::{
    extra_headers, resolve_api_key, retry_override, spawn_call, str_field, EventProcessor,
    PreparedCall,
};
use crate::error::ProviderError;
use crate::responses::{
    convert_messages, convert_tools, push_include, ResponsesProcessor, INCLUDE_REASONING,
    OPENAI_TOOL_CALL_PROVIDERS, WEB_SEARCH_INCLUDES,
};
use crate::ProviderAdapter;

pub use headers::{build_headers, default_pi_user_agent, extract_account_id};
pub use url::{normalize_codex_url, DEFAULT_CODEX_BASE_URL};

const VALID_STATUSES: [&str; 6] = [
    "completed",
    "incomplete",
    "failed",
    "cancelled",
    "queued",
    "in_progress",
];

/// Reasoning effort the given Codex model accepts for `level`.
pub fn clamp_reasoning_effort(model_id: &str, level: ThinkingLevel) -> &'static str {
    let id = model_id.rsplit('/').next().unwrap_or(model_id);
    match level {
        ThinkingLevel::Minimal if id.starts_with("gpt-5.2") || id.starts_with("gpt-5.3") => "low",
        ThinkingLevel::Xhigh if id == "gpt-5.1" => "high",
        ThinkingLevel::High | ThinkingLevel::Xhigh if id == "gpt-5.1-codex-mini" => "high",
        _ if id == "gpt-5.1-codex-mini" => "medium",
        other => other.as_str(),
    }
}

/// Streams the Codex backend, choosing SSE, WebSocket or WebSocket-with-fallback per call.
#[derive(Clone)]
pub struct CodexAdapter {
    sse: Arc<dyn EventTransport>,
    websocket: Arc<dyn EventTransport>,
}

impl CodexAdapter {
    pub fn new() -> Result<Self, ProviderError> {
        let sse = SseTransport::new()?.with_usage_limit_messages(true);
        let websocket =
            WebSocketTransport::default().with_header(headers::HEADER_OPENAI_BETA, headers::WEBSOCKET_BETA);
        Ok(Self::with_transports(Arc::new(sse), Arc::new(websocket)))
    }

    pub fn with_transports(
        sse: Arc<dyn EventTransport>,
        websocket: Arc<dyn EventTransport>,
    ) -> Self {
        Self { sse, websocket }
    }

    fn transport_for(&self, transport: Transport) -> Arc<dyn EventTransport> {
        match transport {
            Transport::Sse => Arc::clone(&self.sse),
            Transport::WebSocket => Arc::clone(&self.websocket),
            Transport::Auto => Arc::new(FallbackTransport::new(
                Arc::clone(&self.websocket),
                Arc::clone(&self.sse),
            )),
        }
    }

    fn prepare(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<PreparedCall, ProviderError> {
        Ok(PreparedCall {
            transport: self.transport_for(options.transport),
            request: self.build_request(model, context, options)?,
            processor: Box::new(CodexProcessor {
                inner: ResponsesProcessor::new(model),
            }),
        })
    }
}

impl ProviderAdapter for CodexAdapter {
    fn api(&self) -> Api {
        Api::OpenAiCodexResponses
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<TransportRequest, ProviderError> {
        let token = resolve_api_key(model, options)?;
        let account_id = extract_account_id(&token).ok_or_else(|| {
            ProviderError::InvalidRequest("Failed to extract accountId from token".to_owned())
        })?;
        let headers = build_headers(
            &token,
            &account_id,
            options.session_id.as_deref(),
            &extra_headers(model, options),
        );
        Ok(
            TransportRequest::new(normalize_codex_url(&model.base_url), build_body(model, context, options)?)
                .with_headers(headers)
                .with_session_id(options.session_id.clone())
                .with_retry(retry_override(options)),
        )
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

fn build_body(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
) -> Result<Value, ProviderError> {
    let mut body = Map::new();
    body.insert("model".into(), json!(model.id));
    body.insert("store".into(), json!(false));
    body.insert("stream".into(), json!(true));
    if let Some(prompt) = context.system_prompt() {
        body.insert("instructions".into(), json!(prompt));
    }
    body.insert(
        "input".into(),
        Value::Array(convert_messages(model, context, OPENAI_TOOL_CALL_PROVIDERS, false)),
    );
    body.insert(
        "text".into(),
        json!({"verbosity": options.text_verbosity.as_deref().unwrap_or("medium")}),
    );
    push_include(&mut body, INCLUDE_REASONING);
    if let Some(session_id) = &options.session_id {
        body.insert("prompt_cache_key".into(), json!(session_id));
    }
    body.insert("tool_choice".into(), json!("auto"));
    body.insert("parallel_tool_calls".into(), json!(true));
    if let Some(temperature) = options.temperature {
        body.insert("temperature".into(), json!(temperature));
    }

    let web_search = options.native_tools.web_search.as_ref();
    if !context.tools.is_empty() || web_search.is_some() {
        body.insert(
            "tools".into(),
            Value::Array(convert_tools(&context.tools, Value::Null, web_search)?),
        );
    }
    if web_search.is_some() {
        for include in WEB_SEARCH_INCLUDES {
            push_include(&mut body, include);
        }
    }

    if let Some(level) = options.reasoning_for(model) {
        body.insert(
            "reasoning".into(),
            json!({
                "effort": clamp_reasoning_effort(&model.id, level),
                "summary": options.reasoning_summary.as_deref().unwrap_or("auto"),
            }),
        );
    }

    if options.transport == Transport::WebSocket {
        if let Some(previous) = &options.previous_response_id {
            body.insert("previous_response_id".into(), json!(previous));
        }
    }

    Ok(Value::Object(body))
}

/// Normalizes Codex event quirks before the shared Responses processing.
struct CodexProcessor {
    inner: ResponsesProcessor,
}

impl EventProcessor for CodexProcessor {
    fn process(&mut self, builder: &mut MessageBuilder, mut event: Value) -> Result<(), ProviderError> {
        let kind = str_field(&event, "type").unwrap_or_default().to_owned();
        match kind.as_str() {
            "error" => {
                let code = str_field(&event, "code").map(str::to_owned);
                let detail = str_field(&event, "message")
                    .map(str::to_owned)
                    .or_else(|| code.clone())
                    .unwrap_or_else(|| event.to_string());
                Err(ProviderError::stream_failed(code, format!("Codex error: {detail}")))
            }
            "response.failed" => {
                let message = event
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .and_then(|error| str_field(error, "message"))
                    .unwrap_or("Codex response failed");
                Err(ProviderError::stream_failed(None, message))
            }
            "response.done" | "response.completed" => {
                event["type"] = json!("response.completed");
                if let Some(response) = event.get_mut("response").and_then(Value::as_object_mut) {
                    let known = response
                        .get("status")
                        .and_then(Value::as_str)
                        .map_or(true, |status| VALID_STATUSES.contains(&status));
                    if !known {
                        response.remove("status");
                    }
                }
                self.inner.process(builder, event)
            }
            _ => self.inner.process(builder, event),
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_provider::{assistant_message_stream, Message, StopReason};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reasoning_effort_is_clamped_per_model() {
        assert_eq!(clamp_reasoning_effort("gpt-5.2-codex", ThinkingLevel::Minimal), "low");
        assert_eq!(clamp_reasoning_effort("openai/gpt-5.3", ThinkingLevel::Minimal), "low");
        assert_eq!(clamp_reasoning_effort("gpt-5.1", ThinkingLevel::Xhigh), "high");
        assert_eq!(clamp_reasoning_effort("gpt-5.1-codex-mini", ThinkingLevel::Xhigh), "high");
        assert_eq!(clamp_reasoning_effort("gpt-5.1-codex-mini", ThinkingLevel::Low), "medium");
        assert_eq!(clamp_reasoning_effort("gpt-5.1-codex", ThinkingLevel::Minimal), "minimal");
    }

    #[test]
    fn body_uses_instructions_and_threads_previous_response_on_websocket() {
        let model = Model::new("gpt-5.1-codex", Api::OpenAiCodexResponses, "openai-codex", "")
            .with_reasoning(true);
        let context = Context::new(Some("sys".into()), vec![Message::user_text("hi")]);
        let options = StreamOptions::new()
            .with_session_id("s-1")
            .with_reasoning(ThinkingLevel::High)
            .with_transport(Transport::WebSocket)
            .with_previous_response_id(Some("resp_1".into()));

        let body = build_body(&model, &context, &options).expect("body");

        assert_eq!(body["instructions"], "sys");
        assert_eq!(body["input"][0]["role"], "user");
        assert_eq!(body["text"], json!({"verbosity": "medium"}));
        assert_eq!(body["include"], json!([INCLUDE_REASONING]));
        assert_eq!(body["prompt_cache_key"], "s-1");
        assert_eq!(body["reasoning"], json!({"effort": "high", "summary": "auto"}));
        assert_eq!(body["previous_response_id"], "resp_1");

        let sse = options.with_transport(Transport::Sse);
        let body = build_body(&model, &context, &sse).expect("body");
        assert_eq!(body.get("previous_response_id"), None);
    }

    #[test]
    fn response_done_with_unknown_status_finishes_as_stop() {
        let model = Model::new("gpt-5.1-codex", Api::OpenAiCodexResponses, "openai-codex", "");
        let (sink, _stream) = assistant_message_stream();
        let mut builder = MessageBuilder::new(&model, sink);
        let mut processor = CodexProcessor {
            inner: ResponsesProcessor::new(&model),
        };

        processor
            .process(
                &mut builder,
                json!({"type": "response.done", "response": {"id": "resp_9", "status": "weird"}}),
            )
            .expect("normalized");

        assert_eq!(builder.stop_reason(), StopReason::Stop);
        assert_eq!(builder.message().response_id.as_deref(), Some("resp_9"));
    }

    #[test]
    fn codex_error_events_carry_vendor_message() {
        let model = Model::new("gpt-5.1-codex", Api::OpenAiCodexResponses, "openai-codex", "");
        let (sink, _stream) = assistant_message_stream();
        let mut builder = MessageBuilder::new(&model, sink);
        let mut processor = CodexProcessor {
            inner: ResponsesProcessor::new(&model),
        };

        let error = processor
            .process(&mut builder, json!({"type": "error", "code": "rate_limited"}))
            .expect_err("error event");
        assert_eq!(error.to_string(), "Codex error: rate_limited");
    }
}
