//! OpenAI Responses adapter.

use std::sync::Arc;

use agent_provider::{
    Api, AssistantMessageEventStream, CacheRetention, Context, Model, StreamOptions,
};
use llm_transport::{EventTransport, SseTransport, TransportRequest};
use serde_json::{json, Map, Value};

use crate::call::{
    extra_headers, resolve_api_key, retry_override, spawn_call, trimmed_base_url, PreparedCall,
};
use crate::error::ProviderError;
use crate::responses::{
    apply_reasoning, convert_messages, convert_tools, push_include, ResponsesProcessor,
    OPENAI_TOOL_CALL_PROVIDERS, WEB_SEARCH_INCLUDES,
};
use crate::ProviderAdapter;

/// Streams the OpenAI Responses API over SSE.
#[derive(Clone)]
pub struct OpenAiResponsesAdapter {
    transport: Arc<dyn EventTransport>,
}

impl OpenAiResponsesAdapter {
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
        Ok(PreparedCall {
            transport: Arc::clone(&self.transport),
            request: self.build_request(model, context, options)?,
            processor: Box::new(
                ResponsesProcessor::new(model)
                    .with_service_tier_pricing(options.service_tier.clone()),
            ),
        })
    }
}

impl ProviderAdapter for OpenAiResponsesAdapter {
    fn api(&self) -> Api {
        Api::OpenAiResponses
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<TransportRequest, ProviderError> {
        let api_key = resolve_api_key(model, options)?;
        Ok(TransportRequest::new(
            format!("{}/responses", trimmed_base_url(&model.base_url)),
            build_body(model, context, options)?,
        )
        .with_header("authorization", format!("Bearer {api_key}"))
        .with_header("content-type", "application/json")
        .with_header("accept", "text/event-stream")
        .with_headers(extra_headers(model, options))
        .with_session_id(options.session_id.clone())
        .with_retry(retry_override(options)))
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
    let retention = options.resolved_cache_retention();
    let mut input = convert_messages(model, context, OPENAI_TOOL_CALL_PROVIDERS, true);

    let mut body = Map::new();
    body.insert("model".into(), json!(model.id));
    body.insert("stream".into(), json!(true));
    body.insert("store".into(), json!(false));

    if retention != CacheRetention::None {
        if let Some(session_id) = &options.session_id {
            body.insert("prompt_cache_key".into(), json!(session_id));
        }
    }
    if retention == CacheRetention::Long && model.base_url.contains("api.openai.com") {
        body.insert("prompt_cache_retention".into(), json!("24h"));
    }
    if let Some(max_tokens) = options.max_tokens {
        body.insert("max_output_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = options.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if let Some(tier) = &options.service_tier {
        body.insert("service_tier".into(), json!(tier));
    }

    let web_search = options.native_tools.web_search.as_ref();
    if !context.tools.is_empty() || web_search.is_some() {
        body.insert(
            "tools".into(),
            Value::Array(convert_tools(&context.tools, json!(false), web_search)?),
        );
    }
    if web_search.is_some() {
        for include in WEB_SEARCH_INCLUDES {
            push_include(&mut body, include);
        }
    }

    apply_reasoning(&mut body, &mut input, model, options);
    body.insert("input".into(), Value::Array(input));
    Ok(Value::Object(body))
}
