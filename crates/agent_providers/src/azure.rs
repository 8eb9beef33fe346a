//! Azure OpenAI Responses adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use agent_provider::env::env_string_opt;
use agent_provider::{Api, AssistantMessageEventStream, Context, Model, StreamOptions};
use llm_transport::{EventTransport, SseTransport, TransportRequest};
use serde_json::{json, Map, Value};

use crate::call::{
    extra_headers, resolve_api_key, retry_override, spawn_call, trimmed_base_url, PreparedCall,
};
use crate::error::ProviderError;
use crate::responses::{
    apply_reasoning, convert_messages, convert_tools, push_include, ResponsesProcessor,
    WEB_SEARCH_INCLUDES,
};
use crate::ProviderAdapter;

pub const DEFAULT_API_VERSION: &str = "v1";

const TOOL_CALL_PROVIDERS: &[&str] = &["openai", "openai-codex", "opencode", "azure-openai-responses"];

/// Endpoint and deployment settings. Explicit values override the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AzureConfig {
    pub base_url: Option<String>,
    pub resource_name: Option<String>,
    pub api_version: Option<String>,
    pub deployment_name: Option<String>,
    /// Model id to deployment name.
    pub deployment_map: BTreeMap<String, String>,
}

impl AzureConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_string_opt)
    }

    /// Reads the `AZURE_OPENAI_*` variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            base_url: lookup("AZURE_OPENAI_BASE_URL"),
            resource_name: lookup("AZURE_OPENAI_RESOURCE_NAME"),
            api_version: lookup("AZURE_OPENAI_API_VERSION"),
            deployment_name: None,
            deployment_map: lookup("AZURE_OPENAI_DEPLOYMENT_NAME_MAP")
                .map(|raw| parse_deployment_map(&raw))
                .unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_resource_name(mut self, resource_name: impl Into<String>) -> Self {
        self.resource_name = Some(resource_name.into());
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = Some(api_version.into());
        self
    }

    #[must_use]
    pub fn with_deployment_name(mut self, deployment_name: impl Into<String>) -> Self {
        self.deployment_name = Some(deployment_name.into());
        self
    }

    /// Explicit base URL, then the resource endpoint, then the model's own URL.
    pub fn base_url_for(&self, model: &Model) -> Result<String, ProviderError> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };
        let url = non_empty(&self.base_url)
            .or_else(|| {
                non_empty(&self.resource_name)
                    .map(|resource| format!("https://{resource}.openai.azure.com/openai/v1"))
            })
            .or_else(|| Some(model.base_url.trim().to_owned()).filter(|url| !url.is_empty()))
            .ok_or_else(|| {
                ProviderError::InvalidRequest(
                    "Azure OpenAI base URL is required. Set AZURE_OPENAI_BASE_URL or \
                     AZURE_OPENAI_RESOURCE_NAME, or pass azureBaseUrl, azureResourceName, or model.baseUrl."
                        .to_owned(),
                )
            })?;
        Ok(trimmed_base_url(&url).to_owned())
    }

    pub fn deployment_for(&self, model: &Model) -> String {
        self.deployment_name
            .clone()
            .or_else(|| self.deployment_map.get(&model.id).cloned())
            .unwrap_or_else(|| model.id.clone())
    }

    pub fn api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION)
    }

    /// Fills every unset field from `fallback`; map entries set here win.
    #[must_use]
    pub fn or(mut self, fallback: AzureConfig) -> Self {
        self.base_url = self.base_url.or(fallback.base_url);
        self.resource_name = self.resource_name.or(fallback.resource_name);
        self.api_version = self.api_version.or(fallback.api_version);
        self.deployment_name = self.deployment_name.or(fallback.deployment_name);
        let mut deployment_map = fallback.deployment_map;
        deployment_map.append(&mut self.deployment_map);
        self.deployment_map = deployment_map;
        self
    }
}

/// Environment reader consulted on every call.
type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Parses `model=deployment,model2=deployment2`, skipping malformed entries.
pub fn parse_deployment_map(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (model, deployment) = entry.split_once('=')?;
            let (model, deployment) = (model.trim(), deployment.trim());
            (!model.is_empty() && !deployment.is_empty())
                .then(|| (model.to_owned(), deployment.to_owned()))
        })
        .collect()
}

/// Streams Azure OpenAI Responses over SSE.
///
/// The `AZURE_OPENAI_*` variables are read per call, so later changes apply
/// to the next request; fields set on the explicit config take precedence.
#[derive(Clone)]
pub struct AzureOpenAiResponsesAdapter {
    transport: Arc<dyn EventTransport>,
    config: AzureConfig,
    env: EnvLookup,
}

impl AzureOpenAiResponsesAdapter {
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self::with_transport(
            Arc::new(SseTransport::new()?),
            AzureConfig::default(),
        ))
    }

    pub fn with_transport(transport: Arc<dyn EventTransport>, config: AzureConfig) -> Self {
        Self {
            transport,
            config,
            env: Arc::new(env_string_opt),
        }
    }

    /// Replaces the process environment as the source of fallback settings.
    #[must_use]
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// Explicit settings only; see [`Self::effective_config`].
    pub fn config(&self) -> &AzureConfig {
        &self.config
    }

    /// Explicit settings over the environment as it reads right now.
    pub fn effective_config(&self) -> AzureConfig {
        self.config
            .clone()
            .or(AzureConfig::from_lookup(|key| (self.env)(key)))
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
            processor: Box::new(ResponsesProcessor::new(model)),
        })
    }
}

impl ProviderAdapter for AzureOpenAiResponsesAdapter {
    fn api(&self) -> Api {
        Api::AzureOpenAiResponses
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<TransportRequest, ProviderError> {
        let api_key = resolve_api_key(model, options)?;
        let config = self.effective_config();
        let base_url = config.base_url_for(model)?;
        let url = format!("{base_url}/responses?api-version={}", config.api_version());
        Ok(TransportRequest::new(url, build_body(&config, model, context, options)?)
            .with_header("api-key", api_key)
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
    config: &AzureConfig,
    model: &Model,
    context: &Context,
    options: &StreamOptions,
) -> Result<Value, ProviderError> {
    let mut input = convert_messages(model, context, TOOL_CALL_PROVIDERS, true);

    let mut body = Map::new();
    body.insert("model".into(), json!(config.deployment_for(model)));
    body.insert("stream".into(), json!(true));
    if let Some(session_id) = &options.session_id {
        body.insert("prompt_cache_key".into(), json!(session_id));
    }
    if let Some(max_tokens) = options.max_tokens {
        body.insert("max_output_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = options.temperature {
        body.insert("temperature".into(), json!(temperature));
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
