//! Vendor adapters that turn a model call into a unified assistant event stream.
//!
//! Each adapter shapes the vendor request, hands it to an
//! [`llm_transport::EventTransport`], and maps the vendor's JSON events onto
//! an [`agent_provider::MessageBuilder`]. [`AdapterRegistry`] selects the
//! adapter by the model's [`Api`] tag.

pub mod anthropic;
pub mod azure;
mod call;
pub mod codex;
pub mod error;
mod history;
pub mod openai;
pub mod responses;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use agent_provider::{
    Api, AssistantMessageEventStream, Context, Model, StreamOptions, StreamProvider,
};
use llm_transport::TransportRequest;

pub use anthropic::AnthropicAdapter;
pub use azure::{AzureConfig, AzureOpenAiResponsesAdapter};
pub use codex::CodexAdapter;
pub use error::ProviderError;
pub use openai::OpenAiResponsesAdapter;

/// One vendor wire protocol.
pub trait ProviderAdapter: Send + Sync {
    fn api(&self) -> Api;

    /// Vendor request for one call, without sending it.
    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<TransportRequest, ProviderError>;

    /// Starts the call on the current tokio runtime.
    ///
    /// Never fails directly: problems end the stream with an `error` event.
    fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AssistantMessageEventStream;
}

/// Adapters keyed by [`Api`].
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Api, Arc<dyn ProviderAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut apis: Vec<_> = self.adapters.keys().map(|api| api.as_str()).collect();
        apis.sort_unstable();
        f.debug_struct("AdapterRegistry").field("apis", &apis).finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four built-in adapters over real HTTP/WebSocket transports.
    pub fn with_defaults() -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        registry.register(Arc::new(AnthropicAdapter::new()?));
        registry.register(Arc::new(OpenAiResponsesAdapter::new()?));
        registry.register(Arc::new(AzureOpenAiResponsesAdapter::new()?));
        registry.register(Arc::new(CodexAdapter::new()?));
        Ok(registry)
    }

    /// Registers `adapter`, replacing any adapter for the same api.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.api(), adapter);
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, api: Api) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(&api)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl StreamProvider for AdapterRegistry {
    fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AssistantMessageEventStream {
        match self.get(model.api) {
            Some(adapter) => adapter.stream(model, context, options),
            None => call::spawn_call(model, options, Err(ProviderError::UnknownApi(model.api))),
        }
    }
}
