use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{Cost, Usage};

/// Wire protocol tag used to select a provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Api {
    #[serde(rename = "anthropic-messages")]
    AnthropicMessages,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "azure-openai-responses")]
    AzureOpenAiResponses,
    #[serde(rename = "openai-codex-responses")]
    OpenAiCodexResponses,
}

impl Api {
    pub const ALL: [Api; 4] = [
        Self::AnthropicMessages,
        Self::OpenAiResponses,
        Self::AzureOpenAiResponses,
        Self::OpenAiCodexResponses,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnthropicMessages => "anthropic-messages",
            Self::OpenAiResponses => "openai-responses",
            Self::AzureOpenAiResponses => "azure-openai-responses",
            Self::OpenAiCodexResponses => "openai-codex-responses",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|api| api.as_str() == value)
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Static description of one model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub name: String,
    pub api: Api,
    pub provider: String,
    pub base_url: String,
    pub reasoning: bool,
    pub input: Vec<InputModality>,
    pub cost: ModelCost,
    pub context_window: u64,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Model {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        api: Api,
        provider: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            api,
            provider: provider.into(),
            base_url: base_url.into(),
            reasoning: false,
            input: vec![InputModality::Text],
            cost: ModelCost::default(),
            context_window: 128_000,
            max_tokens: 16_384,
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = reasoning;
        self
    }

    #[must_use]
    pub fn with_images(mut self) -> Self {
        if !self.input.contains(&InputModality::Image) {
            self.input.push(InputModality::Image);
        }
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: ModelCost) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, context_window: u64, max_tokens: u64) -> Self {
        self.context_window = context_window;
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn supports_images(&self) -> bool {
        self.input.contains(&InputModality::Image)
    }
}

/// Computes monetary cost from token counts and per-million rates.
#[must_use]
pub fn calculate_cost(rates: &ModelCost, usage: &Usage) -> Cost {
    let per_token = |rate: f64, count: u64| rate / 1_000_000.0 * count as f64;
    let input = per_token(rates.input, usage.input);
    let output = per_token(rates.output, usage.output);
    let cache_read = per_token(rates.cache_read, usage.cache_read);
    let cache_write = per_token(rates.cache_write, usage.cache_write);
    let web_search = usage.web_search_requests as f64 * 0.01;
    Cost {
        input,
        output,
        cache_read,
        cache_write,
        web_search,
        total: input + output + cache_read + cache_write + web_search,
    }
}

/// Post-processing hook scaling token cost by service tier (`flex` halves, `priority` doubles).
#[must_use]
pub fn apply_service_tier(cost: Cost, service_tier: Option<&str>) -> Cost {
    let multiplier = match service_tier {
        Some("flex") => 0.5,
        Some("priority") => 2.0,
        _ => return cost,
    };
    let input = cost.input * multiplier;
    let output = cost.output * multiplier;
    let cache_read = cost.cache_read * multiplier;
    let cache_write = cost.cache_write * multiplier;
    Cost {
        input,
        output,
        cache_read,
        cache_write,
        web_search: cost.web_search,
        total: input + output + cache_read + cache_write + cost.web_search,
    }
}

/// Explicit model catalog, constructed once and passed by reference.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    providers: BTreeMap<String, BTreeMap<String, Model>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `model`, replacing any entry with the same provider and id.
    pub fn register(&mut self, model: Model) {
        self.providers
            .entry(model.provider.clone())
            .or_default()
            .insert(model.id.clone(), model);
    }

    #[must_use]
    pub fn with_model(mut self, model: Model) -> Self {
        self.register(model);
        self
    }

    #[must_use]
    pub fn get(&self, provider: &str, model_id: &str) -> Option<&Model> {
        self.providers.get(provider)?.get(model_id)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn models<'a>(&'a self, provider: &str) -> impl Iterator<Item = &'a Model> + 'a {
        self.providers
            .get(provider)
            .into_iter()
            .flat_map(|models| models.values())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether the model accepts the `xhigh` reasoning level.
#[must_use]
pub fn supports_xhigh(model: &Model) -> bool {
    model.id.contains("gpt-5.2")
        || model.id.contains("gpt-5.3")
        || model.id.contains("opus-4-6")
        || model.id.contains("opus-4.6")
}

#[must_use]
pub fn models_are_equal(left: Option<&Model>, right: Option<&Model>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => left.id == right.id && left.provider == right.provider,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn model(id: &str, provider: &str) -> Model {
        Model::new(id, Api::OpenAiResponses, provider, "https://api.openai.com/v1")
    }

    #[test]
    fn api_tags_round_trip_through_parse() {
        for api in Api::ALL {
            assert_eq!(Api::parse(api.as_str()), Some(api));
        }
        assert_eq!(Api::parse("google-generative-ai"), None);
    }

    #[test]
    fn registry_lookups_are_scoped_by_provider() {
        let registry = ModelRegistry::new()
            .with_model(model("gpt-5.2", "openai"))
            .with_model(model("gpt-5.2", "azure"))
            .with_model(model("gpt-5.1", "openai"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.providers().collect::<Vec<_>>(), vec!["azure", "openai"]);
        assert_eq!(registry.models("openai").count(), 2);
        assert!(registry.get("openai", "gpt-5.1").is_some());
        assert!(registry.get("azure", "gpt-5.1").is_none());
        assert!(models_are_equal(
            registry.get("openai", "gpt-5.2"),
            registry.get("openai", "gpt-5.2")
        ));
        assert!(!models_are_equal(
            registry.get("openai", "gpt-5.2"),
            registry.get("azure", "gpt-5.2")
        ));
    }

    #[test]
    fn cost_is_per_million_tokens() {
        let rates = ModelCost {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        };
        let usage = Usage {
            input: 1_000_000,
            output: 200_000,
            cache_read: 500_000,
            cache_write: 0,
            ..Usage::default()
        };

        let cost = calculate_cost(&rates, &usage);
        assert!((cost.input - 3.0).abs() < 1e-9);
        assert!((cost.output - 3.0).abs() < 1e-9);
        assert!((cost.cache_read - 0.15).abs() < 1e-9);
        assert!((cost.total - 6.15).abs() < 1e-9);

        let flex = apply_service_tier(cost.clone(), Some("flex"));
        assert!((flex.total - 3.075).abs() < 1e-9);
        assert_eq!(apply_service_tier(cost.clone(), Some("default")), cost);
    }

    #[test]
    fn xhigh_support_follows_model_family() {
        assert!(supports_xhigh(&model("gpt-5.2-codex", "openai")));
        assert!(!supports_xhigh(&model("gpt-5.1", "openai")));
        assert!(supports_xhigh(&model("claude-opus-4-6", "anthropic")));
    }
}
