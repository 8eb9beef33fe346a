use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{supports_xhigh, Model};
use crate::CancelSignal;

/// Requested reasoning depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }
}

/// Token budget overrides per thinking level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThinkingBudgets {
    pub minimal: Option<u64>,
    pub low: Option<u64>,
    pub medium: Option<u64>,
    pub high: Option<u64>,
}

impl ThinkingBudgets {
    #[must_use]
    pub fn budget_for(&self, level: ThinkingLevel) -> u64 {
        match clamp_reasoning(level) {
            ThinkingLevel::Minimal => self.minimal.unwrap_or(1024),
            ThinkingLevel::Low => self.low.unwrap_or(2048),
            ThinkingLevel::Medium => self.medium.unwrap_or(8192),
            ThinkingLevel::High | ThinkingLevel::Xhigh => self.high.unwrap_or(16_384),
        }
    }
}

/// Maps `xhigh` to `high` for models that do not accept it.
#[must_use]
pub fn clamp_reasoning(level: ThinkingLevel) -> ThinkingLevel {
    match level {
        ThinkingLevel::Xhigh => ThinkingLevel::High,
        other => other,
    }
}

const MIN_OUTPUT_TOKENS: u64 = 1024;

/// Grows `max_tokens` to fit a thinking budget, shrinking the budget if the model cap is hit.
///
/// Returns `(max_tokens, thinking_budget)`.
#[must_use]
pub fn adjust_max_tokens_for_thinking(
    base_max_tokens: u64,
    model_max_tokens: u64,
    level: ThinkingLevel,
    budgets: &ThinkingBudgets,
) -> (u64, u64) {
    let mut budget = budgets.budget_for(level);
    let max_tokens = base_max_tokens.saturating_add(budget).min(model_max_tokens);
    if max_tokens <= budget {
        budget = max_tokens.saturating_sub(MIN_OUTPUT_TOKENS);
    }
    (max_tokens, budget)
}

/// Prompt-cache retention preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRetention {
    None,
    #[default]
    Short,
    Long,
}

/// Streaming transport preference for vendors that offer more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Sse,
    WebSocket,
    /// WebSocket first, SSE when the socket never started.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WebSearchLocation {
    pub city: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WebSearchOptions {
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub max_uses: Option<u32>,
    pub user_location: Option<WebSearchLocation>,
    /// `low` | `medium` | `high` (Responses API only).
    pub search_context_size: Option<String>,
}

/// Vendor-hosted tools toggled per call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NativeTools {
    pub web_search: Option<WebSearchOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool(String),
}

/// Per-call options shared by every adapter. Adapters ignore what they do not support.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub api_key: Option<String>,
    pub transport: Transport,
    pub cache_retention: Option<CacheRetention>,
    pub session_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub metadata_user_id: Option<String>,
    pub native_tools: NativeTools,
    pub reasoning: Option<ThinkingLevel>,
    pub thinking_budgets: ThinkingBudgets,
    pub reasoning_summary: Option<String>,
    pub text_verbosity: Option<String>,
    pub service_tier: Option<String>,
    pub tool_choice: Option<ToolChoice>,
    pub previous_response_id: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_base_delay: Option<Duration>,
    pub cancel: Option<CancelSignal>,
}

impl StreamOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_cache_retention(mut self, retention: CacheRetention) -> Self {
        self.cache_retention = Some(retention);
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self, level: ThinkingLevel) -> Self {
        self.reasoning = Some(level);
        self
    }

    #[must_use]
    pub fn with_thinking_budgets(mut self, budgets: ThinkingBudgets) -> Self {
        self.thinking_budgets = budgets;
        self
    }

    #[must_use]
    pub fn with_web_search(mut self, web_search: WebSearchOptions) -> Self {
        self.native_tools.web_search = Some(web_search);
        self
    }

    #[must_use]
    pub fn with_service_tier(mut self, tier: impl Into<String>) -> Self {
        self.service_tier = Some(tier.into());
        self
    }

    #[must_use]
    pub fn with_previous_response_id(mut self, id: Option<String>) -> Self {
        self.previous_response_id = id;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_base_delay = Some(base_delay);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Explicit retention, else the environment default.
    #[must_use]
    pub fn resolved_cache_retention(&self) -> CacheRetention {
        self.cache_retention
            .unwrap_or_else(crate::env::default_cache_retention)
    }

    /// Explicit max tokens, else the model cap limited to 32k.
    #[must_use]
    pub fn max_tokens_for(&self, model: &Model) -> u64 {
        self.max_tokens
            .unwrap_or_else(|| model.max_tokens.min(32_000))
    }

    /// Reasoning level after clamping `xhigh` for models without it.
    #[must_use]
    pub fn reasoning_for(&self, model: &Model) -> Option<ThinkingLevel> {
        self.reasoning.map(|level| {
            if supports_xhigh(model) {
                level
            } else {
                clamp_reasoning(level)
            }
        })
    }
}
