//! Environment fallbacks for credentials and defaults.

use crate::options::CacheRetention;

/// Returns the trimmed value of `key` when set and non-empty.
#[must_use]
pub fn env_string_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Interprets `1`/`true`/`yes` (any case) as enabled.
#[must_use]
pub fn env_flag(key: &str) -> bool {
    env_string_opt(key).is_some_and(|value| {
        matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    })
}

/// Environment variables consulted for a provider's credential, in order.
#[must_use]
pub fn api_key_vars(provider: &str) -> &'static [&'static str] {
    match provider {
        "anthropic" => &["ANTHROPIC_OAUTH_TOKEN", "ANTHROPIC_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "azure-openai-responses" => &["AZURE_OPENAI_API_KEY"],
        "openai-codex" => &["OPENAI_CODEX_TOKEN"],
        _ => &[],
    }
}

/// Credential for `provider` from the process environment.
#[must_use]
pub fn env_api_key(provider: &str) -> Option<String> {
    env_api_key_with(provider, env_string_opt)
}

/// Same as [`env_api_key`] with an injectable lookup.
pub fn env_api_key_with(provider: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    api_key_vars(provider).iter().find_map(|key| lookup(key))
}

/// `AGENT_CACHE_RETENTION=long` upgrades the default retention.
#[must_use]
pub fn default_cache_retention() -> CacheRetention {
    match env_string_opt("AGENT_CACHE_RETENTION").as_deref() {
        Some("long") => CacheRetention::Long,
        Some("none") => CacheRetention::None,
        _ => CacheRetention::Short,
    }
}
