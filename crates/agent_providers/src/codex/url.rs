/// Base URL used when the model leaves it empty.
pub const DEFAULT_CODEX_BASE_URL: &str = "https://chatgpt.com/backend-api";

/// Resolves a base URL to the Codex responses endpoint.
///
/// A URL already ending in `/codex/responses` is kept, one ending in `/codex`
/// gains `/responses`, anything else gains `/codex/responses`.
pub fn normalize_codex_url(input: &str) -> String {
    let base = match input.trim() {
        "" => DEFAULT_CODEX_BASE_URL,
        base => base,
    };

    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/codex/responses") {
        trimmed.to_owned()
    } else if trimmed.ends_with("/codex") {
        format!("{trimmed}/responses")
    } else {
        format!("{trimmed}/codex/responses")
    }
}
