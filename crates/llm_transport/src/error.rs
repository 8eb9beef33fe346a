use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::Deserialize;

/// Failures surfaced by the SSE and WebSocket transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No API key for provider: {0}")]
    MissingCredential(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("{message}")]
    UsageLimit { message: String },
    #[error(
        "retry exhausted after max attempts (status: {}, last_error: {})",
        display_status(.status),
        display_last_error(.last_error)
    )]
    RetryExhausted {
        status: Option<u16>,
        last_error: Option<String>,
    },
    #[error("{message}")]
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    #[error("WebSocket connect failed: {0}")]
    WebSocketConnect(String),
    #[error("{0}")]
    WebSocketClosed(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Request was aborted")]
    Cancelled,
}

impl TransportError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the socket never opened, so nothing was sent.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::WebSocketConnect(_))
    }

    /// Builds the error for a non-success HTTP response body.
    ///
    /// With `usage_limits` set, quota errors become [`TransportError::UsageLimit`]
    /// carrying the friendly message from [`parse_error_message`].
    #[must_use]
    pub fn from_status(status: StatusCode, body: &str, usage_limits: bool) -> Self {
        let message = if usage_limits {
            parse_error_message(status, body)
        } else {
            vendor_error_message(status, body)
        };
        if usage_limits && has_usage_limit_message(&message) {
            Self::UsageLimit { message }
        } else {
            Self::Status {
                status: status.as_u16(),
                message,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(rename = "error")]
    value: Option<ErrorPayloadFields>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayloadFields {
    message: Option<String>,
    code: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    plan_type: Option<String>,
    resets_at: Option<u64>,
}

impl ErrorPayloadFields {
    /// Friendly text for quota errors: `code` (or `type`) names the limit, or the status is 429.
    fn usage_limit_message(&self, status: StatusCode) -> Option<String> {
        let code = [self.code.as_deref(), self.type_.as_deref()]
            .into_iter()
            .flatten()
            .find(|code| !code.is_empty())
            .unwrap_or_default();
        if status != StatusCode::TOO_MANY_REQUESTS && !is_usage_limit_code(code) {
            return None;
        }

        let mut message = String::from("You have hit your ChatGPT usage limit");
        if let Some(plan) = self.plan_type.as_deref().filter(|plan| !plan.is_empty()) {
            message.push_str(&format!(" ({} plan)", plan.to_ascii_lowercase()));
        }
        message.push('.');
        if let Some(minutes) = self.resets_at.and_then(minutes_until) {
            message.push_str(&format!(" Try again in ~{minutes} min."));
        }
        Some(message)
    }
}

/// Whole minutes from now until the epoch-seconds timestamp, never negative.
fn minutes_until(reset_secs: u64) -> Option<i64> {
    if reset_secs == 0 {
        return None;
    }
    let reset_ms = i64::try_from(reset_secs).ok()?.checked_mul(1000)?;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
    let remaining = reset_ms.saturating_sub(now_ms).max(0);
    Some((remaining as f64 / 60_000.0).round() as i64)
}

/// Extracts a human-readable message from a vendor error body.
///
/// Usage-limit errors (HTTP 429 or a usage-limit code) get a friendly message
/// with the plan and reset hint when present.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        if body.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.to_string()
        }
    };

    let Ok(parsed) = serde_json::from_str::<ErrorPayload>(body) else {
        return fallback();
    };

    let Some(error) = parsed.value else {
        return fallback();
    };
    error
        .usage_limit_message(status)
        .or_else(|| error.message.filter(|message| !message.is_empty()))
        .unwrap_or_else(fallback)
}

/// Vendor `error.message`, else the raw body, else the status reason.
pub fn vendor_error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .and_then(|payload| payload.value)
        .and_then(|error| error.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.to_string()
            }
        })
}

pub(crate) fn has_usage_limit_message(message: &str) -> bool {
    message.contains("usage limit")
}

fn is_usage_limit_code(code: &str) -> bool {
    ["usage_limit_reached", "usage_not_included", "rate_limit_exceeded"]
        .iter()
        .any(|known| code.eq_ignore_ascii_case(known))
}

fn display_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "n/a".to_owned(), |status| status.to_string())
}

fn display_last_error(error: &Option<String>) -> &str {
    error.as_deref().unwrap_or("none")
}
