use reqwest::StatusCode;

use llm_transport::error::parse_error_message;
use llm_transport::TransportError;

#[test]
fn parse_error_message_is_friendly_on_usage_limit() {
    let body = r#"{"error":{"code":"usage_limit_reached","message":"cap exceeded","plan_type":"Pro","resets_at":1731234567}}"#;

    let message = parse_error_message(StatusCode::TOO_MANY_REQUESTS, body);
    assert!(message.starts_with("You have hit your ChatGPT usage limit (pro plan)."));
    assert!(message.contains("Try again in ~0 min."));
}

#[test]
fn parse_error_message_uses_vendor_message_when_present() {
    let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"invalid model"}}"#;
    let message = parse_error_message(StatusCode::BAD_REQUEST, body);
    assert_eq!(message, "invalid model");
}

#[test]
fn parse_error_message_falls_back_to_raw_body_or_reason() {
    assert_eq!(
        parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, "raw failure text"),
        "raw failure text"
    );
    assert_eq!(
        parse_error_message(StatusCode::SERVICE_UNAVAILABLE, ""),
        "Service Unavailable"
    );
}

#[test]
fn usage_limit_status_becomes_distinct_error() {
    let error = TransportError::from_status(
        StatusCode::TOO_MANY_REQUESTS,
        r#"{"error":{"code":"rate_limit_exceeded"}}"#,
        true,
    );
    assert!(matches!(error, TransportError::UsageLimit { .. }));
    assert_eq!(error.to_string(), "You have hit your ChatGPT usage limit.");

    let error = TransportError::from_status(
        StatusCode::UNAUTHORIZED,
        r#"{"error":{"message":"bad key"}}"#,
        true,
    );
    assert!(matches!(error, TransportError::Status { status: 401, .. }));
    assert_eq!(error.to_string(), "HTTP 401: bad key");
}

#[test]
fn plain_vendor_errors_skip_usage_limit_rewrite() {
    let error = TransportError::from_status(
        StatusCode::TOO_MANY_REQUESTS,
        r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        false,
    );
    assert!(matches!(error, TransportError::Status { status: 429, .. }));
    assert_eq!(error.to_string(), "HTTP 429: slow down");
}

#[test]
fn connect_failures_and_cancellation_are_distinguishable() {
    assert!(TransportError::WebSocketConnect("refused".into()).is_connect_failure());
    assert!(!TransportError::WebSocket("reset".into()).is_connect_failure());
    assert!(TransportError::Cancelled.is_cancelled());
    assert_eq!(TransportError::Cancelled.to_string(), "Request was aborted");
}
