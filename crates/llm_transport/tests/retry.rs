use std::time::Duration;

use llm_transport::retry::{is_retryable_http_error, retry_delay_ms, RetryPolicy};
use llm_transport::TransportError;
use reqwest::StatusCode;

#[test]
fn transient_statuses_and_texts_are_retried() {
    let cases = [
        (429, "", true),
        (500, "", true),
        (502, "", true),
        (503, "", true),
        (504, "", true),
        (501, "", false),
        (401, "unauthorized", false),
        (400, "rate limit exceeded", true),
        (400, "Rate-Limit hit", true),
        (400, "Overloaded", true),
        (400, "service unavailable", true),
        (400, "upstream connect error", true),
        (400, "connection refused", true),
        (400, "invalid model", false),
    ];
    for (status, text, expected) in cases {
        assert_eq!(is_retryable_http_error(status, text), expected, "{status} {text:?}");
    }
}

#[test]
fn default_backoff_doubles_from_one_second() {
    let delays: Vec<u128> = (0..4).map(|attempt| retry_delay_ms(attempt).as_millis()).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    assert_eq!(RetryPolicy::default().max_retries, 3);
}

#[test]
fn huge_attempt_numbers_saturate() {
    let policy = RetryPolicy::new(100, Duration::from_secs(1));
    assert!(policy.delay(64) >= policy.delay(30));
}

#[test]
fn usage_limit_bodies_become_usage_limit_errors() {
    let body = r#"{"error":{"code":"usage_not_included","plan_type":"Team"}}"#;

    match TransportError::from_status(StatusCode::FORBIDDEN, body, true) {
        TransportError::UsageLimit { message } => {
            assert_eq!(message, "You have hit your ChatGPT usage limit (team plan).");
        }
        other => panic!("expected a usage limit, got {other:?}"),
    }
    match TransportError::from_status(StatusCode::FORBIDDEN, body, false) {
        TransportError::Status { status, .. } => assert_eq!(status, 403),
        other => panic!("expected a plain status error, got {other:?}"),
    }
}
