use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use crate::cancel::{await_or_cancel, check_cancelled, sleep_or_cancel, CancelSignal};
use crate::error::{has_usage_limit_message, TransportError};
use crate::retry::{is_retryable_http_error, RetryPolicy};
use crate::sse::SseDecoder;
use crate::transport::{EventHandler, EventTransport, TransportRequest};

/// HTTP POST with retry, decoding a `text/event-stream` response.
#[derive(Debug, Clone)]
pub struct SseTransport {
    http: Client,
    retry: RetryPolicy,
    usage_limit_messages: bool,
}

impl SseTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(None)
    }

    /// Client with an overall request timeout.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            retry: RetryPolicy::default(),
            usage_limit_messages: false,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Rewrites quota errors into the friendly usage-limit message and stops retrying them.
    #[must_use]
    pub fn with_usage_limit_messages(mut self, enabled: bool) -> Self {
        self.usage_limit_messages = enabled;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn build_request(
        &self,
        request: &TransportRequest,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let url = url::Url::parse(&request.url)
            .map_err(|error| TransportError::InvalidRequest(format!("{}: {error}", request.url)))?;
        Ok(self
            .http
            .post(url)
            .headers(header_map(request)?)
            .json(&request.body))
    }

    pub async fn send_with_retry(
        &self,
        request: &TransportRequest,
        cancel: Option<&CancelSignal>,
    ) -> Result<Response, TransportError> {
        let policy = request.retry.unwrap_or(self.retry);
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=policy.max_retries {
            check_cancelled(cancel)?;

            let response = await_or_cancel(self.build_request(request)?.send(), cancel).await?;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancel)
                        .await?
                        .unwrap_or_default();
                    let error = TransportError::from_status(status, &body, self.usage_limit_messages);
                    let retryable = is_retryable_http_error(status.as_u16(), &body)
                        && !matches!(error, TransportError::UsageLimit { .. });

                    if retryable && policy.should_retry(attempt) {
                        let delay = policy.delay(attempt);
                        debug!(
                            attempt,
                            status = status.as_u16(),
                            delay_ms = delay.as_millis() as u64,
                            "retrying streaming request"
                        );
                        sleep_or_cancel(delay, cancel).await?;
                        continue;
                    }

                    return Err(error);
                }
                Err(error) => {
                    let message = error.to_string();
                    let usage_limited = has_usage_limit_message(&message);
                    last_error = Some(message);
                    if policy.should_retry(attempt) && !usage_limited {
                        let delay = policy.delay(attempt);
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying streaming request after network error"
                        );
                        sleep_or_cancel(delay, cancel).await?;
                        continue;
                    }
                    warn!(attempt, error = %error, "streaming request failed");
                    return Err(TransportError::RetryExhausted {
                        status: last_status.map(|status| status.as_u16()),
                        last_error,
                    });
                }
            }
        }

        Err(TransportError::RetryExhausted {
            status: last_status.map(|status| status.as_u16()),
            last_error,
        })
    }
}

#[async_trait]
impl EventTransport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn stream(
        &self,
        request: &TransportRequest,
        cancel: Option<&CancelSignal>,
        on_event: &mut EventHandler<'_>,
    ) -> Result<(), TransportError> {
        let response = self.send_with_retry(request, cancel).await?;
        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancel).await? else {
                break;
            };
            check_cancelled(cancel)?;
            let chunk = chunk?;
            for event in decoder.feed(&chunk) {
                on_event(event)?;
            }
            if decoder.saw_done() {
                break;
            }
        }

        check_cancelled(cancel)
    }
}

fn header_map(request: &TransportRequest) -> Result<HeaderMap, TransportError> {
    let mut out = HeaderMap::new();
    for (key, value) in &request.headers {
        out.insert(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| TransportError::InvalidRequest(format!("invalid header key: {key}")))?,
            HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidRequest(format!("invalid header value for {key}")))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn build_request_posts_json_with_headers() {
        let transport = SseTransport::new().expect("client");
        let request = TransportRequest::new("https://api.example.com/v1/messages", json!({"a": 1}))
            .with_header("x-api-key", "secret")
            .with_header("accept", "text/event-stream");

        let built = transport
            .build_request(&request)
            .expect("request builder")
            .build()
            .expect("request");

        assert_eq!(built.method(), "POST");
        assert_eq!(built.url().as_str(), "https://api.example.com/v1/messages");
        assert_eq!(built.headers()["x-api-key"], "secret");
    }

    #[test]
    fn invalid_header_values_are_rejected() {
        let transport = SseTransport::new().expect("client");
        let request = TransportRequest::new("https://api.example.com", json!({}))
            .with_header("x-bad", "line\nbreak");
        assert!(matches!(
            transport.build_request(&request),
            Err(TransportError::InvalidRequest(_))
        ));

        let request = TransportRequest::new("not a url", json!({}));
        assert!(matches!(
            transport.build_request(&request),
            Err(TransportError::InvalidRequest(_))
        ));
    }
}
