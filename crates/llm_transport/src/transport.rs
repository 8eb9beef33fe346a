use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::cancel::CancelSignal;
use crate::error::TransportError;
use crate::retry::RetryPolicy;

/// One streaming request, already shaped for the vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    /// Key for connection reuse on transports that pool sockets.
    pub session_id: Option<String>,
    /// Overrides the transport's default retry policy.
    pub retry: Option<RetryPolicy>,
}

impl TransportRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            body,
            session_id: None,
            retry: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in headers {
            self.headers.insert(key.into(), value.into());
        }
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id.filter(|value| !value.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: Option<RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    /// Header lookup ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }
}

/// Receives each decoded JSON event in wire order. Returning an error stops the stream.
pub type EventHandler<'a> = dyn FnMut(Value) -> Result<(), TransportError> + Send + 'a;

/// A strategy that delivers a vendor's JSON event stream.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Sends `request` and feeds every decoded event to `on_event` until the stream ends.
    async fn stream(
        &self,
        request: &TransportRequest,
        cancel: Option<&CancelSignal>,
        on_event: &mut EventHandler<'_>,
    ) -> Result<(), TransportError>;
}

/// Tries `primary` first and switches to `fallback` only when the primary never connected.
///
/// Once the primary has sent the request, its failures are final.
#[derive(Clone)]
pub struct FallbackTransport {
    primary: Arc<dyn EventTransport>,
    fallback: Arc<dyn EventTransport>,
}

impl fmt::Debug for FallbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackTransport")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

impl FallbackTransport {
    pub fn new(primary: Arc<dyn EventTransport>, fallback: Arc<dyn EventTransport>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl EventTransport for FallbackTransport {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn stream(
        &self,
        request: &TransportRequest,
        cancel: Option<&CancelSignal>,
        on_event: &mut EventHandler<'_>,
    ) -> Result<(), TransportError> {
        match self.primary.stream(request, cancel, on_event).await {
            Err(error) if error.is_connect_failure() => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %error,
                    "primary transport failed to connect, falling back"
                );
                self.fallback.stream(request, cancel, on_event).await
            }
            other => other,
        }
    }
}
