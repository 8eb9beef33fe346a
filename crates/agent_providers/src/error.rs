use agent_provider::Api;
use llm_transport::TransportError;

/// Failures while preparing or interpreting one model call.
///
/// Adapters never hand these to callers directly; they end the event stream
/// with a terminal `error` event carrying the display text.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("No API key for provider: {0}")]
    MissingApiKey(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Unhandled stop reason: {0}")]
    UnknownStopReason(String),
    #[error("no adapter registered for api: {0}")]
    UnknownApi(Api),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Request was aborted")]
    Aborted,
    #[error("Stream ended without {0}")]
    Truncated(&'static str),
}

impl ProviderError {
    /// Vendor-reported failure inside an otherwise healthy stream.
    pub fn stream_failed(code: Option<String>, message: impl Into<String>) -> Self {
        Self::Transport(TransportError::StreamFailed {
            code,
            message: message.into(),
        })
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted | Self::Transport(TransportError::Cancelled))
    }
}
