//! Shared driver for one streamed model call.

use std::collections::BTreeMap;
use std::sync::Arc;

use agent_provider::env::env_api_key;
use agent_provider::{
    apply_service_tier, assistant_message_stream, calculate_cost, is_cancelled, AssistantMessage,
    AssistantMessageEventStream, CancelSignal, MessageBuilder, Model, StopReason, StreamOptions,
};
use llm_transport::{EventTransport, RetryPolicy, TransportError, TransportRequest};
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;

/// Applies vendor JSON events to the message under construction.
pub(crate) trait EventProcessor: Send {
    fn process(&mut self, builder: &mut MessageBuilder, event: Value) -> Result<(), ProviderError>;

    /// Called once the transport ends cleanly; rejects streams cut short.
    fn finish(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// A request ready to send plus the processor that interprets its events.
pub(crate) struct PreparedCall {
    pub transport: Arc<dyn EventTransport>,
    pub request: TransportRequest,
    pub processor: Box<dyn EventProcessor>,
}

/// Runs `prepared` on the current tokio runtime and returns its event stream.
///
/// Preparation failures still produce a stream with a single `error` event.
pub(crate) fn spawn_call(
    model: &Model,
    options: &StreamOptions,
    prepared: Result<PreparedCall, ProviderError>,
) -> AssistantMessageEventStream {
    let (sink, stream) = assistant_message_stream();
    let builder = MessageBuilder::new(model, sink);
    let cancel = options.cancel.clone();

    match prepared {
        Ok(call) => match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(run_call(builder, call, cancel));
            }
            Err(error) => {
                let error = ProviderError::InvalidRequest(format!("no async runtime: {error}"));
                fail(builder, cancel.as_ref(), &error);
            }
        },
        Err(error) => {
            fail(builder, cancel.as_ref(), &error);
        }
    }

    stream
}

async fn run_call(
    mut builder: MessageBuilder,
    call: PreparedCall,
    cancel: Option<CancelSignal>,
) -> AssistantMessage {
    let PreparedCall {
        transport,
        request,
        mut processor,
    } = call;
    let mut failure: Option<ProviderError> = None;

    let result = {
        let mut on_event = |event: Value| -> Result<(), TransportError> {
            if builder.consumer_gone() {
                return Err(TransportError::Cancelled);
            }
            builder.start();
            processor.process(&mut builder, event).map_err(|error| {
                let message = error.to_string();
                failure = Some(error);
                TransportError::Protocol(message)
            })
        };
        transport
            .stream(&request, cancel.as_ref(), &mut on_event)
            .await
    };

    let outcome = match (result, failure) {
        (_, Some(error)) => Err(error),
        (Err(error), None) => Err(ProviderError::from(error)),
        (Ok(()), None) => processor.finish(),
    };

    if is_cancelled(cancel.as_ref()) {
        return fail(builder, cancel.as_ref(), &ProviderError::Aborted);
    }
    match outcome {
        Ok(()) => builder.finish(),
        Err(error) => fail(builder, cancel.as_ref(), &error),
    }
}

fn fail(
    builder: MessageBuilder,
    cancel: Option<&CancelSignal>,
    error: &ProviderError,
) -> AssistantMessage {
    let aborted = is_cancelled(cancel) || error.is_aborted();
    let (reason, message) = if aborted {
        (StopReason::Aborted, ProviderError::Aborted.to_string())
    } else {
        (StopReason::Error, error.to_string())
    };
    debug!(
        provider = %builder.message().provider,
        model = %builder.message().model,
        reason = reason.as_str(),
        error = %message,
        "model call failed"
    );
    builder.fail(reason, message)
}

/// Explicit key from the options, else the provider's environment variables.
pub(crate) fn resolve_api_key(
    model: &Model,
    options: &StreamOptions,
) -> Result<String, ProviderError> {
    options
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
        .or_else(|| env_api_key(&model.provider))
        .ok_or_else(|| ProviderError::MissingApiKey(model.provider.clone()))
}

/// Retry policy override when the caller set either knob.
pub(crate) fn retry_override(options: &StreamOptions) -> Option<RetryPolicy> {
    if options.max_retries.is_none() && options.retry_base_delay.is_none() {
        return None;
    }
    let mut policy = RetryPolicy::default();
    if let Some(max_retries) = options.max_retries {
        policy = policy.with_max_retries(max_retries);
    }
    if let Some(base_delay) = options.retry_base_delay {
        policy = policy.with_base_delay(base_delay);
    }
    Some(policy)
}

/// Model headers overlaid by per-call headers.
pub(crate) fn extra_headers(model: &Model, options: &StreamOptions) -> BTreeMap<String, String> {
    let mut headers = model.headers.clone();
    for (key, value) in &options.headers {
        headers.retain(|name, _| !name.eq_ignore_ascii_case(key));
        headers.insert(key.clone(), value.clone());
    }
    headers
}

/// Recomputes cost from the current usage, optionally applying service-tier pricing.
pub(crate) fn refresh_cost(builder: &mut MessageBuilder, model: &Model, service_tier: Option<&str>) {
    let usage = builder.usage_mut();
    let cost = calculate_cost(&model.cost, usage);
    usage.cost = apply_service_tier(cost, service_tier);
}

pub(crate) fn trimmed_base_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub(crate) fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}
