//! Provider-agnostic contract shared by adapters, transports, and the agent loop.
//!
//! This crate defines the unified message model, the assistant event algebra,
//! the generic event stream primitive, and the pure helpers (usage/cost,
//! streaming JSON, thinking budgets) every vendor adapter builds on. It carries
//! no transport or protocol details.

pub mod builder;
pub mod context;
pub mod env;
pub mod event;
pub mod event_stream;
pub mod json;
pub mod message;
pub mod model;
pub mod options;
pub mod provider;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub use builder::MessageBuilder;
pub use context::{Context, ToolDefinition};
pub use event::AssistantMessageEvent;
pub use event_stream::{
    assistant_message_stream, event_stream, AssistantMessageEventSink,
    AssistantMessageEventStream, EventSink, EventStream,
};
pub use json::{parse_streaming_json, try_parse_streaming_json, StreamingJson};
pub use message::{
    AssistantMessage, ContentBlock, Cost, ImageContent, Message, StopReason, TextContent,
    ThinkingContent, ToolCall, ToolResultMessage, Usage, UsageUpdate, UserContent, UserMessage,
};
pub use model::{
    apply_service_tier, calculate_cost, models_are_equal, supports_xhigh, Api, InputModality, Model,
    ModelCost, ModelRegistry,
};
pub use options::{
    adjust_max_tokens_for_thinking, clamp_reasoning, CacheRetention, NativeTools,
    StreamOptions, ThinkingBudgets, ThinkingLevel, ToolChoice, Transport, WebSearchLocation,
    WebSearchOptions,
};
pub use provider::StreamProvider;

/// Shared cancellation flag for one model call or agent run.
pub type CancelSignal = Arc<AtomicBool>;

/// Creates a fresh, unfired cancellation flag.
#[must_use]
pub fn cancel_signal() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

/// Returns true when the optional signal has been fired.
#[must_use]
pub fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(|signal| signal.load(Ordering::Acquire))
}

/// Milliseconds since the Unix epoch, saturating on clock errors.
#[must_use]
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
