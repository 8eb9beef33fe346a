//! Deterministic scripted implementation of the shared `agent_provider` contract.
//!
//! This crate contains no transport/protocol logic. Each call to
//! [`MockProvider::stream`] pops the next [`ScriptedResponse`] and replays it
//! through a [`MessageBuilder`], so consumers see the same event algebra a
//! real adapter produces.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use agent_provider::{
    assistant_message_stream, is_cancelled, Api, AssistantMessage, AssistantMessageEventStream,
    CancelSignal, Context, MessageBuilder, Model, StopReason, StreamOptions, StreamProvider,
    UsageUpdate,
};
use serde_json::Value;
use tracing::debug;

/// Stable provider identifier used by [`mock_model`].
pub const MOCK_PROVIDER_ID: &str = "mock";

/// Model descriptor attributed to scripted responses.
#[must_use]
pub fn mock_model() -> Model {
    Model::new("mock", Api::OpenAiResponses, MOCK_PROVIDER_ID, "mock://local")
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedBlock {
    Text(String),
    Thinking(String),
    /// Raw argument text, streamed in two halves so live parsing sees a prefix.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Finish,
    /// Keeps the stream open until the call's cancel signal fires.
    HangUntilCancelled,
    /// Drops the producer without a terminal event.
    Truncate,
}

/// One assistant response to replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedResponse {
    blocks: Vec<ScriptedBlock>,
    stop_reason: Option<StopReason>,
    error_message: Option<String>,
    response_id: Option<String>,
    usage: UsageUpdate,
    ending: Ending,
}

impl Default for ScriptedResponse {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            stop_reason: None,
            error_message: None,
            response_id: None,
            usage: UsageUpdate::default(),
            ending: Ending::Finish,
        }
    }
}

impl ScriptedResponse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain text reply that stops normally.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new().with_text(text)
    }

    /// Reply made only of tool calls, each given as `(id, name, arguments)`.
    #[must_use]
    pub fn tool_calls<I, S>(calls: I) -> Self
    where
        I: IntoIterator<Item = (S, S, Value)>,
        S: Into<String>,
    {
        calls
            .into_iter()
            .fold(Self::new(), |response, (id, name, arguments)| {
                response.with_tool_call(id, name, arguments)
            })
    }

    /// Response that ends with a vendor-style error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        let mut response = Self::new();
        response.stop_reason = Some(StopReason::Error);
        response.error_message = Some(message.into());
        response
    }

    /// Response that stays open until the call is aborted.
    #[must_use]
    pub fn hang_until_cancelled() -> Self {
        Self {
            ending: Ending::HangUntilCancelled,
            ..Self::default()
        }
    }

    /// Response whose producer goes away without `done` or `error`.
    #[must_use]
    pub fn truncated() -> Self {
        Self {
            ending: Ending::Truncate,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.blocks.push(ScriptedBlock::Text(text.into()));
        self
    }

    #[must_use]
    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.blocks.push(ScriptedBlock::Thinking(thinking.into()));
        self
    }

    #[must_use]
    pub fn with_tool_call(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        self.with_raw_tool_call(id, name, arguments.to_string())
    }

    /// Tool call whose argument text is sent verbatim, valid JSON or not.
    #[must_use]
    pub fn with_raw_tool_call(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        self.blocks.push(ScriptedBlock::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        });
        self
    }

    #[must_use]
    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_response_id(mut self, id: impl Into<String>) -> Self {
        self.response_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage.input = Some(input);
        self.usage.output = Some(output);
        self
    }

    #[must_use]
    pub fn blocks(&self) -> &[ScriptedBlock] {
        &self.blocks
    }

    fn resolved_stop_reason(&self) -> StopReason {
        self.stop_reason.unwrap_or_else(|| {
            let has_tool_calls = self
                .blocks
                .iter()
                .any(|block| matches!(block, ScriptedBlock::ToolCall { .. }));
            if has_tool_calls {
                StopReason::ToolUse
            } else {
                StopReason::Stop
            }
        })
    }
}

/// What one `stream` call was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: Model,
    pub context: Context,
    pub options: StreamOptions,
}

/// Scripted provider used by `agent_core` tests and local runs.
#[derive(Debug, Default)]
pub struct MockProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
    token_delay: Duration,
}

impl MockProvider {
    #[must_use]
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
        }
    }

    /// Pause between streamed tokens. Zero yields to the scheduler instead.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Appends a response to the script.
    pub fn push(&self, response: ScriptedResponse) {
        lock_unpoisoned(&self.responses).push_back(response);
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        lock_unpoisoned(&self.responses).len()
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock_unpoisoned(&self.calls).clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        lock_unpoisoned(&self.calls).len()
    }
}

impl StreamProvider for MockProvider {
    fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> AssistantMessageEventStream {
        lock_unpoisoned(&self.calls).push(RecordedCall {
            model: model.clone(),
            context: context.clone(),
            options: options.clone(),
        });
        let next = lock_unpoisoned(&self.responses).pop_front();

        let (sink, stream) = assistant_message_stream();
        let builder = MessageBuilder::new(model, sink);
        let cancel = options.cancel.clone();

        let Some(response) = next else {
            builder.fail(StopReason::Error, "mock provider has no scripted response left");
            return stream;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(replay(builder, response, cancel, self.token_delay));
            }
            Err(error) => {
                builder.fail(StopReason::Error, format!("no async runtime: {error}"));
            }
        }
        stream
    }
}

async fn replay(
    mut builder: MessageBuilder,
    response: ScriptedResponse,
    cancel: Option<CancelSignal>,
    token_delay: Duration,
) -> Option<AssistantMessage> {
    builder.start();

    for (index, block) in response.blocks.iter().enumerate() {
        let index = index as u64;
        let chunks = match block {
            ScriptedBlock::Text(text) => {
                builder.open_text(index);
                tokens(text)
            }
            ScriptedBlock::Thinking(thinking) => {
                builder.open_thinking(index);
                tokens(thinking)
            }
            ScriptedBlock::ToolCall {
                id,
                name,
                arguments,
            } => {
                builder.open_tool_call(index, id.as_str(), name.as_str(), "");
                halves(arguments)
            }
        };

        for chunk in chunks {
            if pause(cancel.as_ref(), token_delay).await {
                return Some(aborted(builder));
            }
            match block {
                ScriptedBlock::Text(_) => builder.push_text(index, &chunk),
                ScriptedBlock::Thinking(_) => builder.push_thinking(index, &chunk),
                ScriptedBlock::ToolCall { .. } => builder.push_tool_arguments(index, &chunk),
            };
        }
        builder.close(index);
    }

    match response.ending {
        Ending::Finish => {}
        Ending::HangUntilCancelled => loop {
            if pause(cancel.as_ref(), Duration::from_millis(5)).await {
                return Some(aborted(builder));
            }
        },
        Ending::Truncate => {
            debug!("mock response truncated without a terminal event");
            return None;
        }
    }

    if pause(cancel.as_ref(), Duration::ZERO).await {
        return Some(aborted(builder));
    }
    if let Some(id) = response.response_id.as_deref() {
        builder.set_response_id(id);
    }
    builder.usage_mut().apply(&response.usage);
    builder.set_stop_reason(response.resolved_stop_reason());
    if let Some(message) = response.error_message {
        builder.set_error_message(message);
    }
    Some(builder.finish())
}

/// Waits one token interval. Returns true when the call was aborted.
async fn pause(cancel: Option<&CancelSignal>, delay: Duration) -> bool {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
    is_cancelled(cancel)
}

fn aborted(builder: MessageBuilder) -> AssistantMessage {
    builder.fail(StopReason::Aborted, "Request was aborted")
}

/// Splits after each space or newline, keeping the separators.
fn tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut pending = String::new();
    for ch in text.chars() {
        pending.push(ch);
        if matches!(ch, ' ' | '\n') {
            tokens.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        tokens.push(pending);
    }
    tokens
}

fn halves(text: &str) -> Vec<String> {
    let mut middle = text.len() / 2;
    while !text.is_char_boundary(middle) {
        middle -= 1;
    }
    let (head, tail) = text.split_at(middle);
    [head, tail]
        .into_iter()
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
