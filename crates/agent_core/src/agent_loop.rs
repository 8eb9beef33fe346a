//! Turn state machine: stream a response, run its tool calls, inject queued messages, repeat.
//!
//! [`run_agent_loop`] drives one run inline and hands every [`AgentEvent`] to
//! the caller's `emit` before moving on, so state the caller commits on
//! `message_end` is visible to the next tool. [`agent_loop`] and
//! [`agent_loop_continue`] run the same driver on a spawned task and expose the
//! events as an [`AgentEventStream`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use agent_provider::{
    is_cancelled, AssistantMessage, AssistantMessageEvent, CancelSignal, Context, Message, Model,
    StopReason, StreamOptions, StreamProvider, ToolCall, ToolResultMessage,
};
use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::error::{AgentError, ToolError};
use crate::events::{agent_event_stream, AgentEvent, AgentEventSink, AgentEventStream};
use crate::tool::{validate_tool_arguments, AgentTool, AgentToolResult, ToolUpdater};

pub const SKIPPED_TOOL_CALL_TEXT: &str = "Skipped due to queued user message.";
pub const STREAM_ENDED_WITHOUT_TERMINAL: &str = "provider stream ended without a terminal event";
pub const LOOP_PANICKED: &str = "Agent loop panicked";

/// Credential lookup by provider id, invoked fresh for every model call.
pub type ApiKeyResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
/// Returns newly queued messages (steering or follow-up), draining them.
pub type MessageSource = Arc<dyn Fn() -> Vec<Message> + Send + Sync>;

/// Conversation state one run works on.
#[derive(Clone, Default)]
pub struct AgentContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Arc<dyn AgentTool>>,
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("system_prompt", &self.system_prompt)
            .field("messages", &self.messages.len())
            .field("tools", &self.tools)
            .finish()
    }
}

impl AgentContext {
    #[must_use]
    pub fn new(system_prompt: Option<String>, messages: Vec<Message>) -> Self {
        Self {
            system_prompt,
            messages,
            tools: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        self.tools = tools;
        self
    }

    /// Provider-facing view: history plus tool schemas.
    #[must_use]
    pub fn to_llm_context(&self) -> Context {
        Context::new(self.system_prompt.clone(), self.messages.clone())
            .with_tools(self.tools.iter().map(|tool| tool.definition()).collect())
    }

    fn tool(&self, name: &str) -> Option<&Arc<dyn AgentTool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }
}

/// Everything a run needs besides the conversation.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub model: Model,
    pub provider: Arc<dyn StreamProvider>,
    /// Base options for every call; the loop sets `cancel`, `api_key`, and `previous_response_id`.
    pub options: StreamOptions,
    pub get_api_key: Option<ApiKeyResolver>,
    pub get_steering_messages: Option<MessageSource>,
    pub get_follow_up_messages: Option<MessageSource>,
    pub skip_initial_steering_poll: bool,
}

impl fmt::Debug for AgentLoopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentLoopConfig")
            .field("model", &self.model.id)
            .field("provider", &self.model.provider)
            .field("has_api_key_resolver", &self.get_api_key.is_some())
            .field("has_steering", &self.get_steering_messages.is_some())
            .field("has_follow_up", &self.get_follow_up_messages.is_some())
            .field("skip_initial_steering_poll", &self.skip_initial_steering_poll)
            .finish()
    }
}

impl AgentLoopConfig {
    pub fn new(model: Model, provider: Arc<dyn StreamProvider>) -> Self {
        Self {
            model,
            provider,
            options: StreamOptions::default(),
            get_api_key: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
            skip_initial_steering_poll: false,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_api_key_resolver(mut self, resolver: ApiKeyResolver) -> Self {
        self.get_api_key = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_steering(mut self, source: MessageSource) -> Self {
        self.get_steering_messages = Some(source);
        self
    }

    #[must_use]
    pub fn with_follow_up(mut self, source: MessageSource) -> Self {
        self.get_follow_up_messages = Some(source);
        self
    }

    #[must_use]
    pub fn skipping_initial_steering_poll(mut self) -> Self {
        self.skip_initial_steering_poll = true;
        self
    }

    fn call_options(&self, cancel: &CancelSignal, previous_response_id: Option<String>) -> StreamOptions {
        let mut options = self
            .options
            .clone()
            .with_cancel(cancel.clone())
            .with_previous_response_id(previous_response_id);
        if let Some(key) = self
            .get_api_key
            .as_ref()
            .and_then(|resolve| resolve(&self.model.provider))
        {
            options.api_key = Some(key);
        }
        options
    }
}

/// Starts a run with `prompts` on a spawned task.
pub fn agent_loop(
    prompts: Vec<Message>,
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancelSignal,
) -> AgentEventStream {
    let (sink, stream) = agent_event_stream();
    let guard = PanicGuard::new(&sink, &config, &cancel);
    let task = async move {
        let mut emit = move |event: AgentEvent| {
            sink.push(event);
        };
        run_agent_loop(prompts, context, &config, &cancel, &mut emit).await;
    };
    spawn_or_end(guard.run(task), stream)
}

/// Resumes from `context` without new input on a spawned task.
///
/// Rejected before any model call unless the last message is a user or tool-result message.
pub fn agent_loop_continue(
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancelSignal,
) -> Result<AgentEventStream, AgentError> {
    check_continuable(&context.messages)?;
    let (sink, stream) = agent_event_stream();
    let guard = PanicGuard::new(&sink, &config, &cancel);
    let task = async move {
        let mut emit = move |event: AgentEvent| {
            sink.push(event);
        };
        if let Err(error) = run_agent_loop_continue(context, &config, &cancel, &mut emit).await {
            warn!(error = %error, "agent loop could not continue");
        }
    };
    Ok(spawn_or_end(guard.run(task), stream))
}

/// Ends a spawned run's stream when the loop panics, so consumers still see
/// a failed assistant message and `agent_end`.
struct PanicGuard {
    sink: AgentEventSink,
    model: Model,
    cancel: CancelSignal,
}

impl PanicGuard {
    fn new(sink: &AgentEventSink, config: &AgentLoopConfig, cancel: &CancelSignal) -> Self {
        Self {
            sink: sink.clone(),
            model: config.model.clone(),
            cancel: cancel.clone(),
        }
    }

    async fn run<F>(self, task: F)
    where
        F: std::future::Future<Output = ()>,
    {
        if AssertUnwindSafe(task).catch_unwind().await.is_ok() {
            return;
        }
        let reason = if is_cancelled(Some(&self.cancel)) {
            StopReason::Aborted
        } else {
            StopReason::Error
        };
        warn!(model = %self.model.id, reason = reason.as_str(), "agent loop panicked");
        let message = Message::Assistant(AssistantMessage::failed(
            &self.model,
            reason,
            LOOP_PANICKED,
        ));
        self.sink.push(AgentEvent::MessageStart {
            message: message.clone(),
        });
        self.sink.push(AgentEvent::MessageEnd {
            message: message.clone(),
        });
        self.sink.push(AgentEvent::AgentEnd {
            messages: vec![message],
        });
    }
}

fn spawn_or_end<F>(task: F, stream: AgentEventStream) -> AgentEventStream
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
        }
        // The task and its sink drop here, so the stream ends without a result.
        Err(error) => warn!(error = %error, "agent loop needs a tokio runtime"),
    }
    stream
}

fn check_continuable(messages: &[Message]) -> Result<(), AgentError> {
    match messages.last() {
        None => Err(AgentError::CannotContinue(
            "Cannot continue: no messages in context".to_owned(),
        )),
        Some(Message::Assistant(_)) => Err(AgentError::CannotContinue(
            "Cannot continue from message role: assistant".to_owned(),
        )),
        Some(_) => Ok(()),
    }
}

/// Drives one run with `prompts` appended to `context`. Returns the new messages.
pub async fn run_agent_loop(
    prompts: Vec<Message>,
    mut context: AgentContext,
    config: &AgentLoopConfig,
    cancel: &CancelSignal,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> Vec<Message> {
    emit(AgentEvent::AgentStart);
    emit(AgentEvent::TurnStart);
    for prompt in &prompts {
        emit(AgentEvent::MessageStart {
            message: prompt.clone(),
        });
        emit(AgentEvent::MessageEnd {
            message: prompt.clone(),
        });
    }
    context.messages.extend(prompts.iter().cloned());

    run_turns(context, prompts, config, cancel, emit).await
}

/// Drives one run from the existing context.
pub async fn run_agent_loop_continue(
    context: AgentContext,
    config: &AgentLoopConfig,
    cancel: &CancelSignal,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> Result<Vec<Message>, AgentError> {
    check_continuable(&context.messages)?;
    emit(AgentEvent::AgentStart);
    emit(AgentEvent::TurnStart);
    Ok(run_turns(context, Vec::new(), config, cancel, emit).await)
}

async fn run_turns(
    mut context: AgentContext,
    mut new_messages: Vec<Message>,
    config: &AgentLoopConfig,
    cancel: &CancelSignal,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> Vec<Message> {
    let mut first_turn = true;
    let mut previous_response_id: Option<String> = None;
    let mut pending = if config.skip_initial_steering_poll {
        Vec::new()
    } else {
        poll(config.get_steering_messages.as_ref())
    };

    loop {
        let mut has_more_tool_calls = true;

        while has_more_tool_calls || !pending.is_empty() {
            if first_turn {
                first_turn = false;
            } else {
                emit(AgentEvent::TurnStart);
            }

            if !pending.is_empty() {
                debug!(count = pending.len(), "injecting queued messages");
            }
            for message in pending.drain(..) {
                emit(AgentEvent::MessageStart {
                    message: message.clone(),
                });
                emit(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                context.messages.push(message.clone());
                new_messages.push(message);
            }

            let message = stream_assistant_response(
                &mut context,
                config,
                cancel,
                previous_response_id.take(),
                emit,
            )
            .await;
            new_messages.push(Message::Assistant(message.clone()));

            if message.stop_reason.is_failure() {
                emit(AgentEvent::TurnEnd {
                    message,
                    tool_results: Vec::new(),
                });
                emit(AgentEvent::AgentEnd {
                    messages: new_messages.clone(),
                });
                return new_messages;
            }
            previous_response_id = message.response_id.clone();

            let calls: Vec<ToolCall> = message.tool_calls().cloned().collect();
            has_more_tool_calls = !calls.is_empty();

            let mut steering_after_tools = Vec::new();
            let mut tool_results = Vec::new();
            if has_more_tool_calls {
                let execution = execute_tool_calls(&calls, &mut context, config, cancel, emit).await;
                for result in &execution.results {
                    new_messages.push(Message::ToolResult(result.clone()));
                }
                tool_results = execution.results;
                steering_after_tools = execution.steering;
            }

            emit(AgentEvent::TurnEnd {
                message,
                tool_results,
            });

            pending = if steering_after_tools.is_empty() {
                poll(config.get_steering_messages.as_ref())
            } else {
                steering_after_tools
            };
        }

        let follow_up = poll(config.get_follow_up_messages.as_ref());
        if follow_up.is_empty() {
            break;
        }
        debug!(count = follow_up.len(), "continuing with follow-up messages");
        pending = follow_up;
    }

    emit(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    });
    new_messages
}

fn poll(source: Option<&MessageSource>) -> Vec<Message> {
    source.map(|source| source()).unwrap_or_default()
}

/// Streams one response, keeping the growing partial as the last context message.
async fn stream_assistant_response(
    context: &mut AgentContext,
    config: &AgentLoopConfig,
    cancel: &CancelSignal,
    previous_response_id: Option<String>,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> AssistantMessage {
    let llm_context = context.to_llm_context();
    let options = config.call_options(cancel, previous_response_id);
    let mut response = config.provider.stream(&config.model, &llm_context, &options);
    let mut added_partial = false;

    while let Some(event) = response.next().await {
        if event.is_terminal() {
            break;
        }
        if let AssistantMessageEvent::Start { partial } = &event {
            context.messages.push(Message::Assistant(partial.clone()));
            added_partial = true;
            emit(AgentEvent::MessageStart {
                message: Message::Assistant(partial.clone()),
            });
            continue;
        }
        if added_partial {
            let partial = event.message().clone();
            replace_last(&mut context.messages, Message::Assistant(partial.clone()));
            emit(AgentEvent::MessageUpdate {
                message: partial,
                assistant_event: event,
            });
        }
    }

    let message = response.take_result().unwrap_or_else(|| {
        let reason = if is_cancelled(Some(cancel)) {
            StopReason::Aborted
        } else {
            StopReason::Error
        };
        warn!(
            provider = %config.model.provider,
            model = %config.model.id,
            "provider stream ended without a terminal event"
        );
        AssistantMessage::failed(&config.model, reason, STREAM_ENDED_WITHOUT_TERMINAL)
    });

    if added_partial {
        replace_last(&mut context.messages, Message::Assistant(message.clone()));
    } else {
        context.messages.push(Message::Assistant(message.clone()));
        emit(AgentEvent::MessageStart {
            message: Message::Assistant(message.clone()),
        });
    }
    emit(AgentEvent::MessageEnd {
        message: Message::Assistant(message.clone()),
    });
    message
}

fn replace_last(messages: &mut Vec<Message>, message: Message) {
    match messages.last_mut() {
        Some(last) => *last = message,
        None => messages.push(message),
    }
}

struct ToolExecution {
    results: Vec<ToolResultMessage>,
    steering: Vec<Message>,
}

/// Runs calls strictly in order. A non-empty steering poll after any call skips the rest.
async fn execute_tool_calls(
    calls: &[ToolCall],
    context: &mut AgentContext,
    config: &AgentLoopConfig,
    cancel: &CancelSignal,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> ToolExecution {
    let mut results = Vec::with_capacity(calls.len());
    let mut steering = Vec::new();

    for (index, call) in calls.iter().enumerate() {
        emit(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let outcome = execute_tool_call(call, context, cancel, emit).await;
        let (result, is_error) = match outcome {
            Ok(result) => (result, false),
            Err(error) => {
                warn!(tool = %call.name, error = %error, "tool call failed");
                (AgentToolResult::text(error.to_string()), true)
            }
        };
        let message = finish_tool_call(call, result, is_error, context, emit);
        results.push(message);

        let queued = poll(config.get_steering_messages.as_ref());
        if !queued.is_empty() {
            steering = queued;
            for skipped in &calls[index + 1..] {
                debug!(tool = %skipped.name, "skipping tool call after steering message");
                emit(AgentEvent::ToolExecutionStart {
                    tool_call_id: skipped.id.clone(),
                    tool_name: skipped.name.clone(),
                    args: skipped.arguments.clone(),
                });
                let result = AgentToolResult::text(SKIPPED_TOOL_CALL_TEXT);
                results.push(finish_tool_call(skipped, result, true, context, emit));
            }
            break;
        }
    }

    ToolExecution { results, steering }
}

async fn execute_tool_call(
    call: &ToolCall,
    context: &AgentContext,
    cancel: &CancelSignal,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> Result<AgentToolResult, ToolError> {
    if is_cancelled(Some(cancel)) {
        return Err(ToolError::Cancelled);
    }
    let tool = context
        .tool(&call.name)
        .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
    let args = validate_tool_arguments(tool.as_ref(), call)?;

    let (updater, mut updates) = ToolUpdater::channel();
    let execution = AssertUnwindSafe(tool.execute(&call.id, args, cancel.clone(), &updater)).catch_unwind();
    tokio::pin!(execution);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(partial_result) = updates.recv() => emit(AgentEvent::ToolExecutionUpdate {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                args: call.arguments.clone(),
                partial_result,
            }),
            outcome = &mut execution => break outcome,
        }
    };
    while let Ok(partial_result) = updates.try_recv() {
        emit(AgentEvent::ToolExecutionUpdate {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
            partial_result,
        });
    }

    outcome.unwrap_or_else(|_| Err(ToolError::execution(format!("Tool {} panicked", call.name))))
}

/// Emits the end events and commits the result to the working context.
fn finish_tool_call(
    call: &ToolCall,
    result: AgentToolResult,
    is_error: bool,
    context: &mut AgentContext,
    emit: &mut (dyn FnMut(AgentEvent) + Send),
) -> ToolResultMessage {
    let message = ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: result.content.clone(),
        details: result.details.clone(),
        is_error,
        timestamp: agent_provider::now_ms(),
    };
    emit(AgentEvent::ToolExecutionEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result,
        is_error,
    });
    emit(AgentEvent::MessageStart {
        message: Message::ToolResult(message.clone()),
    });
    emit(AgentEvent::MessageEnd {
        message: Message::ToolResult(message.clone()),
    });
    context.messages.push(Message::ToolResult(message.clone()));
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_requires_user_or_tool_result_last() {
        assert_eq!(
            check_continuable(&[]),
            Err(AgentError::CannotContinue(
                "Cannot continue: no messages in context".into()
            ))
        );
        assert_eq!(check_continuable(&[Message::user_text("hi")]), Ok(()));

        let model = Model::new(
            "m",
            agent_provider::Api::AnthropicMessages,
            "p",
            "http://localhost",
        );
        let assistant = Message::Assistant(AssistantMessage::empty(&model));
        assert_eq!(
            check_continuable(&[Message::user_text("hi"), assistant])
                .map_err(|error| error.to_string()),
            Err("Cannot continue from message role: assistant".to_owned())
        );
    }

    #[test]
    fn replace_last_pushes_into_empty_history() {
        let second = Message::user_text("b");
        let mut messages = Vec::new();
        replace_last(&mut messages, Message::user_text("a"));
        replace_last(&mut messages, second.clone());

        assert_eq!(messages, vec![second]);
    }
}
