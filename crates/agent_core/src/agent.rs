//! Stateful session wrapper around the agent loop.
//!
//! An [`Agent`] owns the conversation, the steering and follow-up queues, and
//! the abort signal of the current run. Clones share the same session, so a
//! tool or listener can hold one and observe committed state mid-run.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_provider::{
    cancel_signal, is_cancelled, AssistantMessage, CancelSignal, ContentBlock, Message, Model,
    StopReason, StreamOptions, StreamProvider, ThinkingBudgets, ThinkingLevel, Transport,
    UserMessage,
};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::agent_loop::{
    run_agent_loop, run_agent_loop_continue, AgentContext, AgentLoopConfig, ApiKeyResolver,
    MessageSource, LOOP_PANICKED,
};
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::tool::AgentTool;

/// How many queued messages one poll delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    #[default]
    OneAtATime,
    All,
}

/// Handle returned by [`Agent::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Snapshot of a session.
#[derive(Clone, Default)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: Option<Model>,
    /// `None` means thinking is off.
    pub thinking_level: Option<ThinkingLevel>,
    pub tools: Vec<Arc<dyn AgentTool>>,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    /// Message currently between `message_start` and `message_end`.
    pub stream_message: Option<Message>,
    pub pending_tool_calls: BTreeSet<String>,
    pub error: Option<String>,
}

impl fmt::Debug for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentState")
            .field("model", &self.model.as_ref().map(|model| &model.id))
            .field("thinking_level", &self.thinking_level)
            .field("tools", &self.tools)
            .field("messages", &self.messages.len())
            .field("is_streaming", &self.is_streaming)
            .field("pending_tool_calls", &self.pending_tool_calls)
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Queues {
    steering: VecDeque<Message>,
    follow_up: VecDeque<Message>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
}

fn dequeue(queue: &mut VecDeque<Message>, mode: QueueMode) -> Vec<Message> {
    match mode {
        QueueMode::OneAtATime => queue.pop_front().into_iter().collect(),
        QueueMode::All => queue.drain(..).collect(),
    }
}

/// Input for a run, chosen once the session is claimed.
struct RunStart {
    /// `None` resumes from the existing history.
    prompts: Option<Vec<Message>>,
    skip_initial_steering_poll: bool,
}

impl RunStart {
    fn prompts(prompts: Vec<Message>) -> Self {
        Self {
            prompts: Some(prompts),
            skip_initial_steering_poll: false,
        }
    }
}

/// Per-call options forwarded to every model call of a run.
#[derive(Clone, Default)]
struct CallSettings {
    session_id: Option<String>,
    transport: Transport,
    thinking_budgets: ThinkingBudgets,
    max_retries: Option<u32>,
    retry_base_delay: Option<Duration>,
    get_api_key: Option<ApiKeyResolver>,
}

struct AgentInner {
    provider: Arc<dyn StreamProvider>,
    state: Mutex<AgentState>,
    queues: Mutex<Queues>,
    settings: Mutex<CallSettings>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    cancel: Mutex<Option<CancelSignal>>,
    busy: watch::Sender<bool>,
}

/// Caller-side input for [`Agent::prompt`].
#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput {
    Text(String),
    Messages(Vec<Message>),
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Message> for PromptInput {
    fn from(message: Message) -> Self {
        Self::Messages(vec![message])
    }
}

impl From<UserMessage> for PromptInput {
    fn from(message: UserMessage) -> Self {
        Self::Messages(vec![Message::User(message)])
    }
}

impl From<Vec<Message>> for PromptInput {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}

impl PromptInput {
    fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Text(text) => vec![Message::user_text(text)],
            Self::Messages(messages) => messages,
        }
    }
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("state", &*lock_unpoisoned(&self.inner.state))
            .finish()
    }
}

impl Agent {
    pub fn new(provider: Arc<dyn StreamProvider>) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(AgentInner {
                provider,
                state: Mutex::new(AgentState::default()),
                queues: Mutex::new(Queues::default()),
                settings: Mutex::new(CallSettings::default()),
                listeners: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                cancel: Mutex::new(None),
                busy,
            }),
        }
    }

    #[must_use]
    pub fn with_model(self, model: Model) -> Self {
        self.set_model(model);
        self
    }

    #[must_use]
    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        self.set_system_prompt(prompt);
        self
    }

    #[must_use]
    pub fn with_tools(self, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        self.set_tools(tools);
        self
    }

    #[must_use]
    pub fn with_messages(self, messages: Vec<Message>) -> Self {
        self.replace_messages(messages);
        self
    }

    #[must_use]
    pub fn with_thinking_level(self, level: Option<ThinkingLevel>) -> Self {
        self.set_thinking_level(level);
        self
    }

    #[must_use]
    pub fn with_session_id(self, session_id: impl Into<String>) -> Self {
        self.set_session_id(Some(session_id.into()));
        self
    }

    #[must_use]
    pub fn with_transport(self, transport: Transport) -> Self {
        self.set_transport(transport);
        self
    }

    #[must_use]
    pub fn with_thinking_budgets(self, budgets: ThinkingBudgets) -> Self {
        lock_unpoisoned(&self.inner.settings).thinking_budgets = budgets;
        self
    }

    #[must_use]
    pub fn with_retry(self, max_retries: u32, base_delay: Duration) -> Self {
        {
            let mut settings = lock_unpoisoned(&self.inner.settings);
            settings.max_retries = Some(max_retries);
            settings.retry_base_delay = Some(base_delay);
        }
        self
    }

    #[must_use]
    pub fn with_api_key_resolver(self, resolver: ApiKeyResolver) -> Self {
        lock_unpoisoned(&self.inner.settings).get_api_key = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_steering_mode(self, mode: QueueMode) -> Self {
        self.set_steering_mode(mode);
        self
    }

    #[must_use]
    pub fn with_follow_up_mode(self, mode: QueueMode) -> Self {
        self.set_follow_up_mode(mode);
        self
    }

    /// Copy of the current session state.
    #[must_use]
    pub fn state(&self) -> AgentState {
        lock_unpoisoned(&self.inner.state).clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        lock_unpoisoned(&self.inner.state).messages.clone()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        lock_unpoisoned(&self.inner.state).is_streaming
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        lock_unpoisoned(&self.inner.state).system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: Model) {
        lock_unpoisoned(&self.inner.state).model = Some(model);
    }

    pub fn set_thinking_level(&self, level: Option<ThinkingLevel>) {
        lock_unpoisoned(&self.inner.state).thinking_level = level;
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn AgentTool>>) {
        lock_unpoisoned(&self.inner.state).tools = tools;
    }

    pub fn replace_messages(&self, messages: Vec<Message>) {
        lock_unpoisoned(&self.inner.state).messages = messages;
    }

    pub fn append_message(&self, message: Message) {
        lock_unpoisoned(&self.inner.state).messages.push(message);
    }

    pub fn clear_messages(&self) {
        lock_unpoisoned(&self.inner.state).messages.clear();
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.settings).session_id.clone()
    }

    /// Session id for provider caching; change it when switching sessions.
    pub fn set_session_id(&self, session_id: Option<String>) {
        lock_unpoisoned(&self.inner.settings).session_id = session_id;
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        lock_unpoisoned(&self.inner.settings).transport
    }

    pub fn set_transport(&self, transport: Transport) {
        lock_unpoisoned(&self.inner.settings).transport = transport;
    }

    #[must_use]
    pub fn steering_mode(&self) -> QueueMode {
        lock_unpoisoned(&self.inner.queues).steering_mode
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        lock_unpoisoned(&self.inner.queues).steering_mode = mode;
    }

    #[must_use]
    pub fn follow_up_mode(&self) -> QueueMode {
        lock_unpoisoned(&self.inner.queues).follow_up_mode
    }

    pub fn set_follow_up_mode(&self, mode: QueueMode) {
        lock_unpoisoned(&self.inner.queues).follow_up_mode = mode;
    }

    /// Queues a message that interrupts the run after the current tool finishes.
    pub fn steer(&self, message: impl Into<Message>) {
        lock_unpoisoned(&self.inner.queues)
            .steering
            .push_back(message.into());
    }

    /// Queues a message delivered only once the agent would otherwise stop.
    pub fn follow_up(&self, message: impl Into<Message>) {
        lock_unpoisoned(&self.inner.queues)
            .follow_up
            .push_back(message.into());
    }

    pub fn clear_steering_queue(&self) {
        lock_unpoisoned(&self.inner.queues).steering.clear();
    }

    pub fn clear_follow_up_queue(&self) {
        lock_unpoisoned(&self.inner.queues).follow_up.clear();
    }

    pub fn clear_all_queues(&self) {
        let mut queues = lock_unpoisoned(&self.inner.queues);
        queues.steering.clear();
        queues.follow_up.clear();
    }

    #[must_use]
    pub fn has_queued_messages(&self) -> bool {
        let queues = lock_unpoisoned(&self.inner.queues);
        !queues.steering.is_empty() || !queues.follow_up.is_empty()
    }

    /// Registers a listener for every event of every run.
    pub fn subscribe(&self, listener: impl Fn(&AgentEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        lock_unpoisoned(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock_unpoisoned(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Fires the abort signal of the current run, if any.
    pub fn abort(&self) {
        if let Some(cancel) = lock_unpoisoned(&self.inner.cancel).as_ref() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Resolves once no run is in flight.
    pub async fn wait_for_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Clears the conversation, run state, and both queues.
    pub fn reset(&self) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.messages.clear();
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls.clear();
            state.error = None;
        }
        self.clear_all_queues();
    }

    /// Runs the loop with new input. Rejected while another run is in flight.
    pub async fn prompt(&self, input: impl Into<PromptInput>) -> Result<(), AgentError> {
        let prompts = input.into().into_messages();
        self.run(move |_| Ok(RunStart::prompts(prompts))).await
    }

    /// Resumes from the current conversation.
    ///
    /// After an assistant message, queued steering (then follow-up) messages
    /// become the input; without any the call is rejected. Queues are only
    /// drained once the run is claimed.
    pub async fn continue_run(&self) -> Result<(), AgentError> {
        self.run(|state| self.continue_start(state)).await
    }

    fn continue_start(&self, state: &AgentState) -> Result<RunStart, AgentError> {
        match state.messages.last() {
            None => Err(AgentError::CannotContinue(
                "No messages to continue from".to_owned(),
            )),
            Some(Message::Assistant(_)) => {
                let steering = self.dequeue_steering();
                if !steering.is_empty() {
                    return Ok(RunStart {
                        prompts: Some(steering),
                        skip_initial_steering_poll: true,
                    });
                }
                let follow_up = self.dequeue_follow_up();
                if !follow_up.is_empty() {
                    return Ok(RunStart::prompts(follow_up));
                }
                Err(AgentError::CannotContinue(
                    "Cannot continue from message role: assistant".to_owned(),
                ))
            }
            Some(_) => Ok(RunStart {
                prompts: None,
                skip_initial_steering_poll: false,
            }),
        }
    }

    fn dequeue_steering(&self) -> Vec<Message> {
        let mut queues = lock_unpoisoned(&self.inner.queues);
        let mode = queues.steering_mode;
        dequeue(&mut queues.steering, mode)
    }

    fn dequeue_follow_up(&self) -> Vec<Message> {
        let mut queues = lock_unpoisoned(&self.inner.queues);
        let mode = queues.follow_up_mode;
        dequeue(&mut queues.follow_up, mode)
    }

    async fn run(
        &self,
        start: impl FnOnce(&AgentState) -> Result<RunStart, AgentError>,
    ) -> Result<(), AgentError> {
        let (prompts, context, config, cancel) = self.begin_run(start)?;
        let model = config.model.clone();

        let agent = self.clone();
        let mut emit = move |event: AgentEvent| agent.handle_event(event);
        let outcome = AssertUnwindSafe(async {
            match prompts {
                Some(prompts) => Ok(run_agent_loop(prompts, context, &config, &cancel, &mut emit).await),
                None => run_agent_loop_continue(context, &config, &cancel, &mut emit).await,
            }
        })
        .catch_unwind()
        .await;

        let failure = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(_) => Some(LOOP_PANICKED.to_owned()),
        };
        if let Some(error) = failure {
            self.fail_run(&model, &cancel, error);
        }
        self.end_run();
        Ok(())
    }

    /// Marks the session busy and assembles the loop inputs.
    ///
    /// `start` picks the input under the state lock, after the busy and model
    /// checks pass; an error from it leaves the session idle.
    fn begin_run(
        &self,
        start: impl FnOnce(&AgentState) -> Result<RunStart, AgentError>,
    ) -> Result<(Option<Vec<Message>>, AgentContext, AgentLoopConfig, CancelSignal), AgentError> {
        let settings = lock_unpoisoned(&self.inner.settings).clone();
        let (start, context, model, reasoning) = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.is_streaming {
                return Err(AgentError::AlreadyStreaming);
            }
            let model = state.model.clone().ok_or(AgentError::NoModel)?;
            let start = start(&state)?;
            state.is_streaming = true;
            state.stream_message = None;
            state.error = None;
            let system_prompt = Some(state.system_prompt.clone()).filter(|prompt| !prompt.is_empty());
            let context = AgentContext::new(system_prompt, state.messages.clone())
                .with_tools(state.tools.clone());
            (start, context, model, state.thinking_level)
        };

        let cancel = cancel_signal();
        *lock_unpoisoned(&self.inner.cancel) = Some(cancel.clone());
        self.inner.busy.send_replace(true);

        let mut options = StreamOptions::new()
            .with_transport(settings.transport)
            .with_thinking_budgets(settings.thinking_budgets);
        options.reasoning = reasoning;
        options.session_id = settings.session_id;
        options.max_retries = settings.max_retries;
        options.retry_base_delay = settings.retry_base_delay;

        let steering_agent = self.clone();
        let follow_up_agent = self.clone();
        let steering: MessageSource = Arc::new(move || steering_agent.dequeue_steering());
        let follow_up: MessageSource = Arc::new(move || follow_up_agent.dequeue_follow_up());

        let mut config = AgentLoopConfig::new(model, Arc::clone(&self.inner.provider))
            .with_options(options)
            .with_steering(steering)
            .with_follow_up(follow_up);
        if let Some(resolver) = settings.get_api_key {
            config = config.with_api_key_resolver(resolver);
        }
        if start.skip_initial_steering_poll {
            config = config.skipping_initial_steering_poll();
        }
        Ok((start.prompts, context, config, cancel))
    }

    /// Records a run that could not reach `agent_end` on its own.
    fn fail_run(&self, model: &Model, cancel: &CancelSignal, error: String) {
        let reason = if is_cancelled(Some(cancel)) {
            StopReason::Aborted
        } else {
            StopReason::Error
        };
        warn!(error = %error, reason = reason.as_str(), "agent run failed");
        let mut message = AssistantMessage::failed(model, reason, error.clone());
        message.content.push(ContentBlock::Text(Default::default()));
        let message = Message::Assistant(message);
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.messages.push(message.clone());
            state.error = Some(error);
        }
        self.notify(&AgentEvent::AgentEnd {
            messages: vec![message],
        });
    }

    fn end_run(&self) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls.clear();
        }
        *lock_unpoisoned(&self.inner.cancel) = None;
        self.inner.busy.send_replace(false);
    }

    /// Commits the event to session state, then notifies listeners.
    fn handle_event(&self, event: AgentEvent) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            match &event {
                AgentEvent::MessageStart { message } => {
                    state.stream_message = Some(message.clone());
                }
                AgentEvent::MessageUpdate { message, .. } => {
                    state.stream_message = Some(Message::Assistant(message.clone()));
                }
                AgentEvent::MessageEnd { message } => {
                    state.stream_message = None;
                    state.messages.push(message.clone());
                }
                AgentEvent::ToolExecutionStart { tool_call_id, .. } => {
                    state.pending_tool_calls.insert(tool_call_id.clone());
                }
                AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                    state.pending_tool_calls.remove(tool_call_id);
                }
                AgentEvent::TurnEnd { message, .. } => {
                    if let Some(error) = &message.error_message {
                        state.error = Some(error.clone());
                    }
                }
                AgentEvent::AgentEnd { .. } => {
                    state.stream_message = None;
                }
                AgentEvent::AgentStart
                | AgentEvent::TurnStart
                | AgentEvent::ToolExecutionUpdate { .. } => {}
            }
        }
        if matches!(event, AgentEvent::AgentEnd { .. }) {
            debug!("agent run finished");
        }
        self.notify(&event);
    }

    fn notify(&self, event: &AgentEvent) {
        let listeners: Vec<Listener> = lock_unpoisoned(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn texts(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|message| match message {
                Message::User(user) => user.content.first().and_then(|c| c.as_text()).map(str::to_owned),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn one_at_a_time_delivers_oldest_first() {
        let mut queue: VecDeque<Message> = ["a", "b"].into_iter().map(Message::user_text).collect();

        assert_eq!(texts(&dequeue(&mut queue, QueueMode::OneAtATime)), vec!["a"]);
        assert_eq!(texts(&dequeue(&mut queue, QueueMode::OneAtATime)), vec!["b"]);
        assert!(dequeue(&mut queue, QueueMode::OneAtATime).is_empty());
    }

    #[test]
    fn all_mode_drains_everything() {
        let mut queue: VecDeque<Message> = ["a", "b"].into_iter().map(Message::user_text).collect();

        assert_eq!(texts(&dequeue(&mut queue, QueueMode::All)), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_mode_uses_kebab_case_names() {
        assert_eq!(
            serde_json::to_value(QueueMode::OneAtATime).expect("serializable"),
            serde_json::json!("one-at-a-time")
        );
        assert_eq!(
            serde_json::from_value::<QueueMode>(serde_json::json!("all")).expect("parse"),
            QueueMode::All
        );
    }
}
