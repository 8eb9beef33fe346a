#![allow(dead_code)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_provider::{AssistantMessage, AssistantMessageEvent, AssistantMessageEventStream};
use async_trait::async_trait;
use llm_transport::{CancelSignal, EventHandler, EventTransport, TransportError, TransportRequest};
use serde_json::Value;

/// What the fake does after replaying its events.
#[derive(Debug, Clone)]
pub enum Ending {
    Complete,
    Fail(String),
    ConnectFailure,
    /// Waits until the call's cancel signal fires.
    HangUntilCancelled,
}

/// Replays scripted JSON events and records every request it receives.
pub struct ScriptedTransport {
    name: &'static str,
    events: Vec<Value>,
    ending: Ending,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new(events: Vec<Value>) -> Arc<Self> {
        Self::named("scripted", events, Ending::Complete)
    }

    pub fn named(name: &'static str, events: Vec<Value>, ending: Ending) -> Arc<Self> {
        Arc::new(Self {
            name,
            events,
            ending,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stream(
        &self,
        request: &TransportRequest,
        cancel: Option<&CancelSignal>,
        on_event: &mut EventHandler<'_>,
    ) -> Result<(), TransportError> {
        self.requests.lock().expect("requests").push(request.clone());
        if matches!(self.ending, Ending::ConnectFailure) {
            return Err(TransportError::WebSocketConnect("refused".into()));
        }
        for event in &self.events {
            on_event(event.clone())?;
        }
        match &self.ending {
            Ending::Complete | Ending::ConnectFailure => Ok(()),
            Ending::Fail(message) => Err(TransportError::Protocol(message.clone())),
            Ending::HangUntilCancelled => loop {
                if cancel.is_some_and(|signal| signal.load(Ordering::Acquire)) {
                    return Err(TransportError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
        }
    }
}

/// Every event up to and including the terminal one, plus the final message.
pub async fn collect(
    mut stream: AssistantMessageEventStream,
) -> (Vec<AssistantMessageEvent>, AssistantMessage) {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    let message = stream.take_result().expect("terminal event");
    (events, message)
}

pub fn kinds(events: &[AssistantMessageEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            AssistantMessageEvent::Start { .. } => "start",
            AssistantMessageEvent::TextStart { .. } => "text_start",
            AssistantMessageEvent::TextDelta { .. } => "text_delta",
            AssistantMessageEvent::TextEnd { .. } => "text_end",
            AssistantMessageEvent::ThinkingStart { .. } => "thinking_start",
            AssistantMessageEvent::ThinkingDelta { .. } => "thinking_delta",
            AssistantMessageEvent::ThinkingEnd { .. } => "thinking_end",
            AssistantMessageEvent::ToolCallStart { .. } => "toolcall_start",
            AssistantMessageEvent::ToolCallDelta { .. } => "toolcall_delta",
            AssistantMessageEvent::ToolCallEnd { .. } => "toolcall_end",
            AssistantMessageEvent::Done { .. } => "done",
            AssistantMessageEvent::Error { .. } => "error",
        })
        .collect()
}
