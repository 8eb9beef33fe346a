#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_core::{Agent, AgentEvent, AgentTool, AgentToolResult, ToolError, ToolUpdater};
use agent_provider::{is_cancelled, CancelSignal, Message};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Returns its `text` argument, streaming one partial result first.
pub struct EchoTool;

#[async_trait]
impl AgentTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echo the text back"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        args: Value,
        _cancel: CancelSignal,
        updater: &ToolUpdater,
    ) -> Result<AgentToolResult, ToolError> {
        let text = args["text"].as_str().unwrap_or_default().to_owned();
        updater.update(AgentToolResult::text("echoing"));
        Ok(AgentToolResult::text(text.clone()).with_details(json!({"length": text.len()})))
    }
}

/// Always fails with an execution error.
pub struct FailingTool;

#[async_trait]
impl AgentTool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        _call_id: &str,
        _args: Value,
        _cancel: CancelSignal,
        _updater: &ToolUpdater,
    ) -> Result<AgentToolResult, ToolError> {
        Err(ToolError::execution("disk on fire"))
    }
}

pub struct PanickingTool;

#[async_trait]
impl AgentTool for PanickingTool {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "panics"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        _call_id: &str,
        _args: Value,
        _cancel: CancelSignal,
        _updater: &ToolUpdater,
    ) -> Result<AgentToolResult, ToolError> {
        panic!("boom");
    }
}

/// Sleeps until cancelled, then reports the abort.
pub struct SlowTool;

#[async_trait]
impl AgentTool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "waits for cancellation"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        _call_id: &str,
        _args: Value,
        cancel: CancelSignal,
        _updater: &ToolUpdater,
    ) -> Result<AgentToolResult, ToolError> {
        while !is_cancelled(Some(&cancel)) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Err(ToolError::Cancelled)
    }
}

/// Records the call ids it ran and how many messages the agent held at that time.
#[derive(Default)]
pub struct ObservingTool {
    agent: Mutex<Option<Agent>>,
    pub seen: Mutex<Vec<(String, usize, Option<String>)>>,
}

impl ObservingTool {
    pub fn attach(&self, agent: Agent) {
        *self.agent.lock().expect("lock") = Some(agent);
    }

    pub fn seen(&self) -> Vec<(String, usize, Option<String>)> {
        self.seen.lock().expect("lock").clone()
    }
}

#[async_trait]
impl AgentTool for ObservingTool {
    fn name(&self) -> &str {
        "observe"
    }

    fn description(&self) -> &str {
        "records committed agent state"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(
        &self,
        call_id: &str,
        _args: Value,
        _cancel: CancelSignal,
        _updater: &ToolUpdater,
    ) -> Result<AgentToolResult, ToolError> {
        let agent = self.agent.lock().expect("lock").clone();
        let (count, last_tool_result) = match agent {
            Some(agent) => {
                let messages = agent.messages();
                let last_tool_result = messages.iter().rev().find_map(|message| match message {
                    Message::ToolResult(result) => Some(result.text()),
                    _ => None,
                });
                (messages.len(), last_tool_result)
            }
            None => (0, None),
        };
        self.seen
            .lock()
            .expect("lock")
            .push((call_id.to_owned(), count, last_tool_result));
        Ok(AgentToolResult::text(format!("observed {call_id}")))
    }
}

/// Shared event log for closures that outlive the test body's borrow.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<AgentEvent>>>);

impl EventLog {
    pub fn push(&self, event: AgentEvent) {
        self.0.lock().expect("lock").push(event);
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.0.lock().expect("lock").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(kind).collect()
    }
}

pub fn kind(event: &AgentEvent) -> &'static str {
    match event {
        AgentEvent::AgentStart => "agent_start",
        AgentEvent::AgentEnd { .. } => "agent_end",
        AgentEvent::TurnStart => "turn_start",
        AgentEvent::TurnEnd { .. } => "turn_end",
        AgentEvent::MessageStart { .. } => "message_start",
        AgentEvent::MessageUpdate { .. } => "message_update",
        AgentEvent::MessageEnd { .. } => "message_end",
        AgentEvent::ToolExecutionStart { .. } => "tool_execution_start",
        AgentEvent::ToolExecutionUpdate { .. } => "tool_execution_update",
        AgentEvent::ToolExecutionEnd { .. } => "tool_execution_end",
    }
}

/// Counter-driven message source: yields `messages` on the `at`-th poll only.
pub fn deliver_on_poll(at: usize, messages: Vec<Message>) -> (Arc<AtomicUsize>, agent_core::MessageSource) {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    let source: agent_core::MessageSource = Arc::new(move || {
        let poll = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if poll == at {
            messages.clone()
        } else {
            Vec::new()
        }
    });
    (polls, source)
}

pub fn role_sequence(messages: &[Message]) -> Vec<&'static str> {
    messages.iter().map(Message::role).collect()
}
