//! Agent loop and session wrapper on top of the provider contract.
//!
//! The loop alternates model calls and tool executions until the model stops
//! asking for tools, draining steering messages between tools and follow-up
//! messages when it would otherwise stop. [`Agent`] keeps the conversation and
//! queues across runs and rejects overlapping prompts.

pub mod agent;
pub mod agent_loop;
pub mod error;
pub mod events;
pub mod tool;

pub use agent::{Agent, AgentState, PromptInput, QueueMode, SubscriptionId};
pub use agent_loop::{
    agent_loop, agent_loop_continue, run_agent_loop, run_agent_loop_continue, AgentContext,
    AgentLoopConfig, ApiKeyResolver, MessageSource, LOOP_PANICKED, SKIPPED_TOOL_CALL_TEXT,
};
pub use error::{AgentError, ToolError};
pub use events::{agent_event_stream, AgentEvent, AgentEventSink, AgentEventStream};
pub use tool::{validate_tool_arguments, AgentTool, AgentToolResult, ToolUpdater};
