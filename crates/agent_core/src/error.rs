/// Reasons a caller action on the loop or the [`crate::Agent`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error(
        "Agent is already processing a prompt. Use steer() or follow_up() to queue messages, or wait for completion."
    )]
    AlreadyStreaming,
    #[error("{0}")]
    CannotContinue(String),
    #[error("No model configured")]
    NoModel,
}

/// Failure of one tool call. Always converted into an error-flagged tool result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {0} not found")]
    UnknownTool(String),
    #[error("{0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
    #[error("Tool execution was aborted")]
    Cancelled,
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}
