//! Tools the agent loop can execute on the model's behalf.

use std::fmt;

use agent_provider::{CancelSignal, ToolCall, ToolDefinition, UserContent};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::ToolError;

/// Output of one tool execution (final or partial).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentToolResult {
    pub content: Vec<UserContent>,
    /// Structured data for the caller; never sent to the model.
    pub details: Value,
}

impl AgentToolResult {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![UserContent::text(text)],
            details: Value::Object(Map::new()),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Streams partial results while a tool is still running.
#[derive(Debug, Clone)]
pub struct ToolUpdater {
    sender: mpsc::UnboundedSender<AgentToolResult>,
}

impl ToolUpdater {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<AgentToolResult>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Publishes a partial result. Dropped silently once the call has finished.
    pub fn update(&self, partial: AgentToolResult) {
        let _ = self.sender.send(partial);
    }
}

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the argument object.
    fn parameters(&self) -> Value;

    async fn execute(
        &self,
        call_id: &str,
        args: Value,
        cancel: CancelSignal,
        updater: &ToolUpdater,
    ) -> Result<AgentToolResult, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

impl fmt::Debug for dyn AgentTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTool").field("name", &self.name()).finish()
    }
}

/// Checks a closed tool call against the tool's schema and returns its arguments.
///
/// Only the top level is checked: the object type, `required` properties, and
/// the primitive `type` of each declared property.
pub fn validate_tool_arguments(tool: &dyn AgentTool, call: &ToolCall) -> Result<Value, ToolError> {
    if let Some(error) = &call.argument_error {
        return Err(ToolError::InvalidArguments(error.clone()));
    }

    let schema = tool.parameters();
    let args = &call.arguments;
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(args.clone());
    }
    let Some(object) = args.as_object() else {
        return Err(invalid(&call.name, "arguments must be an object"));
    };

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for field in required {
        if !object.contains_key(field) {
            return Err(invalid(
                &call.name,
                &format!("missing required property \"{field}\""),
            ));
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in object {
            let expected = properties
                .get(key)
                .and_then(|property| property.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !matches_type(value, expected) {
                    return Err(invalid(
                        &call.name,
                        &format!("property \"{key}\" must be of type {expected}"),
                    ));
                }
            }
        }
    }

    Ok(args.clone())
}

fn invalid(tool: &str, detail: &str) -> ToolError {
    ToolError::InvalidArguments(format!("Validation failed for tool \"{tool}\": {detail}"))
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
