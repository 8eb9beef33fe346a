mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use agent_provider::{
    cancel_signal, Api, AssistantMessageEvent, ContentBlock, Context, Message, Model, ModelCost,
    StopReason, StreamOptions, ToolDefinition,
};
use agent_providers::{AnthropicAdapter, ProviderAdapter};
use common::{collect, kinds, Ending, ScriptedTransport};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn model() -> Model {
    Model::new("claude-sonnet-4-5", Api::AnthropicMessages, "anthropic", "https://api.anthropic.com")
        .with_cost(ModelCost {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        })
}

fn context() -> Context {
    Context::new(Some("be brief".into()), vec![Message::user_text("read a")])
}

fn options() -> StreamOptions {
    StreamOptions::new().with_api_key("sk-ant-api03-test")
}

fn message_start() -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": "msg_01",
            "usage": {
                "input_tokens": 100,
                "output_tokens": 1,
                "cache_read_input_tokens": 20,
                "cache_creation_input_tokens": 5
            }
        }
    })
}

#[tokio::test]
async fn streams_text_and_tool_call_with_usage() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Reading"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read", "input": {}}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"a\":1"}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "}"}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "ping"}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 42}}),
        json!({"type": "message_stop"}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport.clone());

    let (events, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(
        kinds(&events),
        vec![
            "start",
            "text_start",
            "text_delta",
            "text_end",
            "toolcall_start",
            "toolcall_delta",
            "toolcall_delta",
            "toolcall_end",
            "done",
        ]
    );

    let live = events
        .iter()
        .find_map(|event| match event {
            AssistantMessageEvent::ToolCallDelta { partial, .. } => partial.tool_calls().next().cloned(),
            _ => None,
        })
        .expect("first tool delta");
    assert_eq!(live.arguments, json!({"a": 1}));

    assert_eq!(message.stop_reason, StopReason::ToolUse);
    assert_eq!(message.response_id.as_deref(), Some("msg_01"));
    assert_eq!(message.text(), "Reading");
    let call = message.tool_calls().next().expect("tool call");
    assert_eq!(call.id, "toolu_1");
    assert_eq!(call.arguments, json!({"a": 1}));

    assert_eq!(message.usage.input, 100);
    assert_eq!(message.usage.output, 42);
    assert_eq!(message.usage.cache_read, 20);
    assert_eq!(message.usage.cache_write, 5);
    assert_eq!(message.usage.total_tokens, 167);
    assert!(message.usage.cost.total > 0.0);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "https://api.anthropic.com/v1/messages");
    assert_eq!(requests[0].body["stream"], json!(true));
}

#[tokio::test]
async fn thinking_blocks_keep_their_signature() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "Let me think"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "sig-"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "abc"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 7}}),
        json!({"type": "message_stop"}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport);

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.stop_reason, StopReason::Stop);
    match &message.content[0] {
        ContentBlock::Thinking(thinking) => {
            assert_eq!(thinking.thinking, "Let me think");
            assert_eq!(thinking.thinking_signature.as_deref(), Some("sig-abc"));
        }
        other => panic!("expected thinking block, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_stop_reason_ends_in_error() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hi"}}),
        json!({"type": "message_delta", "delta": {"stop_reason": "something_new"}}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport);

    let (events, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(kinds(&events).last(), Some(&"error"));
    assert_eq!(message.stop_reason, StopReason::Error);
    assert_eq!(
        message.error_message.as_deref(),
        Some("Unhandled stop reason: something_new")
    );
    assert_eq!(message.text(), "hi");
}

#[tokio::test]
async fn vendor_error_event_is_terminal() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport);

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.stop_reason, StopReason::Error);
    assert_eq!(message.error_message.as_deref(), Some("Overloaded"));
}

#[tokio::test]
async fn stream_cut_before_message_stop_is_an_error() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "partial"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport);

    let (events, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(kinds(&events).last(), Some(&"error"));
    assert!(!kinds(&events).contains(&"done"));
    assert_eq!(message.stop_reason, StopReason::Error);
    assert_eq!(
        message.error_message.as_deref(),
        Some("Stream ended without message_stop")
    );
    assert_eq!(message.text(), "partial");
}

#[tokio::test]
async fn refusal_stop_reason_is_an_error() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "message_delta", "delta": {"stop_reason": "refusal"}}),
        json!({"type": "message_stop"}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport);

    let (events, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(kinds(&events).last(), Some(&"error"));
    assert_eq!(message.stop_reason, StopReason::Error);
}

#[tokio::test]
async fn abort_mid_stream_ends_with_aborted_error_and_no_open_blocks() {
    let transport = ScriptedTransport::named(
        "scripted",
        vec![
            message_start(),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"pa"}}),
        ],
        Ending::HangUntilCancelled,
    );
    let adapter = AnthropicAdapter::with_transport(transport);
    let cancel = cancel_signal();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.store(true, Ordering::Release);
    });

    let options = options().with_cancel(cancel);
    let (events, message) = collect(adapter.stream(&model(), &context(), &options)).await;

    match events.last() {
        Some(AssistantMessageEvent::Error { reason, .. }) => assert_eq!(*reason, StopReason::Aborted),
        other => panic!("expected aborted error, got {other:?}"),
    }
    assert_eq!(message.stop_reason, StopReason::Aborted);
    assert_eq!(message.error_message.as_deref(), Some("Request was aborted"));
    assert_eq!(message.content.len(), 1);
    assert!(!events
        .iter()
        .any(|event| matches!(event, AssistantMessageEvent::ToolCallEnd { .. })));
}

#[tokio::test]
async fn missing_api_key_fails_without_network() {
    let transport = ScriptedTransport::new(Vec::new());
    let adapter = AnthropicAdapter::with_transport(transport.clone());
    let model = Model::new("m", Api::AnthropicMessages, "keyless-vendor", "https://example.test");

    let (events, message) = collect(adapter.stream(&model, &context(), &StreamOptions::new())).await;

    assert_eq!(kinds(&events), vec!["error"]);
    assert_eq!(
        message.error_message.as_deref(),
        Some("No API key for provider: keyless-vendor")
    );
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn oauth_tool_names_map_back_to_context_tools() {
    let transport = ScriptedTransport::new(vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_9", "name": "Bash", "input": {"cmd": "ls"}}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        json!({"type": "message_stop"}),
    ]);
    let adapter = AnthropicAdapter::with_transport(transport.clone());
    let context = context().with_tools(vec![ToolDefinition::new(
        "bash",
        "run a command",
        json!({"type": "object", "properties": {"cmd": {"type": "string"}}, "required": ["cmd"]}),
    )]);
    let options = StreamOptions::new().with_api_key("sk-ant-oat01-token");

    let (_, message) = collect(adapter.stream(&model(), &context, &options)).await;

    let call = message.tool_calls().next().expect("tool call");
    assert_eq!(call.name, "bash");
    assert_eq!(call.arguments, json!({"cmd": "ls"}));
    assert_eq!(transport.requests()[0].body["tools"][0]["name"], "Bash");
}
