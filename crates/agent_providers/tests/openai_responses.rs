mod common;

use agent_provider::{
    Api, ContentBlock, Context, Message, Model, ModelCost, StopReason, StreamOptions,
};
use agent_providers::{OpenAiResponsesAdapter, ProviderAdapter};
use common::{collect, kinds, ScriptedTransport};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn model() -> Model {
    Model::new("gpt-5", Api::OpenAiResponses, "openai", "https://api.openai.com/v1")
        .with_reasoning(true)
        .with_cost(ModelCost {
            input: 1.0,
            output: 10.0,
            cache_read: 0.1,
            cache_write: 0.0,
        })
}

fn options() -> StreamOptions {
    StreamOptions::new().with_api_key("sk-test").with_session_id("sess")
}

fn context() -> Context {
    Context::new(None, vec![Message::user_text("list files")])
}

fn completed(status: &str, service_tier: Option<&str>) -> Value {
    json!({
        "type": "response.completed",
        "response": {
            "id": "resp_1",
            "status": status,
            "service_tier": service_tier,
            "usage": {
                "input_tokens": 1000,
                "output_tokens": 200,
                "total_tokens": 1200,
                "input_tokens_details": {"cached_tokens": 400}
            }
        }
    })
}

fn reasoning_and_call_events() -> Vec<Value> {
    vec![
        json!({"type": "response.created", "response": {"id": "resp_1"}}),
        json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "reasoning", "id": "rs_1"}}),
        json!({"type": "response.reasoning_summary_part.added", "output_index": 0}),
        json!({"type": "response.reasoning_summary_text.delta", "output_index": 0, "delta": "Plan"}),
        json!({"type": "response.reasoning_summary_part.done", "output_index": 0}),
        json!({"type": "response.output_item.done", "output_index": 0, "item": {
            "type": "reasoning", "id": "rs_1", "summary": [{"type": "summary_text", "text": "Plan"}]
        }}),
        json!({"type": "response.output_item.added", "output_index": 1, "item": {"type": "message", "id": "msg_1"}}),
        json!({"type": "response.content_part.added", "output_index": 1, "part": {"type": "output_text"}}),
        json!({"type": "response.output_text.delta", "output_index": 1, "delta": "Listing"}),
        json!({"type": "response.output_item.done", "output_index": 1, "item": {
            "type": "message", "id": "msg_1", "content": [{"type": "output_text", "text": "Listing"}]
        }}),
        json!({"type": "response.output_item.added", "output_index": 2, "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "ls", "arguments": ""
        }}),
        json!({"type": "response.function_call_arguments.delta", "output_index": 2, "delta": "{\"path\":"}),
        json!({"type": "response.function_call_arguments.delta", "output_index": 2, "delta": "\".\"}"}),
        json!({"type": "response.function_call_arguments.done", "output_index": 2, "arguments": "{\"path\":\".\"}"}),
        json!({"type": "response.output_item.done", "output_index": 2, "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "ls", "arguments": "{\"path\":\".\"}"
        }}),
    ]
}

#[tokio::test]
async fn reasoning_text_and_function_call_stream_in_order() {
    let mut events = reasoning_and_call_events();
    events.push(completed("completed", None));
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(events));

    let (events, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(
        kinds(&events),
        vec![
            "start",
            "thinking_start",
            "thinking_delta",
            "thinking_delta",
            "thinking_end",
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
    assert_eq!(message.stop_reason, StopReason::ToolUse);
    assert_eq!(message.response_id.as_deref(), Some("resp_1"));

    match &message.content[0] {
        ContentBlock::Thinking(thinking) => {
            assert_eq!(thinking.thinking, "Plan");
            let item: Value = serde_json::from_str(
                thinking.thinking_signature.as_deref().expect("reasoning item"),
            )
            .expect("json signature");
            assert_eq!(item["id"], "rs_1");
        }
        other => panic!("expected thinking, got {other:?}"),
    }
    match &message.content[1] {
        ContentBlock::Text(text) => {
            assert_eq!(text.text, "Listing");
            assert_eq!(text.text_signature.as_deref(), Some("msg_1"));
        }
        other => panic!("expected text, got {other:?}"),
    }
    let call = message.tool_calls().next().expect("tool call");
    assert_eq!(call.id, "call_1|fc_1");
    assert_eq!(call.arguments, json!({"path": "."}));
}

#[tokio::test]
async fn usage_uses_native_total_and_service_tier_pricing() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(vec![completed(
        "completed",
        Some("flex"),
    )]));

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.stop_reason, StopReason::Stop);
    assert_eq!(message.usage.input, 600);
    assert_eq!(message.usage.cache_read, 400);
    assert_eq!(message.usage.output, 200);
    assert_eq!(message.usage.total_tokens, 1200);
    // 600 * 1.0 + 200 * 10.0 + 400 * 0.1 per million, halved for flex.
    let expected = (600.0 + 2000.0 + 40.0) / 1_000_000.0 * 0.5;
    assert!((message.usage.cost.total - expected).abs() < 1e-12);
}

#[tokio::test]
async fn incomplete_status_maps_to_length() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(vec![completed(
        "incomplete",
        None,
    )]));

    let (events, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(kinds(&events), vec!["start", "done"]);
    assert_eq!(message.stop_reason, StopReason::Length);
}

#[tokio::test]
async fn unknown_status_is_a_protocol_error() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(vec![completed(
        "paused",
        None,
    )]));

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.stop_reason, StopReason::Error);
    assert_eq!(message.error_message.as_deref(), Some("Unhandled stop reason: paused"));
}

#[tokio::test]
async fn error_events_surface_code_and_message() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(vec![json!({
        "type": "error",
        "code": "server_error",
        "message": "The server had an error"
    })]));

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.stop_reason, StopReason::Error);
    assert_eq!(
        message.error_message.as_deref(),
        Some("Error Code server_error: The server had an error")
    );
}

#[tokio::test]
async fn response_failed_without_detail_uses_fallback_message() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(vec![
        json!({"type": "response.failed", "response": {"status": "failed"}}),
    ]));

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.error_message.as_deref(), Some("Unknown error"));
}

#[tokio::test]
async fn deltas_before_content_part_are_ignored() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(vec![
        json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "message", "id": "msg_1"}}),
        json!({"type": "response.output_text.delta", "output_index": 0, "delta": "early"}),
        json!({"type": "response.content_part.added", "output_index": 0, "part": {"type": "output_text"}}),
        json!({"type": "response.output_text.delta", "output_index": 0, "delta": "late"}),
        completed("completed", None),
    ]));

    let (_, message) = collect(adapter.stream(&model(), &context(), &options())).await;

    assert_eq!(message.text(), "late");
    assert_eq!(message.content.len(), 1);
}

#[test]
fn request_goes_to_responses_endpoint() {
    let adapter = OpenAiResponsesAdapter::with_transport(ScriptedTransport::new(Vec::new()));
    let request = adapter
        .build_request(&model(), &context(), &options())
        .expect("request");

    assert_eq!(request.url, "https://api.openai.com/v1/responses");
    assert_eq!(request.body["input"][0]["content"][0]["text"], "list files");
}
