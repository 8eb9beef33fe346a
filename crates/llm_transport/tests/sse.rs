use llm_transport::SseDecoder;
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn sse_framing_skips_done_sentinel() {
    let payload = concat!(
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hel\"}\n\n",
        "data: [DONE]\n\n",
        "data: {\"type\":\"response.reasoning_summary_text.delta\",\"delta\":\"ok\"}\n\n"
    );

    let events = SseDecoder::parse_frames(payload);
    assert_eq!(
        events,
        vec![
            json!({"type": "response.output_text.delta", "delta": "hel"}),
            json!({"type": "response.reasoning_summary_text.delta", "delta": "ok"}),
        ]
    );
}

#[test]
fn sse_decoder_ignores_event_lines_and_joins_data_lines() {
    let payload = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\n",
        "data: \"message\":{\"id\":\"msg_1\"}}\n\n",
        ": keep-alive comment\n\n",
    );

    let events = SseDecoder::parse_frames(payload);
    assert_eq!(
        events,
        vec![json!({"type": "message_start", "message": {"id": "msg_1"}})]
    );
}

#[test]
fn sse_decoder_ignores_malformed_frames() {
    let payload = concat!(
        "data: {\"type\":\"unknown.event\",\"foo\":\"bar\"}\n\n",
        "data: {broken-json\n\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"x\"}\n\n"
    );

    let events = SseDecoder::parse_frames(payload);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["delta"], "x");
}

#[test]
fn sse_decoder_handles_split_frames_incrementally() {
    let mut decoder = SseDecoder::default();
    assert!(decoder
        .feed(b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"abc\"")
        .is_empty());
    let events = decoder.feed(b"}\n\n");
    assert_eq!(events, vec![json!({"type": "response.output_text.delta", "delta": "abc"})]);
}

#[test]
fn sse_decoder_accepts_crlf_line_endings() {
    let events = SseDecoder::parse_frames("data: {\"n\":1}\r\n\r\ndata: {\"n\":2}\r\n\r\n");
    assert_eq!(events, vec![json!({"n": 1}), json!({"n": 2})]);
}

#[test]
fn sse_decoder_skips_empty_data_frames() {
    let payload = concat!(
        "data: \n\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"done\"}\n\n"
    );
    let events = SseDecoder::parse_frames(payload);
    assert_eq!(events.len(), 1);
}

#[test]
fn sse_decoder_keeps_incomplete_trailing_bytes() {
    let mut decoder = SseDecoder::default();
    assert!(decoder
        .feed(b"data: {\"type\":\"response.reasoning_summary_text.delta\",\"delta\":\"nope\"")
        .is_empty());
    assert!(!decoder.is_empty_buffer());
}
