//! End-to-end checks of usage extraction over literal upstream payloads.

use llmux_executor::usage_parse::{
    codex_completed_event_payload, parse_codex_usage, parse_gemini_usage, parse_openai_usage,
    parse_openai_stream_usage,
};

/// The Codex non-stream path internally streams and selects the single
/// `response.completed` event; usage must come from exactly that event.
#[test]
fn codex_stream_folding_selects_completed_event() {
    let upstream = concat!(
        "data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_1\"}}\n",
        "\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n",
        "\n",
        "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":2,\"total_tokens\":3}}}\n",
        "\n",
    );

    let mut completed = Vec::new();
    for line in upstream.as_bytes().split(|&byte| byte == b'\n') {
        if let Some(payload) = codex_completed_event_payload(line) {
            completed.push(payload.to_vec());
        }
    }
    assert_eq!(completed.len(), 1, "exactly one completion event");

    let detail = parse_codex_usage(&completed[0]).expect("usage");
    assert_eq!(detail.input_tokens, 1);
    assert_eq!(detail.output_tokens, 2);
    assert_eq!(detail.reasoning_tokens, 0);
    assert_eq!(detail.cached_tokens, 0);
    assert_eq!(detail.total_tokens, 3);
}

#[test]
fn codex_usage_includes_reasoning_and_cache_details() {
    let payload = br#"{"type":"response.completed","response":{"usage":{"input_tokens":100,"output_tokens":40,"total_tokens":140,"output_tokens_details":{"reasoning_tokens":25},"input_tokens_details":{"cached_tokens":64}}}}"#;
    let detail = parse_codex_usage(payload).expect("usage");
    assert_eq!(detail.reasoning_tokens, 25);
    assert_eq!(detail.cached_tokens, 64);
}

#[test]
fn stream_without_completion_yields_no_usage() {
    let upstream = "data: {\"type\":\"response.created\"}\n\ndata: {\"type\":\"response.output_text.delta\"}\n\n";
    for line in upstream.as_bytes().split(|&byte| byte == b'\n') {
        assert!(codex_completed_event_payload(line).is_none());
    }
}

#[test]
fn openai_usage_variants() {
    let body = br#"{"usage":{"prompt_tokens":12,"completion_tokens":8,"total_tokens":20,"prompt_tokens_details":{"cached_tokens":4},"completion_tokens_details":{"reasoning_tokens":2}}}"#;
    let detail = parse_openai_usage(body);
    assert_eq!(detail.input_tokens, 12);
    assert_eq!(detail.cached_tokens, 4);
    assert_eq!(detail.reasoning_tokens, 2);

    let line = br#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#;
    let detail = parse_openai_stream_usage(line).expect("stream usage");
    assert_eq!(detail.total_tokens, 6);
}

#[test]
fn gemini_usage_totals_fall_back_to_sum() {
    let body = br#"{"usageMetadata":{"promptTokenCount":9,"candidatesTokenCount":3}}"#;
    let detail = parse_gemini_usage(body);
    assert_eq!(detail.total_tokens, 12);
}
