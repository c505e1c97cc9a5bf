//! Usage extraction from provider payloads.
//!
//! Parsers are pure and idempotent per byte-identical input; streaming
//! variants take one SSE line and return nothing until the event carrying
//! usage arrives.

use llmux_core::UsageDetail;
use serde_json::Value;

use crate::json::{get_i64, get_trimmed_str, parse};

pub const DATA_TAG: &[u8] = b"data:";

/// Strips the SSE `data:` prefix from a line, if present.
pub fn sse_payload(line: &[u8]) -> Option<&[u8]> {
    let rest = line.strip_prefix(DATA_TAG)?;
    Some(trim_ascii(rest))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
    match start {
        None => &[],
        Some(start) => {
            let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap_or(start);
            &bytes[start..=end]
        }
    }
}

/// OpenAI chat-completions usage (non-stream body or stream event payload).
pub fn parse_openai_usage(data: &[u8]) -> UsageDetail {
    let Some(value) = parse(data) else {
        return UsageDetail::default();
    };
    openai_usage_from_value(&value)
}

fn openai_usage_from_value(value: &Value) -> UsageDetail {
    let input = get_i64(value, "usage.prompt_tokens").unwrap_or(0);
    let output = get_i64(value, "usage.completion_tokens").unwrap_or(0);
    let total = get_i64(value, "usage.total_tokens").unwrap_or(input + output);
    UsageDetail {
        input_tokens: input,
        output_tokens: output,
        reasoning_tokens: get_i64(value, "usage.completion_tokens_details.reasoning_tokens")
            .unwrap_or(0),
        cached_tokens: get_i64(value, "usage.prompt_tokens_details.cached_tokens").unwrap_or(0),
        total_tokens: total,
    }
}

pub fn parse_openai_stream_usage(line: &[u8]) -> Option<UsageDetail> {
    let payload = sse_payload(line)?;
    if payload == b"[DONE]" {
        return None;
    }
    let value = parse(payload)?;
    value.get("usage").filter(|usage| usage.is_object())?;
    let detail = openai_usage_from_value(&value);
    if detail.is_empty() { None } else { Some(detail) }
}

/// Codex Responses usage from a `response.completed` event payload.
pub fn parse_codex_usage(payload: &[u8]) -> Option<UsageDetail> {
    let value = parse(payload)?;
    let usage = value.get("response")?.get("usage")?;
    let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
    if input == 0 && output == 0 {
        return None;
    }
    Some(UsageDetail {
        input_tokens: input,
        output_tokens: output,
        reasoning_tokens: usage
            .get("output_tokens_details")
            .and_then(|details| details.get("reasoning_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
        cached_tokens: usage
            .get("input_tokens_details")
            .and_then(|details| details.get("cached_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(input + output),
    })
}

/// Extracts the payload of a Codex `response.completed` SSE line.
pub fn codex_completed_event_payload(line: &[u8]) -> Option<&[u8]> {
    let payload = sse_payload(line)?;
    let value = parse(payload)?;
    if get_trimmed_str(&value, "type") != Some("response.completed") {
        return None;
    }
    Some(payload)
}

/// Gemini usage from `usageMetadata` (root or Code Assist `response` wrapper).
pub fn parse_gemini_usage(data: &[u8]) -> UsageDetail {
    let Some(value) = parse(data) else {
        return UsageDetail::default();
    };
    gemini_usage_from_value(&value)
}

fn gemini_usage_from_value(value: &Value) -> UsageDetail {
    let meta = value
        .get("usageMetadata")
        .or_else(|| value.get("response").and_then(|resp| resp.get("usageMetadata")));
    let Some(meta) = meta else {
        return UsageDetail::default();
    };
    let input = meta.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(0);
    let output = meta
        .get("candidatesTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    UsageDetail {
        input_tokens: input,
        output_tokens: output,
        reasoning_tokens: meta
            .get("thoughtsTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        cached_tokens: meta
            .get("cachedContentTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        total_tokens: meta
            .get("totalTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(input + output),
    }
}

pub fn parse_gemini_stream_usage(line: &[u8]) -> Option<UsageDetail> {
    let payload = sse_payload(line)?;
    if payload == b"[DONE]" {
        return None;
    }
    let detail = parse_gemini_usage(payload);
    if detail.is_empty() { None } else { Some(detail) }
}

/// Claude messages usage; accepts both message bodies and stream events
/// (`message_start` nests usage under `message`).
pub fn parse_claude_usage(data: &[u8]) -> UsageDetail {
    let Some(value) = parse(data) else {
        return UsageDetail::default();
    };
    let usage = value
        .get("usage")
        .or_else(|| value.get("message").and_then(|message| message.get("usage")));
    let Some(usage) = usage else {
        return UsageDetail::default();
    };
    let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
    UsageDetail {
        input_tokens: input,
        output_tokens: output,
        reasoning_tokens: 0,
        cached_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        total_tokens: input + output,
    }
}

pub fn parse_claude_stream_usage(line: &[u8]) -> Option<UsageDetail> {
    let payload = sse_payload(line)?;
    let detail = parse_claude_usage(payload);
    if detail.is_empty() { None } else { Some(detail) }
}

/// Drops Gemini SSE events that carry only usage metadata (no candidates);
/// upstream emits those as separate frames and clients choke on them.
pub fn filter_sse_usage_metadata(line: &[u8]) -> Option<Vec<u8>> {
    let Some(payload) = sse_payload(line) else {
        return Some(line.to_vec());
    };
    let Some(value) = parse(payload) else {
        return Some(line.to_vec());
    };
    if value.get("usageMetadata").is_some() && value.get("candidates").is_none() {
        return None;
    }
    Some(line.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_usage_is_idempotent() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let first = parse_openai_usage(body);
        let second = parse_openai_usage(body);
        assert_eq!(first, second);
        assert_eq!(first.input_tokens, 10);
        assert_eq!(first.total_tokens, 15);
    }

    #[test]
    fn openai_stream_usage_skips_done_and_usage_less_events() {
        assert!(parse_openai_stream_usage(b"data: [DONE]").is_none());
        assert!(parse_openai_stream_usage(b"data: {\"choices\":[]}").is_none());
        let detail = parse_openai_stream_usage(
            br#"data: {"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
        )
        .expect("usage");
        assert_eq!(detail.output_tokens, 4);
    }

    #[test]
    fn codex_completed_event_is_detected() {
        let line = br#"data: {"type":"response.completed","response":{"usage":{"input_tokens":1,"output_tokens":2,"total_tokens":3}}}"#;
        let payload = codex_completed_event_payload(line).expect("completed");
        let detail = parse_codex_usage(payload).expect("usage");
        assert_eq!(
            (detail.input_tokens, detail.output_tokens, detail.total_tokens),
            (1, 2, 3)
        );
        assert!(codex_completed_event_payload(b"data: {\"type\":\"response.created\"}").is_none());
        assert!(codex_completed_event_payload(b"event: done").is_none());
    }

    #[test]
    fn gemini_usage_handles_code_assist_wrapper() {
        let body = br#"{"response":{"usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":2,"totalTokenCount":9,"thoughtsTokenCount":1}}}"#;
        let detail = parse_gemini_usage(body);
        assert_eq!(detail.input_tokens, 7);
        assert_eq!(detail.reasoning_tokens, 1);
        assert_eq!(detail.total_tokens, 9);
    }

    #[test]
    fn claude_usage_reads_message_start_events() {
        let line = br#"data: {"type":"message_start","message":{"usage":{"input_tokens":11,"output_tokens":1,"cache_read_input_tokens":4}}}"#;
        let detail = parse_claude_stream_usage(line).expect("usage");
        assert_eq!(detail.input_tokens, 11);
        assert_eq!(detail.cached_tokens, 4);
    }

    #[test]
    fn usage_only_gemini_frames_are_dropped() {
        let usage_only = br#"data: {"usageMetadata":{"promptTokenCount":5}}"#;
        assert!(filter_sse_usage_metadata(usage_only).is_none());

        let with_candidates =
            br#"data: {"candidates":[{"content":{}}],"usageMetadata":{"promptTokenCount":5}}"#;
        assert!(filter_sse_usage_metadata(with_candidates).is_some());

        let not_sse = b"event: ping";
        assert_eq!(filter_sse_usage_metadata(not_sse), Some(not_sse.to_vec()));
    }
}
