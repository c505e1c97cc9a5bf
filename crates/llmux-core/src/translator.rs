use bytes::Bytes;
use serde_json::Value;

use crate::format::Format;

/// Translator state carried across `translate_stream` calls of a single
/// request. Owned by the executor driving the stream; never shared across
/// requests.
#[derive(Debug, Default)]
pub struct TranslateState {
    pub value: Option<Value>,
}

/// Schema conversion between a source wire format and a provider-native
/// format. Implemented by an external translation library; this crate only
/// fixes the calling contract.
///
/// All functions are pure given the payloads and `state`; `state` is the only
/// mutable carry-over between `translate_stream` invocations.
pub trait Translator: Send + Sync {
    fn translate_request(
        &self,
        from: Format,
        to: Format,
        model: &str,
        payload: Bytes,
        stream: bool,
    ) -> Bytes;

    #[allow(clippy::too_many_arguments)]
    fn translate_non_stream(
        &self,
        to: Format,
        from: Format,
        model: &str,
        original_payload: &[u8],
        translated_request: &[u8],
        upstream_body: &[u8],
        state: &mut TranslateState,
    ) -> Bytes;

    /// May emit zero or more client-format chunks per upstream line.
    #[allow(clippy::too_many_arguments)]
    fn translate_stream(
        &self,
        to: Format,
        from: Format,
        model: &str,
        original_payload: &[u8],
        translated_request: &[u8],
        upstream_line: &[u8],
        state: &mut TranslateState,
    ) -> Vec<Bytes>;

    fn translate_token_count(
        &self,
        to: Format,
        from: Format,
        count: i64,
        usage_json: &[u8],
    ) -> Bytes;
}

/// Identity translator: passes payloads through untouched.
///
/// Used when source and target formats already agree, and as the test
/// double for executor pipelines.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranslator;

impl Translator for PassthroughTranslator {
    fn translate_request(
        &self,
        _from: Format,
        _to: Format,
        _model: &str,
        payload: Bytes,
        _stream: bool,
    ) -> Bytes {
        payload
    }

    fn translate_non_stream(
        &self,
        _to: Format,
        _from: Format,
        _model: &str,
        _original_payload: &[u8],
        _translated_request: &[u8],
        upstream_body: &[u8],
        _state: &mut TranslateState,
    ) -> Bytes {
        Bytes::copy_from_slice(upstream_body)
    }

    fn translate_stream(
        &self,
        _to: Format,
        _from: Format,
        _model: &str,
        _original_payload: &[u8],
        _translated_request: &[u8],
        upstream_line: &[u8],
        _state: &mut TranslateState,
    ) -> Vec<Bytes> {
        if upstream_line == b"[DONE]" {
            return Vec::new();
        }
        vec![Bytes::copy_from_slice(upstream_line)]
    }

    fn translate_token_count(
        &self,
        _to: Format,
        _from: Format,
        _count: i64,
        usage_json: &[u8],
    ) -> Bytes {
        Bytes::copy_from_slice(usage_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_skips_done_sentinel() {
        let translator = PassthroughTranslator;
        let mut state = TranslateState::default();
        let chunks = translator.translate_stream(
            Format::OpenAI,
            Format::Claude,
            "m",
            b"",
            b"",
            b"[DONE]",
            &mut state,
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn passthrough_round_trips_bodies() {
        let translator = PassthroughTranslator;
        let mut state = TranslateState::default();
        let body = br#"{"content":"hello"}"#;
        let out = translator.translate_non_stream(
            Format::OpenAI,
            Format::Claude,
            "m",
            b"",
            b"",
            body,
            &mut state,
        );
        assert_eq!(out.as_ref(), body);
    }
}
