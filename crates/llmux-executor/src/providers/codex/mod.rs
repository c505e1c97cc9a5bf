//! Codex (OpenAI Responses API) transports.

pub mod http;
pub mod prompt_cache;
pub mod websocket;

pub use http::CodexExecutor;
pub use websocket::{CodexAutoExecutor, CodexWebsocketExecutor};

use serde_json::{Value, json};

use llmux_core::{Auth, ExecutorResult, Format, Headers, UsageDetail, header_set};

use crate::base::{ProviderConfig, apply_custom_headers_from_attrs, ensure_header};
use crate::json::{delete_path, get_path, get_trimmed_str, set_path};
use crate::providers::set_bearer;
use crate::usage_parse::{codex_completed_event_payload, parse_codex_usage};

pub const CODEX_DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
pub const CODEX_CLIENT_VERSION: &str = "0.101.0";
pub const CODEX_USER_AGENT: &str =
    "codex_cli_rs/0.101.0 (Mac OS 26.0.1; arm64) Apple_Terminal/464";
pub const COMPACT_ALT: &str = "responses/compact";

/// `(api_key, base_url)`: explicit attribute key wins, otherwise the OAuth
/// access token rides in the key slot.
pub fn codex_credentials(auth: &Auth) -> (String, String) {
    let api_key = auth
        .attribute("api_key")
        .map(str::to_string)
        .or_else(|| auth.metadata_str("access_token").map(str::to_string))
        .unwrap_or_default();
    let base_url = auth
        .attribute("base_url")
        .unwrap_or(CODEX_DEFAULT_BASE_URL)
        .trim_end_matches('/')
        .to_string();
    (api_key, base_url)
}

pub fn is_api_key_auth(auth: &Auth) -> bool {
    auth.attribute("api_key").is_some()
}

#[derive(Debug, Default)]
pub struct CodexProviderConfig;

impl ProviderConfig for CodexProviderConfig {
    fn identifier(&self) -> &str {
        "codex"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        codex_credentials(auth)
    }

    fn endpoint(&self, base_url: &str, _model: &str, _action: &str, _stream: bool) -> String {
        format!("{}/responses", base_url.trim_end_matches('/'))
    }

    fn apply_headers(
        &self,
        headers: &mut Headers,
        auth: &Auth,
        api_key: &str,
        stream: bool,
        inbound: &Headers,
    ) {
        header_set(headers, "Content-Type", "application/json");
        set_bearer(headers, api_key);

        ensure_header(headers, inbound, "Version", CODEX_CLIENT_VERSION);
        ensure_header(headers, inbound, "Session_id", &uuid::Uuid::new_v4().to_string());
        ensure_header(headers, inbound, "User-Agent", CODEX_USER_AGENT);
        ensure_header(headers, inbound, "x-codex-beta-features", "");
        ensure_header(headers, inbound, "x-codex-turn-state", "");
        ensure_header(headers, inbound, "x-codex-turn-metadata", "");
        ensure_header(headers, inbound, "x-responsesapi-include-timing-metrics", "");

        header_set(headers, "Accept", if stream { "text/event-stream" } else { "application/json" });
        header_set(headers, "Connection", "Keep-Alive");

        if !is_api_key_auth(auth) {
            header_set(headers, "Originator", "codex_cli_rs");
            if let Some(account_id) = auth.metadata_str("account_id") {
                header_set(headers, "Chatgpt-Account-Id", account_id);
            }
        }

        apply_custom_headers_from_attrs(headers, auth);
    }

    fn translator_format(&self) -> Format {
        Format::Codex
    }

    fn transform_request_body(
        &self,
        body: Value,
        model: &str,
        stream: bool,
    ) -> ExecutorResult<Value> {
        Ok(normalize_codex_request_body(body, model, stream))
    }

    fn parse_usage(&self, data: &[u8], stream: bool) -> UsageDetail {
        if stream {
            if let Some(payload) = codex_completed_event_payload(data)
                && let Some(detail) = parse_codex_usage(payload)
            {
                return detail;
            }
            UsageDetail::default()
        } else if let Some(detail) = parse_codex_usage(data) {
            detail
        } else {
            UsageDetail::default()
        }
    }
}

/// Upstream request normalization shared by the HTTP and WebSocket paths:
/// pins `model`/`stream`, maps the OpenAI `reasoning_effort` alias into
/// `reasoning.effort`, drops fields the Codex backend rejects, and
/// guarantees `instructions` exists.
pub fn normalize_codex_request_body(mut body: Value, model: &str, stream: bool) -> Value {
    set_path(&mut body, "model", json!(model));
    set_path(&mut body, "stream", json!(stream));

    if get_path(&body, "reasoning.effort").is_none()
        && let Some(effort) = get_trimmed_str(&body, "reasoning_effort").map(str::to_string)
    {
        set_path(&mut body, "reasoning.effort", json!(effort));
    }
    delete_path(&mut body, "reasoning_effort");

    delete_path(&mut body, "previous_response_id");
    delete_path(&mut body, "prompt_cache_retention");
    delete_path(&mut body, "safety_identifier");

    if get_path(&body, "instructions").is_none() {
        set_path(&mut body, "instructions", json!(""));
    }
    body
}
