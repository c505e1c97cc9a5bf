//! Kimi provider: OpenAI-compatible chat completions with kimi-cli
//! compatible headers and tool-message link repair.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Value, json};

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, UsageDetail,
    header_set,
};

use crate::base::{BaseExecutor, ProviderConfig, apply_custom_headers_from_attrs};
use crate::json::{get_path, get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::usage_parse::{parse_openai_stream_usage, parse_openai_usage};

pub const KIMI_API_BASE_URL: &str = "https://api.moonshot.cn";
const KIMI_TOKEN_URL: &str = "https://api.moonshot.cn/oauth2/token";
const KIMI_CLI_VERSION: &str = "1.10.6";
const FALLBACK_DEVICE_ID: &str = "llmux-device";
const REASONING_UNAVAILABLE: &str = "[reasoning unavailable]";

#[derive(Debug, Default)]
pub struct KimiProviderConfig;

impl ProviderConfig for KimiProviderConfig {
    fn identifier(&self) -> &str {
        "kimi"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        (kimi_token(auth).unwrap_or_default(), KIMI_API_BASE_URL.to_string())
    }

    fn endpoint(&self, base_url: &str, _model: &str, _action: &str, _stream: bool) -> String {
        format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
    }

    fn apply_headers(
        &self,
        headers: &mut Headers,
        auth: &Auth,
        api_key: &str,
        stream: bool,
        _inbound: &Headers,
    ) {
        header_set(headers, "Content-Type", "application/json");
        set_bearer(headers, api_key);
        // kimi-cli fingerprint; upstream rejects unknown clients.
        header_set(headers, "User-Agent", &format!("KimiCLI/{KIMI_CLI_VERSION}"));
        header_set(headers, "X-Msh-Platform", "kimi_cli");
        header_set(headers, "X-Msh-Version", KIMI_CLI_VERSION);
        header_set(headers, "X-Msh-Device-Name", &hostname());
        header_set(headers, "X-Msh-Device-Model", &device_model());
        header_set(headers, "X-Msh-Device-Id", &resolve_device_id(auth));
        header_set(headers, "Accept", if stream { "text/event-stream" } else { "application/json" });
        apply_custom_headers_from_attrs(headers, auth);
    }

    fn translator_format(&self) -> Format {
        Format::OpenAI
    }

    fn transform_request_body(
        &self,
        mut body: Value,
        model: &str,
        stream: bool,
    ) -> ExecutorResult<Value> {
        set_path(&mut body, "model", json!(strip_kimi_prefix(model)));
        normalize_tool_message_links(&mut body);
        if stream {
            set_path(&mut body, "stream_options.include_usage", json!(true));
        }
        Ok(body)
    }

    fn parse_usage(&self, data: &[u8], stream: bool) -> UsageDetail {
        if stream {
            parse_openai_stream_usage(data).unwrap_or_default()
        } else {
            parse_openai_usage(data)
        }
    }
}

/// Removes the routing prefix before hitting the upstream API.
pub fn strip_kimi_prefix(model: &str) -> String {
    let model = model.trim();
    if model.len() > 5 && model[..5].eq_ignore_ascii_case("kimi-") {
        model[5..].to_string()
    } else {
        model.to_string()
    }
}

/// Repairs the assistant/tool message linkage the upstream insists on:
/// tool messages get a `tool_call_id` (from `call_id`, or the single
/// outstanding call), and assistant messages with tool calls get a
/// `reasoning_content` scaffold.
pub fn normalize_tool_message_links(body: &mut Value) {
    let Some(messages) = get_path(body, "messages").and_then(Value::as_array).cloned() else {
        return;
    };

    let mut pending: Vec<String> = Vec::new();
    let mut latest_reasoning: Option<String> = None;

    for (index, message) in messages.iter().enumerate() {
        let role = get_trimmed_str(message, "role").unwrap_or("");
        match role {
            "assistant" => {
                if let Some(text) = get_trimmed_str(message, "reasoning_content") {
                    latest_reasoning = Some(text.to_string());
                }

                let tool_calls: Vec<Value> = get_path(message, "tool_calls")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if tool_calls.is_empty() {
                    continue;
                }

                if get_trimmed_str(message, "reasoning_content").is_none() {
                    let scaffold =
                        fallback_assistant_reasoning(message, latest_reasoning.as_deref());
                    set_path(body, &format!("messages.{index}.reasoning_content"), json!(scaffold));
                }

                for call in &tool_calls {
                    if let Some(id) = get_trimmed_str(call, "id") {
                        pending.push(id.to_string());
                    }
                }
            }
            "tool" => {
                let mut tool_call_id = get_trimmed_str(message, "tool_call_id")
                    .map(str::to_string);
                if tool_call_id.is_none()
                    && let Some(call_id) = get_trimmed_str(message, "call_id")
                {
                    tool_call_id = Some(call_id.to_string());
                    set_path(body, &format!("messages.{index}.tool_call_id"), json!(call_id));
                }
                if tool_call_id.is_none() && pending.len() == 1 {
                    let inferred = pending[0].clone();
                    set_path(body, &format!("messages.{index}.tool_call_id"), json!(inferred));
                    tool_call_id = Some(inferred);
                }
                if let Some(id) = tool_call_id
                    && let Some(position) = pending.iter().position(|candidate| *candidate == id)
                {
                    pending.remove(position);
                }
            }
            _ => {}
        }
    }
}

fn fallback_assistant_reasoning(message: &Value, latest: Option<&str>) -> String {
    if let Some(latest) = latest.map(str::trim).filter(|text| !text.is_empty()) {
        return latest.to_string();
    }

    match get_path(message, "content") {
        Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Some(Value::Array(parts)) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| get_trimmed_str(part, "text"))
                .collect();
            if texts.is_empty() {
                REASONING_UNAVAILABLE.to_string()
            } else {
                texts.join("\n")
            }
        }
        _ => REASONING_UNAVAILABLE.to_string(),
    }
}

fn kimi_token(auth: &Auth) -> Option<String> {
    auth.metadata_str("access_token")
        .or_else(|| auth.attribute("access_token"))
        .or_else(|| auth.attribute("api_key"))
        .map(str::to_string)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn device_model() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Stable device id: credential metadata first, then the kimi-cli share
/// file, then a constant.
pub fn resolve_device_id(auth: &Auth) -> String {
    if let Some(id) = auth.metadata_str("device_id") {
        return id.to_string();
    }
    kimi_cli_device_id_path()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|raw| raw.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| FALLBACK_DEVICE_ID.to_string())
}

fn kimi_cli_device_id_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    let share = match std::env::consts::OS {
        "macos" => home.join("Library").join("Application Support").join("kimi"),
        "windows" => std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("AppData").join("Roaming"))
            .join("kimi"),
        _ => home.join(".local").join("share").join("kimi"),
    };
    Some(share.join("device_id"))
}

pub struct KimiExecutor {
    base: BaseExecutor,
}

impl KimiExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }
}

#[async_trait]
impl ProviderExecutor for KimiExecutor {
    fn identifier(&self) -> &str {
        "kimi"
    }

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        self.base.execute(auth, req, opts).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        self.base.execute_stream(auth, req, opts).await
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        crate::providers::openai_compat::estimate_chat_tokens(&self.base, req, opts)
    }

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        let Some(refresh_token) = auth.metadata_str("refresh_token").map(str::to_string) else {
            return Ok(auth.clone());
        };

        let form = [
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("device_id", resolve_device_id(auth)),
        ];
        let body = form
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "POST".to_string(),
                url: KIMI_TOKEN_URL.to_string(),
                headers: vec![(
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                )],
                body: Some(body.into_bytes().into()),
            },
        )
        .await?;
        if !(200..300).contains(&resp.status) {
            return Err(ExecutorError::status(
                resp.status,
                String::from_utf8_lossy(&resp.body).into_owned(),
            ));
        }

        let token: Value = serde_json::from_slice(&resp.body)
            .map_err(|err| ExecutorError::internal(format!("kimi token response: {err}")))?;
        let mut refreshed = auth.clone();
        if let Some(access) = get_trimmed_str(&token, "access_token") {
            refreshed
                .metadata
                .insert("access_token".to_string(), json!(access));
        }
        if let Some(refresh) = get_trimmed_str(&token, "refresh_token") {
            refreshed
                .metadata
                .insert("refresh_token".to_string(), json!(refresh));
        }
        if let Some(expires_in) = token.get("expires_in").and_then(Value::as_i64) {
            let expiry = time::OffsetDateTime::now_utc() + std::time::Duration::from_secs(expires_in.max(0) as u64);
            if let Ok(formatted) = expiry.format(&time::format_description::well_known::Rfc3339) {
                refreshed.metadata.insert("expired".to_string(), json!(formatted));
            }
        }
        refreshed.metadata.insert("type".to_string(), json!("kimi"));
        Ok(refreshed)
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        if let Some(token) = kimi_token(auth) {
            set_bearer(&mut req.headers, &token);
        }
        Ok(())
    }

    async fn http_request(
        &self,
        auth: &Auth,
        mut req: PreparedHttpRequest,
    ) -> ExecutorResult<PreparedHttpResponse> {
        self.prepare_request(&mut req, auth)?;
        passthrough_http(self.base.cfg(), auth, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_kimi_prefix_case_insensitively() {
        assert_eq!(strip_kimi_prefix("kimi-k2-turbo"), "k2-turbo");
        assert_eq!(strip_kimi_prefix("Kimi-K2"), "K2");
        assert_eq!(strip_kimi_prefix("k2"), "k2");
    }

    #[test]
    fn tool_call_id_inferred_from_single_outstanding_call() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "tool_calls": [{"id": "call-1", "type": "function"}]},
                {"role": "tool", "content": "ok"}
            ]
        });
        normalize_tool_message_links(&mut body);
        assert_eq!(body["messages"][1]["tool_call_id"], "call-1");
        let reasoning = body["messages"][0]["reasoning_content"]
            .as_str()
            .expect("reasoning scaffold");
        assert!(!reasoning.trim().is_empty());
    }

    #[test]
    fn tool_call_id_copied_from_call_id_field() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "tool_calls": [{"id": "call-a"}, {"id": "call-b"}]},
                {"role": "tool", "call_id": "call-b", "content": "ok"}
            ]
        });
        normalize_tool_message_links(&mut body);
        assert_eq!(body["messages"][1]["tool_call_id"], "call-b");
    }

    #[test]
    fn ambiguous_pending_calls_are_left_alone() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "content": "thinking", "tool_calls": [{"id": "a"}, {"id": "b"}]},
                {"role": "tool", "content": "ok"}
            ]
        });
        normalize_tool_message_links(&mut body);
        assert!(body["messages"][1].get("tool_call_id").is_none());
    }

    #[test]
    fn reasoning_scaffold_prefers_prior_reasoning_then_content() {
        let mut body = json!({
            "messages": [
                {"role": "assistant", "reasoning_content": "earlier thoughts", "content": "x"},
                {"role": "assistant", "tool_calls": [{"id": "c1"}]}
            ]
        });
        normalize_tool_message_links(&mut body);
        assert_eq!(body["messages"][1]["reasoning_content"], "earlier thoughts");

        let mut body = json!({
            "messages": [
                {"role": "assistant", "content": "call the tool", "tool_calls": [{"id": "c1"}]}
            ]
        });
        normalize_tool_message_links(&mut body);
        assert_eq!(body["messages"][0]["reasoning_content"], "call the tool");

        let mut body = json!({
            "messages": [
                {"role": "assistant", "tool_calls": [{"id": "c1"}]}
            ]
        });
        normalize_tool_message_links(&mut body);
        assert_eq!(body["messages"][0]["reasoning_content"], REASONING_UNAVAILABLE);
    }

    #[test]
    fn no_op_without_tool_calls() {
        let mut body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let before = body.clone();
        normalize_tool_message_links(&mut body);
        assert_eq!(body, before);
    }
}
