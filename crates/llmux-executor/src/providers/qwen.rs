//! Qwen provider: OpenAI-compatible chat completions against the DashScope
//! portal, with the streaming decoy-tool workaround.

use async_trait::async_trait;
use serde_json::{Value, json};

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, UsageDetail,
    header_set,
};

use crate::base::{BaseExecutor, ProviderConfig};
use crate::json::{get_path, get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::usage_parse::{parse_openai_stream_usage, parse_openai_usage};

pub const QWEN_DEFAULT_BASE_URL: &str = "https://portal.qwen.ai/v1";
const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const QWEN_USER_AGENT: &str = "QwenCode/0.10.3 (darwin; arm64)";

/// Qwen3 randomly leaks tokens into streams when the request carries no
/// tools; a single obviously-non-invocable tool stabilizes the stream.
const DECOY_TOOL: &str = r#"[{"type":"function","function":{"name":"do_not_call_me","description":"Do not call this tool under any circumstances, it will have catastrophic consequences.","parameters":{"type":"object","properties":{"operation":{"type":"number","description":"1:poweroff\n2:rm -fr /\n3:mkfs.ext4 /dev/sda1"}},"required":["operation"]}}}]"#;

#[derive(Debug, Default)]
pub struct QwenProviderConfig;

impl ProviderConfig for QwenProviderConfig {
    fn identifier(&self) -> &str {
        "qwen"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        let mut api_key = auth.attribute("api_key").map(str::to_string);
        let mut base_url = auth.attribute("base_url").map(str::to_string);

        if api_key.is_none() {
            api_key = auth.metadata_str("access_token").map(str::to_string);
            if let Some(resource) = auth.metadata_str("resource_url") {
                base_url = Some(format!("https://{resource}/v1"));
            }
        }

        (
            api_key.unwrap_or_default(),
            base_url.unwrap_or_else(|| QWEN_DEFAULT_BASE_URL.to_string()),
        )
    }

    fn endpoint(&self, base_url: &str, _model: &str, _action: &str, _stream: bool) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn apply_headers(
        &self,
        headers: &mut Headers,
        _auth: &Auth,
        api_key: &str,
        stream: bool,
        _inbound: &Headers,
    ) {
        header_set(headers, "Content-Type", "application/json");
        set_bearer(headers, api_key);
        header_set(headers, "User-Agent", QWEN_USER_AGENT);
        header_set(headers, "X-Dashscope-Useragent", QWEN_USER_AGENT);
        header_set(headers, "X-Dashscope-Cachecontrol", "enable");
        header_set(headers, "X-Dashscope-Authtype", "qwen-oauth");
        header_set(headers, "X-Stainless-Lang", "js");
        header_set(headers, "X-Stainless-Runtime", "node");
        header_set(headers, "X-Stainless-Runtime-Version", "v22.17.0");
        header_set(headers, "X-Stainless-Package-Version", "5.11.0");
        header_set(headers, "X-Stainless-Os", "MacOS");
        header_set(headers, "X-Stainless-Arch", "arm64");
        header_set(headers, "X-Stainless-Retry-Count", "0");
        header_set(headers, "Sec-Fetch-Mode", "cors");
        header_set(headers, "Accept", if stream { "text/event-stream" } else { "application/json" });
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
        set_path(&mut body, "model", json!(model));

        if stream {
            let tools_missing = match get_path(&body, "tools") {
                None => true,
                Some(Value::Array(items)) => items.is_empty(),
                Some(_) => false,
            };
            if tools_missing {
                let decoy: Value = serde_json::from_str(DECOY_TOOL)
                    .map_err(|err| ExecutorError::internal(format!("decoy tool: {err}")))?;
                set_path(&mut body, "tools", decoy);
            }
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

pub struct QwenExecutor {
    base: BaseExecutor,
}

impl QwenExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }
}

#[async_trait]
impl ProviderExecutor for QwenExecutor {
    fn identifier(&self) -> &str {
        "qwen"
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

        let body = format!(
            "grant_type=refresh_token&refresh_token={}",
            urlencoding::encode(&refresh_token)
        );
        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "POST".to_string(),
                url: QWEN_TOKEN_URL.to_string(),
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
            .map_err(|err| ExecutorError::internal(format!("qwen token response: {err}")))?;
        let mut refreshed = auth.clone();
        if let Some(access) = get_trimmed_str(&token, "access_token") {
            refreshed.metadata.insert("access_token".to_string(), json!(access));
        }
        if let Some(refresh) = get_trimmed_str(&token, "refresh_token") {
            refreshed.metadata.insert("refresh_token".to_string(), json!(refresh));
        }
        if let Some(resource) = get_trimmed_str(&token, "resource_url") {
            refreshed.metadata.insert("resource_url".to_string(), json!(resource));
        }
        refreshed.metadata.insert("type".to_string(), json!("qwen"));
        Ok(refreshed)
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        let (api_key, _) = QwenProviderConfig.credentials(auth);
        set_bearer(&mut req.headers, &api_key);
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

    fn transform(body: Value, stream: bool) -> Value {
        QwenProviderConfig
            .transform_request_body(body, "qwen3-coder-plus", stream)
            .expect("transform")
    }

    #[test]
    fn decoy_tool_injected_for_streaming_without_tools() {
        let body = transform(json!({"messages": []}), true);
        assert_eq!(body["tools"][0]["function"]["name"], "do_not_call_me");
        assert_eq!(body["stream_options"]["include_usage"], json!(true));

        let body = transform(json!({"messages": [], "tools": []}), true);
        assert_eq!(body["tools"][0]["function"]["name"], "do_not_call_me");
    }

    #[test]
    fn decoy_tool_not_injected_when_tools_present_or_non_stream() {
        let body = transform(
            json!({"tools": [{"type": "function", "function": {"name": "real"}}]}),
            true,
        );
        assert_eq!(body["tools"][0]["function"]["name"], "real");

        let body = transform(json!({"messages": []}), false);
        assert!(body.get("tools").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn oauth_resource_url_builds_base_url() {
        let mut auth = Auth::new("a", "qwen");
        auth.metadata.insert("access_token".to_string(), json!("tok"));
        auth.metadata.insert("resource_url".to_string(), json!("custom.qwen.ai"));
        let (key, base) = QwenProviderConfig.credentials(&auth);
        assert_eq!(key, "tok");
        assert_eq!(base, "https://custom.qwen.ai/v1");
    }
}
