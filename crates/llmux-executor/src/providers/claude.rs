//! Claude provider: Anthropic messages endpoint with API-key and OAuth
//! credential shapes.

use async_trait::async_trait;
use serde_json::{Value, json};

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, UsageDetail,
    header_set,
};

use crate::base::{BaseExecutor, ProviderConfig, apply_custom_headers_from_attrs};
use crate::json::{get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::usage_parse::{parse_claude_stream_usage, parse_claude_usage};

pub const CLAUDE_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const CLAUDE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLAUDE_OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// `bearer:` marks an OAuth access token travelling in the api-key slot so
/// header application can pick the right auth scheme.
const BEARER_PREFIX: &str = "bearer:";

#[derive(Debug, Default)]
pub struct ClaudeProviderConfig;

impl ProviderConfig for ClaudeProviderConfig {
    fn identifier(&self) -> &str {
        "claude"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        let base_url = auth
            .attribute("base_url")
            .unwrap_or(CLAUDE_DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        if let Some(api_key) = auth.attribute("api_key") {
            return (api_key.to_string(), base_url);
        }
        if let Some(token) = auth.metadata_str("access_token") {
            return (format!("{BEARER_PREFIX}{token}"), base_url);
        }
        (String::new(), base_url)
    }

    fn endpoint(&self, base_url: &str, _model: &str, action: &str, _stream: bool) -> String {
        let base = base_url.trim_end_matches('/');
        if action == "countTokens" {
            format!("{base}/v1/messages/count_tokens")
        } else {
            format!("{base}/v1/messages")
        }
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
        header_set(headers, "anthropic-version", ANTHROPIC_VERSION);
        if let Some(token) = api_key.strip_prefix(BEARER_PREFIX) {
            set_bearer(headers, token);
            header_set(headers, "anthropic-beta", OAUTH_BETA);
        } else if !api_key.is_empty() {
            header_set(headers, "x-api-key", api_key);
        }
        header_set(headers, "Accept", if stream { "text/event-stream" } else { "application/json" });
        apply_custom_headers_from_attrs(headers, auth);
    }

    fn translator_format(&self) -> Format {
        Format::Claude
    }

    fn transform_request_body(
        &self,
        mut body: Value,
        model: &str,
        stream: bool,
    ) -> ExecutorResult<Value> {
        set_path(&mut body, "model", json!(model));
        set_path(&mut body, "stream", json!(stream));
        Ok(body)
    }

    fn parse_usage(&self, data: &[u8], stream: bool) -> UsageDetail {
        if stream {
            parse_claude_stream_usage(data).unwrap_or_default()
        } else {
            parse_claude_usage(data)
        }
    }
}

pub struct ClaudeExecutor {
    base: BaseExecutor,
}

impl ClaudeExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }
}

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
    fn identifier(&self) -> &str {
        "claude"
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
        auth: &Auth,
        mut req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        req.metadata
            .insert("action".to_string(), json!("countTokens"));
        self.base.execute(auth, req, opts).await
    }

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        let Some(refresh_token) = auth.metadata_str("refresh_token").map(str::to_string) else {
            return Ok(auth.clone());
        };

        let body = serde_json::to_vec(&json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": CLAUDE_OAUTH_CLIENT_ID,
        }))
        .map_err(|err| ExecutorError::internal(err.to_string()))?;
        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "POST".to_string(),
                url: CLAUDE_TOKEN_URL.to_string(),
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: Some(body.into()),
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
            .map_err(|err| ExecutorError::internal(format!("claude token response: {err}")))?;
        let mut refreshed = auth.clone();
        if let Some(access) = get_trimmed_str(&token, "access_token") {
            refreshed.metadata.insert("access_token".to_string(), json!(access));
        }
        if let Some(refresh) = get_trimmed_str(&token, "refresh_token") {
            refreshed.metadata.insert("refresh_token".to_string(), json!(refresh));
        }
        refreshed.metadata.insert("type".to_string(), json!("claude"));
        Ok(refreshed)
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        let (api_key, _) = ClaudeProviderConfig.credentials(auth);
        if let Some(token) = api_key.strip_prefix(BEARER_PREFIX) {
            set_bearer(&mut req.headers, token);
        } else if !api_key.is_empty() {
            header_set(&mut req.headers, "x-api-key", &api_key);
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
