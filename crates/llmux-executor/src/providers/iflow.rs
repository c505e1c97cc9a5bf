//! iFlow provider: OpenAI-compatible chat completions with a signed session
//! header and dual refresh modes (OAuth tokens vs browser cookie).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, UsageDetail,
    header_set,
};

use crate::base::{BaseExecutor, ProviderConfig};
use crate::json::{get_path, get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::usage_parse::{parse_openai_stream_usage, parse_openai_usage};

pub const IFLOW_DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";
const IFLOW_TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const IFLOW_API_KEY_URL: &str = "https://iflow.cn/api/openapi/apikey";
const IFLOW_USER_AGENT: &str = "iFlow-Cli";

#[derive(Debug, Default)]
pub struct IFlowProviderConfig;

impl ProviderConfig for IFlowProviderConfig {
    fn identifier(&self) -> &str {
        "iflow"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        let api_key = auth
            .attribute("api_key")
            .or_else(|| auth.metadata_str("api_key"))
            .unwrap_or_default()
            .to_string();
        let base_url = auth
            .attribute("base_url")
            .or_else(|| auth.metadata_str("base_url"))
            .unwrap_or(IFLOW_DEFAULT_BASE_URL)
            .to_string();
        (api_key, base_url)
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
        header_set(headers, "User-Agent", IFLOW_USER_AGENT);

        let session_id = format!("session-{}", uuid::Uuid::new_v4());
        header_set(headers, "session-id", &session_id);

        let timestamp = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        header_set(headers, "x-iflow-timestamp", &timestamp.to_string());
        if let Some(signature) = create_signature(IFLOW_USER_AGENT, &session_id, timestamp, api_key)
        {
            header_set(headers, "x-iflow-signature", &signature);
        }

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
        preserve_reasoning_content(&mut body);
        if stream
            && let Some(Value::Array(items)) = get_path(&body, "tools")
            && items.is_empty()
        {
            let placeholder = json!([{
                "type": "function",
                "function": {
                    "name": "noop",
                    "description": "Placeholder tool to stabilise streaming",
                    "parameters": {"type": "object"}
                }
            }]);
            set_path(&mut body, "tools", placeholder);
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

/// hex(HMAC-SHA256(key=api_key, msg="UA:session:ts")).
pub fn create_signature(
    user_agent: &str,
    session_id: &str,
    timestamp_ms: i64,
    api_key: &str,
) -> Option<String> {
    if api_key.is_empty() {
        return None;
    }
    let payload = format!("{user_agent}:{session_id}:{timestamp_ms}");
    let mut mac = Hmac::<Sha256>::new_from_slice(api_key.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// GLM-4.x and MiniMax M2 carry their thought chains in history via
/// `reasoning_content`; when the client already preserved it nothing needs
/// rewriting, this only logs the observation.
fn preserve_reasoning_content(body: &mut Value) {
    let model = get_trimmed_str(body, "model").unwrap_or("").to_ascii_lowercase();
    if !(model.starts_with("glm-4") || model.starts_with("minimax-m2")) {
        return;
    }
    let Some(messages) = get_path(body, "messages").and_then(Value::as_array) else {
        return;
    };
    let preserved = messages.iter().any(|message| {
        get_trimmed_str(message, "role") == Some("assistant")
            && get_trimmed_str(message, "reasoning_content").is_some()
    });
    if preserved {
        tracing::debug!(model = %model, "reasoning_content found in message history");
    }
}

pub struct IFlowExecutor {
    base: BaseExecutor,
}

impl IFlowExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }

    async fn refresh_cookie_based(
        &self,
        auth: &Auth,
        cookie: &str,
        email: &str,
    ) -> ExecutorResult<Auth> {
        tracing::info!(email = %email, "refreshing cookie-based iflow api key");
        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "GET".to_string(),
                url: IFLOW_API_KEY_URL.to_string(),
                headers: vec![
                    ("Cookie".to_string(), cookie.to_string()),
                    ("User-Agent".to_string(), IFLOW_USER_AGENT.to_string()),
                ],
                body: None,
            },
        )
        .await?;
        if !(200..300).contains(&resp.status) {
            return Err(ExecutorError::status(
                resp.status,
                String::from_utf8_lossy(&resp.body).into_owned(),
            ));
        }

        let parsed: Value = serde_json::from_slice(&resp.body)
            .map_err(|err| ExecutorError::internal(format!("iflow api key response: {err}")))?;
        let api_key = get_trimmed_str(&parsed, "data.apiKey")
            .or_else(|| get_trimmed_str(&parsed, "apiKey"))
            .ok_or_else(|| ExecutorError::internal("iflow api key response missing apiKey"))?;

        let mut refreshed = auth.clone();
        refreshed.metadata.insert("api_key".to_string(), json!(api_key));
        refreshed.metadata.insert("cookie".to_string(), json!(cookie));
        refreshed.metadata.insert("email".to_string(), json!(email));
        refreshed.metadata.insert("type".to_string(), json!("iflow"));
        if let Some(expire) = get_trimmed_str(&parsed, "data.expireTime") {
            refreshed.metadata.insert("expired".to_string(), json!(expire));
        }
        refreshed
            .attributes
            .insert("api_key".to_string(), api_key.to_string());
        Ok(refreshed)
    }

    async fn refresh_oauth_based(&self, auth: &Auth) -> ExecutorResult<Auth> {
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
                url: IFLOW_TOKEN_URL.to_string(),
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
            .map_err(|err| ExecutorError::internal(format!("iflow token response: {err}")))?;
        let mut refreshed = auth.clone();
        if let Some(access) = get_trimmed_str(&token, "access_token") {
            refreshed.metadata.insert("access_token".to_string(), json!(access));
        }
        if let Some(refresh) = get_trimmed_str(&token, "refresh_token") {
            refreshed.metadata.insert("refresh_token".to_string(), json!(refresh));
        }
        if let Some(api_key) = get_trimmed_str(&token, "apiKey")
            .or_else(|| get_trimmed_str(&token, "api_key"))
        {
            refreshed.metadata.insert("api_key".to_string(), json!(api_key));
            refreshed
                .attributes
                .insert("api_key".to_string(), api_key.to_string());
        }
        refreshed.metadata.insert("type".to_string(), json!("iflow"));
        Ok(refreshed)
    }
}

#[async_trait]
impl ProviderExecutor for IFlowExecutor {
    fn identifier(&self) -> &str {
        "iflow"
    }

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        let (api_key, _) = IFlowProviderConfig.credentials(auth);
        if api_key.is_empty() {
            return Err(ExecutorError::invalid_request("iflow executor: missing api key"));
        }
        self.base.execute(auth, req, opts).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        let (api_key, _) = IFlowProviderConfig.credentials(auth);
        if api_key.is_empty() {
            return Err(ExecutorError::invalid_request("iflow executor: missing api key"));
        }
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
        let cookie = auth.metadata_str("cookie").map(str::to_string);
        let email = auth.metadata_str("email").map(str::to_string);
        match (cookie, email) {
            (Some(cookie), Some(email)) => self.refresh_cookie_based(auth, &cookie, &email).await,
            _ => self.refresh_oauth_based(auth).await,
        }
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        let (api_key, _) = IFlowProviderConfig.credentials(auth);
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
