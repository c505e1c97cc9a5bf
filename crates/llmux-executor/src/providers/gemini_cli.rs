//! Gemini CLI (Cloud Code Assist) executor.
//!
//! OAuth-only upstream with the Code Assist request envelope
//! (`{project, model, request}`), per-base-model 429 fallback, and token
//! refresh against the Google OAuth endpoint with metadata write-back.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamChunk, StreamResult,
    TranslateState, UsageDetail, header_set,
};

use crate::base::{
    BaseExecutor, ProviderConfig, ensure_header, headers_from_wreq, map_transport_error,
};
use crate::duration::parse_duration;
use crate::json::{delete_path, get_path, get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::record::{
    UpstreamRequestLog, record_api_request, record_api_response_chunk, record_api_response_error,
    record_api_response_metadata, summarize_error_body,
};
use crate::scan::{GEMINI_SCAN_LIMIT, LineScanner};
use crate::usage_parse::{DATA_TAG, parse_gemini_stream_usage, parse_gemini_usage};

pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const CODE_ASSIST_VERSION: &str = "v1internal";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";
const TOKEN_EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, Default)]
pub struct GeminiCliProviderConfig;

impl ProviderConfig for GeminiCliProviderConfig {
    fn identifier(&self) -> &str {
        "gemini-cli"
    }

    fn credentials(&self, _auth: &Auth) -> (String, String) {
        // OAuth tokens only; the executor injects the bearer itself.
        (String::new(), CODE_ASSIST_ENDPOINT.to_string())
    }

    fn endpoint(&self, base_url: &str, _model: &str, action: &str, stream: bool) -> String {
        if action == "countTokens" {
            return format!("{base_url}/{CODE_ASSIST_VERSION}:countTokens");
        }
        if stream {
            format!("{base_url}/{CODE_ASSIST_VERSION}:streamGenerateContent?alt=sse")
        } else {
            format!("{base_url}/{CODE_ASSIST_VERSION}:generateContent")
        }
    }

    fn apply_headers(
        &self,
        headers: &mut Headers,
        _auth: &Auth,
        _api_key: &str,
        stream: bool,
        inbound: &Headers,
    ) {
        header_set(headers, "Content-Type", "application/json");
        ensure_header(headers, inbound, "User-Agent", "google-api-nodejs-client/9.15.1");
        ensure_header(headers, inbound, "X-Goog-Api-Client", "gl-node/22.17.0");
        ensure_header(
            headers,
            inbound,
            "Client-Metadata",
            "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI",
        );
        header_set(headers, "Accept", if stream { "text/event-stream" } else { "application/json" });
    }

    fn translator_format(&self) -> Format {
        Format::GeminiCli
    }

    fn transform_request_body(
        &self,
        mut body: Value,
        model: &str,
        _stream: bool,
    ) -> ExecutorResult<Value> {
        crate::providers::gemini::fix_image_aspect_ratio(model, &mut body, "request.");
        Ok(body)
    }

    fn parse_usage(&self, data: &[u8], stream: bool) -> UsageDetail {
        if stream {
            parse_gemini_stream_usage(data).unwrap_or_default()
        } else {
            parse_gemini_usage(data)
        }
    }

    fn scan_limit(&self) -> usize {
        GEMINI_SCAN_LIMIT
    }
}

/// Builds the 429 status error enriched with the retry hint Google encodes
/// into the error body.
pub fn gemini_status_error(status: u16, headers: &Headers, body: &[u8]) -> ExecutorError {
    let content_type = llmux_core::header_get(headers, "content-type").unwrap_or("");
    let mut err = ExecutorError::status(status, summarize_error_body(content_type, body));
    if status == 429 {
        err = err.with_retry_after(parse_retry_delay(body));
    }
    err
}

/// Retry hint resolution order: `RetryInfo.retryDelay`, then
/// `ErrorInfo.metadata.quotaResetDelay`, then an `"after Ns"` message scan.
pub fn parse_retry_delay(body: &[u8]) -> Option<std::time::Duration> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let details = get_path(&value, "error.details").and_then(Value::as_array);

    if let Some(details) = details {
        for detail in details {
            if get_trimmed_str(detail, "@type")
                == Some("type.googleapis.com/google.rpc.RetryInfo")
                && let Some(delay) = get_trimmed_str(detail, "retryDelay").and_then(parse_duration)
            {
                return Some(delay);
            }
        }
        for detail in details {
            if get_trimmed_str(detail, "@type")
                == Some("type.googleapis.com/google.rpc.ErrorInfo")
                && let Some(delay) =
                    get_trimmed_str(detail, "metadata.quotaResetDelay").and_then(parse_duration)
            {
                return Some(delay);
            }
        }
    }

    let message = get_trimmed_str(&value, "error.message")?;
    let idx = message.find("after ")?;
    let rest = &message[idx + "after ".len()..];
    let digits: String = rest.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    let tail = &rest[digits.len()..];
    if digits.is_empty() || !tail.starts_with('s') {
        return None;
    }
    digits
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

pub struct GeminiCliExecutor {
    base: BaseExecutor,
}

impl GeminiCliExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }

    fn provider(&self) -> GeminiCliProviderConfig {
        GeminiCliProviderConfig
    }

    /// Fallback order tried on 429, starting with the base model.
    pub fn fallback_models(&self, base_model: &str) -> Vec<String> {
        let mut models = vec![base_model.to_string()];
        if let Some(extra) = self.base.cfg().gemini_cli_fallbacks.get(base_model) {
            for model in extra {
                if !models.contains(model) {
                    models.push(model.clone());
                }
            }
        }
        models
    }

    fn project_id(&self, auth: &Auth) -> String {
        auth.metadata_str("project_id").unwrap_or_default().to_string()
    }

    /// Returns a fresh access token, refreshing through the Google OAuth
    /// endpoint when the stored one is missing or about to expire. The
    /// refreshed token is merged back into the returned credential.
    async fn prepare_access_token(&self, auth: &Auth) -> ExecutorResult<(String, Auth)> {
        let expiry_ok = auth
            .metadata_str("expiry")
            .and_then(|raw| {
                time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
                    .ok()
            })
            .map(|expiry| {
                expiry - time::OffsetDateTime::now_utc()
                    > time::Duration::seconds(TOKEN_EXPIRY_SLACK_SECS)
            })
            .unwrap_or(false);

        if expiry_ok && let Some(token) = auth.metadata_str("access_token") {
            return Ok((token.to_string(), auth.clone()));
        }
        let refreshed = self.exchange_refresh_token(auth).await?;
        let token = refreshed
            .metadata_str("access_token")
            .ok_or_else(|| ExecutorError::status(401, "missing access token"))?
            .to_string();
        Ok((token, refreshed))
    }

    async fn exchange_refresh_token(&self, auth: &Auth) -> ExecutorResult<Auth> {
        let refresh_token = auth
            .metadata_str("refresh_token")
            .ok_or_else(|| ExecutorError::status(401, "gemini-cli auth metadata missing"))?
            .to_string();

        let body = format!(
            "grant_type=refresh_token&client_id={}&client_secret={}&refresh_token={}",
            urlencoding::encode(OAUTH_CLIENT_ID),
            urlencoding::encode(OAUTH_CLIENT_SECRET),
            urlencoding::encode(&refresh_token),
        );
        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "POST".to_string(),
                url: GOOGLE_TOKEN_URL.to_string(),
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
            .map_err(|err| ExecutorError::internal(format!("google token response: {err}")))?;
        let mut refreshed = auth.clone();
        if let Some(access) = get_trimmed_str(&token, "access_token") {
            refreshed.metadata.insert("access_token".to_string(), json!(access));
        }
        if let Some(refresh) = get_trimmed_str(&token, "refresh_token") {
            refreshed.metadata.insert("refresh_token".to_string(), json!(refresh));
        }
        if let Some(expires_in) = token.get("expires_in").and_then(Value::as_i64) {
            let expiry = time::OffsetDateTime::now_utc()
                + std::time::Duration::from_secs(expires_in.max(0) as u64);
            if let Ok(formatted) = expiry.format(&time::format_description::well_known::Rfc3339) {
                refreshed.metadata.insert("expiry".to_string(), json!(formatted));
            }
        }
        Ok(refreshed)
    }

    fn prepare_payload(
        &self,
        req: &Request,
        opts: &Options,
        stream: bool,
    ) -> ExecutorResult<(String, Value, Bytes)> {
        let base_model = crate::thinking::parse_suffix(&req.model).model_name;
        let from = opts.source_format;
        let to = Format::GeminiCli;
        let original_payload = if opts.original_request.is_empty() {
            req.payload.clone()
        } else {
            opts.original_request.clone()
        };
        let translated = self.base.translator().translate_request(
            from,
            to,
            &base_model,
            req.payload.clone(),
            stream,
        );
        let mut body: Value = serde_json::from_slice(&translated).map_err(|err| {
            ExecutorError::invalid_request(format!("gemini-cli payload is not JSON: {err}"))
        })?;
        crate::thinking::apply_thinking(&mut body, &req.model, to);
        let mut body = self
            .provider()
            .transform_request_body(body, &base_model, stream)?;
        crate::overrides::apply_payload_overrides(self.base.cfg(), &base_model, to, &mut body);
        Ok((base_model, body, original_payload))
    }

    async fn send_attempt(
        &self,
        auth: &Auth,
        token: &str,
        url: &str,
        payload: &[u8],
        stream: bool,
        opts: &Options,
    ) -> ExecutorResult<wreq::Response> {
        let mut headers = Headers::new();
        set_bearer(&mut headers, token);
        self.provider()
            .apply_headers(&mut headers, auth, "", stream, &opts.request_headers);

        record_api_request(UpstreamRequestLog {
            url,
            method: "POST",
            provider: "gemini-cli",
            body: payload,
            auth: Some(auth),
        });
        let client = crate::client::client_for(self.base.cfg(), auth)?;
        let mut builder = client.post(url);
        for (key, value) in &headers {
            builder = builder.header(key, value);
        }
        let resp = builder
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|err| {
                record_api_response_error("gemini-cli", &err);
                map_transport_error(err)
            })?;
        record_api_response_metadata("gemini-cli", resp.status().as_u16());
        Ok(resp)
    }
}

#[async_trait]
impl ProviderExecutor for GeminiCliExecutor {
    fn identifier(&self) -> &str {
        "gemini-cli"
    }

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        let (base_model, body, original_payload) = self.prepare_payload(&req, &opts, false)?;
        let (token, auth_snapshot) = self.prepare_access_token(auth).await?;
        let reporter = self.base.reporter(&base_model, auth);

        let action = if req.action() == Some("countTokens") {
            "countTokens"
        } else {
            "execute"
        };
        let project_id = self.project_id(&auth_snapshot);
        let models = self.fallback_models(&base_model);
        let from = opts.source_format;

        let mut last_status = 0u16;
        let mut last_body: Vec<u8> = Vec::new();
        let mut last_headers = Headers::new();

        for (index, attempt_model) in models.iter().enumerate() {
            let mut payload = body.clone();
            if action == "countTokens" {
                delete_path(&mut payload, "project");
                delete_path(&mut payload, "model");
            } else {
                set_path(&mut payload, "project", json!(project_id));
                set_path(&mut payload, "model", json!(attempt_model));
            }
            let payload = serde_json::to_vec(&payload).map_err(|err| {
                reporter.publish_failure();
                ExecutorError::internal(err.to_string())
            })?;

            let url = self
                .provider()
                .endpoint(CODE_ASSIST_ENDPOINT, attempt_model, action, false);
            let resp = match self
                .send_attempt(auth, &token, &url, &payload, false, &opts)
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    reporter.publish_failure();
                    return Err(err);
                }
            };
            let status = resp.status().as_u16();
            let resp_headers = headers_from_wreq(resp.headers());
            let data = match resp.bytes().await {
                Ok(data) => data,
                Err(err) => {
                    reporter.publish_failure();
                    return Err(map_transport_error(err));
                }
            };
            record_api_response_chunk("gemini-cli", &data);

            if (200..300).contains(&status) {
                if action == "countTokens" {
                    let count = get_path(&crate::json::parse(&data).unwrap_or(Value::Null), "totalTokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    reporter.ensure_published();
                    let payload = self.base.translator().translate_token_count(
                        Format::GeminiCli,
                        from,
                        count,
                        &data,
                    );
                    return Ok(Response {
                        payload,
                        headers: resp_headers,
                    });
                }

                reporter.publish(self.provider().parse_usage(&data, false));
                reporter.ensure_published();
                let mut state = TranslateState::default();
                let out = self.base.translator().translate_non_stream(
                    Format::GeminiCli,
                    from,
                    attempt_model,
                    &original_payload,
                    &payload,
                    &data,
                    &mut state,
                );
                return Ok(Response {
                    payload: out,
                    headers: resp_headers,
                });
            }

            last_status = status;
            last_body = data.to_vec();
            last_headers = resp_headers;
            if status == 429 {
                if index + 1 < models.len() {
                    tracing::debug!(next = %models[index + 1], "rate limited, retrying with next model");
                }
                continue;
            }
            reporter.publish_failure();
            return Err(gemini_status_error(status, &last_headers, &last_body));
        }

        if last_status == 0 {
            last_status = 429;
        }
        reporter.publish_failure();
        Err(gemini_status_error(last_status, &last_headers, &last_body))
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        let (base_model, body, original_payload) = self.prepare_payload(&req, &opts, true)?;
        let (token, auth_snapshot) = self.prepare_access_token(auth).await?;
        let reporter = self.base.reporter(&base_model, auth);

        let project_id = self.project_id(&auth_snapshot);
        let models = self.fallback_models(&base_model);
        let from = opts.source_format;

        let mut last_status = 0u16;
        let mut last_body: Vec<u8> = Vec::new();
        let mut last_headers = Headers::new();

        for (index, attempt_model) in models.iter().enumerate() {
            let mut payload = body.clone();
            set_path(&mut payload, "project", json!(project_id));
            set_path(&mut payload, "model", json!(attempt_model));
            let payload_bytes = serde_json::to_vec(&payload).map_err(|err| {
                reporter.publish_failure();
                ExecutorError::internal(err.to_string())
            })?;

            let url = self
                .provider()
                .endpoint(CODE_ASSIST_ENDPOINT, attempt_model, "stream", true);
            let resp = match self
                .send_attempt(auth, &token, &url, &payload_bytes, true, &opts)
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    reporter.publish_failure();
                    return Err(err);
                }
            };
            let status = resp.status().as_u16();
            let resp_headers = headers_from_wreq(resp.headers());

            if !(200..300).contains(&status) {
                let data = resp.bytes().await.unwrap_or_default();
                record_api_response_chunk("gemini-cli", &data);
                last_status = status;
                last_body = data.to_vec();
                last_headers = resp_headers;
                if status == 429 {
                    if index + 1 < models.len() {
                        tracing::debug!(next = %models[index + 1], "rate limited, retrying with next model");
                    }
                    continue;
                }
                reporter.publish_failure();
                return Err(gemini_status_error(status, &last_headers, &last_body));
            }

            let (tx, rx) = mpsc::channel::<StreamChunk>(16);
            let translator = Arc::clone(self.base.translator());
            let original_payload = original_payload.clone();
            let model_for_translate = attempt_model.clone();

            tokio::spawn(async move {
                use futures_util::StreamExt;

                let mut scanner = LineScanner::new(GEMINI_SCAN_LIMIT);
                let mut state = TranslateState::default();
                let mut stream = resp.bytes_stream();

                let handle_line = |line: Bytes, state: &mut TranslateState| -> Vec<Bytes> {
                    record_api_response_chunk("gemini-cli", &line);
                    if let Some(detail) = parse_gemini_stream_usage(&line) {
                        reporter.publish(detail);
                    }
                    if !line.starts_with(DATA_TAG) {
                        return Vec::new();
                    }
                    translator.translate_stream(
                        Format::GeminiCli,
                        from,
                        &model_for_translate,
                        &original_payload,
                        &payload_bytes,
                        &line,
                        state,
                    )
                };

                loop {
                    match stream.next().await {
                        Some(Ok(chunk)) => {
                            let lines = match scanner.push(&chunk) {
                                Ok(lines) => lines,
                                Err(err) => {
                                    record_api_response_error("gemini-cli", &err);
                                    reporter.publish_failure();
                                    let _ = tx
                                        .send(StreamChunk::Err(ExecutorError::transport(
                                            err.to_string(),
                                        )))
                                        .await;
                                    return;
                                }
                            };
                            for line in lines {
                                for segment in handle_line(line, &mut state) {
                                    if tx.send(StreamChunk::Payload(segment)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            record_api_response_error("gemini-cli", &err);
                            reporter.publish_failure();
                            let _ = tx.send(StreamChunk::Err(map_transport_error(err))).await;
                            return;
                        }
                        None => break,
                    }
                }

                if let Some(line) = scanner.finish() {
                    for segment in handle_line(line, &mut state) {
                        if tx.send(StreamChunk::Payload(segment)).await.is_err() {
                            return;
                        }
                    }
                }
                let done = translator.translate_stream(
                    Format::GeminiCli,
                    from,
                    &model_for_translate,
                    &original_payload,
                    &payload_bytes,
                    b"[DONE]",
                    &mut state,
                );
                for segment in done {
                    if tx.send(StreamChunk::Payload(segment)).await.is_err() {
                        return;
                    }
                }
            });

            return Ok(StreamResult {
                headers: resp_headers,
                chunks: rx,
            });
        }

        if last_status == 0 {
            last_status = 429;
        }
        reporter.publish_failure();
        Err(gemini_status_error(last_status, &last_headers, &last_body))
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        mut req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        req.metadata
            .insert("action".to_string(), json!("countTokens"));
        self.execute(auth, req, opts).await
    }

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        self.exchange_refresh_token(auth).await
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        if let Some(token) = auth.metadata_str("access_token") {
            set_bearer(&mut req.headers, token);
        }
        Ok(())
    }

    async fn http_request(
        &self,
        auth: &Auth,
        mut req: PreparedHttpRequest,
    ) -> ExecutorResult<PreparedHttpResponse> {
        let (token, _) = self.prepare_access_token(auth).await?;
        set_bearer(&mut req.headers, &token);
        passthrough_http(self.base.cfg(), auth, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retry_delay_prefers_retry_info() {
        let body = br#"{"error":{"message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.ErrorInfo","metadata":{"quotaResetDelay":"90s"}},
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"30s"}
        ]}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_delay_falls_back_to_quota_reset_then_message() {
        let body = br#"{"error":{"message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.ErrorInfo","metadata":{"quotaResetDelay":"90s"}}
        ]}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(90)));

        let body = br#"{"error":{"message":"Please retry after 17s."}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(17)));

        let body = br#"{"error":{"message":"no hint"}}"#;
        assert_eq!(parse_retry_delay(body), None);
    }

    #[test]
    fn fallback_models_start_with_base_and_dedupe() {
        use llmux_core::{MemoryUsageSink, PassthroughTranslator};

        let mut cfg = crate::config::Config::default();
        cfg.gemini_cli_fallbacks.insert(
            "gemini-2.5-pro".to_string(),
            vec!["gemini-2.5-flash".to_string(), "gemini-2.5-pro".to_string()],
        );
        let executor = GeminiCliExecutor::new(BaseExecutor::new(
            Arc::new(cfg),
            Arc::new(PassthroughTranslator),
            Arc::new(MemoryUsageSink::new()),
            Arc::new(GeminiCliProviderConfig),
        ));
        assert_eq!(
            executor.fallback_models("gemini-2.5-pro"),
            vec!["gemini-2.5-pro", "gemini-2.5-flash"]
        );
        assert_eq!(
            executor.fallback_models("gemini-2.5-flash"),
            vec!["gemini-2.5-flash"]
        );
    }

    #[test]
    fn endpoints_use_code_assist_shape() {
        let config = GeminiCliProviderConfig;
        assert_eq!(
            config.endpoint(CODE_ASSIST_ENDPOINT, "gemini-2.5-pro", "execute", false),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            config.endpoint(CODE_ASSIST_ENDPOINT, "gemini-2.5-pro", "countTokens", false),
            "https://cloudcode-pa.googleapis.com/v1internal:countTokens"
        );
        assert!(
            config
                .endpoint(CODE_ASSIST_ENDPOINT, "gemini-2.5-pro", "stream", true)
                .ends_with(":streamGenerateContent?alt=sse")
        );
    }
}
