//! Codex HTTP executor.
//!
//! The upstream only speaks streaming on `/responses`; non-streaming callers
//! are served by consuming the stream internally and folding the single
//! `response.completed` event back into a response body. `/responses/compact`
//! is a distinct non-streaming endpoint translated to `openai-response`.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, TranslateState,
    header_get,
};

use crate::base::{BaseExecutor, headers_from_wreq, map_transport_error, upstream_status_error};
use crate::json::{delete_path, get_path, get_trimmed_str, parse};
use crate::providers::codex::prompt_cache::apply_codex_prompt_cache;
use crate::providers::codex::{COMPACT_ALT, codex_credentials, normalize_codex_request_body};
use crate::providers::{passthrough_http, set_bearer};
use crate::record::record_api_response_chunk;
use crate::thinking::parse_suffix;
use crate::usage_parse::{codex_completed_event_payload, parse_codex_usage, parse_openai_usage};

const CODEX_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const CODEX_OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

pub struct CodexExecutor {
    base: BaseExecutor,
}

impl CodexExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }

    pub(crate) fn base(&self) -> &BaseExecutor {
        &self.base
    }

    /// Non-streaming execution by internally streaming `/responses` and
    /// selecting the `response.completed` event.
    async fn execute_via_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        let prepared = self.base.prepare(auth, &req, &opts, true)?;
        let reporter = self.base.reporter(&prepared.base_model, auth);

        let result: ExecutorResult<Response> = async {
            let (body, _cache_id, cache_headers) = apply_codex_prompt_cache(
                self.base.cfg(),
                prepared.from,
                &req.payload,
                &prepared.base_model,
                prepared.body.clone().into(),
                false,
            )
            .await;

            let url = format!("{}/responses", prepared.base_url.trim_end_matches('/'));
            let mut headers = self.base.build_headers(auth, &prepared.api_key, true, &opts);
            for (key, value) in &cache_headers {
                if header_get(&headers, key).is_none() {
                    headers.push((key.clone(), value.clone()));
                }
            }

            let resp = self.base.send(auth, &url, &headers, body.to_vec()).await?;
            let status = resp.status().as_u16();
            let resp_headers = headers_from_wreq(resp.headers());
            let data = resp.bytes().await.map_err(map_transport_error)?;
            record_api_response_chunk("codex", &data);
            if !(200..300).contains(&status) {
                return Err(upstream_status_error(status, &resp_headers, &data));
            }

            for line in data.split(|&byte| byte == b'\n') {
                let Some(payload) = codex_completed_event_payload(line) else {
                    continue;
                };
                if let Some(detail) = parse_codex_usage(payload) {
                    reporter.publish(detail);
                }
                reporter.ensure_published();

                let mut state = TranslateState::default();
                let out = self.base.translator().translate_non_stream(
                    prepared.to,
                    prepared.from,
                    &req.model,
                    &prepared.original_payload,
                    &body,
                    payload,
                    &mut state,
                );
                return Ok(Response {
                    payload: out,
                    headers: resp_headers,
                });
            }

            Err(ExecutorError::stream_disconnected(
                "stream closed before response.completed",
            ))
        }
        .await;
        if result.is_err() {
            reporter.publish_failure();
        }
        result
    }

    async fn execute_compact(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        let base_model = parse_suffix(&req.model).model_name;
        let (api_key, base_url) = codex_credentials(auth);
        let reporter = self.base.reporter(&base_model, auth);

        let result: ExecutorResult<Response> = async {
            let from = opts.source_format;
            let to = Format::OpenAIResponse;
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
                false,
            );
            let mut body: Value = serde_json::from_slice(&translated).map_err(|err| {
                ExecutorError::invalid_request(format!("compact payload is not JSON: {err}"))
            })?;
            crate::thinking::apply_thinking(&mut body, &req.model, to);
            crate::overrides::apply_payload_overrides(self.base.cfg(), &base_model, to, &mut body);
            let mut body = normalize_codex_request_body(body, &base_model, false);
            delete_path(&mut body, "stream");
            let body = serde_json::to_vec(&body)
                .map_err(|err| ExecutorError::internal(err.to_string()))?;

            let (body, _cache_id, cache_headers) = apply_codex_prompt_cache(
                self.base.cfg(),
                from,
                &req.payload,
                &base_model,
                body.into(),
                false,
            )
            .await;

            let url = format!("{}/responses/compact", base_url.trim_end_matches('/'));
            let mut headers = self.base.build_headers(auth, &api_key, false, &opts);
            for (key, value) in &cache_headers {
                if header_get(&headers, key).is_none() {
                    headers.push((key.clone(), value.clone()));
                }
            }

            let resp = self.base.send(auth, &url, &headers, body.to_vec()).await?;
            let status = resp.status().as_u16();
            let resp_headers = headers_from_wreq(resp.headers());
            let data = resp.bytes().await.map_err(map_transport_error)?;
            record_api_response_chunk("codex", &data);
            if !(200..300).contains(&status) {
                return Err(upstream_status_error(status, &resp_headers, &data));
            }

            reporter.publish(parse_openai_usage(&data));
            reporter.ensure_published();

            let mut state = TranslateState::default();
            let out = self.base.translator().translate_non_stream(
                to,
                from,
                &req.model,
                &original_payload,
                &body,
                &data,
                &mut state,
            );
            Ok(Response {
                payload: out,
                headers: resp_headers,
            })
        }
        .await;
        if result.is_err() {
            reporter.publish_failure();
        }
        result
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &str {
        "codex"
    }

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        if opts.alt == COMPACT_ALT {
            return self.execute_compact(auth, req, opts).await;
        }
        self.execute_via_stream(auth, req, opts).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        if opts.alt == COMPACT_ALT {
            let mut err = ExecutorError::invalid_request("streaming not supported for /responses/compact");
            err.status = Some(400);
            return Err(err);
        }
        self.base.execute_stream(auth, req, opts).await
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        let base_model = parse_suffix(&req.model).model_name;
        let from = opts.source_format;
        let to = Format::Codex;
        let translated = self.base.translator().translate_request(
            from,
            to,
            &base_model,
            req.payload.clone(),
            false,
        );
        let body: Value = serde_json::from_slice(&translated).map_err(|err| {
            ExecutorError::invalid_request(format!("count payload is not JSON: {err}"))
        })?;
        let body = normalize_codex_request_body(body, &base_model, false);

        let bpe = bpe_for_codex_model(&base_model)?;
        let count = count_codex_input_tokens(&bpe, &body);

        let usage_json = format!(
            "{{\"response\":{{\"usage\":{{\"input_tokens\":{count},\"output_tokens\":0,\"total_tokens\":{count}}}}}}}"
        );
        let payload = self
            .base
            .translator()
            .translate_token_count(to, from, count, usage_json.as_bytes());
        Ok(Response {
            payload,
            headers: Headers::new(),
        })
    }

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        tracing::debug!("codex executor: refresh called");
        let Some(refresh_token) = auth.metadata_str("refresh_token").map(str::to_string) else {
            return Ok(auth.clone());
        };

        let body = serde_json::to_vec(&json!({
            "client_id": CODEX_OAUTH_CLIENT_ID,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "scope": "openid profile email",
        }))
        .map_err(|err| ExecutorError::internal(err.to_string()))?;
        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "POST".to_string(),
                url: CODEX_TOKEN_URL.to_string(),
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
            .map_err(|err| ExecutorError::internal(format!("codex token response: {err}")))?;
        let mut refreshed = auth.clone();
        if let Some(access) = get_trimmed_str(&token, "access_token") {
            refreshed.metadata.insert("access_token".to_string(), json!(access));
        }
        if let Some(refresh) = get_trimmed_str(&token, "refresh_token") {
            refreshed.metadata.insert("refresh_token".to_string(), json!(refresh));
        }
        if let Some(id_token) = get_trimmed_str(&token, "id_token") {
            refreshed.metadata.insert("id_token".to_string(), json!(id_token));
            let claims = parse_id_token_claims(id_token);
            if let Some(account_id) = claims.account_id {
                refreshed.metadata.insert("account_id".to_string(), json!(account_id));
            }
            if let Some(email) = claims.email {
                refreshed.metadata.insert("email".to_string(), json!(email));
            }
        }
        refreshed.metadata.insert("type".to_string(), json!("codex"));
        Ok(refreshed)
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        let (api_key, _) = codex_credentials(auth);
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

fn bpe_for_codex_model(model: &str) -> ExecutorResult<tiktoken_rs::CoreBPE> {
    if let Ok(bpe) = tiktoken_rs::get_bpe_from_model(model) {
        return Ok(bpe);
    }
    tiktoken_rs::o200k_base().map_err(|err| ExecutorError::internal(err.to_string()))
}

/// Counts input-side tokens over a normalized Codex body: instructions,
/// input items, tool declarations, and structured-output schemas.
pub fn count_codex_input_tokens(bpe: &tiktoken_rs::CoreBPE, body: &Value) -> i64 {
    let mut segments: Vec<String> = Vec::new();

    if let Some(instructions) = get_trimmed_str(body, "instructions") {
        segments.push(instructions.to_string());
    }

    if let Some(items) = get_path(body, "input").and_then(Value::as_array) {
        for item in items {
            match get_trimmed_str(item, "type") {
                Some("message") => {
                    if let Some(parts) = get_path(item, "content").and_then(Value::as_array) {
                        for part in parts {
                            if let Some(text) = get_trimmed_str(part, "text") {
                                segments.push(text.to_string());
                            }
                        }
                    }
                }
                Some("function_call") => {
                    if let Some(name) = get_trimmed_str(item, "name") {
                        segments.push(name.to_string());
                    }
                    if let Some(args) = get_trimmed_str(item, "arguments") {
                        segments.push(args.to_string());
                    }
                }
                Some("function_call_output") => {
                    if let Some(output) = get_trimmed_str(item, "output") {
                        segments.push(output.to_string());
                    }
                }
                _ => {
                    if let Some(text) = get_trimmed_str(item, "text") {
                        segments.push(text.to_string());
                    }
                }
            }
        }
    }

    if let Some(tools) = get_path(body, "tools").and_then(Value::as_array) {
        for tool in tools {
            if let Some(name) = get_trimmed_str(tool, "name") {
                segments.push(name.to_string());
            }
            if let Some(description) = get_trimmed_str(tool, "description") {
                segments.push(description.to_string());
            }
            if let Some(parameters) = get_path(tool, "parameters") {
                let raw = match parameters {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                if !raw.trim().is_empty() {
                    segments.push(raw);
                }
            }
        }
    }

    if let Some(format_value) = get_path(body, "text.format") {
        if let Some(name) = get_trimmed_str(format_value, "name") {
            segments.push(name.to_string());
        }
        if let Some(schema) = get_path(format_value, "schema") {
            let raw = match schema {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if !raw.trim().is_empty() {
                segments.push(raw);
            }
        }
    }

    let text = segments.join("\n");
    if text.is_empty() {
        return 0;
    }
    bpe.encode_ordinary(&text).len() as i64
}

#[derive(Debug, Default)]
struct IdTokenClaims {
    email: Option<String>,
    account_id: Option<String>,
}

fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let mut parts = id_token.split('.');
    let payload_b64 = match (parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature))
            if !header.is_empty() && !payload.is_empty() && !signature.is_empty() =>
        {
            payload
        }
        _ => return claims,
    };
    let Ok(payload_bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64)
    else {
        return claims;
    };
    let Some(payload) = parse(&payload_bytes) else {
        return claims;
    };

    claims.email = get_trimmed_str(&payload, "email")
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);
    claims.account_id = payload
        .get("https://api.openai.com/auth")
        .and_then(|auth_claims| auth_claims.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    claims
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_token_claims_are_extracted() {
        let payload = json!({
            "email": "dev@example.com",
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct-7"}
        });
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).expect("payload"));
        let token = format!("h.{encoded}.s");
        let claims = parse_id_token_claims(&token);
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert_eq!(claims.account_id.as_deref(), Some("acct-7"));

        assert!(parse_id_token_claims("not-a-jwt").email.is_none());
    }

    #[test]
    fn token_counting_covers_input_shapes() {
        let bpe = tiktoken_rs::o200k_base().expect("bpe");
        let body = json!({
            "instructions": "be brief",
            "input": [
                {"type": "message", "content": [{"type": "input_text", "text": "hello there"}]},
                {"type": "function_call", "name": "lookup", "arguments": "{\"q\":\"rust\"}"},
                {"type": "function_call_output", "output": "{\"ok\":true}"}
            ],
            "tools": [{"name": "lookup", "description": "search things", "parameters": {"type": "object"}}]
        });
        let count = count_codex_input_tokens(&bpe, &body);
        assert!(count > 0);

        assert_eq!(count_codex_input_tokens(&bpe, &json!({})), 0);
    }
}
