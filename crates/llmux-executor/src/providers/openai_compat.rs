//! Generic OpenAI-compatible provider.
//!
//! Works against any `/chat/completions` endpoint configured on the
//! credential; custom headers travel as `header_`-prefixed attributes. Also
//! carries the `/responses/compact` alternate endpoint, which bypasses the
//! standard pipeline (different translator target, never streamed).

use async_trait::async_trait;
use serde_json::{Value, json};

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, TranslateState,
    UsageDetail, header_set,
};

use crate::base::{
    BaseExecutor, ProviderConfig, apply_custom_headers_from_attrs, headers_from_wreq,
    map_transport_error, upstream_status_error,
};
use crate::json::{delete_path, get_path, get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::thinking::{apply_thinking, parse_suffix};
use crate::usage_parse::{parse_openai_stream_usage, parse_openai_usage};

pub const COMPACT_ALT: &str = "responses/compact";

#[derive(Debug)]
pub struct OpenAICompatProviderConfig {
    provider_name: String,
}

impl OpenAICompatProviderConfig {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
        }
    }
}

impl ProviderConfig for OpenAICompatProviderConfig {
    fn identifier(&self) -> &str {
        &self.provider_name
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        (
            auth.attribute("api_key").unwrap_or_default().to_string(),
            auth.attribute("base_url").unwrap_or_default().to_string(),
        )
    }

    fn endpoint(&self, base_url: &str, _model: &str, _action: &str, _stream: bool) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
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
        header_set(headers, "User-Agent", "llmux-openai-compat");
        apply_custom_headers_from_attrs(headers, auth);
        if stream {
            header_set(headers, "Accept", "text/event-stream");
            header_set(headers, "Cache-Control", "no-cache");
        } else {
            header_set(headers, "Accept", "application/json");
        }
    }

    fn translator_format(&self) -> Format {
        Format::OpenAI
    }

    fn transform_request_body(
        &self,
        mut body: Value,
        model: &str,
        _stream: bool,
    ) -> ExecutorResult<Value> {
        set_path(&mut body, "model", json!(model));
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

pub struct OpenAICompatExecutor {
    provider_name: String,
    base: BaseExecutor,
}

impl OpenAICompatExecutor {
    pub fn new(provider_name: impl Into<String>, base: BaseExecutor) -> Self {
        Self {
            provider_name: provider_name.into(),
            base,
        }
    }

    /// `/responses/compact`: translated to `openai-response`, non-streaming
    /// only, endpoint appended verbatim to the credential base URL.
    async fn execute_compact(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        let base_model = parse_suffix(&req.model).model_name;
        let (api_key, base_url) = self.base.provider().credentials(auth);
        if base_url.is_empty() {
            return Err(ExecutorError::invalid_request(format!(
                "{}: missing base_url",
                self.provider_name
            )));
        }
        let reporter = self.base.reporter(&base_model, auth);

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
            reporter.publish_failure();
            ExecutorError::invalid_request(format!("compact payload is not JSON: {err}"))
        })?;
        apply_thinking(&mut body, &req.model, to);
        set_path(&mut body, "model", json!(base_model));
        delete_path(&mut body, "stream");
        let body = serde_json::to_vec(&body)
            .map_err(|err| ExecutorError::internal(format!("serialize compact body: {err}")))?;

        let url = format!("{}/responses/compact", base_url.trim_end_matches('/'));
        let headers = self.base.build_headers(auth, &api_key, false, &opts);

        let result: ExecutorResult<Response> = async {
            let resp = self.base.send(auth, &url, &headers, body.clone()).await?;
            let status = resp.status().as_u16();
            let resp_headers = headers_from_wreq(resp.headers());
            let data = resp.bytes().await.map_err(map_transport_error)?;
            if !(200..300).contains(&status) {
                return Err(upstream_status_error(status, &resp_headers, &data));
            }

            reporter.publish(parse_openai_usage(&data));
            reporter.ensure_published();

            let mut state = TranslateState::default();
            let payload = self.base.translator().translate_non_stream(
                to,
                from,
                &req.model,
                &original_payload,
                &body,
                &data,
                &mut state,
            );
            Ok(Response {
                payload,
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
impl ProviderExecutor for OpenAICompatExecutor {
    fn identifier(&self) -> &str {
        &self.provider_name
    }

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        if opts.alt == COMPACT_ALT {
            return self.execute_compact(auth, req, opts).await;
        }
        self.base.execute(auth, req, opts).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        if opts.alt == COMPACT_ALT {
            return Err(ExecutorError {
                kind: llmux_core::ErrorKind::InvalidRequest,
                status: Some(400),
                message: "streaming not supported for /responses/compact".to_string(),
                retry_after: None,
                headers: None,
            });
        }
        self.base.execute_stream(auth, req, opts).await
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response> {
        estimate_chat_tokens(&self.base, req, opts)
    }

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        Ok(auth.clone())
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        let (api_key, _) = self.base.provider().credentials(auth);
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

/// Local token estimate over an OpenAI chat payload using tiktoken; used by
/// the OpenAI-family providers that have no countTokens endpoint.
pub(crate) fn estimate_chat_tokens(
    base: &BaseExecutor,
    req: Request,
    opts: Options,
) -> ExecutorResult<Response> {
    let base_model = parse_suffix(&req.model).model_name;
    let from = opts.source_format;
    let to = Format::OpenAI;
    let translated = base
        .translator()
        .translate_request(from, to, &base_model, req.payload.clone(), false);
    let body: Value = serde_json::from_slice(&translated)
        .map_err(|err| ExecutorError::invalid_request(format!("count payload is not JSON: {err}")))?;

    let bpe = bpe_for_model(&base_model)?;
    let mut segments: Vec<String> = Vec::new();
    if let Some(messages) = get_path(&body, "messages").and_then(Value::as_array) {
        for message in messages {
            match get_path(message, "content") {
                Some(Value::String(text)) => segments.push(text.clone()),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = get_trimmed_str(part, "text") {
                            segments.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
            if let Some(calls) = get_path(message, "tool_calls").and_then(Value::as_array) {
                for call in calls {
                    if let Some(name) = get_trimmed_str(call, "function.name") {
                        segments.push(name.to_string());
                    }
                    if let Some(args) = get_trimmed_str(call, "function.arguments") {
                        segments.push(args.to_string());
                    }
                }
            }
        }
    }
    if let Some(tools) = get_path(&body, "tools").and_then(Value::as_array) {
        for tool in tools {
            if let Some(name) = get_trimmed_str(tool, "function.name") {
                segments.push(name.to_string());
            }
            if let Some(description) = get_trimmed_str(tool, "function.description") {
                segments.push(description.to_string());
            }
            if let Some(parameters) = get_path(tool, "function.parameters") {
                segments.push(parameters.to_string());
            }
        }
    }

    let text = segments.join("\n");
    let count = bpe.encode_ordinary(&text).len() as i64;
    let usage_json = crate::providers::openai_usage_json(count);
    let payload = base
        .translator()
        .translate_token_count(to, from, count, &usage_json);
    Ok(Response {
        payload,
        headers: Headers::new(),
    })
}

fn bpe_for_model(model: &str) -> ExecutorResult<tiktoken_rs::CoreBPE> {
    if let Ok(bpe) = tiktoken_rs::get_bpe_from_model(model) {
        return Ok(bpe);
    }
    tiktoken_rs::o200k_base().map_err(|err| ExecutorError::internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_and_key_come_from_attributes() {
        let mut auth = Auth::new("a", "openrouter");
        auth.attributes
            .insert("api_key".to_string(), "sk-1".to_string());
        auth.attributes
            .insert("base_url".to_string(), "https://openrouter.ai/api/v1".to_string());
        let config = OpenAICompatProviderConfig::new("openrouter");
        let (key, base) = config.credentials(&auth);
        assert_eq!(key, "sk-1");
        assert_eq!(
            config.endpoint(&base, "m", "execute", false),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn custom_headers_flow_through() {
        let mut auth = Auth::new("a", "custom");
        auth.attributes
            .insert("header_x_org".to_string(), "org-1".to_string());
        let config = OpenAICompatProviderConfig::new("custom");
        let mut headers = Headers::new();
        config.apply_headers(&mut headers, &auth, "key", false, &Headers::new());
        assert_eq!(llmux_core::header_get(&headers, "x-org"), Some("org-1"));
    }
}
