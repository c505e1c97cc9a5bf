use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, Request, Response, StreamChunk,
    StreamResult, TranslateState, Translator, UsageDetail, UsageReporter, UsageSink, header_get,
    header_set,
};

use crate::client::client_for;
use crate::config::Config;
use crate::overrides::apply_payload_overrides;
use crate::record::{
    UpstreamRequestLog, record_api_request, record_api_response_chunk, record_api_response_error,
    record_api_response_metadata, summarize_error_body,
};
use crate::scan::{DEFAULT_SCAN_LIMIT, LineScanner};
use crate::thinking::{apply_thinking, parse_suffix};

/// Provider-specific policy consumed by [`BaseExecutor`].
pub trait ProviderConfig: Send + Sync {
    fn identifier(&self) -> &str;

    /// Extracts `(api_key, base_url)` from the credential.
    fn credentials(&self, auth: &Auth) -> (String, String);

    fn endpoint(&self, base_url: &str, model: &str, action: &str, stream: bool) -> String;

    /// Sets authorization, content type and provider-specific headers.
    /// `inbound` carries request-scoped headers captured by the server layer.
    fn apply_headers(
        &self,
        headers: &mut Headers,
        auth: &Auth,
        api_key: &str,
        stream: bool,
        inbound: &Headers,
    );

    fn translator_format(&self) -> Format;

    /// Post-translation request edits (model field, provider quirks).
    fn transform_request_body(&self, body: Value, model: &str, stream: bool)
    -> ExecutorResult<Value>;

    /// Response cleaning. Returning an empty vector for a non-empty input
    /// drops the frame.
    fn transform_response_body(&self, body: Vec<u8>) -> Vec<u8> {
        body
    }

    fn parse_usage(&self, data: &[u8], stream: bool) -> UsageDetail;

    fn scan_limit(&self) -> usize {
        DEFAULT_SCAN_LIMIT
    }
}

/// Copies `name` from the inbound request headers when present, otherwise
/// sets `default`. Headers already set by the provider win.
pub fn ensure_header(headers: &mut Headers, inbound: &Headers, name: &str, default: &str) {
    if header_get(headers, name).is_some() {
        return;
    }
    if let Some(value) = header_get(inbound, name) {
        let value = value.to_string();
        header_set(headers, name, &value);
        return;
    }
    header_set(headers, name, default);
}

/// Forwards `header_`-prefixed credential attributes as custom headers
/// (`header_x_api_version` becomes `x-api-version`).
pub fn apply_custom_headers_from_attrs(headers: &mut Headers, auth: &Auth) {
    for (key, value) in &auth.attributes {
        let Some(name) = key.strip_prefix("header_") else {
            continue;
        };
        let name = name.trim().replace('_', "-");
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        header_set(headers, &name, value);
    }
}

pub fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (key, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((key.as_str().to_string(), text.to_string()));
        }
    }
    out
}

pub fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

/// Builds the terminal error for a non-2xx upstream response.
pub fn upstream_status_error(status: u16, headers: &Headers, body: &[u8]) -> ExecutorError {
    let content_type = header_get(headers, "content-type").unwrap_or("");
    let message = summarize_error_body(content_type, body);
    let mut err = ExecutorError::status(status, message);
    if status == 429 {
        err = err.with_retry_after(parse_retry_after(headers));
    }
    err
}

pub fn map_transport_error(err: wreq::Error) -> ExecutorError {
    ExecutorError::transport(err.to_string())
}

/// Shared translate → transform → HTTP → translate-back pipeline.
pub struct BaseExecutor {
    cfg: Arc<Config>,
    translator: Arc<dyn Translator>,
    sink: Arc<dyn UsageSink>,
    provider: Arc<dyn ProviderConfig>,
}

pub(crate) struct PreparedCall {
    pub base_model: String,
    pub from: Format,
    pub to: Format,
    pub original_payload: Bytes,
    pub body: Vec<u8>,
    pub api_key: String,
    pub base_url: String,
}

impl BaseExecutor {
    pub fn new(
        cfg: Arc<Config>,
        translator: Arc<dyn Translator>,
        sink: Arc<dyn UsageSink>,
        provider: Arc<dyn ProviderConfig>,
    ) -> Self {
        Self {
            cfg,
            translator,
            sink,
            provider,
        }
    }

    pub fn cfg(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn translator(&self) -> &Arc<dyn Translator> {
        &self.translator
    }

    pub fn sink(&self) -> &Arc<dyn UsageSink> {
        &self.sink
    }

    pub fn provider(&self) -> &Arc<dyn ProviderConfig> {
        &self.provider
    }

    pub(crate) fn reporter(&self, base_model: &str, auth: &Auth) -> UsageReporter {
        UsageReporter::new(
            self.provider.identifier(),
            base_model,
            auth,
            Arc::clone(&self.sink),
        )
    }

    /// Translation + thinking + overrides + provider transform, shared by
    /// both pipelines and by the specialized executors.
    pub(crate) fn prepare(
        &self,
        auth: &Auth,
        req: &Request,
        opts: &Options,
        stream: bool,
    ) -> ExecutorResult<PreparedCall> {
        let base_model = parse_suffix(&req.model).model_name;
        let (api_key, base_url) = self.provider.credentials(auth);

        let from = opts.source_format;
        let to = self.provider.translator_format();
        let original_payload = if opts.original_request.is_empty() {
            req.payload.clone()
        } else {
            opts.original_request.clone()
        };

        let translated =
            self.translator
                .translate_request(from, to, &base_model, req.payload.clone(), stream);
        let mut body: Value = serde_json::from_slice(&translated).map_err(|err| {
            ExecutorError::invalid_request(format!(
                "{}: translated payload is not JSON: {err}",
                self.provider.identifier()
            ))
        })?;

        apply_thinking(&mut body, &req.model, to);
        apply_payload_overrides(&self.cfg, &base_model, to, &mut body);
        let body = self.provider.transform_request_body(body, &base_model, stream)?;
        let body = serde_json::to_vec(&body)
            .map_err(|err| ExecutorError::internal(format!("serialize request body: {err}")))?;

        Ok(PreparedCall {
            base_model,
            from,
            to,
            original_payload,
            body,
            api_key,
            base_url,
        })
    }

    pub(crate) fn build_headers(
        &self,
        auth: &Auth,
        api_key: &str,
        stream: bool,
        opts: &Options,
    ) -> Headers {
        let mut headers = Headers::new();
        self.provider
            .apply_headers(&mut headers, auth, api_key, stream, &opts.request_headers);
        headers
    }

    pub(crate) async fn send(
        &self,
        auth: &Auth,
        url: &str,
        headers: &Headers,
        body: Vec<u8>,
    ) -> ExecutorResult<wreq::Response> {
        record_api_request(UpstreamRequestLog {
            url,
            method: "POST",
            provider: self.provider.identifier(),
            body: &body,
            auth: Some(auth),
        });

        let client = client_for(&self.cfg, auth)?;
        let mut builder = client.post(url);
        for (key, value) in headers {
            builder = builder.header(key, value);
        }
        let resp = builder.body(body).send().await.map_err(|err| {
            record_api_response_error(self.provider.identifier(), &err);
            map_transport_error(err)
        })?;
        record_api_response_metadata(self.provider.identifier(), resp.status().as_u16());
        Ok(resp)
    }

    /// Non-streaming pipeline.
    pub async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        let prepared = self.prepare(auth, &req, &opts, false)?;
        let reporter = self.reporter(&prepared.base_model, auth);
        let result = self.execute_prepared(auth, &req, &opts, prepared, &reporter).await;
        if result.is_err() {
            reporter.publish_failure();
        }
        result
    }

    async fn execute_prepared(
        &self,
        auth: &Auth,
        req: &Request,
        opts: &Options,
        prepared: PreparedCall,
        reporter: &UsageReporter,
    ) -> ExecutorResult<Response> {
        let action = req.action().unwrap_or("execute");
        let url = self
            .provider
            .endpoint(&prepared.base_url, &prepared.base_model, action, false);
        let headers = self.build_headers(auth, &prepared.api_key, false, opts);

        let resp = self.send(auth, &url, &headers, prepared.body.clone()).await?;
        let status = resp.status().as_u16();
        let resp_headers = headers_from_wreq(resp.headers());
        let data = resp.bytes().await.map_err(map_transport_error)?;
        record_api_response_chunk(self.provider.identifier(), &data);

        if !(200..300).contains(&status) {
            return Err(upstream_status_error(status, &resp_headers, &data));
        }

        let data = self.provider.transform_response_body(data.to_vec());
        reporter.publish(self.provider.parse_usage(&data, false));
        reporter.ensure_published();

        let mut state = TranslateState::default();
        let payload = self.translator.translate_non_stream(
            prepared.to,
            prepared.from,
            &req.model,
            &prepared.original_payload,
            &prepared.body,
            &data,
            &mut state,
        );
        Ok(Response {
            payload,
            headers: resp_headers,
        })
    }

    /// Streaming pipeline. Returns once upstream headers are received; the
    /// producer task feeds the chunk channel and reports terminal errors as a
    /// final chunk.
    pub async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        let prepared = self.prepare(auth, &req, &opts, true)?;
        let reporter = self.reporter(&prepared.base_model, auth);

        let url = self
            .provider
            .endpoint(&prepared.base_url, &prepared.base_model, "stream", true);
        let headers = self.build_headers(auth, &prepared.api_key, true, &opts);

        let resp = match self.send(auth, &url, &headers, prepared.body.clone()).await {
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
            record_api_response_chunk(self.provider.identifier(), &data);
            reporter.publish_failure();
            return Err(upstream_status_error(status, &resp_headers, &data));
        }

        let (tx, rx) = mpsc::channel::<StreamChunk>(16);
        let provider = Arc::clone(&self.provider);
        let translator = Arc::clone(&self.translator);
        let model = req.model.clone();
        let original_payload = prepared.original_payload.clone();
        let request_body = prepared.body.clone();
        let (from, to) = (prepared.from, prepared.to);

        tokio::spawn(async move {
            let mut scanner = LineScanner::new(provider.scan_limit());
            let mut state = TranslateState::default();
            let mut stream = resp.bytes_stream();

            let emit = |line: Bytes,
                        state: &mut TranslateState,
                        tx: &mpsc::Sender<StreamChunk>| {
                let provider = Arc::clone(&provider);
                let translator = Arc::clone(&translator);
                let model = model.clone();
                let original_payload = original_payload.clone();
                let request_body = request_body.clone();
                let chunks = {
                    record_api_response_chunk(provider.identifier(), &line);
                    let usage = provider.parse_usage(&line, true);
                    if !usage.is_empty() {
                        reporter.publish(usage);
                    }
                    let transformed = provider.transform_response_body(line.to_vec());
                    if transformed.is_empty() && !line.is_empty() {
                        Vec::new()
                    } else {
                        translator.translate_stream(
                            to,
                            from,
                            &model,
                            &original_payload,
                            &request_body,
                            &transformed,
                            state,
                        )
                    }
                };
                let tx = tx.clone();
                async move {
                    for chunk in chunks {
                        if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                            return false;
                        }
                    }
                    true
                }
            };

            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        let lines = match scanner.push(&chunk) {
                            Ok(lines) => lines,
                            Err(err) => {
                                record_api_response_error(provider.identifier(), &err);
                                reporter.publish_failure();
                                let _ = tx
                                    .send(StreamChunk::Err(ExecutorError::transport(err.to_string())))
                                    .await;
                                return;
                            }
                        };
                        for line in lines {
                            if !emit(line, &mut state, &tx).await {
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        record_api_response_error(provider.identifier(), &err);
                        reporter.publish_failure();
                        let _ = tx
                            .send(StreamChunk::Err(map_transport_error(err)))
                            .await;
                        return;
                    }
                    None => break,
                }
            }

            if let Some(line) = scanner.finish()
                && !emit(line, &mut state, &tx).await
            {
                return;
            }

            let done_chunks = translator.translate_stream(
                to,
                from,
                &model,
                &original_payload,
                &request_body,
                b"[DONE]",
                &mut state,
            );
            for chunk in done_chunks {
                if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                    return;
                }
            }
        });

        Ok(StreamResult {
            headers: resp_headers,
            chunks: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_header_prefers_existing_then_inbound_then_default() {
        let inbound = vec![("Version".to_string(), "9.9.9".to_string())];

        let mut headers = Headers::new();
        ensure_header(&mut headers, &inbound, "Version", "0.1.0");
        assert_eq!(header_get(&headers, "version"), Some("9.9.9"));

        let mut headers = vec![("version".to_string(), "explicit".to_string())];
        ensure_header(&mut headers, &inbound, "Version", "0.1.0");
        assert_eq!(header_get(&headers, "version"), Some("explicit"));

        let mut headers = Headers::new();
        ensure_header(&mut headers, &Headers::new(), "Version", "0.1.0");
        assert_eq!(header_get(&headers, "version"), Some("0.1.0"));
    }

    #[test]
    fn custom_attr_headers_are_forwarded() {
        let mut auth = Auth::new("a", "openai-compat");
        auth.attributes
            .insert("header_x_portal_token".to_string(), "tok".to_string());
        auth.attributes
            .insert("api_key".to_string(), "ignored".to_string());
        let mut headers = Headers::new();
        apply_custom_headers_from_attrs(&mut headers, &auth);
        assert_eq!(header_get(&headers, "x-portal-token"), Some("tok"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn retry_after_is_parsed_on_429() {
        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("retry-after".to_string(), "12".to_string()),
        ];
        let err = upstream_status_error(429, &headers, b"{\"error\":\"quota\"}");
        assert!(err.is_quota_exceeded());
        assert_eq!(err.retry_after, Some(Duration::from_secs(12)));

        let err = upstream_status_error(500, &headers, b"boom");
        assert_eq!(err.retry_after, None);
    }
}
