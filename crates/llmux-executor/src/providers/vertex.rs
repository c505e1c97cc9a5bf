//! Gemini Vertex executor.
//!
//! Two credential shapes: an express API key (query-less key header against
//! the shared publisher endpoint) and a Google service account whose access
//! tokens are minted through an RS256 JWT assertion. Imagen models are
//! bridged to/from the Gemini request/response shape around `:predict`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

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
use crate::scan::GEMINI_SCAN_LIMIT;
use crate::usage_parse::{parse_gemini_stream_usage, parse_gemini_usage};

const VERTEX_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECS: u64 = 3600;
const TOKEN_EXPIRY_SLACK_SECS: i64 = 120;

pub fn vertex_base_url(location: &str) -> String {
    let location = location.trim();
    if location.is_empty() || location.eq_ignore_ascii_case("global") {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{location}-aiplatform.googleapis.com")
    }
}

pub fn is_imagen_model(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("imagen-")
}

fn vertex_action(model: &str, stream: bool) -> &'static str {
    if is_imagen_model(model) {
        "predict"
    } else if stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    }
}

/// API-key flavored provider config used by the shared pipeline.
#[derive(Debug, Default)]
pub struct VertexProviderConfig;

impl ProviderConfig for VertexProviderConfig {
    fn identifier(&self) -> &str {
        "gemini-vertex"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        let api_key = auth.attribute("api_key").unwrap_or_default().to_string();
        let base_url = auth
            .attribute("base_url")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "https://aiplatform.googleapis.com".to_string());
        (api_key, base_url)
    }

    fn endpoint(&self, base_url: &str, model: &str, _action: &str, stream: bool) -> String {
        let action = vertex_action(model, stream);
        let suffix = if stream && !is_imagen_model(model) {
            "?alt=sse"
        } else {
            ""
        };
        // Service-account credentials carry the full project/location path in
        // their base URL; the express key uses the shared publisher root.
        if base_url.contains("/projects/") {
            format!("{base_url}/publishers/google/models/{model}:{action}{suffix}")
        } else {
            format!("{base_url}/v1/publishers/google/models/{model}:{action}{suffix}")
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
        if !api_key.is_empty() {
            header_set(headers, "x-goog-api-key", api_key);
        }
        header_set(headers, "Accept", if stream { "text/event-stream" } else { "application/json" });
        apply_custom_headers_from_attrs(headers, auth);
    }

    fn translator_format(&self) -> Format {
        Format::Gemini
    }

    fn transform_request_body(
        &self,
        mut body: Value,
        model: &str,
        _stream: bool,
    ) -> ExecutorResult<Value> {
        if is_imagen_model(model) {
            return convert_to_imagen_request(&body);
        }
        set_path(&mut body, "model", json!(model));
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

/// Gemini generateContent shape → Imagen `:predict` shape.
pub fn convert_to_imagen_request(body: &Value) -> ExecutorResult<Value> {
    let mut prompt_parts: Vec<String> = Vec::new();
    if let Some(contents) = get_path(body, "contents").and_then(Value::as_array) {
        for content in contents {
            if let Some(parts) = get_path(content, "parts").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = get_trimmed_str(part, "text") {
                        prompt_parts.push(text.to_string());
                    }
                }
            }
        }
    }
    if prompt_parts.is_empty() {
        return Err(ExecutorError::invalid_request(
            "imagen request carries no text prompt",
        ));
    }

    let mut parameters = json!({"sampleCount": 1});
    if let Some(count) = get_path(body, "generationConfig.candidateCount").and_then(Value::as_i64) {
        parameters["sampleCount"] = json!(count.max(1));
    }
    if let Some(ratio) = get_trimmed_str(body, "generationConfig.imageConfig.aspectRatio") {
        parameters["aspectRatio"] = json!(ratio);
    }

    Ok(json!({
        "instances": [{"prompt": prompt_parts.join("\n")}],
        "parameters": parameters,
    }))
}

/// Imagen `:predict` predictions → Gemini candidates with inline image data.
pub fn convert_imagen_response(data: &[u8], model: &str) -> Vec<u8> {
    let Some(value) = crate::json::parse(data) else {
        return data.to_vec();
    };
    let Some(predictions) = get_path(&value, "predictions").and_then(Value::as_array) else {
        return data.to_vec();
    };

    let candidates: Vec<Value> = predictions
        .iter()
        .enumerate()
        .filter_map(|(index, prediction)| {
            let encoded = get_trimmed_str(prediction, "bytesBase64Encoded")?;
            let mime = get_trimmed_str(prediction, "mimeType").unwrap_or("image/png");
            Some(json!({
                "content": {
                    "role": "model",
                    "parts": [{"inlineData": {"mimeType": mime, "data": encoded}}]
                },
                "finishReason": "STOP",
                "index": index,
            }))
        })
        .collect();

    let converted = json!({
        "candidates": candidates,
        "modelVersion": model,
    });
    serde_json::to_vec(&converted).unwrap_or_else(|_| data.to_vec())
}

struct CachedToken {
    token: String,
    expires_at: time::OffsetDateTime,
}

static SA_TOKEN_CACHE: Mutex<Option<HashMap<String, CachedToken>>> = Mutex::new(None);

#[derive(serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub struct VertexExecutor {
    base: BaseExecutor,
}

impl VertexExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }

    fn service_account(&self, auth: &Auth) -> Option<(String, String, Value)> {
        let sa = auth.metadata.get("service_account")?.clone();
        let project = get_trimmed_str(&sa, "project_id")
            .or_else(|| auth.metadata_str("project_id"))?
            .to_string();
        let location = auth
            .metadata_str("location")
            .or_else(|| auth.attribute("location"))
            .unwrap_or("global")
            .to_string();
        Some((project, location, sa))
    }

    /// Mints (or reuses) a service-account access token via JWT assertion.
    async fn service_account_token(&self, auth: &Auth, sa: &Value) -> ExecutorResult<String> {
        let client_email = get_trimmed_str(sa, "client_email")
            .ok_or_else(|| ExecutorError::invalid_request("service account missing client_email"))?;
        let private_key = get_trimmed_str(sa, "private_key")
            .ok_or_else(|| ExecutorError::invalid_request("service account missing private_key"))?;
        let token_uri = get_trimmed_str(sa, "token_uri").unwrap_or(DEFAULT_TOKEN_URI);

        {
            let cache = SA_TOKEN_CACHE.lock().expect("vertex token cache lock");
            if let Some(cached) = cache.as_ref().and_then(|map| map.get(client_email))
                && cached.expires_at - time::OffsetDateTime::now_utc()
                    > time::Duration::seconds(TOKEN_EXPIRY_SLACK_SECS)
            {
                return Ok(cached.token.clone());
            }
        }

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            iss: client_email,
            scope: VERTEX_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS as i64,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|err| ExecutorError::invalid_request(format!("service account key: {err}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|err| ExecutorError::internal(format!("assertion encode: {err}")))?;

        let body = format!(
            "grant_type={}&assertion={}",
            urlencoding::encode("urn:ietf:params:oauth:grant-type:jwt-bearer"),
            urlencoding::encode(&assertion),
        );
        let resp = passthrough_http(
            self.base.cfg(),
            auth,
            PreparedHttpRequest {
                method: "POST".to_string(),
                url: token_uri.to_string(),
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

        let token_value: Value = serde_json::from_slice(&resp.body)
            .map_err(|err| ExecutorError::internal(format!("token response: {err}")))?;
        let token = get_trimmed_str(&token_value, "access_token")
            .ok_or_else(|| ExecutorError::internal("token response missing access_token"))?
            .to_string();
        let expires_in = token_value
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(TOKEN_LIFETIME_SECS as i64);

        let mut cache = SA_TOKEN_CACHE.lock().expect("vertex token cache lock");
        cache.get_or_insert_with(HashMap::new).insert(
            client_email.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at: time::OffsetDateTime::now_utc()
                    + Duration::from_secs(expires_in.max(0) as u64),
            },
        );
        Ok(token)
    }

    /// Builds a per-call credential view that routes the shared pipeline to
    /// the regional project endpoint with the minted bearer token. The
    /// original credential is never mutated.
    async fn service_account_view(&self, auth: &Auth) -> ExecutorResult<Auth> {
        let (project, location, sa) = self
            .service_account(auth)
            .ok_or_else(|| ExecutorError::invalid_request("vertex credential shape unknown"))?;
        let token = self.service_account_token(auth, &sa).await?;

        let mut shadow = auth.clone();
        shadow.attributes.remove("api_key");
        shadow.attributes.insert(
            "base_url".to_string(),
            format!(
                "{}/v1/projects/{project}/locations/{location}",
                vertex_base_url(&location)
            ),
        );
        // Travels through the generic custom-header path.
        shadow
            .attributes
            .insert("header_authorization".to_string(), format!("Bearer {token}"));
        Ok(shadow)
    }
}

#[async_trait]
impl ProviderExecutor for VertexExecutor {
    fn identifier(&self) -> &str {
        "gemini-vertex"
    }

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response> {
        let base_model = crate::thinking::parse_suffix(&req.model).model_name;
        if auth.attribute("api_key").is_some() {
            let mut response = self.base.execute(auth, req, opts).await?;
            if is_imagen_model(&base_model) {
                response.payload = convert_imagen_response(&response.payload, &base_model).into();
            }
            return Ok(response);
        }

        let shadow = self.service_account_view(auth).await?;
        let mut response = self.base.execute(&shadow, req, opts).await?;
        if is_imagen_model(&base_model) {
            response.payload = convert_imagen_response(&response.payload, &base_model).into();
        }
        Ok(response)
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult> {
        let base_model = crate::thinking::parse_suffix(&req.model).model_name;
        if is_imagen_model(&base_model) {
            return Err(ExecutorError::invalid_request(
                "imagen models do not support streaming",
            ));
        }
        if auth.attribute("api_key").is_some() {
            return self.base.execute_stream(auth, req, opts).await;
        }
        let shadow = self.service_account_view(auth).await?;
        self.base.execute_stream(&shadow, req, opts).await
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
        Ok(auth.clone())
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        if let Some(api_key) = auth.attribute("api_key") {
            header_set(&mut req.headers, "x-goog-api-key", api_key);
        }
        Ok(())
    }

    async fn http_request(
        &self,
        auth: &Auth,
        mut req: PreparedHttpRequest,
    ) -> ExecutorResult<PreparedHttpResponse> {
        if auth.attribute("api_key").is_some() {
            self.prepare_request(&mut req, auth)?;
        } else if let Some((_, _, sa)) = self.service_account(auth) {
            let token = self.service_account_token(auth, &sa).await?;
            set_bearer(&mut req.headers, &token);
        }
        passthrough_http(self.base.cfg(), auth, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_varies_with_location() {
        assert_eq!(vertex_base_url("global"), "https://aiplatform.googleapis.com");
        assert_eq!(vertex_base_url(""), "https://aiplatform.googleapis.com");
        assert_eq!(
            vertex_base_url("us-central1"),
            "https://us-central1-aiplatform.googleapis.com"
        );
    }

    #[test]
    fn imagen_models_use_predict_action() {
        assert!(is_imagen_model("imagen-3.0-generate-002"));
        assert!(!is_imagen_model("gemini-2.5-pro"));
        assert_eq!(vertex_action("imagen-3.0-generate-002", true), "predict");
        assert_eq!(vertex_action("gemini-2.5-pro", true), "streamGenerateContent");
    }

    #[test]
    fn imagen_request_round_trip() {
        let gemini = json!({
            "contents": [{"parts": [{"text": "a lighthouse"}, {"text": "at night"}]}],
            "generationConfig": {
                "candidateCount": 2,
                "imageConfig": {"aspectRatio": "16:9"}
            }
        });
        let imagen = convert_to_imagen_request(&gemini).expect("convert");
        assert_eq!(imagen["instances"][0]["prompt"], "a lighthouse\nat night");
        assert_eq!(imagen["parameters"]["sampleCount"], 2);
        assert_eq!(imagen["parameters"]["aspectRatio"], "16:9");

        let predict = serde_json::to_vec(&json!({
            "predictions": [{"bytesBase64Encoded": "QUJD", "mimeType": "image/png"}]
        }))
        .expect("encode");
        let back: Value =
            serde_json::from_slice(&convert_imagen_response(&predict, "imagen-3.0-generate-002"))
                .expect("decode");
        assert_eq!(back["candidates"][0]["content"]["parts"][0]["inlineData"]["data"], "QUJD");
        assert_eq!(back["candidates"][0]["finishReason"], "STOP");
        assert_eq!(back["modelVersion"], "imagen-3.0-generate-002");
    }

    #[test]
    fn imagen_request_requires_prompt() {
        let err = convert_to_imagen_request(&json!({"contents": []})).expect_err("no prompt");
        assert_eq!(err.kind, llmux_core::ErrorKind::InvalidRequest);
    }

    #[test]
    fn endpoint_shapes() {
        let config = VertexProviderConfig;
        let url = config.endpoint(
            "https://aiplatform.googleapis.com",
            "gemini-2.5-pro",
            "execute",
            false,
        );
        assert_eq!(
            url,
            "https://aiplatform.googleapis.com/v1/publishers/google/models/gemini-2.5-pro:generateContent"
        );
    }
}
