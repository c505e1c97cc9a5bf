//! Gemini provider (Generative Language API key / OAuth bearer).

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, Format, Headers, Options, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Request, Response, StreamResult, UsageDetail,
    header_remove, header_set,
};

use crate::base::{BaseExecutor, ProviderConfig, apply_custom_headers_from_attrs};
use crate::json::{delete_path, get_path, get_trimmed_str, set_path};
use crate::providers::{passthrough_http, set_bearer};
use crate::scan::GEMINI_SCAN_LIMIT;
use crate::usage_parse::{filter_sse_usage_metadata, parse_gemini_stream_usage, parse_gemini_usage};

pub const GL_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const GL_API_VERSION: &str = "v1beta";
const IMAGE_PREVIEW_MODEL: &str = "gemini-2.5-flash-image-preview";
const COVER_INSTRUCTION: &str = "Based on the following requirements, create an image within the uploaded picture. The new content *MUST* completely cover the entire area of the original picture, maintaining its exact proportions, and *NO* blank areas should appear.";

/// `bearer:` marks an OAuth access token travelling in the api-key slot;
/// header application switches between `x-goog-api-key` and `Authorization`.
pub const BEARER_PREFIX: &str = "bearer:";

#[derive(Debug, Default)]
pub struct GeminiProviderConfig;

impl ProviderConfig for GeminiProviderConfig {
    fn identifier(&self) -> &str {
        "gemini"
    }

    fn credentials(&self, auth: &Auth) -> (String, String) {
        let mut api_key = auth.attribute("api_key").map(str::to_string);

        if api_key.is_none() {
            let bearer = auth
                .metadata_str("access_token")
                .map(str::to_string)
                .or_else(|| {
                    auth.metadata
                        .get("token")
                        .and_then(|token| token.get("access_token"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            if let Some(bearer) = bearer {
                api_key = Some(format!("{BEARER_PREFIX}{bearer}"));
            }
        }

        let base_url = auth
            .attribute("base_url")
            .unwrap_or(GL_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        (api_key.unwrap_or_default(), base_url)
    }

    fn endpoint(&self, base_url: &str, model: &str, action: &str, stream: bool) -> String {
        if action == "countTokens" {
            return format!("{base_url}/{GL_API_VERSION}/models/{model}:countTokens");
        }
        if stream {
            format!("{base_url}/{GL_API_VERSION}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base_url}/{GL_API_VERSION}/models/{model}:generateContent")
        }
    }

    fn apply_headers(
        &self,
        headers: &mut Headers,
        auth: &Auth,
        api_key: &str,
        _stream: bool,
        _inbound: &Headers,
    ) {
        header_set(headers, "Content-Type", "application/json");
        if let Some(bearer) = api_key.strip_prefix(BEARER_PREFIX) {
            set_bearer(headers, bearer);
            header_remove(headers, "x-goog-api-key");
        } else if !api_key.is_empty() {
            header_set(headers, "x-goog-api-key", api_key);
            header_remove(headers, "Authorization");
        }
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
        fix_image_aspect_ratio(model, &mut body, "");
        set_path(&mut body, "model", json!(model));
        // Not accepted by the Generative Language API.
        delete_path(&mut body, "session_id");
        Ok(body)
    }

    fn transform_response_body(&self, body: Vec<u8>) -> Vec<u8> {
        filter_sse_usage_metadata(&body).unwrap_or_default()
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

/// For the image-preview model, a request with a declared aspect ratio but no
/// inline image gets a white placeholder at that ratio plus forced image
/// modalities; the unsupported `imageConfig` block is dropped either way.
/// `root` is `""` for plain Gemini and `"request."` for Code Assist bodies.
pub fn fix_image_aspect_ratio(model: &str, body: &mut Value, root: &str) {
    if model != IMAGE_PREVIEW_MODEL {
        return;
    }
    let path = |suffix: &str| format!("{root}{suffix}");

    let Some(aspect_ratio) = get_trimmed_str(body, &path("generationConfig.imageConfig.aspectRatio"))
        .map(str::to_string)
    else {
        return;
    };
    let Some(contents) = get_path(body, &path("contents")).and_then(Value::as_array).cloned()
    else {
        return;
    };
    if contents.is_empty() {
        return;
    }

    let has_inline_data = contents.iter().any(|content| {
        get_path(content, "parts")
            .and_then(Value::as_array)
            .is_some_and(|parts| parts.iter().any(|part| part.get("inlineData").is_some()))
    });
    if has_inline_data {
        delete_path(body, &path("generationConfig.imageConfig"));
        return;
    }

    let placeholder = white_png_base64(&aspect_ratio);
    let mut parts = vec![
        json!({"text": COVER_INSTRUCTION}),
        json!({"inlineData": {"mime_type": "image/png", "data": placeholder}}),
    ];
    if let Some(existing) = get_path(&contents[0], "parts").and_then(Value::as_array) {
        parts.extend(existing.iter().cloned());
    }

    set_path(body, &path("contents.0.parts"), Value::Array(parts));
    set_path(body, &path("generationConfig.responseModalities"), json!(["IMAGE", "TEXT"]));
    delete_path(body, &path("generationConfig.imageConfig"));
}

/// Base64 PNG of a solid white image at the requested aspect ratio.
pub fn white_png_base64(aspect_ratio: &str) -> String {
    let (width, height) = dimensions_for_ratio(aspect_ratio);
    base64::engine::general_purpose::STANDARD.encode(encode_white_png(width, height))
}

fn dimensions_for_ratio(aspect_ratio: &str) -> (u32, u32) {
    match aspect_ratio.trim() {
        "1:1" => (1024, 1024),
        "2:3" => (832, 1248),
        "3:2" => (1248, 832),
        "3:4" => (864, 1184),
        "4:3" => (1184, 864),
        "4:5" => (896, 1152),
        "5:4" => (1152, 896),
        "9:16" => (768, 1344),
        "16:9" => (1344, 768),
        "21:9" => (1536, 672),
        _ => (1024, 1024),
    }
}

/// Minimal grayscale PNG encoder: stored deflate blocks, no filtering.
fn encode_white_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    // 8-bit grayscale, no interlace.
    ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);
    push_chunk(&mut out, b"IHDR", &ihdr);

    let row_len = 1 + width as usize;
    let mut raw = Vec::with_capacity(row_len * height as usize);
    for _ in 0..height {
        raw.push(0); // filter: none
        raw.resize(raw.len() + width as usize, 0xFF);
    }
    push_chunk(&mut out, b"IDAT", &zlib_stored(&raw));
    push_chunk(&mut out, b"IEND", &[]);
    out
}

fn push_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut crc_input = Vec::with_capacity(4 + data.len());
    crc_input.extend_from_slice(kind);
    crc_input.extend_from_slice(data);
    out.extend_from_slice(&crc32(&crc_input).to_be_bytes());
}

fn zlib_stored(raw: &[u8]) -> Vec<u8> {
    let mut out = vec![0x78, 0x01];
    let mut chunks = raw.chunks(0xFFFF).peekable();
    if raw.is_empty() {
        out.extend_from_slice(&[0x01, 0x00, 0x00, 0xFF, 0xFF]);
    }
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        out.push(if last { 0x01 } else { 0x00 });
        let len = chunk.len() as u16;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&(!len).to_le_bytes());
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(&adler32(raw).to_be_bytes());
    out
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let (mut a, mut b) = (1u32, 0u32);
    for &byte in data {
        a = (a + byte as u32) % MOD;
        b = (b + a) % MOD;
    }
    (b << 16) | a
}

pub struct GeminiExecutor {
    base: BaseExecutor,
}

impl GeminiExecutor {
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }
}

#[async_trait]
impl ProviderExecutor for GeminiExecutor {
    fn identifier(&self) -> &str {
        "gemini"
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
        Ok(auth.clone())
    }

    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()> {
        let (api_key, _) = GeminiProviderConfig.credentials(auth);
        if let Some(bearer) = api_key.strip_prefix(BEARER_PREFIX) {
            set_bearer(&mut req.headers, bearer);
        } else if !api_key.is_empty() {
            header_set(&mut req.headers, "x-goog-api-key", &api_key);
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
