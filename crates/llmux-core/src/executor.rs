use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::auth::Auth;
use crate::error::{ExecutorError, ExecutorResult};
use crate::format::Format;
use crate::headers::Headers;

/// Metadata key carrying the execution session id for WebSocket-capable
/// executors.
pub const EXECUTION_SESSION_METADATA_KEY: &str = "execution_session_id";

/// Metadata key set by the server layer when the downstream transport is a
/// WebSocket connection.
pub const DOWNSTREAM_WEBSOCKET_METADATA_KEY: &str = "downstream_websocket";

/// Validated inbound request, already parsed by the server layer.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Requested model name; may still carry a thinking suffix.
    pub model: String,
    /// Opaque payload in the source wire format.
    pub payload: Bytes,
    pub metadata: Map<String, Value>,
}

impl Request {
    pub fn new(model: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            model: model.into(),
            payload: payload.into(),
            metadata: Map::new(),
        }
    }

    pub fn action(&self) -> Option<&str> {
        self.metadata.get("action").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub source_format: Format,
    pub stream: bool,
    /// Alternate endpoint selector (e.g. `responses/compact`).
    pub alt: String,
    /// Raw payload captured before any translation, fed back to the
    /// translator for context.
    pub original_request: Bytes,
    /// Inbound request-scoped headers captured by the server layer; provider
    /// header builders consult these before applying defaults.
    pub request_headers: Headers,
    pub metadata: Map<String, Value>,
}

impl Options {
    pub fn new(source_format: Format) -> Self {
        Self {
            source_format,
            stream: false,
            alt: String::new(),
            original_request: Bytes::new(),
            request_headers: Headers::new(),
            metadata: Map::new(),
        }
    }

    pub fn execution_session_id(&self) -> Option<&str> {
        self.metadata
            .get(EXECUTION_SESSION_METADATA_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn downstream_websocket(&self) -> bool {
        self.metadata
            .get(DOWNSTREAM_WEBSOCKET_METADATA_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub payload: Bytes,
    pub headers: Headers,
}

/// One unit of a streamed response: payload bytes, or a terminal error after
/// which the channel closes.
#[derive(Debug)]
pub enum StreamChunk {
    Payload(Bytes),
    Err(ExecutorError),
}

#[derive(Debug)]
pub struct StreamResult {
    pub headers: Headers,
    pub chunks: mpsc::Receiver<StreamChunk>,
}

/// A fully prepared pass-through HTTP request.
#[derive(Debug, Clone)]
pub struct PreparedHttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

#[derive(Debug)]
pub struct PreparedHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// Per-provider execution contract.
///
/// Implementations are stateless with respect to credentials: `execute` and
/// `execute_stream` borrow an immutable snapshot and never mutate it. A
/// refreshed credential is produced only by `refresh`. Cancellation is
/// drop-based: dropping the returned future or the chunk receiver closes the
/// upstream connection.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn identifier(&self) -> &str;

    async fn execute(&self, auth: &Auth, req: Request, opts: Options) -> ExecutorResult<Response>;

    /// Returns only after upstream headers are received; later failures are
    /// delivered as a terminal chunk.
    async fn execute_stream(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<StreamResult>;

    async fn count_tokens(
        &self,
        auth: &Auth,
        req: Request,
        opts: Options,
    ) -> ExecutorResult<Response>;

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth>;

    /// Injects provider auth into a prepared pass-through request.
    fn prepare_request(&self, req: &mut PreparedHttpRequest, auth: &Auth) -> ExecutorResult<()>;

    /// Executes a prepared pass-through request with provider auth applied.
    async fn http_request(
        &self,
        auth: &Auth,
        req: PreparedHttpRequest,
    ) -> ExecutorResult<PreparedHttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_session_id_trims_and_filters() {
        let mut opts = Options::new(Format::OpenAI);
        assert_eq!(opts.execution_session_id(), None);
        opts.metadata
            .insert(EXECUTION_SESSION_METADATA_KEY.to_string(), json!("  sess-1  "));
        assert_eq!(opts.execution_session_id(), Some("sess-1"));
        opts.metadata
            .insert(EXECUTION_SESSION_METADATA_KEY.to_string(), json!("   "));
        assert_eq!(opts.execution_session_id(), None);
    }

    #[test]
    fn request_action_reads_metadata() {
        let mut req = Request::new("gemini-2.5-pro", Bytes::new());
        assert_eq!(req.action(), None);
        req.metadata.insert("action".to_string(), json!("countTokens"));
        assert_eq!(req.action(), Some("countTokens"));
    }
}
