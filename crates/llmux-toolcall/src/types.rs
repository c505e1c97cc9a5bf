use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;

use crate::schema::ObjectSchema;

/// Handler invoked with the validated argument object.
///
/// Handlers report domain failures by returning a [`ToolError`]; anything the
/// runtime itself detects (timeout, cancellation, panic) is classified on top.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, ToolError>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for HandlerFn<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        (self.0)(args).await
    }
}

#[derive(Clone)]
pub struct Definition {
    pub name: String,
    pub version: String,
    pub description: String,
    pub timeout: Option<Duration>,
    pub side_effecting: bool,
    pub input_schema: Option<ObjectSchema>,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("side_effecting", &self.side_effecting)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub request_id: String,
    pub execution_session_id: String,
    pub response_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub raw_arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnknownTool,
    ValidationError,
    Timeout,
    Canceled,
    HandlerError,
    InternalError,
    Panic,
    DuplicateInFlight,
    DuplicateCallIdConflict,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UnknownTool => "unknown_tool",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Canceled => "canceled",
            ErrorCode::HandlerError => "handler_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::Panic => "panic",
            ErrorCode::DuplicateInFlight => "duplicate_in_flight",
            ErrorCode::DuplicateCallIdConflict => "duplicate_call_id_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args_hash: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub replay_cached: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub validation_failed: bool,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    pub data: Value,
    pub error: Option<ToolError>,
    pub meta: EnvelopeMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Started,
    Succeeded,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
    Canceled,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub call_id: String,
    pub tool_name: String,
    pub args_hash: String,
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub error_code: Option<ErrorCode>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub envelope: Envelope,
    pub record: Record,
    pub duplicate: bool,
    pub validated: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Start,
    ValidateStart,
    ValidateDone,
    ExecuteStart,
    ExecuteDone,
    Finish,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub tool_name: String,
    pub tool_version: String,
    pub call_id: String,
    pub args_hash: String,
    pub status: Option<Status>,
    pub error_code: Option<ErrorCode>,
    pub latency_ms: i64,
    pub duplicate: bool,
    pub message: String,
}

impl Event {
    pub(crate) fn new(event_type: EventType, tool_name: &str, call_id: &str) -> Self {
        Self {
            event_type,
            tool_name: tool_name.to_string(),
            tool_version: String::new(),
            call_id: call_id.to_string(),
            args_hash: String::new(),
            status: None,
            error_code: None,
            latency_ms: 0,
            duplicate: false,
            message: String::new(),
        }
    }
}

pub trait Hook: Send + Sync {
    fn on_tool_event(&self, event: &Event);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl Hook for NoopHook {
    fn on_tool_event(&self, _event: &Event) {}
}

pub struct HookChain(pub Vec<Arc<dyn Hook>>);

impl Hook for HookChain {
    fn on_tool_event(&self, event: &Event) {
        for hook in &self.0 {
            hook.on_tool_event(event);
        }
    }
}

pub fn compose_hooks(hooks: Vec<Arc<dyn Hook>>) -> Arc<dyn Hook> {
    let mut filtered: Vec<Arc<dyn Hook>> = hooks;
    match filtered.len() {
        0 => Arc::new(NoopHook),
        1 => filtered.remove(0),
        _ => Arc::new(HookChain(filtered)),
    }
}

/// Serializes an envelope into a Codex `function_call_output` input item.
/// The envelope itself travels as a JSON string in `output`.
pub fn build_function_call_output_item(
    call_id: &str,
    envelope: &Envelope,
) -> Result<Value, serde_json::Error> {
    let payload = serde_json::to_string(envelope)?;
    Ok(json!({
        "type": "function_call_output",
        "call_id": call_id,
        "output": payload,
    }))
}

/// Wraps a `function_call_output` item into a WebSocket `response.append`
/// frame for incremental Codex turns.
pub fn build_response_append_with_function_call_output(
    call_id: &str,
    envelope: &Envelope,
) -> Result<Value, serde_json::Error> {
    let item = build_function_call_output_item(call_id, envelope)?;
    Ok(json!({
        "type": "response.append",
        "input": [item],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_call_output_item_nests_envelope_as_string() {
        let envelope = Envelope {
            ok: true,
            data: json!({"answer": 42}),
            error: None,
            meta: EnvelopeMeta {
                tool_name: "calc".to_string(),
                call_id: "call-1".to_string(),
                ..Default::default()
            },
        };
        let item = build_function_call_output_item("call-1", &envelope).expect("item");
        assert_eq!(item["type"], "function_call_output");
        assert_eq!(item["call_id"], "call-1");
        let inner: Value =
            serde_json::from_str(item["output"].as_str().expect("output string")).expect("inner");
        assert_eq!(inner["ok"], true);
        assert_eq!(inner["data"]["answer"], 42);
    }

    #[test]
    fn response_append_wraps_single_item() {
        let envelope = Envelope::default();
        let frame =
            build_response_append_with_function_call_output("call-9", &envelope).expect("frame");
        assert_eq!(frame["type"], "response.append");
        assert_eq!(frame["input"].as_array().map(Vec::len), Some(1));
        assert_eq!(frame["input"][0]["call_id"], "call-9");
    }

    #[test]
    fn error_code_serializes_snake_case() {
        let code = serde_json::to_string(&ErrorCode::DuplicateCallIdConflict).expect("json");
        assert_eq!(code, "\"duplicate_call_id_conflict\"");
        assert_eq!(ErrorCode::Timeout.as_str(), "timeout");
    }

    #[test]
    fn timed_out_status_serializes_as_timeout() {
        let status = serde_json::to_string(&Status::TimedOut).expect("json");
        assert_eq!(status, "\"timeout\"");
    }
}
