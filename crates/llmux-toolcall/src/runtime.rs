use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::store::RecordStore;
use crate::types::{
    CallRequest, CallResult, Definition, Envelope, EnvelopeMeta, ErrorCode, Event, EventType, Hook,
    NoopHook, Record, Status, ToolError,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateCompletedPolicy {
    /// Replay the cached envelope of the completed call (default).
    #[default]
    ReturnCached,
    /// Fail duplicates of completed calls with `duplicate_call_id_conflict`.
    Fail,
}

pub struct Runtime {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn RecordStore>,
    pub default_timeout: Duration,
    pub hook: Arc<dyn Hook>,
    pub duplicate_completed_policy: DuplicateCompletedPolicy,
}

impl Runtime {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            registry,
            store,
            default_timeout: DEFAULT_TIMEOUT,
            hook: Arc::new(NoopHook),
            duplicate_completed_policy: DuplicateCompletedPolicy::default(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hook = hook;
        self
    }

    /// Runs one tool call end to end: request validation, idempotency claim,
    /// argument validation, handler execution with timeout/cancel handling,
    /// and record completion.
    pub async fn execute(&self, mut req: CallRequest, cancel: CancellationToken) -> CallResult {
        let start = OffsetDateTime::now_utc();
        req.call_id = req.call_id.trim().to_string();
        req.tool_name = req.tool_name.trim().to_string();

        if let Some(invalid) = validate_call_request(&req) {
            let res = failure_result(&req, start, OffsetDateTime::now_utc(), Status::Failed, invalid.clone(), EnvelopeMeta::default());
            self.emit_finish(&req, &res, Some(invalid.code));
            return res;
        }

        let Some(def) = self.registry.get(&req.tool_name) else {
            let err = ToolError::new(
                ErrorCode::UnknownTool,
                format!("unknown tool {:?}", req.tool_name),
                false,
            );
            let meta = EnvelopeMeta {
                tool_name: req.tool_name.clone(),
                ..Default::default()
            };
            let res = failure_result(&req, start, OffsetDateTime::now_utc(), Status::Failed, err.clone(), meta);
            self.complete_store(&res.record);
            self.emit_finish(&req, &res, Some(err.code));
            return res;
        };

        let args_hash = hash_args(&req.raw_arguments);
        let seed = Record {
            call_id: req.call_id.clone(),
            tool_name: def.name.clone(),
            args_hash: args_hash.clone(),
            status: Status::Started,
            started_at: start,
            ended_at: None,
            error_code: None,
            envelope: Envelope::default(),
        };
        if let Some(dup) = self.handle_duplicate(&req, &seed) {
            return dup;
        }

        self.emit_lifecycle(EventType::Start, &def, &req, &args_hash, Status::Started, None);
        self.emit_lifecycle(EventType::ValidateStart, &def, &req, &args_hash, Status::Started, None);

        let validated = match validate_against_definition(&def, &req.raw_arguments) {
            Ok(obj) => obj,
            Err(err) => {
                let te = ToolError::new(ErrorCode::ValidationError, err.to_string(), false);
                let end = OffsetDateTime::now_utc();
                let meta = EnvelopeMeta {
                    tool_name: def.name.clone(),
                    tool_version: def.version.clone(),
                    args_hash: args_hash.clone(),
                    validation_failed: true,
                    ..Default::default()
                };
                let mut res = failure_result(&req, start, end, Status::Failed, te.clone(), meta);
                res.record.tool_name = def.name.clone();
                self.complete_store(&res.record);
                self.emit_lifecycle(EventType::ValidateDone, &def, &req, &args_hash, Status::Failed, Some(te.code));
                self.emit_finish(&req, &res, Some(te.code));
                return res;
            }
        };
        self.emit_lifecycle(EventType::ValidateDone, &def, &req, &args_hash, Status::Succeeded, None);

        let timeout = def.timeout.unwrap_or(self.default_timeout);
        self.emit_lifecycle(EventType::ExecuteStart, &def, &req, &args_hash, Status::Started, None);

        let exec = call_handler(&def, validated.clone(), timeout, &cancel).await;
        let end = OffsetDateTime::now_utc();
        match exec {
            Err(err) => {
                let (te, status, timed_out, canceled) = classify_handler_error(err);
                let meta = EnvelopeMeta {
                    tool_name: def.name.clone(),
                    tool_version: def.version.clone(),
                    call_id: req.call_id.clone(),
                    args_hash: args_hash.clone(),
                    latency_ms: latency_ms(start, end),
                    timed_out,
                    canceled,
                    ..Default::default()
                };
                let mut res = failure_result(&req, start, end, status, te.clone(), meta);
                res.record.tool_name = def.name.clone();
                res.validated = Some(validated);
                self.complete_store(&res.record);
                self.emit_lifecycle(EventType::ExecuteDone, &def, &req, &args_hash, status, Some(te.code));
                self.emit_finish(&req, &res, Some(te.code));
                res
            }
            Ok(data) => {
                let latency = latency_ms(start, end);
                let envelope = Envelope {
                    ok: true,
                    data,
                    error: None,
                    meta: EnvelopeMeta {
                        tool_name: def.name.clone(),
                        tool_version: def.version.clone(),
                        call_id: req.call_id.clone(),
                        args_hash: args_hash.clone(),
                        latency_ms: latency,
                        ..Default::default()
                    },
                };
                let record = Record {
                    call_id: req.call_id.clone(),
                    tool_name: def.name.clone(),
                    args_hash,
                    status: Status::Succeeded,
                    started_at: start,
                    ended_at: Some(end),
                    error_code: None,
                    envelope: envelope.clone(),
                };
                self.complete_store(&record);
                let args_hash = record.args_hash.clone();
                self.emit_lifecycle(EventType::ExecuteDone, &def, &req, &args_hash, Status::Succeeded, None);
                let res = CallResult {
                    envelope,
                    record,
                    duplicate: false,
                    validated: Some(validated),
                };
                self.emit_finish(&req, &res, None);
                res
            }
        }
    }

    fn handle_duplicate(&self, req: &CallRequest, seed: &Record) -> Option<CallResult> {
        let existing = self.store.begin(seed.clone())?;
        let end = OffsetDateTime::now_utc();

        if !existing.args_hash.is_empty()
            && !seed.args_hash.is_empty()
            && existing.args_hash != seed.args_hash
        {
            let te = ToolError::new(
                ErrorCode::DuplicateCallIdConflict,
                "same call_id received with different arguments",
                false,
            );
            let meta = EnvelopeMeta {
                tool_name: seed.tool_name.clone(),
                args_hash: seed.args_hash.clone(),
                duplicate: true,
                conflict: true,
                ..Default::default()
            };
            let mut res = failure_result(req, seed.started_at, end, Status::Duplicate, te.clone(), meta);
            res.record.tool_name = seed.tool_name.clone();
            res.duplicate = true;
            self.emit_duplicate(req, seed, Some(te.code), &te.message);
            return Some(res);
        }

        if existing.status != Status::Started {
            if self.duplicate_completed_policy == DuplicateCompletedPolicy::Fail {
                let te = ToolError::new(
                    ErrorCode::DuplicateCallIdConflict,
                    "duplicate completed tool call replay is disallowed",
                    false,
                );
                let meta = EnvelopeMeta {
                    tool_name: seed.tool_name.clone(),
                    args_hash: seed.args_hash.clone(),
                    duplicate: true,
                    conflict: true,
                    ..Default::default()
                };
                let mut res = failure_result(req, seed.started_at, end, Status::Duplicate, te.clone(), meta);
                res.record.tool_name = seed.tool_name.clone();
                res.duplicate = true;
                self.emit_duplicate(req, seed, Some(te.code), &te.message);
                return Some(res);
            }

            let mut envelope = existing.envelope.clone();
            envelope.meta.duplicate = true;
            envelope.meta.replay_cached = true;
            envelope.meta.call_id = req.call_id.clone();
            envelope.meta.args_hash = seed.args_hash.clone();
            if envelope.meta.tool_name.is_empty() {
                envelope.meta.tool_name = existing.tool_name.clone();
            }
            if envelope.meta.latency_ms == 0 {
                envelope.meta.latency_ms = latency_ms(seed.started_at, end);
            }
            let res = CallResult {
                envelope,
                record: existing,
                duplicate: true,
                validated: None,
            };
            self.emit_duplicate(req, seed, None, "");
            return Some(res);
        }

        let te = ToolError::new(
            ErrorCode::DuplicateInFlight,
            "duplicate tool call is already in progress",
            true,
        );
        let meta = EnvelopeMeta {
            tool_name: seed.tool_name.clone(),
            args_hash: seed.args_hash.clone(),
            duplicate: true,
            ..Default::default()
        };
        let mut res = failure_result(req, seed.started_at, end, Status::Duplicate, te.clone(), meta);
        res.record.tool_name = seed.tool_name.clone();
        res.duplicate = true;
        self.emit_duplicate(req, seed, Some(te.code), &te.message);
        Some(res)
    }

    fn complete_store(&self, record: &Record) {
        if !record.call_id.is_empty() {
            self.store.complete(record.clone());
        }
    }

    fn emit_lifecycle(
        &self,
        event_type: EventType,
        def: &Definition,
        req: &CallRequest,
        args_hash: &str,
        status: Status,
        error_code: Option<ErrorCode>,
    ) {
        let mut event = Event::new(event_type, &def.name, &req.call_id);
        event.tool_version = def.version.clone();
        event.args_hash = args_hash.to_string();
        event.status = Some(status);
        event.error_code = error_code;
        self.hook.on_tool_event(&event);
    }

    fn emit_finish(&self, req: &CallRequest, res: &CallResult, error_code: Option<ErrorCode>) {
        let mut event = Event::new(EventType::Finish, &res.record.tool_name, &req.call_id);
        event.args_hash = res.record.args_hash.clone();
        event.status = Some(res.record.status);
        event.error_code = error_code;
        event.latency_ms = res.envelope.meta.latency_ms;
        self.hook.on_tool_event(&event);
    }

    fn emit_duplicate(&self, req: &CallRequest, seed: &Record, error_code: Option<ErrorCode>, message: &str) {
        let mut event = Event::new(EventType::Duplicate, &seed.tool_name, &req.call_id);
        event.args_hash = seed.args_hash.clone();
        event.status = Some(Status::Duplicate);
        event.error_code = error_code;
        event.duplicate = true;
        event.message = message.to_string();
        self.hook.on_tool_event(&event);
    }
}

enum HandlerFailure {
    Tool(ToolError),
    TimedOut,
    Canceled,
    Panicked(String),
}

async fn call_handler(
    def: &Definition,
    args: Map<String, Value>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value, HandlerFailure> {
    let handler = Arc::clone(&def.handler);
    // Panics in handlers are contained by the spawned task and surfaced as a
    // join error instead of unwinding through the runtime.
    let mut join = tokio::spawn(async move { handler.call(args).await });

    tokio::select! {
        joined = &mut join => match joined {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(HandlerFailure::Tool(err)),
            Err(join_err) if join_err.is_panic() => {
                Err(HandlerFailure::Panicked(format!("{join_err}")))
            }
            Err(_) => Err(HandlerFailure::Canceled),
        },
        _ = tokio::time::sleep(timeout) => {
            join.abort();
            Err(HandlerFailure::TimedOut)
        }
        _ = cancel.cancelled() => {
            join.abort();
            Err(HandlerFailure::Canceled)
        }
    }
}

fn classify_handler_error(err: HandlerFailure) -> (ToolError, Status, bool, bool) {
    match err {
        HandlerFailure::TimedOut => (
            ToolError::new(ErrorCode::Timeout, "tool execution timed out", true),
            Status::TimedOut,
            true,
            false,
        ),
        HandlerFailure::Canceled => (
            ToolError::new(ErrorCode::Canceled, "tool execution canceled", true),
            Status::Canceled,
            false,
            true,
        ),
        HandlerFailure::Panicked(message) => (
            ToolError::new(ErrorCode::Panic, format!("tool handler panic: {message}"), false),
            Status::Failed,
            false,
            false,
        ),
        HandlerFailure::Tool(te) => (te, Status::Failed, false, false),
    }
}

fn validate_call_request(req: &CallRequest) -> Option<ToolError> {
    if req.call_id.is_empty() {
        return Some(ToolError::new(ErrorCode::InvalidRequest, "call_id is required", false));
    }
    if req.tool_name.is_empty() {
        return Some(ToolError::new(ErrorCode::InvalidRequest, "tool_name is required", false));
    }
    None
}

fn validate_against_definition(
    def: &Definition,
    raw_args: &str,
) -> Result<Map<String, Value>, crate::schema::ValidationError> {
    match &def.input_schema {
        Some(schema) => schema.validate_raw(raw_args),
        None => crate::schema::parse_args_object(raw_args),
    }
}

fn failure_result(
    req: &CallRequest,
    start: OffsetDateTime,
    end: OffsetDateTime,
    status: Status,
    err: ToolError,
    mut meta: EnvelopeMeta,
) -> CallResult {
    if meta.call_id.is_empty() {
        meta.call_id = req.call_id.clone();
    }
    if meta.tool_name.is_empty() {
        meta.tool_name = req.tool_name.clone();
    }
    if meta.args_hash.is_empty() {
        meta.args_hash = hash_args(&req.raw_arguments);
    }
    if meta.latency_ms == 0 {
        meta.latency_ms = latency_ms(start, end);
    }
    let envelope = Envelope {
        ok: false,
        data: Value::Null,
        error: Some(err.clone()),
        meta,
    };
    let record = Record {
        call_id: req.call_id.clone(),
        tool_name: req.tool_name.clone(),
        args_hash: hash_args(&req.raw_arguments),
        status,
        started_at: start,
        ended_at: Some(end),
        error_code: Some(err.code),
        envelope: envelope.clone(),
    };
    CallResult {
        envelope,
        record,
        duplicate: false,
        validated: None,
    }
}

fn latency_ms(start: OffsetDateTime, end: OffsetDateTime) -> i64 {
    ((end - start).whole_milliseconds()).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn hash_args(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}
