//! Tool-call runtime for llmux.
//!
//! Providers that surface function calling hand completed calls to this
//! runtime, which validates arguments against a registered schema, enforces
//! idempotency by `call_id`, runs the handler under a timeout, and packages
//! the outcome into a normalized envelope suitable for serialization into an
//! upstream `function_call_output` item.

pub mod registry;
pub mod runtime;
pub mod schema;
pub mod stats;
pub mod store;
pub mod types;

pub use registry::Registry;
pub use runtime::{DuplicateCompletedPolicy, Runtime};
pub use schema::{FieldSchema, FieldType, ObjectSchema, ValidationError, ValidationIssue, parse_args_object};
pub use stats::{StatsHook, StatsSnapshot};
pub use store::{MemoryStore, RecordStore};
pub use types::{
    CallRequest, CallResult, Definition, Envelope, EnvelopeMeta, ErrorCode, Event, EventType, Hook,
    HookChain, NoopHook, Record, Status, ToolError, ToolHandler, build_function_call_output_item,
    build_response_append_with_function_call_output, compose_hooks,
};
