//! Core abstractions for llmux.
//!
//! This crate intentionally does **not** depend on any concrete HTTP client
//! or server framework. Executors implement [`ProviderExecutor`] and perform
//! their own I/O in a higher layer; this crate owns the credential model and
//! manager, the executor contract, the translator abstraction, and usage
//! reporting.

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod format;
pub mod headers;
pub mod manager;
pub mod registry;
pub mod store;
pub mod translator;
pub mod usage;

pub use auth::{Auth, AuthState, websocket_incremental_enabled};
pub use dispatch::{Dispatcher, ModelRouter};
pub use error::{ErrorKind, ExecutorError, ExecutorResult};
pub use executor::{
    Options, PreparedHttpRequest, PreparedHttpResponse, ProviderExecutor, Request, Response,
    StreamChunk, StreamResult,
};
pub use format::Format;
pub use headers::{Headers, header_get, header_remove, header_set};
pub use manager::{CredentialManager, SelectError, SelectionMode};
pub use registry::ExecutorRegistry;
pub use store::{AuthStore, MemoryAuthStore};
pub use translator::{PassthroughTranslator, TranslateState, Translator};
pub use usage::{MemoryUsageSink, TracingUsageSink, UsageDetail, UsageRecord, UsageReporter, UsageSink};
