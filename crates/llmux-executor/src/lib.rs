//! Provider executors for llmux.
//!
//! `BaseExecutor` carries the shared translate → transform → HTTP →
//! translate-back pipeline; each provider contributes a [`base::ProviderConfig`]
//! describing its endpoint, credential extraction, headers, body transforms
//! and usage parsing. Codex additionally ships a WebSocket transport with
//! persistent execution sessions and a prompt-cache coordination layer.

pub mod base;
pub mod client;
pub mod config;
pub mod duration;
pub mod json;
pub mod overrides;
pub mod providers;
pub mod record;
pub mod scan;
pub mod thinking;
pub mod usage_parse;

pub use base::{BaseExecutor, ProviderConfig, ensure_header};
pub use config::{Config, PayloadRule, PromptCacheConfig};
pub use providers::codex::prompt_cache::SharedCacheStore;
pub use providers::standard_registry;
