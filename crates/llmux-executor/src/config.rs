use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use llmux_core::Format;

use crate::providers::codex::prompt_cache::SharedCacheStore;

pub const DEFAULT_PROMPT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PROMPT_CACHE_KEY_PREFIX: &str = "llmux:codex:prompt-cache:";
pub const DEFAULT_PROMPT_CACHE_TIMEOUT: Duration = Duration::from_millis(500);

/// Server-side payload override applied after translation.
///
/// `models` entries are exact names or `prefix*` globs; an empty list matches
/// every model. `set` writes dotted paths, `delete` removes them.
#[derive(Debug, Clone, Default)]
pub struct PayloadRule {
    pub models: Vec<String>,
    pub format: Option<Format>,
    pub set: Vec<(String, Value)>,
    pub delete: Vec<String>,
}

impl PayloadRule {
    pub fn matches(&self, model: &str, format: Format) -> bool {
        if let Some(rule_format) = self.format
            && rule_format != format
        {
            return false;
        }
        if self.models.is_empty() {
            return true;
        }
        self.models.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                model.starts_with(prefix)
            } else {
                pattern == model
            }
        })
    }
}

/// Codex prompt-cache coordination settings.
#[derive(Clone, Default)]
pub struct PromptCacheConfig {
    /// Default TTL when the request does not carry a retention hint.
    pub ttl: Option<Duration>,
    pub key_prefix: Option<String>,
    pub timeout: Option<Duration>,
    /// Optional distributed backend; the local map is used when absent or
    /// failing.
    pub store: Option<Arc<dyn SharedCacheStore>>,
}

impl PromptCacheConfig {
    pub fn effective_key_prefix(&self) -> &str {
        self.key_prefix
            .as_deref()
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or(DEFAULT_PROMPT_CACHE_KEY_PREFIX)
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_PROMPT_CACHE_TIMEOUT)
    }
}

impl std::fmt::Debug for PromptCacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptCacheConfig")
            .field("ttl", &self.ttl)
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("distributed", &self.store.is_some())
            .finish()
    }
}

/// Runtime configuration shared by all executors. Immutable for the lifetime
/// of an executor instance.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Global outbound proxy; a credential-level proxy wins over this.
    pub proxy_url: Option<String>,
    pub payload_rules: Vec<PayloadRule>,
    pub prompt_cache: PromptCacheConfig,
    /// Extra 429 fallback models per Gemini CLI base model.
    pub gemini_cli_fallbacks: std::collections::HashMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rule_matching_honors_globs_and_format() {
        let rule = PayloadRule {
            models: vec!["gpt-5*".to_string(), "o3".to_string()],
            format: Some(Format::Codex),
            set: vec![("store".to_string(), json!(false))],
            delete: vec![],
        };
        assert!(rule.matches("gpt-5-codex", Format::Codex));
        assert!(rule.matches("o3", Format::Codex));
        assert!(!rule.matches("o3", Format::OpenAI));
        assert!(!rule.matches("gpt-4.1", Format::Codex));
    }

    #[test]
    fn empty_model_list_matches_all() {
        let rule = PayloadRule::default();
        assert!(rule.matches("anything", Format::OpenAI));
    }
}
