use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Lifecycle state of a credential. A credential is in exactly one state at
/// any moment; `Cooling` credentials are excluded from selection until the
/// deadline in [`Auth::cooldown_until`] passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Active,
    Cooling,
    Expired,
    Invalid,
}

impl AuthState {
    pub fn is_active(&self) -> bool {
        matches!(self, AuthState::Active)
    }
}

/// A provider credential.
///
/// `attributes` holds flat string settings (`api_key`, `base_url`,
/// per-provider flags); `metadata` holds tagged values written by login and
/// refresh flows (`access_token`, `refresh_token`, `expiry`, `account_id`,
/// `project_id`, `cookie`, `device_id`, `service_account`). `runtime` is a
/// provider-scoped opaque object (e.g. a shared token source) that is never
/// serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "default_state")]
    pub state: AuthState,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cooldown_until: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub excluded_models: Vec<String>,
    /// Consecutive quota failures, drives the exponential cooldown base.
    #[serde(default)]
    pub quota_failures: u32,
    #[serde(skip)]
    pub runtime: Option<Arc<dyn Any + Send + Sync>>,
}

fn default_state() -> AuthState {
    AuthState::Active
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("cooldown_until", &self.cooldown_until)
            .finish_non_exhaustive()
    }
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            label: String::new(),
            attributes: HashMap::new(),
            metadata: Map::new(),
            state: AuthState::Active,
            cooldown_until: None,
            last_used_at: None,
            proxy_url: None,
            excluded_models: Vec::new(),
            quota_failures: 0,
            runtime: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Account identity used for audit records: type plus a display value.
    pub fn account_info(&self) -> (&'static str, String) {
        if let Some(email) = self.metadata_str("email") {
            return ("email", email.to_string());
        }
        if self.attribute("api_key").is_some() {
            return ("api_key", self.label.clone());
        }
        ("unknown", self.label.clone())
    }

    pub fn excludes_model(&self, model: &str) -> bool {
        self.excluded_models
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(model))
    }
}

/// Reads the WebSocket incremental-transport opt-in from a credential.
///
/// Attributes win over metadata; an unparseable attribute value falls
/// through to metadata. Accepted truthy values are `true`/`1` (any case,
/// surrounding whitespace ignored) and boolean `true`; everything else is
/// false.
pub fn websocket_incremental_enabled(auth: &Auth) -> bool {
    if let Some(raw) = auth.attributes.get("websockets")
        && let Some(parsed) = parse_lenient_bool_str(raw)
    {
        return parsed;
    }
    match auth.metadata.get("websockets") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(raw)) => parse_lenient_bool_str(raw).unwrap_or(false),
        _ => false,
    }
}

fn parse_lenient_bool_str(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth() -> Auth {
        Auth::new("auth-1", "codex")
    }

    #[test]
    fn attribute_trims_and_filters_empty() {
        let mut a = auth();
        a.attributes.insert("api_key".to_string(), "  sk-x  ".to_string());
        a.attributes.insert("base_url".to_string(), "   ".to_string());
        assert_eq!(a.attribute("api_key"), Some("sk-x"));
        assert_eq!(a.attribute("base_url"), None);
    }

    #[test]
    fn websockets_attribute_accepts_lenient_bools() {
        for (raw, want) in [("true", true), ("1", true), (" TRUE ", true), ("false", false), ("0", false), ("FALSE", false), ("nope", false)] {
            let mut a = auth();
            a.attributes.insert("websockets".to_string(), raw.to_string());
            assert_eq!(websocket_incremental_enabled(&a), want, "value {raw:?}");
        }
    }

    #[test]
    fn websockets_metadata_bool_and_string() {
        let mut a = auth();
        a.metadata.insert("websockets".to_string(), json!(true));
        assert!(websocket_incremental_enabled(&a));

        a.metadata.insert("websockets".to_string(), json!(" true "));
        assert!(websocket_incremental_enabled(&a));

        a.metadata.insert("websockets".to_string(), json!(1));
        assert!(!websocket_incremental_enabled(&a));
    }

    #[test]
    fn websockets_attributes_take_precedence_unless_invalid() {
        let mut a = auth();
        a.attributes.insert("websockets".to_string(), "false".to_string());
        a.metadata.insert("websockets".to_string(), json!(true));
        assert!(!websocket_incremental_enabled(&a));

        a.attributes.insert("websockets".to_string(), "invalid".to_string());
        assert!(websocket_incremental_enabled(&a));
    }

    #[test]
    fn excludes_model_is_case_insensitive() {
        let mut a = auth();
        a.excluded_models.push("gpt-5".to_string());
        assert!(a.excludes_model("GPT-5"));
        assert!(!a.excludes_model("gpt-4.1"));
    }
}
