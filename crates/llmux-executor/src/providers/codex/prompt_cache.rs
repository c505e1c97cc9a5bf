//! Codex prompt-cache coordination.
//!
//! Resolves a stable `prompt_cache_key` per (model, user) so sequential
//! requests land on the same upstream cache shard. Keys map to UUIDs in a
//! process-wide map with TTL; when a distributed backend is configured the
//! UUID is agreed on through `set-if-absent` and the backend is the
//! authority. Backend failures warn once per (operation, error) and fall
//! back to the local map.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;

use llmux_core::{Format, Headers, header_set};

use crate::config::{Config, DEFAULT_PROMPT_CACHE_TTL};
use crate::duration::parse_duration;
use crate::json::{get_trimmed_str, parse, set_path};

const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Optional distributed key/value backend with set-if-absent semantics.
#[async_trait]
pub trait SharedCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, String>;
    /// Returns true when the value was stored, false on contention.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, String>;
    async fn del(&self, key: &str) -> Result<(), String>;
}

struct LocalEntry {
    id: String,
    expires_at: OffsetDateTime,
}

static LOCAL_CACHE: Mutex<Option<HashMap<String, LocalEntry>>> = Mutex::new(None);
static WARNED: Mutex<Option<HashSet<String>>> = Mutex::new(None);

/// Applies prompt-cache resolution to a translated Codex body.
///
/// Returns the (possibly updated) body, the cache id, and the headers to add
/// (`Conversation_id` / `Session_id`, both set to the cache id). With
/// `skip_if_body_empty`, an empty body bypasses cache logic entirely (the
/// WebSocket preflight path).
pub async fn apply_codex_prompt_cache(
    cfg: &Config,
    from: Format,
    request_payload: &[u8],
    model: &str,
    body: Bytes,
    skip_if_body_empty: bool,
) -> (Bytes, String, Headers) {
    let headers = Headers::new();
    if skip_if_body_empty && body.is_empty() {
        return (body, String::new(), headers);
    }

    let cache_id = resolve_cache_id(cfg, from, request_payload, model).await;
    let Some(cache_id) = cache_id else {
        return (body, String::new(), headers);
    };

    let body = match parse(&body) {
        Some(mut value) => {
            set_path(&mut value, "prompt_cache_key", Value::String(cache_id.clone()));
            serde_json::to_vec(&value).map(Bytes::from).unwrap_or(body)
        }
        None => body,
    };

    let mut headers = Headers::new();
    header_set(&mut headers, "Conversation_id", &cache_id);
    header_set(&mut headers, "Session_id", &cache_id);
    (body, cache_id, headers)
}

async fn resolve_cache_id(
    cfg: &Config,
    from: Format,
    request_payload: &[u8],
    model: &str,
) -> Option<String> {
    let payload = parse(request_payload).unwrap_or(Value::Null);

    // An explicit key always wins, even when retention says off.
    if let Some(explicit) = explicit_prompt_cache_key(&payload) {
        return Some(explicit);
    }
    if retention_disabled(&payload) {
        return None;
    }

    if from == Format::Claude {
        let user_id = get_trimmed_str(&payload, "metadata.user_id")?;
        let ttl = effective_ttl(cfg, &payload);
        return get_or_create_cache_id(cfg, model, user_id, ttl).await;
    }

    // Other sources need an explicit, truthy retention hint before a cache
    // key is derived on their behalf.
    if !retention_requested(&payload) {
        return None;
    }
    let user_id = prompt_cache_user_id(&payload)?;
    let ttl = effective_ttl(cfg, &payload);
    get_or_create_cache_id(cfg, model, user_id, ttl).await
}

fn explicit_prompt_cache_key(payload: &Value) -> Option<String> {
    get_trimmed_str(payload, "prompt_cache_key")
        .or_else(|| get_trimmed_str(payload, "metadata.prompt_cache_key"))
        .map(str::to_string)
}

fn prompt_cache_user_id(payload: &Value) -> Option<&str> {
    get_trimmed_str(payload, "metadata.user_id")
        .or_else(|| get_trimmed_str(payload, "user"))
        .or_else(|| get_trimmed_str(payload, "safety_identifier"))
        .or_else(|| get_trimmed_str(payload, "metadata.safety_identifier"))
}

pub(crate) fn retention_disabled(payload: &Value) -> bool {
    let Some(retention) = payload.get("prompt_cache_retention") else {
        return false;
    };
    match retention {
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value <= 0.0),
        Value::String(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "off" | "none" | "false" | "disabled" | "disable" | "no"
        ),
        _ => false,
    }
}

fn retention_requested(payload: &Value) -> bool {
    payload.get("prompt_cache_retention").is_some() && !retention_disabled(payload)
}

/// TTL from an explicit retention hint: seconds for numbers, parsed duration
/// for strings, the default otherwise.
fn retention_ttl(payload: &Value) -> Duration {
    let Some(retention) = payload.get("prompt_cache_retention") else {
        return DEFAULT_PROMPT_CACHE_TTL;
    };
    match retention {
        Value::Number(number) => match number.as_i64() {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_PROMPT_CACHE_TTL,
        },
        Value::String(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return DEFAULT_PROMPT_CACHE_TTL;
            }
            parse_duration(raw).unwrap_or(DEFAULT_PROMPT_CACHE_TTL)
        }
        _ => DEFAULT_PROMPT_CACHE_TTL,
    }
}

/// Resolution priority: explicit retention → configured default → global
/// default. Clamped to (0, 7d]; sub-minute values survive.
pub(crate) fn effective_ttl(cfg: &Config, payload: &Value) -> Duration {
    if payload.get("prompt_cache_retention").is_some() {
        if retention_disabled(payload) {
            return Duration::ZERO;
        }
        return clamp_ttl(retention_ttl(payload));
    }
    if let Some(configured) = cfg.prompt_cache.ttl
        && !configured.is_zero()
    {
        return clamp_ttl(configured);
    }
    clamp_ttl(DEFAULT_PROMPT_CACHE_TTL)
}

fn clamp_ttl(ttl: Duration) -> Duration {
    if ttl.is_zero() {
        return DEFAULT_PROMPT_CACHE_TTL;
    }
    ttl.min(MAX_TTL)
}

async fn get_or_create_cache_id(
    cfg: &Config,
    model: &str,
    user_id: &str,
    ttl: Duration,
) -> Option<String> {
    let model = model.trim();
    let user_id = user_id.trim();
    if model.is_empty() || user_id.is_empty() {
        return None;
    }
    let key = format!("{model}-{user_id}");

    if let Some(distributed) = distributed_cache_id(cfg, &key, ttl).await {
        return Some(distributed);
    }

    let now = OffsetDateTime::now_utc();
    let mut guard = LOCAL_CACHE.lock().expect("prompt cache lock");
    let cache = guard.get_or_insert_with(HashMap::new);
    if let Some(entry) = cache.get(&key)
        && entry.expires_at > now
    {
        return Some(entry.id.clone());
    }
    let id = uuid::Uuid::new_v4().to_string();
    cache.insert(
        key,
        LocalEntry {
            id: id.clone(),
            expires_at: now + clamp_ttl(ttl),
        },
    );
    Some(id)
}

/// Distributed agreement on the cache id. Blank stored values are treated as
/// corrupt and repaired via delete-and-retry, at most once.
async fn distributed_cache_id(cfg: &Config, key: &str, ttl: Duration) -> Option<String> {
    let store = cfg.prompt_cache.store.as_ref()?;
    let full_key = format!("{}{key}", cfg.prompt_cache.effective_key_prefix());
    let timeout = cfg.prompt_cache.effective_timeout();
    let ttl = clamp_ttl(ttl);

    for attempt in 0..2 {
        let existing = match with_timeout(timeout, store.get(&full_key)).await {
            Ok(existing) => existing,
            Err(err) => {
                warn_once("get", &err);
                return None;
            }
        };
        match existing {
            Some(value) if !value.trim().is_empty() => return Some(value.trim().to_string()),
            Some(_) => {
                // Corrupt blank value; repair once then fall through to set.
                if attempt == 0 {
                    if let Err(err) = with_timeout(timeout, store.del(&full_key)).await {
                        warn_once("del", &err);
                        return None;
                    }
                    continue;
                }
                return None;
            }
            None => {}
        }

        let candidate = uuid::Uuid::new_v4().to_string();
        match with_timeout(timeout, store.set_if_absent(&full_key, &candidate, ttl)).await {
            Ok(true) => return Some(candidate),
            Ok(false) => {
                // Lost the race; adopt the winner.
                match with_timeout(timeout, store.get(&full_key)).await {
                    Ok(Some(winner)) if !winner.trim().is_empty() => {
                        return Some(winner.trim().to_string());
                    }
                    Ok(_) => return None,
                    Err(err) => {
                        warn_once("get_after_set", &err);
                        return None;
                    }
                }
            }
            Err(err) => {
                warn_once("set_if_absent", &err);
                return None;
            }
        }
    }
    None
}

async fn with_timeout<T>(
    timeout: Duration,
    future: impl std::future::Future<Output = Result<T, String>>,
) -> Result<T, String> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err("timeout".to_string()),
    }
}

fn warn_once(operation: &str, error: &str) {
    let key = format!("{operation}:{error}");
    let mut guard = WARNED.lock().expect("prompt cache warn lock");
    let warned = guard.get_or_insert_with(HashSet::new);
    if warned.insert(key) {
        tracing::warn!(operation, error, "prompt cache backend unavailable, falling back to local");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_core::header_get;
    use serde_json::json;
    use std::sync::Arc;

    fn cfg() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn claude_source_derives_stable_id_per_model_user() {
        let payload = br#"{"metadata":{"user_id":"user-123"}}"#;
        let body = Bytes::from_static(br#"{"input":[]}"#);

        let (body1, id1, headers) = apply_codex_prompt_cache(
            &cfg(),
            Format::Claude,
            payload,
            "gpt-5",
            body.clone(),
            false,
        )
        .await;
        assert!(!id1.is_empty());
        assert_eq!(header_get(&headers, "Conversation_id"), Some(id1.as_str()));
        assert_eq!(header_get(&headers, "Session_id"), Some(id1.as_str()));
        let parsed: Value = serde_json::from_slice(&body1).expect("body json");
        assert_eq!(parsed["prompt_cache_key"], json!(id1));

        let (_, id2, _) = apply_codex_prompt_cache(
            &cfg(),
            Format::Claude,
            payload,
            "gpt-5",
            body.clone(),
            false,
        )
        .await;
        assert_eq!(id1, id2);

        let (_, id3, _) =
            apply_codex_prompt_cache(&cfg(), Format::Claude, payload, "gpt-4.1", body, false).await;
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn explicit_key_wins_even_with_retention_off() {
        let payload = br#"{"prompt_cache_key":"pinned","prompt_cache_retention":"off"}"#;
        let (_, id, headers) = apply_codex_prompt_cache(
            &cfg(),
            Format::OpenAI,
            payload,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        assert_eq!(id, "pinned");
        assert_eq!(header_get(&headers, "Session_id"), Some("pinned"));
    }

    #[tokio::test]
    async fn retention_off_suppresses_derivation() {
        let payload = br#"{"prompt_cache_retention":"off","metadata":{"user_id":"u"}}"#;
        let (_, id, headers) = apply_codex_prompt_cache(
            &cfg(),
            Format::Claude,
            payload,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        assert!(id.is_empty());
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn non_claude_sources_need_truthy_retention() {
        let no_hint = br#"{"user":"u-1"}"#;
        let (_, id, _) = apply_codex_prompt_cache(
            &cfg(),
            Format::OpenAI,
            no_hint,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        assert!(id.is_empty());

        let hinted = br#"{"user":"u-1","prompt_cache_retention":true}"#;
        let (_, id, _) = apply_codex_prompt_cache(
            &cfg(),
            Format::OpenAI,
            hinted,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn skip_if_body_empty_bypasses_cache() {
        let payload = br#"{"metadata":{"user_id":"u"}}"#;
        let (body, id, headers) =
            apply_codex_prompt_cache(&cfg(), Format::Claude, payload, "gpt-5", Bytes::new(), true)
                .await;
        assert!(body.is_empty());
        assert!(id.is_empty());
        assert!(headers.is_empty());
    }

    #[test]
    fn numeric_retention_is_exact_seconds() {
        let payload = json!({"prompt_cache_retention": 5});
        assert_eq!(effective_ttl(&cfg(), &payload), Duration::from_secs(5));
    }

    #[test]
    fn retention_values_parse_and_clamp() {
        assert_eq!(
            effective_ttl(&cfg(), &json!({"prompt_cache_retention": "90s"})),
            Duration::from_secs(90)
        );
        assert_eq!(
            effective_ttl(&cfg(), &json!({"prompt_cache_retention": "30d"})),
            DEFAULT_PROMPT_CACHE_TTL,
        );
        // Above the 7 day cap.
        assert_eq!(
            effective_ttl(&cfg(), &json!({"prompt_cache_retention": "200h"})),
            MAX_TTL
        );
        assert_eq!(
            effective_ttl(&cfg(), &json!({"prompt_cache_retention": "off"})),
            Duration::ZERO
        );
        assert_eq!(effective_ttl(&cfg(), &json!({})), DEFAULT_PROMPT_CACHE_TTL);
    }

    #[test]
    fn disabled_values_cover_the_lenient_set() {
        for raw in ["0", "off", "none", "false", "disabled", "disable", "no", " OFF "] {
            assert!(
                retention_disabled(&json!({"prompt_cache_retention": raw})),
                "{raw:?} should disable"
            );
        }
        for raw in ["", "default", "auto", "1h"] {
            assert!(
                !retention_disabled(&json!({"prompt_cache_retention": raw})),
                "{raw:?} should not disable"
            );
        }
        assert!(retention_disabled(&json!({"prompt_cache_retention": false})));
        assert!(retention_disabled(&json!({"prompt_cache_retention": 0})));
        assert!(!retention_disabled(&json!({"prompt_cache_retention": true})));
        assert!(!retention_disabled(&json!({"prompt_cache_retention": 30})));
    }

    #[derive(Default)]
    struct FakeStore {
        values: Mutex<HashMap<String, String>>,
        gets: Mutex<i32>,
    }

    #[async_trait]
    impl SharedCacheStore for FakeStore {
        async fn get(&self, key: &str) -> Result<Option<String>, String> {
            *self.gets.lock().expect("lock") += 1;
            Ok(self.values.lock().expect("lock").get(key).cloned())
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            _ttl: Duration,
        ) -> Result<bool, String> {
            let mut values = self.values.lock().expect("lock");
            if values.contains_key(key) {
                return Ok(false);
            }
            values.insert(key.to_string(), value.to_string());
            Ok(true)
        }

        async fn del(&self, key: &str) -> Result<(), String> {
            self.values.lock().expect("lock").remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn distributed_store_is_authoritative() {
        let store = Arc::new(FakeStore::default());
        let mut cfg = Config::default();
        cfg.prompt_cache.store = Some(store.clone());

        let payload = br#"{"metadata":{"user_id":"user-d"}}"#;
        let (_, id1, _) = apply_codex_prompt_cache(
            &cfg,
            Format::Claude,
            payload,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        let (_, id2, _) = apply_codex_prompt_cache(
            &cfg,
            Format::Claude,
            payload,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        assert_eq!(id1, id2);
        assert!(!id1.is_empty());
        let stored = store.values.lock().expect("lock");
        assert_eq!(stored.len(), 1);
        assert!(stored.keys().next().expect("key").ends_with("gpt-5-user-d"));
    }

    #[tokio::test]
    async fn blank_distributed_value_is_repaired_once() {
        let store = Arc::new(FakeStore::default());
        let full_key = format!(
            "{}gpt-5-user-b",
            crate::config::DEFAULT_PROMPT_CACHE_KEY_PREFIX
        );
        store
            .values
            .lock()
            .expect("lock")
            .insert(full_key.clone(), "   ".to_string());

        let mut cfg = Config::default();
        cfg.prompt_cache.store = Some(store.clone());
        let payload = br#"{"metadata":{"user_id":"user-b"}}"#;
        let (_, id, _) = apply_codex_prompt_cache(
            &cfg,
            Format::Claude,
            payload,
            "gpt-5",
            Bytes::from_static(b"{}"),
            false,
        )
        .await;
        assert!(!id.is_empty());
        let stored = store.values.lock().expect("lock");
        assert_eq!(stored.get(&full_key), Some(&id));
    }
}
