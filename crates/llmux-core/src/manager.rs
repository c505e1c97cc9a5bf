use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;

use crate::auth::{Auth, AuthState};
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::ProviderExecutor;
use crate::store::AuthStore;

const QUOTA_BACKOFF_BASE: Duration = Duration::from_secs(30);
const QUOTA_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Round-robin across healthy credentials, least-recently-used first.
    #[default]
    RoundRobin,
    /// Pin the first healthy credential until it fails.
    FillFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no credentials available for provider {0:?}")]
    NoCredentialsAvailable(String),
}

#[derive(Default)]
struct ManagerState {
    auths: HashMap<String, Auth>,
    by_provider: HashMap<String, Vec<String>>,
    rotation: HashMap<String, usize>,
}

/// Owns the credential set: registration, per-request selection, refresh
/// single-flight and quota cooldowns. All mutation happens under the manager
/// lock and is persisted through the store.
pub struct CredentialManager {
    state: Mutex<ManagerState>,
    refresh_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store: Arc<dyn AuthStore>,
    mode: SelectionMode,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            refresh_guards: Mutex::new(HashMap::new()),
            store,
            mode: SelectionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: SelectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub async fn register(&self, auth: Auth) -> ExecutorResult<()> {
        if auth.id.is_empty() {
            return Err(ExecutorError::invalid_request("auth id is required"));
        }
        self.store.put(auth.clone()).await?;
        let mut state = self.state.lock().expect("credential manager lock");
        let ids = state.by_provider.entry(auth.provider.clone()).or_default();
        if !ids.contains(&auth.id) {
            ids.push(auth.id.clone());
        }
        state.auths.insert(auth.id.clone(), auth);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> ExecutorResult<()> {
        self.store.delete(id).await?;
        let mut state = self.state.lock().expect("credential manager lock");
        if let Some(auth) = state.auths.remove(id)
            && let Some(ids) = state.by_provider.get_mut(&auth.provider)
        {
            ids.retain(|candidate| candidate != id);
        }
        self.refresh_guards
            .lock()
            .expect("refresh guard lock")
            .remove(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Auth> {
        self.state
            .lock()
            .expect("credential manager lock")
            .auths
            .get(id)
            .cloned()
    }

    /// Selects a credential for `(provider, model)`. Never blocks on I/O.
    ///
    /// Cooling credentials whose deadline has elapsed are returned to
    /// `Active` before ranking. Ranking excludes cooling/expired/invalid
    /// credentials and credentials excluding the model, then rotates
    /// round-robin starting after the last pick (or pins the first healthy
    /// candidate in fill-first mode).
    pub fn select(&self, provider: &str, model: &str) -> Result<Auth, SelectError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().expect("credential manager lock");

        let ids = state
            .by_provider
            .get(provider)
            .cloned()
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(SelectError::NoCredentialsAvailable(provider.to_string()));
        }

        for id in &ids {
            if let Some(auth) = state.auths.get_mut(id)
                && auth.state == AuthState::Cooling
                && auth.cooldown_until.is_none_or(|until| now >= until)
            {
                auth.state = AuthState::Active;
                auth.cooldown_until = None;
            }
        }

        let healthy: Vec<String> = ids
            .iter()
            .filter(|id| {
                state
                    .auths
                    .get(*id)
                    .map(|auth| auth.state.is_active() && !auth.excludes_model(model))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if healthy.is_empty() {
            return Err(SelectError::NoCredentialsAvailable(provider.to_string()));
        }

        let chosen = match self.mode {
            SelectionMode::FillFirst => healthy[0].clone(),
            SelectionMode::RoundRobin => {
                let cursor = state.rotation.entry(provider.to_string()).or_insert(0);
                let index = *cursor % healthy.len();
                *cursor = (index + 1) % healthy.len();
                healthy[index].clone()
            }
        };

        let auth = state
            .auths
            .get_mut(&chosen)
            .expect("selected credential present");
        auth.last_used_at = Some(now);
        Ok(auth.clone())
    }

    /// Refreshes a credential through its executor. Safe to call
    /// concurrently: a per-credential guard collapses simultaneous refreshes
    /// into one upstream exchange; late arrivals observe the refreshed
    /// credential and return it.
    pub async fn refresh(
        &self,
        executor: &dyn ProviderExecutor,
        id: &str,
    ) -> ExecutorResult<Auth> {
        let guard = {
            let mut guards = self.refresh_guards.lock().expect("refresh guard lock");
            Arc::clone(
                guards
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _held = guard.lock().await;

        let current = self
            .get(id)
            .ok_or_else(|| ExecutorError::invalid_request(format!("unknown credential {id:?}")))?;
        // A refresh that completed while we waited on the guard already
        // reset the state; don't issue a second upstream exchange.
        if current.state == AuthState::Active && current.quota_failures == 0 {
            if let Some(last) = current.metadata.get("last_refresh").and_then(|v| v.as_str())
                && let Ok(at) = OffsetDateTime::parse(last, &time::format_description::well_known::Rfc3339)
                && OffsetDateTime::now_utc() - at < Duration::from_secs(5)
            {
                return Ok(current);
            }
        }

        match executor.refresh(&current).await {
            Ok(mut refreshed) => {
                refreshed.state = AuthState::Active;
                refreshed.quota_failures = 0;
                refreshed.cooldown_until = None;
                refreshed.metadata.insert(
                    "last_refresh".to_string(),
                    serde_json::Value::String(
                        OffsetDateTime::now_utc()
                            .format(&time::format_description::well_known::Rfc3339)
                            .unwrap_or_default(),
                    ),
                );
                self.store.put(refreshed.clone()).await?;
                let mut state = self.state.lock().expect("credential manager lock");
                state.auths.insert(refreshed.id.clone(), refreshed.clone());
                Ok(refreshed)
            }
            Err(err) => {
                // Definitive grant failures invalidate the credential; all
                // other refresh errors leave state untouched.
                if is_definitive_auth_failure(&err) {
                    self.mark_state(id, AuthState::Invalid);
                    if let Some(auth) = self.get(id) {
                        let _ = self.store.put(auth).await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Applies the outcome of one upstream call to the credential.
    pub async fn on_result(&self, id: &str, error: Option<&ExecutorError>) {
        let updated = {
            let mut state = self.state.lock().expect("credential manager lock");
            let Some(auth) = state.auths.get_mut(id) else {
                return;
            };
            match error {
                None => {
                    auth.quota_failures = 0;
                    if auth.state == AuthState::Cooling {
                        auth.state = AuthState::Active;
                        auth.cooldown_until = None;
                    }
                }
                Some(err) if err.is_unauthorized() => {
                    auth.state = AuthState::Expired;
                }
                Some(err) if err.is_quota_exceeded() => {
                    auth.quota_failures = auth.quota_failures.saturating_add(1);
                    let backoff = err
                        .retry_after
                        .unwrap_or_else(|| quota_backoff(auth.quota_failures));
                    auth.state = AuthState::Cooling;
                    auth.cooldown_until = Some(OffsetDateTime::now_utc() + backoff);
                    tracing::debug!(
                        auth = %auth.id,
                        secs = backoff.as_secs(),
                        failures = auth.quota_failures,
                        "credential cooling"
                    );
                }
                Some(err) if is_definitive_auth_failure(err) => {
                    auth.state = AuthState::Invalid;
                }
                Some(_) => {}
            }
            auth.clone()
        };
        let _ = self.store.put(updated).await;
    }

    pub fn cooldown_remaining(&self, id: &str) -> Option<Duration> {
        let auth = self.get(id)?;
        let until = auth.cooldown_until?;
        let now = OffsetDateTime::now_utc();
        if until <= now {
            return None;
        }
        (until - now).try_into().ok()
    }

    fn mark_state(&self, id: &str, new_state: AuthState) {
        let mut state = self.state.lock().expect("credential manager lock");
        if let Some(auth) = state.auths.get_mut(id) {
            auth.state = new_state;
        }
    }
}

fn quota_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(6);
    let backoff = QUOTA_BACKOFF_BASE * 2u32.pow(shift);
    backoff.min(QUOTA_BACKOFF_CAP)
}

fn is_definitive_auth_failure(err: &ExecutorError) -> bool {
    if !matches!(err.status, Some(400) | Some(403)) {
        return false;
    }
    let message = err.message.to_ascii_lowercase();
    message.contains("invalid_grant") || message.contains("invalid_api_key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_backoff_doubles_and_caps() {
        assert_eq!(quota_backoff(1), Duration::from_secs(30));
        assert_eq!(quota_backoff(2), Duration::from_secs(60));
        assert_eq!(quota_backoff(3), Duration::from_secs(120));
        assert_eq!(quota_backoff(20), QUOTA_BACKOFF_CAP);
    }

    #[test]
    fn definitive_failures_need_status_and_marker() {
        let err = ExecutorError::status(400, "error: invalid_grant");
        assert!(is_definitive_auth_failure(&err));
        let err = ExecutorError::status(500, "invalid_grant");
        assert!(!is_definitive_auth_failure(&err));
        let err = ExecutorError::status(400, "bad request");
        assert!(!is_definitive_auth_failure(&err));
    }
}
