use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use llmux_core::{
    Auth, AuthState, CredentialManager, ExecutorError, ExecutorResult, MemoryAuthStore, Options,
    PreparedHttpRequest, PreparedHttpResponse, ProviderExecutor, Request, Response, SelectError,
    SelectionMode, StreamResult,
};
use time::OffsetDateTime;

struct StubExecutor {
    refreshes: AtomicUsize,
    fail_refresh: bool,
}

impl StubExecutor {
    fn new(fail_refresh: bool) -> Self {
        Self {
            refreshes: AtomicUsize::new(0),
            fail_refresh,
        }
    }
}

#[async_trait]
impl ProviderExecutor for StubExecutor {
    fn identifier(&self) -> &str {
        "stub"
    }

    async fn execute(&self, _auth: &Auth, _req: Request, _opts: Options) -> ExecutorResult<Response> {
        Ok(Response::default())
    }

    async fn execute_stream(
        &self,
        _auth: &Auth,
        _req: Request,
        _opts: Options,
    ) -> ExecutorResult<StreamResult> {
        Err(ExecutorError::internal("not used"))
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        _req: Request,
        _opts: Options,
    ) -> ExecutorResult<Response> {
        Ok(Response::default())
    }

    async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        // Simulate a slow upstream token exchange.
        tokio::time::sleep(Duration::from_millis(30)).await;
        if self.fail_refresh {
            return Err(ExecutorError::status(400, "invalid_grant"));
        }
        let mut refreshed = auth.clone();
        refreshed.metadata.insert(
            "access_token".to_string(),
            serde_json::Value::String("fresh".to_string()),
        );
        Ok(refreshed)
    }

    fn prepare_request(&self, _req: &mut PreparedHttpRequest, _auth: &Auth) -> ExecutorResult<()> {
        Ok(())
    }

    async fn http_request(
        &self,
        _auth: &Auth,
        _req: PreparedHttpRequest,
    ) -> ExecutorResult<PreparedHttpResponse> {
        Err(ExecutorError::internal("not used"))
    }
}

fn manager() -> CredentialManager {
    CredentialManager::new(Arc::new(MemoryAuthStore::new()))
}

fn auth(id: &str) -> Auth {
    Auth::new(id, "stub")
}

#[tokio::test]
async fn select_rotates_round_robin() {
    let manager = manager();
    for id in ["a", "b", "c"] {
        manager.register(auth(id)).await.expect("register");
    }

    let picks: Vec<String> = (0..6)
        .map(|_| manager.select("stub", "model-x").expect("select").id)
        .collect();
    assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test]
async fn fill_first_pins_first_healthy() {
    let manager =
        CredentialManager::new(Arc::new(MemoryAuthStore::new())).with_mode(SelectionMode::FillFirst);
    for id in ["a", "b"] {
        manager.register(auth(id)).await.expect("register");
    }
    for _ in 0..3 {
        assert_eq!(manager.select("stub", "m").expect("select").id, "a");
    }

    let quota = ExecutorError::status(429, "quota");
    manager.on_result("a", Some(&quota)).await;
    assert_eq!(manager.select("stub", "m").expect("select").id, "b");
}

#[tokio::test]
async fn cooling_credential_is_never_selected_until_deadline() {
    let manager = manager();
    manager.register(auth("only")).await.expect("register");

    let quota = ExecutorError::status(429, "quota").with_retry_after(Some(Duration::from_secs(60)));
    manager.on_result("only", Some(&quota)).await;

    assert_eq!(manager.get("only").map(|a| a.state), Some(AuthState::Cooling));
    assert_eq!(
        manager.select("stub", "m").map(|auth| auth.id),
        Err(SelectError::NoCredentialsAvailable("stub".to_string()))
    );
    assert!(manager.cooldown_remaining("only").expect("cooldown") > Duration::from_secs(50));
}

#[tokio::test]
async fn expired_cooldown_recovers_on_select() {
    let manager = manager();
    let mut cooled = auth("cooled");
    cooled.state = AuthState::Cooling;
    cooled.cooldown_until = Some(OffsetDateTime::now_utc() - Duration::from_secs(1));
    manager.register(cooled).await.expect("register");

    let picked = manager.select("stub", "m").expect("select");
    assert_eq!(picked.id, "cooled");
    assert_eq!(picked.state, AuthState::Active);
}

#[tokio::test]
async fn model_exclusion_filters_candidates() {
    let manager = manager();
    let mut limited = auth("limited");
    limited.excluded_models.push("gpt-5".to_string());
    manager.register(limited).await.expect("register");
    manager.register(auth("open")).await.expect("register");

    for _ in 0..4 {
        assert_eq!(manager.select("stub", "gpt-5").expect("select").id, "open");
    }
    assert!(manager.select("stub", "gpt-4.1").is_ok());
}

#[tokio::test]
async fn retry_after_beats_exponential_backoff() {
    let manager = manager();
    manager.register(auth("a")).await.expect("register");

    let quota = ExecutorError::status(429, "quota").with_retry_after(Some(Duration::from_secs(7)));
    manager.on_result("a", Some(&quota)).await;
    let remaining = manager.cooldown_remaining("a").expect("cooldown");
    assert!(remaining <= Duration::from_secs(7));
    assert!(remaining > Duration::from_secs(4));
}

#[tokio::test]
async fn quota_failures_escalate_and_reset_on_success() {
    let manager = manager();
    manager.register(auth("a")).await.expect("register");

    let quota = ExecutorError::status(429, "quota");
    manager.on_result("a", Some(&quota)).await;
    assert_eq!(manager.get("a").map(|auth| auth.quota_failures), Some(1));
    manager.on_result("a", Some(&quota)).await;
    assert_eq!(manager.get("a").map(|auth| auth.quota_failures), Some(2));

    manager.on_result("a", None).await;
    let refreshed = manager.get("a").expect("auth");
    assert_eq!(refreshed.quota_failures, 0);
    assert_eq!(refreshed.state, AuthState::Active);
}

#[tokio::test]
async fn unauthorized_marks_expired() {
    let manager = manager();
    manager.register(auth("a")).await.expect("register");
    let unauthorized = ExecutorError::status(401, "token expired");
    manager.on_result("a", Some(&unauthorized)).await;
    assert_eq!(manager.get("a").map(|auth| auth.state), Some(AuthState::Expired));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_is_single_flight() {
    let manager = Arc::new(manager());
    manager.register(auth("a")).await.expect("register");
    // Expire it so the short-circuit in refresh does not apply.
    let unauthorized = ExecutorError::status(401, "expired");
    manager.on_result("a", Some(&unauthorized)).await;

    let executor = Arc::new(StubExecutor::new(false));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            manager.refresh(executor.as_ref(), "a").await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("refresh");
    }
    // One caller performs the exchange; the rest observe the refreshed state.
    assert_eq!(executor.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.get("a").and_then(|a| a.metadata_str("access_token").map(str::to_string)),
        Some("fresh".to_string())
    );
}

#[tokio::test]
async fn refresh_invalid_grant_marks_invalid() {
    let manager = manager();
    manager.register(auth("a")).await.expect("register");
    let unauthorized = ExecutorError::status(401, "expired");
    manager.on_result("a", Some(&unauthorized)).await;

    let executor = StubExecutor::new(true);
    let err = manager.refresh(&executor, "a").await.expect_err("refresh fails");
    assert_eq!(err.status, Some(400));
    assert_eq!(manager.get("a").map(|auth| auth.state), Some(AuthState::Invalid));
}
