use std::sync::Arc;

use crate::error::{ErrorKind, ExecutorError, ExecutorResult};
use crate::executor::{Options, ProviderExecutor, Request, Response, StreamResult};
use crate::manager::CredentialManager;
use crate::registry::ExecutorRegistry;

/// Maps a requested model to a provider id by longest-prefix rule.
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    rules: Vec<(String, String)>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default routing table for the CLI backend fleet.
    pub fn standard() -> Self {
        let mut router = Self::new();
        for (prefix, provider) in [
            ("kimi-", "kimi"),
            ("qwen", "qwen"),
            ("glm-", "iflow"),
            ("minimax-", "iflow"),
            ("claude-", "claude"),
            ("gemini-", "gemini"),
            ("gpt-", "codex"),
            ("codex-", "codex"),
            ("o3", "codex"),
            ("o4", "codex"),
        ] {
            router.add_rule(prefix, provider);
        }
        router
    }

    pub fn add_rule(&mut self, prefix: impl Into<String>, provider: impl Into<String>) {
        self.rules.push((prefix.into(), provider.into()));
        self.rules
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    }

    pub fn provider_for(&self, model: &str) -> Option<&str> {
        let model = model.trim().to_ascii_lowercase();
        self.rules
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, provider)| provider.as_str())
    }
}

/// Per-request orchestration: route, select a credential, execute, report
/// the outcome back to the credential manager, retry once after a refresh on
/// 401.
pub struct Dispatcher {
    registry: Arc<ExecutorRegistry>,
    manager: Arc<CredentialManager>,
    router: ModelRouter,
}

impl Dispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, manager: Arc<CredentialManager>) -> Self {
        Self {
            registry,
            manager,
            router: ModelRouter::standard(),
        }
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = router;
        self
    }

    pub fn manager(&self) -> &Arc<CredentialManager> {
        &self.manager
    }

    fn resolve(&self, model: &str) -> ExecutorResult<(String, Arc<dyn ProviderExecutor>)> {
        let provider = self
            .router
            .provider_for(model)
            .ok_or_else(|| ExecutorError::invalid_request(format!("no route for model {model:?}")))?
            .to_string();
        let executor = self.registry.get(&provider).ok_or_else(|| {
            ExecutorError::invalid_request(format!("no executor for provider {provider:?}"))
        })?;
        Ok((provider, executor))
    }

    pub async fn execute(&self, req: Request, opts: Options) -> ExecutorResult<Response> {
        let (provider, executor) = self.resolve(&req.model)?;
        let auth = self
            .manager
            .select(&provider, &req.model)
            .map_err(|err| ExecutorError::invalid_request(err.to_string()))?;

        let result = executor.execute(&auth, req.clone(), opts.clone()).await;
        self.manager.on_result(&auth.id, result.as_ref().err()).await;

        match result {
            Err(err) if err.kind == ErrorKind::Unauthorized => {
                let refreshed = self.manager.refresh(executor.as_ref(), &auth.id).await?;
                let retried = executor.execute(&refreshed, req, opts).await;
                self.manager
                    .on_result(&refreshed.id, retried.as_ref().err())
                    .await;
                retried
            }
            other => other,
        }
    }

    pub async fn execute_stream(&self, req: Request, opts: Options) -> ExecutorResult<StreamResult> {
        let (provider, executor) = self.resolve(&req.model)?;
        let auth = self
            .manager
            .select(&provider, &req.model)
            .map_err(|err| ExecutorError::invalid_request(err.to_string()))?;

        let result = executor.execute_stream(&auth, req.clone(), opts.clone()).await;
        self.manager.on_result(&auth.id, result.as_ref().err()).await;

        match result {
            Err(err) if err.kind == ErrorKind::Unauthorized => {
                let refreshed = self.manager.refresh(executor.as_ref(), &auth.id).await?;
                let retried = executor.execute_stream(&refreshed, req, opts).await;
                self.manager
                    .on_result(&refreshed.id, retried.as_ref().err())
                    .await;
                retried
            }
            other => other,
        }
    }

    pub async fn count_tokens(&self, req: Request, opts: Options) -> ExecutorResult<Response> {
        let (provider, executor) = self.resolve(&req.model)?;
        let auth = self
            .manager
            .select(&provider, &req.model)
            .map_err(|err| ExecutorError::invalid_request(err.to_string()))?;
        let result = executor.count_tokens(&auth, req, opts).await;
        self.manager.on_result(&auth.id, result.as_ref().err()).await;
        result
    }
}
