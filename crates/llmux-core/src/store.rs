use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::auth::Auth;
use crate::error::{ExecutorError, ExecutorResult};

/// Credential persistence boundary.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn get(&self, id: &str) -> ExecutorResult<Option<Auth>>;
    async fn list(&self, provider: &str) -> ExecutorResult<Vec<Auth>>;
    async fn put(&self, auth: Auth) -> ExecutorResult<()>;
    async fn delete(&self, id: &str) -> ExecutorResult<()>;
}

#[derive(Default)]
pub struct MemoryAuthStore {
    auths: Mutex<HashMap<String, Auth>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn get(&self, id: &str) -> ExecutorResult<Option<Auth>> {
        Ok(self.auths.lock().expect("auth store lock").get(id).cloned())
    }

    async fn list(&self, provider: &str) -> ExecutorResult<Vec<Auth>> {
        let auths = self.auths.lock().expect("auth store lock");
        let mut out: Vec<Auth> = auths
            .values()
            .filter(|auth| auth.provider == provider)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn put(&self, auth: Auth) -> ExecutorResult<()> {
        if auth.id.is_empty() {
            return Err(ExecutorError::invalid_request("auth id is required"));
        }
        self.auths
            .lock()
            .expect("auth store lock")
            .insert(auth.id.clone(), auth);
        Ok(())
    }

    async fn delete(&self, id: &str) -> ExecutorResult<()> {
        self.auths.lock().expect("auth store lock").remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let store = MemoryAuthStore::new();
        store.put(Auth::new("b", "codex")).await.expect("put");
        store.put(Auth::new("a", "codex")).await.expect("put");
        store.put(Auth::new("c", "gemini")).await.expect("put");

        assert!(store.get("a").await.expect("get").is_some());
        let codex = store.list("codex").await.expect("list");
        assert_eq!(
            codex.iter().map(|auth| auth.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        store.delete("a").await.expect("delete");
        assert!(store.get("a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn put_requires_id() {
        let store = MemoryAuthStore::new();
        let err = store.put(Auth::new("", "codex")).await.expect_err("no id");
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidRequest);
    }
}
