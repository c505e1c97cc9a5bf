use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::ProviderExecutor;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ProviderExecutor>) {
        self.executors
            .insert(executor.identifier().to_string(), executor);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut out: Vec<String> = self.executors.keys().cloned().collect();
        out.sort();
        out
    }
}
