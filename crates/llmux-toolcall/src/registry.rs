use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::Definition;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("tool name is required")]
    EmptyName,
    #[error("tool {0:?} is already registered")]
    Duplicate(String),
}

#[derive(Default)]
pub struct Registry {
    defs: RwLock<HashMap<String, Definition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mut def: Definition) -> Result<(), RegisterError> {
        let name = def.name.trim().to_string();
        if name.is_empty() {
            return Err(RegisterError::EmptyName);
        }
        def.name = name.clone();

        let mut defs = self.defs.write().expect("toolcall registry lock");
        if defs.contains_key(&name) {
            return Err(RegisterError::Duplicate(name));
        }
        defs.insert(name, def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Definition> {
        self.defs
            .read()
            .expect("toolcall registry lock")
            .get(name.trim())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .defs
            .read()
            .expect("toolcall registry lock")
            .keys()
            .cloned()
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::types::HandlerFn;

    fn noop_def(name: &str) -> Definition {
        Definition {
            name: name.to_string(),
            version: "1".to_string(),
            description: String::new(),
            timeout: None,
            side_effecting: false,
            input_schema: None,
            handler: Arc::new(HandlerFn(|_args| async { Ok(json!(null)) })),
        }
    }

    #[test]
    fn register_trims_and_rejects_duplicates() {
        let registry = Registry::new();
        registry.register(noop_def("  echo  ")).expect("register");
        assert!(registry.get("echo").is_some());
        assert_eq!(
            registry.register(noop_def("echo")),
            Err(RegisterError::Duplicate("echo".to_string()))
        );
    }

    #[test]
    fn register_rejects_blank_name() {
        let registry = Registry::new();
        assert_eq!(registry.register(noop_def("   ")), Err(RegisterError::EmptyName));
    }

    #[test]
    fn names_are_sorted() {
        let registry = Registry::new();
        registry.register(noop_def("zeta")).expect("register");
        registry.register(noop_def("alpha")).expect("register");
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }
}
