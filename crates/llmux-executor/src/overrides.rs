//! Server-side payload overrides.
//!
//! A pure overlay of configured values onto the translated request body for
//! the chosen model and target format. Applied after thinking handling and
//! before the provider-specific request transform.

use serde_json::Value;

use llmux_core::Format;

use crate::config::Config;
use crate::json::{delete_path, set_path};

pub fn apply_payload_overrides(cfg: &Config, model: &str, format: Format, body: &mut Value) {
    for rule in &cfg.payload_rules {
        if !rule.matches(model, format) {
            continue;
        }
        for (path, value) in &rule.set {
            set_path(body, path, value.clone());
        }
        for path in &rule.delete {
            delete_path(body, path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayloadRule;
    use serde_json::json;

    #[test]
    fn applies_matching_rules_in_order() {
        let cfg = Config {
            payload_rules: vec![
                PayloadRule {
                    models: vec!["gpt-5*".to_string()],
                    format: Some(Format::Codex),
                    set: vec![("store".to_string(), json!(false))],
                    delete: vec!["max_output_tokens".to_string()],
                },
                PayloadRule {
                    models: vec![],
                    format: None,
                    set: vec![("store".to_string(), json!(true))],
                    delete: vec![],
                },
            ],
            ..Default::default()
        };

        let mut body = json!({"max_output_tokens": 64});
        apply_payload_overrides(&cfg, "gpt-5-codex", Format::Codex, &mut body);
        // Later rules overlay earlier ones.
        assert_eq!(body, json!({"store": true}));

        let mut body = json!({"max_output_tokens": 64});
        apply_payload_overrides(&cfg, "gemini-2.5-pro", Format::Gemini, &mut body);
        assert_eq!(body, json!({"max_output_tokens": 64, "store": true}));
    }
}
