//! Thinking-suffix parsing and application.
//!
//! Clients toggle provider reasoning through a model-name tail. Two spellings
//! are accepted: a parenthesized effort level (`gpt-5(high)`) and a
//! `-thinking[-<budget>]` / `-nothinking` tail (`gemini-2.5-flash-thinking-8192`).
//! The base model is the name without the tail.

use serde_json::{Value, json};

use llmux_core::Format;

use crate::json::{delete_path, get_path, set_path};

const EFFORT_LEVELS: &[&str] = &["none", "minimal", "low", "medium", "high", "xhigh", "max", "auto"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSuffix {
    pub model_name: String,
    pub effort: Option<String>,
    pub thinking: Option<bool>,
    pub budget: Option<i64>,
}

pub fn parse_suffix(model: &str) -> ModelSuffix {
    let model = model.trim();

    if let Some(open) = model.rfind('(')
        && model.ends_with(')')
    {
        let candidate = model[open + 1..model.len() - 1].trim().to_ascii_lowercase();
        if EFFORT_LEVELS.contains(&candidate.as_str()) {
            return ModelSuffix {
                model_name: model[..open].trim_end().to_string(),
                thinking: Some(candidate != "none"),
                effort: Some(candidate),
                budget: None,
            };
        }
    }

    if let Some(base) = model.strip_suffix("-nothinking") {
        return ModelSuffix {
            model_name: base.to_string(),
            effort: None,
            thinking: Some(false),
            budget: None,
        };
    }

    if let Some(base) = model.strip_suffix("-thinking") {
        return ModelSuffix {
            model_name: base.to_string(),
            effort: None,
            thinking: Some(true),
            budget: None,
        };
    }

    if let Some(idx) = model.rfind("-thinking-") {
        let tail = &model[idx + "-thinking-".len()..];
        if let Ok(budget) = tail.parse::<i64>() {
            return ModelSuffix {
                model_name: model[..idx].to_string(),
                effort: None,
                thinking: Some(true),
                budget: Some(budget),
            };
        }
    }

    ModelSuffix {
        model_name: model.to_string(),
        effort: None,
        thinking: None,
        budget: None,
    }
}

/// Applies the parsed thinking directive onto the translated body for the
/// target format. A model name without a directive leaves the body untouched.
pub fn apply_thinking(body: &mut Value, requested_model: &str, target: Format) {
    let suffix = parse_suffix(requested_model);
    if suffix.effort.is_none() && suffix.thinking.is_none() {
        return;
    }

    match target {
        Format::Codex | Format::OpenAIResponse => {
            if let Some(effort) = &suffix.effort {
                set_path(body, "reasoning.effort", json!(effort));
            } else if suffix.thinking == Some(false) {
                delete_path(body, "reasoning");
            }
        }
        Format::OpenAI => {
            if let Some(effort) = &suffix.effort {
                set_path(body, "reasoning_effort", json!(effort));
            } else if suffix.thinking == Some(false) {
                delete_path(body, "reasoning_effort");
            }
        }
        Format::Claude => match suffix.thinking {
            Some(true) => {
                let budget = suffix.budget.unwrap_or(16_384);
                set_path(body, "thinking", json!({"type": "enabled", "budget_tokens": budget}));
            }
            Some(false) => {
                delete_path(body, "thinking");
            }
            None => {}
        },
        Format::Gemini | Format::GeminiCli => {
            let root = if target == Format::GeminiCli
                && get_path(body, "request").is_some_and(Value::is_object)
            {
                "request.generationConfig.thinkingConfig"
            } else {
                "generationConfig.thinkingConfig"
            };
            match suffix.thinking {
                Some(true) => {
                    let budget = suffix.budget.unwrap_or(-1);
                    set_path(
                        body,
                        root,
                        json!({"thinkingBudget": budget, "includeThoughts": true}),
                    );
                }
                Some(false) => {
                    set_path(body, root, json!({"thinkingBudget": 0}));
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_effort_parentheses() {
        let parsed = parse_suffix("gpt-5(high)");
        assert_eq!(parsed.model_name, "gpt-5");
        assert_eq!(parsed.effort.as_deref(), Some("high"));
        assert_eq!(parsed.thinking, Some(true));
    }

    #[test]
    fn unknown_parentheses_are_part_of_the_name() {
        let parsed = parse_suffix("model(custom)");
        assert_eq!(parsed.model_name, "model(custom)");
        assert_eq!(parsed.effort, None);
    }

    #[test]
    fn parses_thinking_budget_tail() {
        let parsed = parse_suffix("gemini-2.5-flash-thinking-8192");
        assert_eq!(parsed.model_name, "gemini-2.5-flash");
        assert_eq!(parsed.thinking, Some(true));
        assert_eq!(parsed.budget, Some(8192));
    }

    #[test]
    fn parses_nothinking_tail() {
        let parsed = parse_suffix("qwen3-coder-nothinking");
        assert_eq!(parsed.model_name, "qwen3-coder");
        assert_eq!(parsed.thinking, Some(false));
    }

    #[test]
    fn plain_model_is_untouched() {
        let parsed = parse_suffix("claude-sonnet-4-5");
        assert_eq!(parsed.model_name, "claude-sonnet-4-5");
        assert_eq!(parsed.thinking, None);

        let mut body = json!({"input": []});
        apply_thinking(&mut body, "claude-sonnet-4-5", Format::Codex);
        assert_eq!(body, json!({"input": []}));
    }

    #[test]
    fn applies_codex_effort() {
        let mut body = json!({});
        apply_thinking(&mut body, "gpt-5(high)", Format::Codex);
        assert_eq!(body, json!({"reasoning": {"effort": "high"}}));
    }

    #[test]
    fn applies_claude_budget() {
        let mut body = json!({});
        apply_thinking(&mut body, "claude-opus-4-thinking-4096", Format::Claude);
        assert_eq!(
            body,
            json!({"thinking": {"type": "enabled", "budget_tokens": 4096}})
        );
    }

    #[test]
    fn applies_gemini_cli_under_request_root() {
        let mut body = json!({"request": {"contents": []}});
        apply_thinking(&mut body, "gemini-2.5-pro-thinking", Format::GeminiCli);
        assert_eq!(
            body["request"]["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            json!(-1)
        );
    }
}
