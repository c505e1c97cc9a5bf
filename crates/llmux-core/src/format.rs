use serde::{Deserialize, Serialize};

/// Wire-format tag for request/response translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    OpenAI,
    Claude,
    Gemini,
    GeminiCli,
    OpenAIResponse,
    Codex,
}

impl Format {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Format::OpenAI),
            "claude" => Some(Format::Claude),
            "gemini" => Some(Format::Gemini),
            "gemini-cli" => Some(Format::GeminiCli),
            "openai-response" | "openai_response" => Some(Format::OpenAIResponse),
            "codex" => Some(Format::Codex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::OpenAI => "openai",
            Format::Claude => "claude",
            Format::Gemini => "gemini",
            Format::GeminiCli => "gemini-cli",
            Format::OpenAIResponse => "openai-response",
            Format::Codex => "codex",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_names() {
        for format in [
            Format::OpenAI,
            Format::Claude,
            Format::Gemini,
            Format::GeminiCli,
            Format::OpenAIResponse,
            Format::Codex,
        ] {
            assert_eq!(Format::from_name(format.as_str()), Some(format));
        }
        assert_eq!(Format::from_name("unknown"), None);
    }
}
