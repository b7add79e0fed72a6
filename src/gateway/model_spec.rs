//! `"<provider>:<model>"` parsing (§4.1, §6 "Model spec format").

use std::fmt;

/// The closed provider enumeration. Anything else is a parse error at the
/// gateway boundary, not a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Openrouter,
    Dashscope,
    Apiyi,
    Ollama,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openrouter" => Some(Self::Openrouter),
            "dashscope" => Some(Self::Dashscope),
            "apiyi" => Some(Self::Apiyi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openrouter => "openrouter",
            Self::Dashscope => "dashscope",
            Self::Apiyi => "apiyi",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: String,
}

impl ModelSpec {
    /// A spec with no recognized `provider:` prefix (or an empty side of the
    /// colon) is treated as a bare model name against `openrouter`, matching
    /// the "missing prefix ⇒ openrouter" rule.
    pub fn parse(spec: &str) -> Self {
        if let Some((provider_part, model_part)) = spec.split_once(':') {
            let provider_part = provider_part.trim().to_lowercase();
            let model_part = model_part.trim();
            if !provider_part.is_empty() && !model_part.is_empty() {
                if let Some(provider) = Provider::parse(&provider_part) {
                    return Self {
                        provider,
                        model: model_part.to_string(),
                    };
                }
            }
        }
        Self {
            provider: Provider::Openrouter,
            model: spec.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_openrouter_without_prefix() {
        let spec = ModelSpec::parse("gpt-4o");
        assert_eq!(spec.provider, Provider::Openrouter);
        assert_eq!(spec.model, "gpt-4o");
    }

    #[test]
    fn parses_recognized_provider() {
        let spec = ModelSpec::parse("dashscope:qwen-max");
        assert_eq!(spec.provider, Provider::Dashscope);
        assert_eq!(spec.model, "qwen-max");
    }

    #[test]
    fn unrecognized_provider_falls_back_to_whole_string_as_model() {
        let spec = ModelSpec::parse("bedrock:claude-3");
        assert_eq!(spec.provider, Provider::Openrouter);
        assert_eq!(spec.model, "bedrock:claude-3");
    }

    #[test]
    fn empty_model_part_falls_back() {
        let spec = ModelSpec::parse("openrouter:");
        assert_eq!(spec.provider, Provider::Openrouter);
        assert_eq!(spec.model, "openrouter:");
    }
}
