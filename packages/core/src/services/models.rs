//! Model Registry and Resolution
//!
//! A static registry of the models this system can route to, plus the
//! precedence rule that picks one for a turn.

/// Fallback when nothing else specifies a model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: i64 = 4096;

/// One routable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Identifier sent to the provider.
    pub id: &'static str,
    /// Provider that serves this model.
    pub provider: &'static str,
    /// Human-readable name for pickers.
    pub display: &'static str,
}

/// Models available for generation.
pub const AVAILABLE_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gpt-4o",
        provider: "openai",
        display: "GPT-4o",
    },
    ModelInfo {
        id: "gpt-4o-mini",
        provider: "openai",
        display: "GPT-4o Mini",
    },
    ModelInfo {
        id: "claude-opus-4-5-20251101",
        provider: "anthropic",
        display: "Claude Opus 4.5",
    },
    ModelInfo {
        id: "claude-sonnet-4-20250514",
        provider: "anthropic",
        display: "Claude Sonnet 4",
    },
    ModelInfo {
        id: "claude-3-5-haiku-20241022",
        provider: "anthropic",
        display: "Claude 3.5 Haiku",
    },
    ModelInfo {
        id: "gemini-2.0-flash",
        provider: "gemini",
        display: "Gemini 2.0 Flash",
    },
    ModelInfo {
        id: "gemini-2.0-pro-exp-02-05",
        provider: "gemini",
        display: "Gemini 2.0 Pro (Experimental)",
    },
];

/// Pick the model for a turn.
///
/// Precedence: per-request override, then the session's default, then the
/// user's preferred model, then [`DEFAULT_MODEL`]. Empty strings count as
/// absent.
pub fn resolve_model(
    request_model: Option<&str>,
    session_default: Option<&str>,
    user_preferred: Option<&str>,
) -> String {
    let non_empty = |value: Option<&str>| {
        value
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    non_empty(request_model)
        .or_else(|| non_empty(session_default))
        .or_else(|| non_empty(user_preferred))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// The provider that serves `model`.
///
/// Registry lookup first; unknown models fall back to an explicit
/// `provider/model` prefix, then to "openai".
pub fn provider_for(model: &str) -> &str {
    if let Some(info) = AVAILABLE_MODELS.iter().find(|m| m.id == model) {
        return info.provider;
    }
    match model.split_once('/') {
        Some((prefix, _)) if !prefix.is_empty() => prefix,
        _ => "openai",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_precedence() {
        assert_eq!(
            resolve_model(Some("gpt-4o"), Some("claude-sonnet-4-20250514"), Some("gemini-2.0-flash")),
            "gpt-4o"
        );
        assert_eq!(
            resolve_model(None, Some("claude-sonnet-4-20250514"), Some("gemini-2.0-flash")),
            "claude-sonnet-4-20250514"
        );
        assert_eq!(
            resolve_model(None, None, Some("gemini-2.0-flash")),
            "gemini-2.0-flash"
        );
        assert_eq!(resolve_model(None, None, None), DEFAULT_MODEL);
    }

    #[test]
    fn empty_strings_are_absent() {
        assert_eq!(resolve_model(Some(""), Some("  "), None), DEFAULT_MODEL);
        assert_eq!(resolve_model(Some(" gpt-4o "), None, None), "gpt-4o");
    }

    #[test]
    fn provider_lookup() {
        assert_eq!(provider_for("gpt-4o-mini"), "openai");
        assert_eq!(provider_for("claude-3-5-haiku-20241022"), "anthropic");
        assert_eq!(provider_for("gemini-2.0-flash"), "gemini");
        assert_eq!(provider_for("mistral/mistral-large"), "mistral");
        assert_eq!(provider_for("some-unknown-model"), "openai");
    }
}
