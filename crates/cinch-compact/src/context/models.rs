//! Model metadata used for threshold math.

/// Upper bound on the output allowance reserved out of the context window.
pub const MAX_OUTPUT_RESERVATION: usize = 20_000;

/// Context limits for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    /// Raw context window in tokens.
    pub context_window: usize,
    /// The model's general per-response output limit.
    pub max_output_tokens: usize,
    /// Whether the model handles tool definitions well enough to be offered
    /// the richer summarizer tool set.
    pub supports_tools: bool,
}

impl ModelLimits {
    pub fn new(context_window: usize, max_output_tokens: usize) -> Self {
        Self {
            context_window,
            max_output_tokens,
            supports_tools: true,
        }
    }

    /// Tokens held back for the response: the output limit, capped at
    /// [`MAX_OUTPUT_RESERVATION`].
    pub fn output_reservation(&self) -> usize {
        self.max_output_tokens.min(MAX_OUTPUT_RESERVATION)
    }
}

/// Look up approximate limits for a model by name.
///
/// Matches on the model name segment (after the last `/` in paths like
/// `"anthropic/claude-sonnet-4"`) so org prefixes don't cause false hits.
pub fn limits_for_model(model: &str) -> ModelLimits {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.contains("[1m]") || name.ends_with("-1m") {
        ModelLimits::new(1_000_000, 32_000)
    } else if name.contains("opus") {
        ModelLimits::new(200_000, 32_000)
    } else if name.contains("sonnet") {
        ModelLimits::new(200_000, 64_000)
    } else if name.contains("haiku") {
        ModelLimits::new(200_000, 8_192)
    } else if name.contains("gpt-4o") {
        ModelLimits::new(128_000, 16_384)
    } else if name.contains("gpt-4.1") || name.contains("gpt-5") {
        ModelLimits::new(400_000, 128_000)
    } else if name.starts_with("o1") || name.starts_with("o3") || name.starts_with("o4") {
        ModelLimits::new(200_000, 100_000)
    } else if name.contains("gemini") {
        ModelLimits::new(1_000_000, 65_536)
    } else if name.contains("deepseek") {
        ModelLimits {
            supports_tools: false,
            ..ModelLimits::new(128_000, 8_192)
        }
    } else if name.contains("glm") {
        ModelLimits::new(200_000, 32_000)
    } else {
        ModelLimits {
            supports_tools: false,
            ..ModelLimits::new(200_000, 8_192)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_prefix_is_ignored() {
        assert_eq!(
            limits_for_model("anthropic/claude-sonnet-4"),
            limits_for_model("claude-sonnet-4")
        );
        assert_eq!(
            limits_for_model("my-org/custom-model").context_window,
            200_000
        );
    }

    #[test]
    fn reservation_is_capped() {
        assert_eq!(limits_for_model("claude-sonnet-4").output_reservation(), 20_000);
        assert_eq!(limits_for_model("claude-3-5-haiku").output_reservation(), 8_192);
    }

    #[test]
    fn unknown_models_do_not_get_tools() {
        assert!(!limits_for_model("someone/mystery-7b").supports_tools);
        assert!(limits_for_model("anthropic/claude-opus-4").supports_tools);
    }
}
