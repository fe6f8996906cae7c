use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::TokenId;
use crate::stopper::FinishReason;

/// One call to `predict`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictRequest {
    pub prompt: String,
    /// Evaluated before the prompt with no template applied.
    pub system_prompt: Option<String>,
    /// Embedded and evaluated after the system prompt.
    pub image: Option<PathBuf>,
}

impl PredictRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref().filter(|s| !s.is_empty())
    }

    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }
}

/// Result of a completed prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Everything passed to the callback, concatenated.
    pub text: String,
    /// Every sampled token, including suppressed and end-of-generation tokens.
    pub tokens: Vec<TokenId>,
    pub finish_reason: FinishReason,
    /// Tokens evaluated before sampling started (system prompt and prompt).
    pub prompt_tokens: usize,
    pub rotations: usize,
    pub elapsed: Duration,
}
