use super::{FinishReason, Stopper, TokenStep};
use tracing::{debug, warn};

/// Stopper that limits generation to a maximum number of tokens.
///
/// Every sampled token counts, including suppressed skip tokens and the
/// end-of-generation token itself.
#[derive(Debug)]
pub struct MaxTokensStopper {
    max_tokens: usize,
    tokens_generated: usize,
}

impl MaxTokensStopper {
    pub fn new(max_tokens: usize) -> Self {
        debug!("Creating MaxTokensStopper with limit: {} tokens", max_tokens);
        if max_tokens == 0 {
            warn!("MaxTokensStopper created with 0 token limit - will stop after the first token");
        }
        Self {
            max_tokens,
            tokens_generated: 0,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn tokens_generated(&self) -> usize {
        self.tokens_generated
    }

    pub fn remaining_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.tokens_generated)
    }
}

impl Stopper for MaxTokensStopper {
    fn should_stop(&mut self, _step: &TokenStep<'_>) -> Option<FinishReason> {
        self.tokens_generated += 1;
        if self.tokens_generated >= self.max_tokens {
            debug!(
                "MaxTokensStopper triggered: {} tokens generated (limit {})",
                self.tokens_generated, self.max_tokens
            );
            Some(FinishReason::MaxTokens)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: TokenStep<'static> = TokenStep {
        token: 3,
        is_end_of_generation: false,
        emitted: "a",
    };

    #[test]
    fn test_stops_at_limit() {
        let mut stopper = MaxTokensStopper::new(3);
        assert_eq!(stopper.should_stop(&STEP), None);
        assert_eq!(stopper.should_stop(&STEP), None);
        assert_eq!(stopper.remaining_tokens(), 1);
        assert_eq!(stopper.should_stop(&STEP), Some(FinishReason::MaxTokens));
        assert_eq!(stopper.tokens_generated(), 3);
    }

    #[test]
    fn test_zero_limit_stops_on_first_token() {
        let mut stopper = MaxTokensStopper::new(0);
        assert_eq!(stopper.max_tokens(), 0);
        assert_eq!(stopper.should_stop(&STEP), Some(FinishReason::MaxTokens));
    }
}
