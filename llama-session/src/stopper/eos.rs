use super::{FinishReason, Stopper, TokenStep};
use tracing::debug;

/// Stops on any token the engine classifies as end-of-generation.
#[derive(Debug, Default)]
pub struct EosStopper;

impl EosStopper {
    pub fn new() -> Self {
        Self
    }
}

impl Stopper for EosStopper {
    fn should_stop(&mut self, step: &TokenStep<'_>) -> Option<FinishReason> {
        if step.is_end_of_generation {
            debug!("End-of-generation token {} detected", step.token);
            Some(FinishReason::EndOfGeneration)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_eog_tokens_stop() {
        let mut stopper = EosStopper::new();
        let normal = TokenStep {
            token: 7,
            is_end_of_generation: false,
            emitted: "x",
        };
        assert_eq!(stopper.should_stop(&normal), None);
        let eog = TokenStep {
            token: 2,
            is_end_of_generation: true,
            emitted: "",
        };
        assert_eq!(stopper.should_stop(&eog), Some(FinishReason::EndOfGeneration));
    }
}
