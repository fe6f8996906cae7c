use super::{FinishReason, Stopper, TokenStep};
use tracing::debug;

/// Stops once the emitted text exceeds `max_bytes` bytes.
///
/// The fragment that crosses the limit is still delivered; nothing after it is.
#[derive(Debug)]
pub struct MaxBytesStopper {
    max_bytes: usize,
    emitted: usize,
}

impl MaxBytesStopper {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            emitted: 0,
        }
    }

    pub fn emitted_bytes(&self) -> usize {
        self.emitted
    }
}

impl Stopper for MaxBytesStopper {
    fn should_stop(&mut self, step: &TokenStep<'_>) -> Option<FinishReason> {
        self.emitted += step.emitted.len();
        if self.emitted > self.max_bytes {
            debug!(
                "MaxBytesStopper triggered: {} bytes emitted (limit {})",
                self.emitted, self.max_bytes
            );
            Some(FinishReason::MaxBytes)
        } else {
            None
        }
    }
}
