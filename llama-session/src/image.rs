//! Multimodal image prompts.
//!
//! The image encoder (projector) is an external collaborator. The session asks
//! it how many positions an image will occupy, makes room in the context, and
//! then lets it write the embedding into the engine starting at `n_past`.

use std::path::Path;

use crate::engine::InferenceEngine;

pub trait ImageEvaluator: Send {
    /// Positions the embedding of `image` will occupy.
    fn embedding_len(&self, image: &Path) -> Result<usize, String>;

    /// Embed `image` and evaluate it at positions starting from `n_past`,
    /// in chunks of at most `n_batch`. Returns the number of positions written.
    fn evaluate(
        &mut self,
        engine: &mut dyn InferenceEngine,
        image: &Path,
        n_batch: usize,
        n_past: usize,
    ) -> Result<usize, String>;
}
