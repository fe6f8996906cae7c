//! # Inference Engine Interface
//!
//! The native decode engine, its tokenizer and its model loader are external
//! collaborators. This module defines the seams a binding has to fill:
//!
//! - [`Backend`] creates the two native resources, the model weights and the
//!   decode context bound to them.
//! - [`InferenceEngine`] is the decode context: batched decode, logits for the
//!   last evaluated position, tokenization in both directions, vocabulary
//!   markers, and the KV cache sequence operations used by context rotation.
//! - [`Batch`] is the token/position buffer handed to `decode`.
//!
//! The engine may use worker threads internally; from this crate's point of view
//! each `decode` call is one blocking unit of work.

use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::progress::LoadProgress;

/// Token id as used by the engine vocabulary.
pub type TokenId = i32;

/// Sequence id for single-session use.
pub const MAIN_SEQUENCE: i32 = 0;

/// One slot of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub position: i32,
    pub sequence: i32,
    pub want_logits: bool,
}

/// A bounded buffer of tokens to evaluate in one decode call.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append one token at an absolute position of the main sequence.
    pub fn add(
        &mut self,
        token: TokenId,
        position: usize,
        want_logits: bool,
    ) -> Result<(), EngineError> {
        if self.entries.len() >= self.capacity {
            return Err(EngineError::BatchFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            position: position as i32,
            sequence: MAIN_SEQUENCE,
            want_logits,
        });
        Ok(())
    }

    /// Clear and refill with `tokens` starting at `first_position`.
    ///
    /// Only the last token requests logits.
    pub fn fill(&mut self, tokens: &[TokenId], first_position: usize) -> Result<(), EngineError> {
        self.clear();
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            self.add(*token, first_position + i, i == last)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

/// A LoRA adapter to apply at model load.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoraAdapter {
    pub path: PathBuf,
    pub scale: f32,
}

/// Parameters for loading model weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub n_gpu_layers: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub lora_adapters: Vec<LoraAdapter>,
}

/// Parameters for creating the decode context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub context_length: usize,
    pub n_batch: usize,
    pub n_threads: usize,
    pub flash_attention: bool,
}

/// The decode context of a loaded model.
pub trait InferenceEngine {
    /// Evaluate a batch. A non-zero native status maps to [`EngineError::Decode`].
    fn decode(&mut self, batch: &Batch) -> Result<(), EngineError>;

    /// Logits for the last position of the last decoded batch that requested them.
    fn logits(&self) -> Result<&[f32], EngineError>;

    /// Tokenize `text`, optionally prefixing the begin marker and parsing special tokens.
    fn tokenize(
        &self,
        text: &str,
        add_begin_marker: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of one token. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId, render_special: bool) -> Result<Vec<u8>, EngineError>;

    fn vocab_size(&self) -> usize;

    fn begin_marker_token(&self) -> TokenId;

    fn end_marker_token(&self) -> TokenId;

    fn newline_token(&self) -> Option<TokenId> {
        None
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == self.end_marker_token()
    }

    /// Maximum number of positions the context can hold.
    fn context_length(&self) -> usize;

    /// Remove positions `[p0, p1)` of `sequence` from the KV cache.
    fn kv_seq_rm(&mut self, sequence: i32, p0: usize, p1: usize) -> Result<(), EngineError>;

    /// Shift positions `[p0, p1)` of `sequence` by `delta`.
    fn kv_seq_add(
        &mut self,
        sequence: i32,
        p0: usize,
        p1: usize,
        delta: i64,
    ) -> Result<(), EngineError>;

    /// Drop all KV cache content.
    fn kv_clear(&mut self);

    /// Encoder-decoder models run the prompt through an encoder first.
    fn has_encoder(&self) -> bool {
        false
    }

    fn encode(&mut self, _batch: &Batch) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("encode"))
    }

    fn decoder_start_token(&self) -> Option<TokenId> {
        None
    }

    /// Opaque engine state (KV cache) for persistence. Empty means "nothing to save".
    fn state_snapshot(&self) -> Result<Vec<u8>, EngineError> {
        Ok(Vec::new())
    }

    fn restore_snapshot(&mut self, _snapshot: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }

    fn system_info(&self) -> String {
        String::new()
    }
}

/// Creates the native resources for a session.
///
/// The controller keeps the model alive for as long as the context exists and
/// drops the context first.
pub trait Backend {
    type Model;
    type Context: InferenceEngine;

    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
        progress: &LoadProgress,
    ) -> Result<Self::Model, EngineError>;

    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_marks_only_last_for_logits() {
        let mut batch = Batch::new(8);
        batch.fill(&[5, 6, 7], 10).unwrap();
        let entries = batch.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].position, 10);
        assert_eq!(entries[2].position, 12);
        assert!(!entries[0].want_logits);
        assert!(!entries[1].want_logits);
        assert!(entries[2].want_logits);
    }

    #[test]
    fn test_add_past_capacity_fails() {
        let mut batch = Batch::new(1);
        batch.add(1, 0, true).unwrap();
        assert_eq!(
            batch.add(2, 1, true),
            Err(EngineError::BatchFull { capacity: 1 })
        );
        batch.clear();
        assert!(batch.is_empty());
        batch.add(2, 1, true).unwrap();
    }
}
