//! Token history, the `n_past` counter and KV-cache rotation.
//!
//! `n_past` counts positions present in the engine's KV cache. `history` lists
//! the tokens sent to the engine, each paired with the KV position it occupies.
//! Image embeddings occupy positions without tokens, so history indices and KV
//! positions diverge after an image; rotation maps the discarded position range
//! back to history entries through those positions.
//!
//! A generated token that was shown to the caller but not yet evaluated (the
//! last token of a prediction that stopped early) is held as `pending` and is
//! evaluated before anything else on the next prediction.
//!
//! Rotation keeps a protected prefix of `P` positions, discards half of the rest,
//! shifts the survivors down and decodes one end-of-generation sentinel so the
//! engine's position tracking resumes at the new `n_past`:
//!
//! ```text
//! before:  [ P protected | n_discard dropped | kept ............ ]  n_past
//! after:   [ P protected | kept ............ | eos ]                 n_past - n_discard + 1
//! ```

use tracing::{debug, info};

use crate::engine::{Batch, InferenceEngine, TokenId, MAIN_SEQUENCE};
use crate::error::SessionError;

/// What one rotation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPlan {
    pub protected: usize,
    pub discarded: usize,
    pub n_past_before: usize,
    pub n_past_after: usize,
}

/// Positions `[start, start + len)` that hold an image embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpan {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct ContextWindow {
    history: Vec<TokenId>,
    /// KV position of each history entry, strictly ascending.
    positions: Vec<usize>,
    n_past: usize,
    context_length: usize,
    protected: usize,
    pending: Option<TokenId>,
}

impl ContextWindow {
    /// `protected` is capped at half the context length.
    pub fn new(context_length: usize, protected: usize) -> Self {
        Self {
            history: Vec::new(),
            positions: Vec::new(),
            n_past: 0,
            context_length,
            protected: protected.min(context_length / 2),
            pending: None,
        }
    }

    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Position ranges below `n_past` that hold no history entry.
    pub fn image_spans(&self) -> Vec<ImageSpan> {
        let mut spans = Vec::new();
        let mut next = 0;
        for &position in &self.positions {
            if position > next {
                spans.push(ImageSpan {
                    start: next,
                    len: position - next,
                });
            }
            next = position + 1;
        }
        if self.n_past > next {
            spans.push(ImageSpan {
                start: next,
                len: self.n_past - next,
            });
        }
        spans
    }

    pub fn pending(&self) -> Option<TokenId> {
        self.pending
    }

    pub fn set_pending(&mut self, token: Option<TokenId>) {
        self.pending = token;
    }

    /// History plus the pending token: everything the sampler has seen.
    pub fn sampled_tokens(&self) -> Vec<TokenId> {
        let mut tokens = self.history.clone();
        tokens.extend(self.pending);
        tokens
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn remaining(&self) -> usize {
        self.context_length.saturating_sub(self.n_past)
    }

    /// Protected prefix length for the current fill level.
    pub fn protected_prefix(&self) -> usize {
        self.protected.min(self.n_past)
    }

    /// Replace the window with persisted state.
    ///
    /// History entries fill every position below `n_past` outside `spans`, in
    /// order, so `history.len()` plus the span lengths must equal `n_past`.
    pub fn restore(
        &mut self,
        history: Vec<TokenId>,
        n_past: usize,
        spans: &[ImageSpan],
    ) -> Result<(), String> {
        if n_past > self.context_length {
            return Err(format!(
                "saved n_past {} exceeds context length {}",
                n_past, self.context_length
            ));
        }

        let mut positions = Vec::with_capacity(history.len());
        let mut next = 0;
        for span in spans {
            if span.len == 0 || span.start < next || span.start + span.len > n_past {
                return Err(format!(
                    "image span {}..{} is out of order or beyond n_past {}",
                    span.start,
                    span.start + span.len,
                    n_past
                ));
            }
            positions.extend(next..span.start);
            next = span.start + span.len;
        }
        positions.extend(next..n_past);
        if positions.len() != history.len() {
            return Err(format!(
                "{} saved tokens do not fill n_past {} around {} image positions",
                history.len(),
                n_past,
                n_past - positions.len()
            ));
        }

        self.history = history;
        self.positions = positions;
        self.n_past = n_past;
        self.pending = None;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.positions.clear();
        self.n_past = 0;
        self.pending = None;
    }

    /// Whether `incoming` more positions would overflow the context.
    pub fn should_rotate(&self, incoming: usize) -> bool {
        self.n_past + incoming > self.context_length
    }

    /// Append decoded tokens and advance `n_past` by their count.
    pub fn record(&mut self, tokens: &[TokenId]) -> Result<(), SessionError> {
        let start = self.n_past;
        self.advance(tokens.len())?;
        self.history.extend_from_slice(tokens);
        self.positions.extend(start..self.n_past);
        Ok(())
    }

    /// Advance `n_past` for positions that carry no token (image embeddings).
    pub fn advance(&mut self, positions: usize) -> Result<(), SessionError> {
        if self.should_rotate(positions) {
            return Err(self.exhausted(positions));
        }
        self.n_past += positions;
        Ok(())
    }

    /// Compute the next rotation without touching the engine.
    pub fn plan_rotation(&self, incoming: usize) -> Result<RotationPlan, SessionError> {
        let protected = self.protected_prefix();
        let discarded = (self.n_past - protected) / 2;

        if discarded < 2 || incoming + protected + 1 > self.context_length {
            return Err(self.exhausted(incoming));
        }

        Ok(RotationPlan {
            protected,
            discarded,
            n_past_before: self.n_past,
            n_past_after: self.n_past - discarded + 1,
        })
    }

    /// Run one rotation against the engine.
    pub fn rotate<E: InferenceEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        incoming: usize,
    ) -> Result<RotationPlan, SessionError> {
        let plan = self.plan_rotation(incoming)?;
        let start = plan.protected;
        let end = plan.protected + plan.discarded;

        engine
            .kv_seq_rm(MAIN_SEQUENCE, start, end)
            .map_err(|e| SessionError::evaluation("kv shift", e))?;
        engine
            .kv_seq_add(MAIN_SEQUENCE, end, self.n_past, -(plan.discarded as i64))
            .map_err(|e| SessionError::evaluation("kv shift", e))?;

        self.n_past -= plan.discarded;
        let first = self.positions.partition_point(|&p| p < start);
        let last = self.positions.partition_point(|&p| p < end);
        self.history.drain(first..last);
        self.positions.drain(first..last);
        for position in &mut self.positions[first..] {
            *position -= plan.discarded;
        }

        let sentinel = engine.end_marker_token();
        let mut batch = Batch::new(1);
        batch
            .add(sentinel, self.n_past, true)
            .map_err(|e| SessionError::evaluation("rotation sentinel", e))?;
        engine
            .decode(&batch)
            .map_err(|e| SessionError::evaluation("rotation sentinel", e))?;
        self.record(&[sentinel])?;

        info!(
            "Rotated context: protected {}, discarded {}, n_past {} -> {}",
            plan.protected, plan.discarded, plan.n_past_before, self.n_past
        );
        Ok(plan)
    }

    /// Rotate as many times as needed for `incoming` positions to fit.
    pub fn make_room<E: InferenceEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        incoming: usize,
    ) -> Result<Vec<RotationPlan>, SessionError> {
        let mut plans = Vec::new();
        while self.should_rotate(incoming) {
            plans.push(self.rotate(engine, incoming)?);
        }
        if plans.len() > 1 {
            debug!("{} rotations needed for {} incoming positions", plans.len(), incoming);
        }
        Ok(plans)
    }

    fn exhausted(&self, required: usize) -> SessionError {
        SessionError::RotationExhausted {
            required,
            n_past: self.n_past,
            context_length: self.context_length,
            protected: self.protected_prefix(),
        }
    }
}
