//! # Synthetic Engine
//!
//! A deterministic, table-driven [`Backend`] for tests and demos.
//!
//! - The vocabulary is a list of byte pieces. Token `0` is `<s>`, token `1` is
//!   `</s>`. Tokenization is greedy longest-match over the pieces.
//! - Logits depend only on the last decoded token: a transition table names the
//!   favoured next token (end of sequence when absent), which gets a logit of
//!   [`FAVOURED_LOGIT`] while every other token gets `0.0`.
//! - The KV cache is a position-to-token map that honours `seq_rm` / `seq_add`
//!   and rejects positions outside the context.
//! - Decode failures and native panics can be injected, and every decode is
//!   logged for assertions.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace};

use crate::engine::{
    Backend, Batch, BatchEntry, ContextParams, InferenceEngine, ModelParams, TokenId,
    MAIN_SEQUENCE,
};
use crate::error::EngineError;
use crate::image::ImageEvaluator;
use crate::progress::LoadProgress;

pub const BOS: TokenId = 0;
pub const EOS: TokenId = 1;

/// Logit of the favoured next token.
pub const FAVOURED_LOGIT: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceKind {
    Normal,
    Control,
    EndOfGeneration,
}

#[derive(Debug, Clone)]
struct Piece {
    bytes: Vec<u8>,
    kind: PieceKind,
}

/// Vocabulary plus transition table.
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    pieces: Vec<Piece>,
    transitions: HashMap<TokenId, TokenId>,
    fallback: TokenId,
    encoder: Option<Option<TokenId>>,
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticModel {
    pub fn new() -> Self {
        Self {
            pieces: vec![
                Piece {
                    bytes: b"<s>".to_vec(),
                    kind: PieceKind::Control,
                },
                Piece {
                    bytes: b"</s>".to_vec(),
                    kind: PieceKind::Control,
                },
            ],
            transitions: HashMap::new(),
            fallback: EOS,
            encoder: None,
        }
    }

    /// A model whose vocabulary holds the given pieces, in order, after `<s>` and `</s>`.
    pub fn with_pieces<S: AsRef<[u8]>>(pieces: &[S]) -> Self {
        let mut model = Self::new();
        for piece in pieces {
            model.add_piece(piece);
        }
        model
    }

    fn add(&mut self, bytes: &[u8], kind: PieceKind) -> TokenId {
        if let Some(existing) = self.find(bytes) {
            return existing;
        }
        self.pieces.push(Piece {
            bytes: bytes.to_vec(),
            kind,
        });
        (self.pieces.len() - 1) as TokenId
    }

    /// Add a normal piece, returning its id (or the existing id).
    pub fn add_piece<S: AsRef<[u8]>>(&mut self, bytes: S) -> TokenId {
        self.add(bytes.as_ref(), PieceKind::Normal)
    }

    /// Add a control token, matched only when special-token parsing is on.
    pub fn add_control(&mut self, text: &str) -> TokenId {
        self.add(text.as_bytes(), PieceKind::Control)
    }

    /// Add a control token that also ends generation.
    pub fn add_end_of_generation(&mut self, text: &str) -> TokenId {
        self.add(text.as_bytes(), PieceKind::EndOfGeneration)
    }

    fn find(&self, bytes: &[u8]) -> Option<TokenId> {
        self.pieces
            .iter()
            .position(|p| p.bytes == bytes)
            .map(|i| i as TokenId)
    }

    pub fn token(&self, text: &str) -> Option<TokenId> {
        self.find(text.as_bytes())
    }

    /// After `prev`, favour `next`.
    pub fn link(&mut self, prev: TokenId, next: TokenId) {
        self.transitions.insert(prev, next);
    }

    /// Link consecutive pieces, adding any that are missing.
    pub fn script<S: AsRef<[u8]>>(&mut self, pieces: &[S]) {
        let ids: Vec<TokenId> = pieces.iter().map(|p| self.add_piece(p)).collect();
        for pair in ids.windows(2) {
            self.link(pair[0], pair[1]);
        }
    }

    /// Token favoured after any token without a transition.
    pub fn set_fallback(&mut self, token: TokenId) {
        self.fallback = token;
    }

    /// Report an encoder with the given decoder start token.
    pub fn with_encoder(mut self, decoder_start: Option<TokenId>) -> Self {
        self.encoder = Some(decoder_start);
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, token: TokenId) -> Option<&[u8]> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.pieces.get(i))
            .map(|p| p.bytes.as_slice())
    }

    pub fn next_token(&self, prev: TokenId) -> TokenId {
        self.transitions.get(&prev).copied().unwrap_or(self.fallback)
    }

    pub fn logits_after(&self, prev: TokenId) -> Vec<f32> {
        let mut logits = vec![0.0; self.pieces.len()];
        if let Ok(next) = usize::try_from(self.next_token(prev)) {
            if let Some(slot) = logits.get_mut(next) {
                *slot = FAVOURED_LOGIT;
            }
        }
        logits
    }

    pub fn tokenize(
        &self,
        text: &str,
        add_begin_marker: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, EngineError> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::new();
        if add_begin_marker {
            tokens.push(BOS);
        }

        let mut i = 0;
        while i < bytes.len() {
            let best = self
                .pieces
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.bytes.is_empty())
                .filter(|(_, p)| parse_special || p.kind == PieceKind::Normal)
                .filter(|(_, p)| bytes[i..].starts_with(&p.bytes))
                .max_by_key(|(id, p)| (p.bytes.len(), std::cmp::Reverse(*id)));
            match best {
                Some((id, piece)) => {
                    tokens.push(id as TokenId);
                    i += piece.bytes.len();
                }
                None => {
                    return Err(EngineError::tokenization(format!(
                        "no piece for byte 0x{:02x} at offset {}",
                        bytes[i], i
                    )))
                }
            }
        }
        Ok(tokens)
    }

    /// Concatenated bytes of normal pieces; control tokens render as nothing.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8> {
        tokens
            .iter()
            .filter_map(|t| {
                let index = usize::try_from(*t).ok()?;
                let piece = self.pieces.get(index)?;
                (piece.kind == PieceKind::Normal).then_some(piece.bytes.as_slice())
            })
            .flatten()
            .copied()
            .collect()
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS
            || usize::try_from(token)
                .ok()
                .and_then(|i| self.pieces.get(i))
                .is_some_and(|p| p.kind == PieceKind::EndOfGeneration)
    }
}

/// Decode context over a [`SyntheticModel`].
#[derive(Debug)]
pub struct SyntheticContext {
    model: Arc<SyntheticModel>,
    context_length: usize,
    cells: BTreeMap<usize, TokenId>,
    logits: Option<Vec<f32>>,
    decode_log: Vec<Vec<BatchEntry>>,
    encode_log: Vec<Vec<TokenId>>,
    fail_after: Option<(usize, i32)>,
    refuse_restore: bool,
}

impl SyntheticContext {
    pub fn new(model: Arc<SyntheticModel>, context_length: usize) -> Self {
        Self {
            model,
            context_length,
            cells: BTreeMap::new(),
            logits: None,
            decode_log: Vec::new(),
            encode_log: Vec::new(),
            fail_after: None,
            refuse_restore: false,
        }
    }

    pub fn model(&self) -> &SyntheticModel {
        &self.model
    }

    /// Let `successes` more decodes succeed, then fail one with `status`.
    pub fn fail_decode_after(&mut self, successes: usize, status: i32) {
        self.fail_after = Some((successes, status));
    }

    /// Every successful decode, in order.
    pub fn decode_log(&self) -> &[Vec<BatchEntry>] {
        &self.decode_log
    }

    /// Tokens of every successful decode, flattened.
    pub fn decoded_tokens(&self) -> Vec<TokenId> {
        self.decode_log
            .iter()
            .flat_map(|b| b.iter().map(|e| e.token))
            .collect()
    }

    pub fn encode_log(&self) -> &[Vec<TokenId>] {
        &self.encode_log
    }

    pub fn occupied_positions(&self) -> Vec<usize> {
        self.cells.keys().copied().collect()
    }

    pub fn token_at(&self, position: usize) -> Option<TokenId> {
        self.cells.get(&position).copied()
    }

    fn position(&self, entry: &BatchEntry) -> Result<usize, EngineError> {
        usize::try_from(entry.position)
            .ok()
            .filter(|p| *p < self.context_length)
            .ok_or(EngineError::decode(1))
    }
}

impl InferenceEngine for SyntheticContext {
    fn decode(&mut self, batch: &Batch) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Err(EngineError::decode(-1));
        }
        if let Some((remaining, status)) = self.fail_after {
            if remaining == 0 {
                self.fail_after = None;
                debug!("Injected decode failure with status {}", status);
                return Err(EngineError::decode(status));
            }
            self.fail_after = Some((remaining - 1, status));
        }

        let mut positions = Vec::with_capacity(batch.len());
        for entry in batch.entries() {
            if entry.sequence != MAIN_SEQUENCE {
                return Err(EngineError::decode(1));
            }
            positions.push(self.position(entry)?);
        }

        let mut logits = None;
        for (entry, position) in batch.entries().iter().zip(positions) {
            self.cells.insert(position, entry.token);
            if entry.want_logits {
                logits = Some(self.model.logits_after(entry.token));
            }
        }
        self.logits = logits;
        trace!("Synthetic decode of {} tokens", batch.len());
        self.decode_log.push(batch.entries().to_vec());
        Ok(())
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        self.logits.as_deref().ok_or(EngineError::NoLogits)
    }

    fn tokenize(
        &self,
        text: &str,
        add_begin_marker: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, EngineError> {
        self.model.tokenize(text, add_begin_marker, parse_special)
    }

    fn token_to_piece(&self, token: TokenId, render_special: bool) -> Result<Vec<u8>, EngineError> {
        let index = usize::try_from(token).map_err(|_| EngineError::Piece {
            token,
            message: "negative token id".to_string(),
        })?;
        let piece = self.model.pieces.get(index).ok_or_else(|| EngineError::Piece {
            token,
            message: "out of vocabulary".to_string(),
        })?;
        if piece.kind != PieceKind::Normal && !render_special {
            return Ok(Vec::new());
        }
        Ok(piece.bytes.clone())
    }

    fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    fn begin_marker_token(&self) -> TokenId {
        BOS
    }

    fn end_marker_token(&self) -> TokenId {
        EOS
    }

    fn newline_token(&self) -> Option<TokenId> {
        self.model.token("\n")
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_end_of_generation(token)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn kv_seq_rm(&mut self, sequence: i32, p0: usize, p1: usize) -> Result<(), EngineError> {
        if sequence != MAIN_SEQUENCE {
            return Err(EngineError::KvCache(format!("unknown sequence {}", sequence)));
        }
        self.cells.retain(|pos, _| *pos < p0 || *pos >= p1);
        Ok(())
    }

    fn kv_seq_add(
        &mut self,
        sequence: i32,
        p0: usize,
        p1: usize,
        delta: i64,
    ) -> Result<(), EngineError> {
        if sequence != MAIN_SEQUENCE {
            return Err(EngineError::KvCache(format!("unknown sequence {}", sequence)));
        }
        let moved: Vec<(usize, TokenId)> = self.cells.range(p0..p1).map(|(p, t)| (*p, *t)).collect();
        for (pos, _) in &moved {
            self.cells.remove(pos);
        }
        for (pos, token) in moved {
            let shifted = usize::try_from(pos as i64 + delta)
                .map_err(|_| EngineError::KvCache(format!("position {} shifted below zero", pos)))?;
            self.cells.insert(shifted, token);
        }
        Ok(())
    }

    fn kv_clear(&mut self) {
        self.cells.clear();
        self.logits = None;
    }

    fn has_encoder(&self) -> bool {
        self.model.encoder.is_some()
    }

    fn encode(&mut self, batch: &Batch) -> Result<(), EngineError> {
        if !self.has_encoder() {
            return Err(EngineError::Unsupported("encode"));
        }
        self.encode_log
            .push(batch.entries().iter().map(|e| e.token).collect());
        Ok(())
    }

    fn decoder_start_token(&self) -> Option<TokenId> {
        self.model.encoder.flatten()
    }

    fn state_snapshot(&self) -> Result<Vec<u8>, EngineError> {
        let mut buf = BytesMut::with_capacity(4 + self.cells.len() * 8);
        buf.put_u32_le(self.cells.len() as u32);
        for (pos, token) in &self.cells {
            buf.put_u32_le(*pos as u32);
            buf.put_i32_le(*token);
        }
        Ok(buf.to_vec())
    }

    fn restore_snapshot(&mut self, snapshot: &[u8]) -> Result<(), EngineError> {
        if self.refuse_restore {
            return Err(EngineError::State("snapshot rejected".to_string()));
        }
        let mut buf = snapshot;
        if buf.remaining() < 4 {
            return Err(EngineError::State("snapshot too short".to_string()));
        }
        let count = buf.get_u32_le() as usize;
        if buf.remaining() != count * 8 {
            return Err(EngineError::State("snapshot length mismatch".to_string()));
        }
        let mut cells = BTreeMap::new();
        for _ in 0..count {
            let pos = buf.get_u32_le() as usize;
            let token = buf.get_i32_le();
            if pos >= self.context_length {
                return Err(EngineError::State(format!("position {} outside context", pos)));
            }
            cells.insert(pos, token);
        }
        self.cells = cells;
        self.logits = None;
        Ok(())
    }

    fn system_info(&self) -> String {
        format!(
            "synthetic engine | vocab {} | n_ctx {}",
            self.model.vocab_size(),
            self.context_length
        )
    }
}

/// Fault switches for [`SyntheticBackend`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticFaults {
    /// `load_model` returns this error.
    pub load_error: Option<String>,
    /// `load_model` panics.
    pub panic_on_load: bool,
    /// `new_context` panics.
    pub panic_on_context: bool,
    /// Contexts reject `restore_snapshot`.
    pub refuse_restore: bool,
}

#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    model: Arc<SyntheticModel>,
    faults: SyntheticFaults,
    load_steps: usize,
}

impl SyntheticBackend {
    pub fn new(model: SyntheticModel) -> Self {
        Self {
            model: Arc::new(model),
            faults: SyntheticFaults::default(),
            load_steps: 4,
        }
    }

    pub fn with_faults(mut self, faults: SyntheticFaults) -> Self {
        self.faults = faults;
        self
    }

    pub fn model(&self) -> &SyntheticModel {
        &self.model
    }
}

impl Backend for SyntheticBackend {
    type Model = Arc<SyntheticModel>;
    type Context = SyntheticContext;

    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
        progress: &LoadProgress,
    ) -> Result<Self::Model, EngineError> {
        if self.faults.panic_on_load {
            panic!("synthetic fault while loading {}", path.display());
        }
        if let Some(message) = &self.faults.load_error {
            return Err(EngineError::load(message));
        }
        debug!(
            "Synthetic load of {} (gpu layers {}, mmap {})",
            path.display(),
            params.n_gpu_layers,
            params.use_mmap
        );
        for step in 0..=self.load_steps {
            let fraction = step as f32 / self.load_steps.max(1) as f32;
            if !progress.report(fraction) {
                return Err(EngineError::load("model load aborted by progress callback"));
            }
        }
        Ok(self.model.clone())
    }

    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError> {
        if self.faults.panic_on_context {
            panic!("synthetic fault while creating context");
        }
        if params.context_length == 0 {
            return Err(EngineError::load("context length must be positive"));
        }
        let mut context = SyntheticContext::new(model.clone(), params.context_length);
        context.refuse_restore = self.faults.refuse_restore;
        Ok(context)
    }
}

/// Image evaluator that writes `positions` copies of one token.
#[derive(Debug, Clone)]
pub struct SyntheticImageEvaluator {
    pub positions: usize,
    pub token: TokenId,
    pub fail: bool,
    pub panic: bool,
}

impl SyntheticImageEvaluator {
    pub fn new(positions: usize, token: TokenId) -> Self {
        Self {
            positions,
            token,
            fail: false,
            panic: false,
        }
    }
}

impl ImageEvaluator for SyntheticImageEvaluator {
    fn embedding_len(&self, image: &Path) -> Result<usize, String> {
        if self.fail {
            return Err(format!("cannot read {}", image.display()));
        }
        Ok(self.positions)
    }

    fn evaluate(
        &mut self,
        engine: &mut dyn InferenceEngine,
        image: &Path,
        n_batch: usize,
        n_past: usize,
    ) -> Result<usize, String> {
        if self.panic {
            panic!("synthetic fault while embedding {}", image.display());
        }
        let tokens = vec![self.token; self.positions];
        let mut batch = Batch::new(n_batch.max(1));
        for (i, chunk) in tokens.chunks(n_batch.max(1)).enumerate() {
            batch
                .fill(chunk, n_past + i * n_batch.max(1))
                .map_err(|e| e.to_string())?;
            engine.decode(&batch).map_err(|e| e.to_string())?;
        }
        Ok(self.positions)
    }
}
