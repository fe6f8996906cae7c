//! # Generation Loop
//!
//! One `predict` call runs these stages in order:
//!
//! 1. A token left pending by the previous prediction is evaluated.
//! 2. The system prompt, tokenized without special-token parsing, is evaluated
//!    first so it sits before any user content.
//! 3. An image, if given, is embedded by the [`ImageEvaluator`] and occupies
//!    the next positions.
//! 4. The prompt is rendered through the prompt template and tokenized.
//! 5. Prompt tokens are evaluated in batches of at most `n_batch`, rotating the
//!    context before any batch that would overflow it.
//! 6. Tokens are sampled one at a time. Each token is accepted by the sampling
//!    chain, decoded to text, passed to the callback, checked against the
//!    stoppers and, if generation continues, fed back as a batch of one.
//!    When a stopper or the callback ends generation on a token that is not
//!    end-of-generation, that token is left pending instead of being decoded.
//!
//! `n_past` only moves after a decode succeeds, so a failed evaluation leaves
//! the context window at its pre-batch state.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::context::ContextWindow;
use crate::decoder::Utf8Decoder;
use crate::engine::{Batch, InferenceEngine, TokenId};
use crate::error::SessionError;
use crate::guard::{catch_native, NativeBoundary};
use crate::image::ImageEvaluator;
use crate::prompt::PromptTemplate;
use crate::sampling::SamplingChain;
use crate::stopper::{
    first_reason, EosStopper, FinishReason, MaxBytesStopper, MaxTokensStopper, Stopper, TokenStep,
};

mod request;

pub use request::{GenerationOutcome, PredictRequest};

/// Per-session generation settings resolved at load time.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub n_batch: usize,
    pub template: PromptTemplate,
    pub add_bos: bool,
    pub add_eos: bool,
    pub parse_special: bool,
    pub skip_tokens: HashSet<TokenId>,
    pub max_output_tokens: Option<usize>,
    pub max_output_bytes: Option<usize>,
    pub clear_penalty_history_on_rotate: bool,
}

impl GenerationSettings {
    pub fn from_config(
        config: &SessionConfig,
        skip_tokens: HashSet<TokenId>,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            n_batch: config.n_batch,
            template: config.prompt_template()?,
            add_bos: config.add_bos_token,
            add_eos: config.add_eos_token,
            parse_special: config.parse_special_tokens,
            skip_tokens,
            max_output_tokens: config.max_output_tokens,
            max_output_bytes: config.max_output_bytes,
            clear_penalty_history_on_rotate: config.clear_penalty_history_on_rotate,
        })
    }

    fn stoppers(&self) -> Vec<Box<dyn Stopper>> {
        let mut stoppers: Vec<Box<dyn Stopper>> = vec![Box::new(EosStopper::new())];
        if let Some(max_tokens) = self.max_output_tokens {
            stoppers.push(Box::new(MaxTokensStopper::new(max_tokens)));
        }
        if let Some(max_bytes) = self.max_output_bytes {
            stoppers.push(Box::new(MaxBytesStopper::new(max_bytes)));
        }
        stoppers
    }
}

/// Borrowed view of a session for the duration of one prediction.
pub struct GenerationLoop<'a, E: InferenceEngine> {
    engine: &'a mut E,
    window: &'a mut ContextWindow,
    chain: &'a mut SamplingChain,
    settings: &'a GenerationSettings,
    image_evaluator: Option<&'a mut (dyn ImageEvaluator + 'static)>,
    batch: &'a mut Batch,
    started: Instant,
    rotations: usize,
}

impl<'a, E: InferenceEngine> GenerationLoop<'a, E> {
    /// `batch` must hold at least `settings.n_batch` entries.
    pub fn new(
        engine: &'a mut E,
        window: &'a mut ContextWindow,
        chain: &'a mut SamplingChain,
        settings: &'a GenerationSettings,
        batch: &'a mut Batch,
        image_evaluator: Option<&'a mut (dyn ImageEvaluator + 'static)>,
    ) -> Self {
        Self {
            engine,
            window,
            chain,
            settings,
            image_evaluator,
            batch,
            started: Instant::now(),
            rotations: 0,
        }
    }

    /// Run one prediction. `callback(fragment, elapsed_seconds)` returns `true` to stop.
    pub fn predict<F>(
        mut self,
        request: &PredictRequest,
        mut callback: F,
    ) -> Result<GenerationOutcome, SessionError>
    where
        F: FnMut(&str, f64) -> bool,
    {
        self.eval_pending()?;
        let n_past_at_start = self.window.n_past();
        let mut prompt_tokens = 0;

        let inline_system = self.settings.template.embeds_system_prompt();
        if let Some(system_prompt) = request.system_prompt().filter(|_| !inline_system) {
            prompt_tokens += self.eval_system_prompt(system_prompt)?;
        }

        if let Some(image) = request.image() {
            self.eval_image(image)?;
        }

        let rendered = self
            .settings
            .template
            .render(&request.prompt, request.system_prompt());
        let tokens = self.tokenize_prompt(&rendered)?;
        if tokens.is_empty() && self.window.n_past() == 0 {
            return Err(SessionError::EmptyPrompt);
        }
        let tokens = self.encode_if_needed(tokens)?;
        prompt_tokens += tokens.len();
        self.evaluate(&tokens, "prompt")?;

        debug!(
            "Prompt evaluated: {} tokens, n_past {} -> {}",
            prompt_tokens,
            n_past_at_start,
            self.window.n_past()
        );

        self.generate(prompt_tokens, &mut callback)
    }

    /// The pending token was already accepted by the chain, so it is decoded
    /// and recorded without feeding the penalty window again.
    fn eval_pending(&mut self) -> Result<(), SessionError> {
        let Some(token) = self.window.pending() else {
            return Ok(());
        };
        self.decode_one(token, "pending token")?;
        self.window.set_pending(None);
        trace!("Evaluated pending token {}", token);
        Ok(())
    }

    fn eval_system_prompt(&mut self, system_prompt: &str) -> Result<usize, SessionError> {
        let add_bos = self.settings.add_bos && self.window.n_past() == 0;
        let tokens = self
            .engine
            .tokenize(system_prompt, add_bos, false)
            .map_err(SessionError::Tokenization)?;
        debug!("System prompt: {} tokens", tokens.len());
        self.evaluate(&tokens, "system prompt")?;
        Ok(tokens.len())
    }

    fn eval_image(&mut self, image: &std::path::Path) -> Result<(), SessionError> {
        let evaluator = self
            .image_evaluator
            .as_deref_mut()
            .ok_or_else(|| SessionError::Image("no image evaluator configured".to_string()))?;
        let positions = evaluator.embedding_len(image).map_err(SessionError::Image)?;

        self.rotations += self.make_room(positions)?;

        let n_past = self.window.n_past();
        let n_batch = self.settings.n_batch;
        let engine: &mut dyn InferenceEngine = &mut *self.engine;
        let evaluator = self
            .image_evaluator
            .as_deref_mut()
            .ok_or_else(|| SessionError::Image("no image evaluator configured".to_string()))?;
        let written = catch_native(NativeBoundary::ImageEmbed, || {
            evaluator
                .evaluate(engine, image, n_batch, n_past)
                .map_err(SessionError::Image)
        })?;

        self.window.advance(written)?;
        debug!("Image {} occupied {} positions", image.display(), written);
        Ok(())
    }

    fn tokenize_prompt(&mut self, text: &str) -> Result<Vec<TokenId>, SessionError> {
        let add_bos = self.settings.add_bos && self.window.n_past() == 0;
        let mut tokens = self
            .engine
            .tokenize(text, add_bos, self.settings.parse_special)
            .map_err(SessionError::Tokenization)?;
        if self.settings.add_eos && !text.is_empty() {
            tokens.push(self.engine.end_marker_token());
        }
        trace!("Prompt tokens: {:?}", tokens);
        Ok(tokens)
    }

    /// Encoder-decoder models consume the prompt in the encoder; the decoder
    /// starts from its start token.
    fn encode_if_needed(&mut self, tokens: Vec<TokenId>) -> Result<Vec<TokenId>, SessionError> {
        if !self.engine.has_encoder() || tokens.is_empty() {
            return Ok(tokens);
        }
        for chunk in tokens.chunks(self.settings.n_batch.max(1)) {
            self.batch
                .fill(chunk, 0)
                .map_err(|e| SessionError::evaluation("encoder", e))?;
            self.engine
                .encode(self.batch)
                .map_err(|e| SessionError::evaluation("encoder", e))?;
        }
        let start = self
            .engine
            .decoder_start_token()
            .unwrap_or_else(|| self.engine.begin_marker_token());
        debug!("Encoded {} prompt tokens; decoder starts at {}", tokens.len(), start);
        Ok(vec![start])
    }

    fn make_room(&mut self, incoming: usize) -> Result<usize, SessionError> {
        let rotated = self.window.make_room(&mut *self.engine, incoming)?.len();
        if rotated > 0 && self.settings.clear_penalty_history_on_rotate {
            self.chain.reset_penalty_history();
        }
        Ok(rotated)
    }

    /// Evaluate `tokens` in `n_batch` chunks, recording each chunk after its decode.
    fn evaluate(&mut self, tokens: &[TokenId], stage: &'static str) -> Result<(), SessionError> {
        for chunk in tokens.chunks(self.settings.n_batch.max(1)) {
            self.rotations += self.make_room(chunk.len())?;
            self.batch
                .fill(chunk, self.window.n_past())
                .map_err(|e| SessionError::evaluation(stage, e))?;
            self.engine
                .decode(self.batch)
                .map_err(|e| SessionError::evaluation(stage, e))?;
            self.window.record(chunk)?;
            self.chain.observe(chunk);
            trace!("Evaluated {} {} tokens, n_past {}", chunk.len(), stage, self.window.n_past());
        }
        Ok(())
    }

    fn generate<F>(
        &mut self,
        prompt_tokens: usize,
        callback: &mut F,
    ) -> Result<GenerationOutcome, SessionError>
    where
        F: FnMut(&str, f64) -> bool,
    {
        let mut stoppers = self.settings.stoppers();
        let mut decoder = Utf8Decoder::new();
        let mut text = String::new();
        let mut generated = Vec::new();

        let finish_reason = loop {
            let logits = self
                .engine
                .logits()
                .map_err(|e| SessionError::evaluation("logits", e))?;
            let token = self.chain.sample(logits)?;
            self.chain.accept(token);
            generated.push(token);

            let is_end_of_generation = self.engine.is_end_of_generation(token);
            let fragment = if is_end_of_generation || self.settings.skip_tokens.contains(&token) {
                String::new()
            } else {
                let piece = self
                    .engine
                    .token_to_piece(token, false)
                    .map_err(SessionError::Tokenization)?;
                decoder.push(&piece)
            };
            trace!("Sampled token {} -> {:?}", token, fragment);

            if !fragment.is_empty() {
                text.push_str(&fragment);
                if callback(&fragment, self.started.elapsed().as_secs_f64()) {
                    break FinishReason::Cancelled;
                }
            }

            let step = TokenStep {
                token,
                is_end_of_generation,
                emitted: &fragment,
            };
            if let Some(reason) = first_reason(&mut stoppers, &step) {
                break reason;
            }

            self.decode_one(token, "generated token")?;
        };

        if let Some(&last) = generated.last() {
            if !self.engine.is_end_of_generation(last) {
                self.window.set_pending(Some(last));
            }
        }

        let dropped = decoder.finish();
        if dropped > 0 {
            debug!("Dropped {} incomplete UTF-8 bytes at end of generation", dropped);
        }

        let elapsed = self.started.elapsed();
        debug!(
            "Generation finished ({}): {} tokens, {} bytes, {} rotations in {:.2}s",
            finish_reason,
            generated.len(),
            text.len(),
            self.rotations,
            elapsed.as_secs_f64()
        );

        Ok(GenerationOutcome {
            text,
            tokens: generated,
            finish_reason,
            prompt_tokens,
            rotations: self.rotations,
            elapsed,
        })
    }

    fn decode_one(&mut self, token: TokenId, stage: &'static str) -> Result<(), SessionError> {
        self.rotations += self.make_room(1)?;
        self.batch
            .fill(&[token], self.window.n_past())
            .map_err(|e| SessionError::evaluation(stage, e))?;
        self.engine
            .decode(self.batch)
            .map_err(|e| SessionError::evaluation(stage, e))?;
        self.window.record(&[token])?;
        Ok(())
    }
}
