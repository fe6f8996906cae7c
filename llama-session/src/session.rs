//! # Session Controller
//!
//! A [`Session`] owns the native resources of one model and drives its whole
//! lifecycle:
//!
//! ```text
//! load model -> create context -> (warm-up) -> (grammar) -> build sampling chain
//!            -> (restore saved state) -> predict* -> save state -> destroy
//! ```
//!
//! Teardown releases the batch buffer, then the decode context, then the model.
//! Dropping a session runs the same teardown, saving state first when state
//! persistence is configured.
//!
//! A session runs one prediction at a time; `predict` takes `&mut self`. Use
//! [`crate::SharedSession`] to share a session between tasks.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::context::ContextWindow;
use crate::engine::{Backend, Batch, InferenceEngine, TokenId};
use crate::error::SessionError;
use crate::generation::{GenerationLoop, GenerationOutcome, GenerationSettings, PredictRequest};
use crate::guard::{catch_native, NativeBoundary};
use crate::handle::NativeHandle;
use crate::image::ImageEvaluator;
use crate::progress::{LoadProgress, ProgressCallback, ProgressRegistry};
use crate::sampling::{Grammar, SamplingChain, SamplingParams};
use crate::state::{SessionState, SessionStateStore};

pub struct Session<B: Backend> {
    config: SessionConfig,
    batch: NativeHandle<Batch>,
    context: NativeHandle<B::Context>,
    model: NativeHandle<B::Model>,
    window: ContextWindow,
    chain: SamplingChain,
    settings: GenerationSettings,
    state_store: Option<SessionStateStore>,
    image_evaluator: Option<Box<dyn ImageEvaluator>>,
    progress: Arc<ProgressRegistry>,
}

impl<B: Backend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model_path", &self.config.model_path)
            .field("live", &self.is_live())
            .field("n_past", &self.window.n_past())
            .field("stages", &self.chain.stage_names())
            .finish()
    }
}

impl<B: Backend> Session<B> {
    pub fn load(backend: &B, config: SessionConfig) -> Result<Self, SessionError> {
        Self::load_with_progress(backend, config, None)
    }

    /// Load a session, reporting model-load progress to `progress`.
    ///
    /// The callback receives a fraction in `[0, 1]`; returning `false` aborts the load.
    pub fn load_with_progress(
        backend: &B,
        config: SessionConfig,
        progress: Option<ProgressCallback>,
    ) -> Result<Self, SessionError> {
        config.validate().map_err(SessionError::Config)?;
        info!("Loading model from {}", config.model_path.display());

        let registry = Arc::new(ProgressRegistry::new());
        let load_progress = LoadProgress::new(registry.clone(), progress);
        let model_params = config.model_params();
        let model = catch_native(NativeBoundary::ModelLoad, || {
            backend
                .load_model(&config.model_path, &model_params, &load_progress)
                .map_err(SessionError::load)
        })?;
        drop(load_progress);
        let model = NativeHandle::new("model", model);

        let context_params = config.context_params();
        let context = catch_native(NativeBoundary::ContextInit, || {
            let model = model.get()?;
            backend
                .new_context(model, &context_params)
                .map_err(SessionError::load)
        })?;
        let mut context = NativeHandle::new("context", context);

        info!(
            "Model loaded: vocab {}, context length {}, gpu layers {}, mmap {}",
            context.get()?.vocab_size(),
            config.context_length,
            model_params.n_gpu_layers,
            model_params.use_mmap
        );

        if config.warmup {
            warm_up(context.get_mut()?)?;
        }

        let grammar = load_grammar(&config)?;
        let engine = context.get()?;
        let skip_tokens = parse_skip_tokens(engine, &config);
        let chain = SamplingChain::builder(engine.vocab_size(), &config.sampling)
            .context_length(config.context_length)
            .newline_token(engine.newline_token())
            .grammar(grammar)
            .build();
        if chain.is_empty() {
            warn!("Sampling chain could not be built; predictions will fail until it is rebuilt");
        }

        let settings = GenerationSettings::from_config(&config, skip_tokens)?;
        let window = ContextWindow::new(config.context_length, config.protected_prefix());
        let batch = NativeHandle::new("batch", Batch::new(config.n_batch));
        let state_store = config.state_store();

        let mut session = Self {
            config,
            batch,
            context,
            model,
            window,
            chain,
            settings,
            state_store,
            image_evaluator: None,
            progress: registry,
        };
        session.restore_saved_state()?;
        Ok(session)
    }

    pub fn with_image_evaluator(mut self, evaluator: Box<dyn ImageEvaluator>) -> Self {
        self.image_evaluator = Some(evaluator);
        self
    }

    pub fn set_image_evaluator(&mut self, evaluator: Option<Box<dyn ImageEvaluator>>) {
        self.image_evaluator = evaluator;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_live(&self) -> bool {
        self.model.is_live() && self.context.is_live()
    }

    pub fn n_past(&self) -> usize {
        self.window.n_past()
    }

    pub fn history(&self) -> &[TokenId] {
        self.window.history()
    }

    pub fn context_window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn sampling_chain(&self) -> &SamplingChain {
        &self.chain
    }

    pub fn skip_tokens(&self) -> &HashSet<TokenId> {
        &self.settings.skip_tokens
    }

    pub fn progress_registry(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    pub fn model(&self) -> Result<&B::Model, SessionError> {
        self.model.get()
    }

    pub fn engine(&self) -> Result<&B::Context, SessionError> {
        self.context.get()
    }

    pub fn engine_mut(&mut self) -> Result<&mut B::Context, SessionError> {
        self.context.get_mut()
    }

    pub fn system_info(&self) -> Result<String, SessionError> {
        Ok(self.context.get()?.system_info())
    }

    /// Generate a reply to `prompt`, streaming fragments to `callback`.
    ///
    /// Returns the concatenated text passed to the callback.
    pub fn predict<F>(
        &mut self,
        prompt: &str,
        callback: F,
        system_prompt: Option<&str>,
        image: Option<&Path>,
    ) -> Result<String, SessionError>
    where
        F: FnMut(&str, f64) -> bool,
    {
        let mut request = PredictRequest::new(prompt);
        request.system_prompt = system_prompt.map(str::to_string);
        request.image = image.map(Path::to_path_buf);
        Ok(self.predict_request(&request, callback)?.text)
    }

    pub fn predict_request<F>(
        &mut self,
        request: &PredictRequest,
        callback: F,
    ) -> Result<GenerationOutcome, SessionError>
    where
        F: FnMut(&str, f64) -> bool,
    {
        let _model = self.model.get()?;
        let engine = self.context.get_mut()?;
        let batch = self.batch.get_mut()?;

        let n_past_before = self.window.n_past();
        let result = GenerationLoop::new(
            engine,
            &mut self.window,
            &mut self.chain,
            &self.settings,
            batch,
            self.image_evaluator.as_deref_mut(),
        )
        .predict(request, callback);

        match &result {
            Ok(outcome) => debug!(
                "Prediction finished ({}): {} tokens, n_past {} -> {}",
                outcome.finish_reason,
                outcome.tokens.len(),
                n_past_before,
                self.window.n_past()
            ),
            Err(e) => warn!(
                "Prediction failed after n_past {} -> {}: {}",
                n_past_before,
                self.window.n_past(),
                e
            ),
        }
        result
    }

    /// Rebuild the sampling chain from new parameters.
    ///
    /// The grammar carries over and the penalty window is refilled from history
    /// and the pending token.
    pub fn rebuild_sampling(&mut self, params: SamplingParams) -> Result<(), SessionError> {
        params.validate().map_err(SessionError::Config)?;
        let engine = self.context.get()?;
        let chain = SamplingChain::builder(engine.vocab_size(), &params)
            .context_length(self.config.context_length)
            .newline_token(engine.newline_token())
            .grammar(self.chain.grammar().cloned())
            .build();
        self.chain = chain;
        self.chain.observe(&self.window.sampled_tokens());
        self.config.sampling = params;
        info!("Sampling chain rebuilt: {}", self.chain.stage_names().join(" -> "));
        Ok(())
    }

    /// Forget everything evaluated so far.
    pub fn reset_context(&mut self) -> Result<(), SessionError> {
        self.context.get_mut()?.kv_clear();
        self.window.reset();
        self.chain.reset_penalty_history();
        debug!("Context reset");
        Ok(())
    }

    /// Current history, `n_past`, image spans, pending token and engine snapshot.
    pub fn snapshot_state(&self) -> Result<SessionState, SessionError> {
        let engine = self.context.get()?;
        let engine_snapshot = engine.state_snapshot().map_err(|e| {
            let path = self
                .state_store
                .as_ref()
                .map(|s| s.path().to_path_buf())
                .unwrap_or_default();
            SessionError::state_io(path, e)
        })?;
        Ok(SessionState {
            tokens: self.window.history().to_vec(),
            n_past: self.window.n_past(),
            image_spans: self.window.image_spans(),
            pending: self.window.pending(),
            engine_snapshot,
        })
    }

    /// Write state to the configured state file.
    ///
    /// Returns `false` when persistence is off or the context is gone.
    pub fn save_state(&self) -> Result<bool, SessionError> {
        let Some(store) = &self.state_store else {
            return Ok(false);
        };
        if !self.context.is_live() {
            debug!("Context released; not saving state to {}", store.path().display());
            return Ok(false);
        }
        store.save(&self.snapshot_state()?)?;
        Ok(true)
    }

    /// Save state (if configured) and release batch, context and model in that order.
    ///
    /// Calling it again is a no-op.
    pub fn destroy(&mut self) -> Result<(), SessionError> {
        let saved = self.save_state();

        let released = [
            self.batch.release(),
            self.context.release(),
            self.model.release(),
        ];
        if released.iter().any(|r| *r) {
            info!("Session for {} destroyed", self.config.model_path.display());
        }
        saved.map(|_| ())
    }

    fn restore_saved_state(&mut self) -> Result<(), SessionError> {
        let Some(store) = self.state_store.clone() else {
            return Ok(());
        };
        let state = match store.load() {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Ignoring saved session state: {}", e);
                return Ok(());
            }
        };

        if let Err(e) = self
            .window
            .restore(state.tokens.clone(), state.n_past, &state.image_spans)
        {
            warn!("Ignoring saved session state from {}: {}", store.path().display(), e);
            return Ok(());
        }
        self.window.set_pending(state.pending);

        let engine = self.context.get_mut()?;
        if !state.engine_snapshot.is_empty() {
            if let Err(e) = engine.restore_snapshot(&state.engine_snapshot) {
                warn!(
                    "Engine rejected saved state from {}: {}; starting empty",
                    store.path().display(),
                    e
                );
                engine.kv_clear();
                self.window.reset();
                return Ok(());
            }
        } else if state.n_past > 0 {
            if !state.image_spans.is_empty() {
                warn!(
                    "Saved state has no engine snapshot and {} image spans to replay; starting empty",
                    state.image_spans.len()
                );
                self.window.reset();
                return Ok(());
            }
            if let Err(e) = replay(
                engine,
                self.batch.get_mut()?,
                &state.tokens,
                self.config.n_batch,
            ) {
                warn!("Replaying saved history failed: {}; starting empty", e);
                engine.kv_clear();
                self.window.reset();
                return Ok(());
            }
        }

        self.chain.observe(&self.window.sampled_tokens());
        info!(
            "Restored session state: {} tokens, n_past {}",
            self.window.history().len(),
            self.window.n_past()
        );
        Ok(())
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Failed to save session state during teardown: {}", e);
        }
    }
}

/// Decode `[bos, eos]` once and clear the cache.
fn warm_up<E: InferenceEngine>(engine: &mut E) -> Result<(), SessionError> {
    catch_native(NativeBoundary::Warmup, || {
        let mut batch = Batch::new(2);
        batch
            .fill(&[engine.begin_marker_token(), engine.end_marker_token()], 0)
            .map_err(|e| SessionError::evaluation("warm-up", e))?;
        engine
            .decode(&batch)
            .map_err(|e| SessionError::evaluation("warm-up", e))?;
        engine.kv_clear();
        debug!("Warm-up decode complete");
        Ok(())
    })
}

fn load_grammar(config: &SessionConfig) -> Result<Option<Grammar>, SessionError> {
    let Some(path) = &config.grammar_path else {
        return Ok(None);
    };
    match catch_native(NativeBoundary::GrammarLoad, || Grammar::from_file(path)) {
        Ok(grammar) => {
            info!("Grammar loaded from {}", path.display());
            Ok(Some(grammar))
        }
        Err(e) if config.strict_grammar => Err(e),
        Err(e) => {
            warn!("Continuing without grammar: {}", e);
            Ok(None)
        }
    }
}

/// Resolve configured skip tokens. Strings must map to exactly one token.
fn parse_skip_tokens<E: InferenceEngine>(engine: &E, config: &SessionConfig) -> HashSet<TokenId> {
    let vocab = engine.vocab_size();
    let mut skip = HashSet::new();

    for text in &config.skip_tokens {
        match engine.tokenize(text, false, true) {
            Ok(tokens) if tokens.len() == 1 => {
                skip.insert(tokens[0]);
            }
            Ok(tokens) => warn!(
                "Skip token {:?} maps to {} tokens, expected 1; ignoring",
                text,
                tokens.len()
            ),
            Err(e) => warn!("Skip token {:?} could not be tokenized: {}", text, e),
        }
    }
    for id in &config.skip_token_ids {
        if usize::try_from(*id).is_ok_and(|i| i < vocab) {
            skip.insert(*id);
        } else {
            warn!("Skip token id {} is outside the vocabulary ({}); ignoring", id, vocab);
        }
    }

    if !skip.is_empty() {
        debug!("Skip tokens: {:?}", skip);
    }
    skip
}

fn replay<E: InferenceEngine>(
    engine: &mut E,
    batch: &mut Batch,
    tokens: &[TokenId],
    n_batch: usize,
) -> Result<(), SessionError> {
    engine.kv_clear();
    for (i, chunk) in tokens.chunks(n_batch.max(1)).enumerate() {
        batch
            .fill(chunk, i * n_batch.max(1))
            .map_err(|e| SessionError::evaluation("saved history", e))?;
        engine
            .decode(batch)
            .map_err(|e| SessionError::evaluation("saved history", e))?;
    }
    debug!("Replayed {} saved tokens", tokens.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticBackend, SyntheticModel};

    fn backend() -> SyntheticBackend {
        let mut model = SyntheticModel::with_pieces(&["2", "+", "=", "<|sep|>"]);
        model.script(&["=", " 4", "."]);
        SyntheticBackend::new(model)
    }

    fn config() -> SessionConfig {
        SessionConfig {
            context_length: 64,
            n_batch: 8,
            sampling: SamplingParams::greedy(),
            ..SessionConfig::new("tiny.gguf")
        }
    }

    #[test]
    fn test_destroy_releases_in_order_and_is_idempotent() {
        let mut session = Session::load(&backend(), config()).unwrap();
        assert!(session.is_live());
        session.destroy().unwrap();
        assert!(!session.is_live());
        assert!(matches!(session.engine(), Err(SessionError::InvalidHandle("context"))));
        assert!(matches!(
            session.predict("2+2=", |_, _| false, None, None),
            Err(SessionError::InvalidHandle(_))
        ));
        session.destroy().unwrap();
    }

    #[test]
    fn test_skip_tokens_resolved_from_strings_and_ids() {
        let mut config = config();
        config.skip_tokens = vec!["<|sep|>".to_string(), "2+".to_string()];
        config.skip_token_ids = vec![3, 9999];
        let session = Session::load(&backend(), config).unwrap();
        let sep = session.engine().unwrap().model().token("<|sep|>").unwrap();
        assert!(session.skip_tokens().contains(&sep));
        assert!(session.skip_tokens().contains(&3));
        assert_eq!(session.skip_tokens().len(), 2);
    }

    #[test]
    fn test_rebuild_sampling_keeps_history() {
        let mut session = Session::load(&backend(), config()).unwrap();
        session.predict("2+2=", |_, _| false, None, None).unwrap();
        let history = session.history().to_vec();

        let params = SamplingParams {
            penalty_last_n: 8,
            penalty_repeat: 1.2,
            ..SamplingParams::greedy()
        };
        session.rebuild_sampling(params).unwrap();
        assert_eq!(session.sampling_chain().stage_names(), vec!["penalties", "greedy"]);
        assert_eq!(session.history(), history.as_slice());
        assert!(!session.sampling_chain().penalty_window().is_empty());

        let invalid = SamplingParams {
            top_p: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            session.rebuild_sampling(invalid),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_reset_context_clears_window() {
        let mut session = Session::load(&backend(), config()).unwrap();
        session.predict("2+2=", |_, _| false, None, None).unwrap();
        assert!(session.n_past() > 0);
        session.reset_context().unwrap();
        assert_eq!(session.n_past(), 0);
        assert!(session.engine().unwrap().occupied_positions().is_empty());
    }

    #[test]
    fn test_system_info_comes_from_engine() {
        let session = Session::load(&backend(), config()).unwrap();
        assert!(session.system_info().unwrap().contains("synthetic"));
    }
}
