//! # Sampling Chain
//!
//! A [`SamplingChain`] turns the logits of the last evaluated position into one
//! token id. It is built once from a [`SamplingParams`] record and runs a fixed
//! pipeline:
//!
//! ```text
//! penalties -> top-k -> typical -> top-p -> min-p -> temperature -> terminal
//! ```
//!
//! Every stage is optional except the terminal selector, which is exactly one of
//! greedy arg-max, mirostat (v1 or v2) or a seeded distribution draw, and always
//! runs last. Each filter sees only the survivors of the stages before it.
//!
//! Stateful stages keep their state inside the chain: the penalty window and the
//! mirostat `mu` estimate are updated through [`SamplingChain::accept`], so two
//! sessions never share sampling state.

pub mod candidates;
pub mod filters;
pub mod grammar;
pub mod mirostat;
pub mod params;

pub use candidates::{Candidates, TokenData};
pub use grammar::Grammar;
pub use mirostat::{Mirostat, MirostatVersion};
pub use params::{MirostatMode, SamplingParams, DISABLED_THRESHOLD, RANDOM_SEED};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::engine::TokenId;
use crate::error::SamplingError;
use filters::Penalties;

/// Context length assumed for `penalty_last_n = -1` when none is given.
pub const DEFAULT_PENALTY_CONTEXT: usize = 2048;

#[derive(Debug, Clone)]
enum Filter {
    Penalties(Penalties),
    TopK(usize),
    Typical(f32),
    TopP(f32),
    MinP(f32),
    Temperature(f32),
    DynamicTemperature {
        temperature: f32,
        range: f32,
        exponent: f32,
    },
}

impl Filter {
    fn name(&self) -> &'static str {
        match self {
            Filter::Penalties(_) => "penalties",
            Filter::TopK(_) => "top-k",
            Filter::Typical(_) => "typical",
            Filter::TopP(_) => "top-p",
            Filter::MinP(_) => "min-p",
            Filter::Temperature(_) => "temperature",
            Filter::DynamicTemperature { .. } => "dynamic-temperature",
        }
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    Greedy,
    Mirostat(Mirostat),
    Distribution,
}

impl Terminal {
    fn name(&self) -> &'static str {
        match self {
            Terminal::Greedy => "greedy",
            Terminal::Mirostat(m) => match m.version() {
                MirostatVersion::V1 => "mirostat-v1",
                MirostatVersion::V2 => "mirostat-v2",
            },
            Terminal::Distribution => "distribution",
        }
    }
}

/// Builder for a [`SamplingChain`] when more than vocabulary size and parameters are known.
pub struct ChainBuilder<'a> {
    vocab_size: usize,
    params: &'a SamplingParams,
    context_length: usize,
    newline_token: Option<TokenId>,
    grammar: Option<Grammar>,
}

impl<'a> ChainBuilder<'a> {
    /// Resolves `penalty_last_n = -1`.
    pub fn context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    /// Token exempt from penalties when `penalize_newline` is false.
    pub fn newline_token(mut self, token: Option<TokenId>) -> Self {
        self.newline_token = token;
        self
    }

    pub fn grammar(mut self, grammar: Option<Grammar>) -> Self {
        self.grammar = grammar;
        self
    }

    pub fn build(self) -> SamplingChain {
        let params = self.params;
        let rng = seeded_rng(params.seed);

        if self.vocab_size == 0 {
            warn!("Cannot build a sampling chain for an empty vocabulary; chain is empty");
            return SamplingChain::empty_with(self.vocab_size, rng);
        }
        if let Err(e) = params.validate() {
            warn!("Invalid sampling parameters ({}); chain is empty", e);
            return SamplingChain::empty_with(self.vocab_size, rng);
        }

        let min_keep = params.min_keep.max(1);
        let mut filters = Vec::new();

        if params.penalties_enabled() {
            filters.push(Filter::Penalties(Penalties::new(
                params.resolved_penalty_last_n(self.context_length),
                params.penalty_repeat,
                params.penalty_freq,
                params.penalty_present,
                params.penalize_newline,
                self.newline_token,
            )));
        }
        if params.top_k > 0 {
            filters.push(Filter::TopK(params.top_k as usize));
        }
        if params.typical_p < DISABLED_THRESHOLD {
            filters.push(Filter::Typical(params.typical_p));
        }
        if params.top_p < DISABLED_THRESHOLD {
            filters.push(Filter::TopP(params.top_p));
        }
        if params.min_p > 0.0 && params.min_p < DISABLED_THRESHOLD {
            filters.push(Filter::MinP(params.min_p));
        }

        let terminal = match params.mirostat {
            MirostatMode::Off if params.temperature <= 0.0 => Terminal::Greedy,
            mode => {
                if params.temperature > 0.0 {
                    filters.push(temperature_filter(params));
                }
                match mode {
                    MirostatMode::V1 => Terminal::Mirostat(Mirostat::new(
                        MirostatVersion::V1,
                        self.vocab_size,
                        params.mirostat_tau,
                        params.mirostat_eta,
                    )),
                    MirostatMode::V2 => Terminal::Mirostat(Mirostat::new(
                        MirostatVersion::V2,
                        self.vocab_size,
                        params.mirostat_tau,
                        params.mirostat_eta,
                    )),
                    MirostatMode::Off => Terminal::Distribution,
                }
            }
        };

        let chain = SamplingChain {
            vocab_size: self.vocab_size,
            min_keep,
            filters,
            terminal: Some(terminal),
            rng,
            grammar: self.grammar,
        };
        debug!("Built sampling chain: {}", chain.stage_names().join(" -> "));
        chain
    }
}

fn temperature_filter(params: &SamplingParams) -> Filter {
    if params.dynatemp_range > 0.0 {
        Filter::DynamicTemperature {
            temperature: params.temperature,
            range: params.dynatemp_range,
            exponent: params.dynatemp_exponent,
        }
    } else {
        Filter::Temperature(params.temperature)
    }
}

fn seeded_rng(seed: u32) -> StdRng {
    if seed == RANDOM_SEED {
        StdRng::from_os_rng()
    } else {
        StdRng::seed_from_u64(u64::from(seed))
    }
}

/// Ordered token-selection pipeline. See the module documentation.
#[derive(Debug, Clone)]
pub struct SamplingChain {
    vocab_size: usize,
    min_keep: usize,
    filters: Vec<Filter>,
    terminal: Option<Terminal>,
    rng: StdRng,
    grammar: Option<Grammar>,
}

impl SamplingChain {
    pub fn build(vocab_size: usize, params: &SamplingParams) -> Self {
        Self::builder(vocab_size, params).build()
    }

    pub fn builder(vocab_size: usize, params: &SamplingParams) -> ChainBuilder<'_> {
        ChainBuilder {
            vocab_size,
            params,
            context_length: DEFAULT_PENALTY_CONTEXT,
            newline_token: None,
            grammar: None,
        }
    }

    /// A chain with no stages. Its [`sample`](Self::sample) always fails.
    pub fn empty(vocab_size: usize) -> Self {
        Self::empty_with(vocab_size, StdRng::seed_from_u64(0))
    }

    fn empty_with(vocab_size: usize, rng: StdRng) -> Self {
        Self {
            vocab_size,
            min_keep: 1,
            filters: Vec::new(),
            terminal: None,
            rng,
            grammar: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terminal.is_none()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Stage names in execution order, terminal last.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.filters
            .iter()
            .map(Filter::name)
            .chain(self.terminal.iter().map(Terminal::name))
            .collect()
    }

    pub fn grammar(&self) -> Option<&Grammar> {
        self.grammar.as_ref()
    }

    /// Current mirostat estimate, if the terminal is mirostat.
    pub fn mirostat_mu(&self) -> Option<f32> {
        match &self.terminal {
            Some(Terminal::Mirostat(m)) => Some(m.mu()),
            _ => None,
        }
    }

    /// Run the filter stages only.
    pub fn filtered(&self, logits: &[f32]) -> Result<Candidates, SamplingError> {
        if self.is_empty() {
            return Err(SamplingError::EmptyChain {
                vocab_size: self.vocab_size,
            });
        }
        if logits.len() != self.vocab_size {
            return Err(SamplingError::LogitsLength {
                expected: self.vocab_size,
                actual: logits.len(),
            });
        }

        let mut candidates = Candidates::from_logits(logits);
        for filter in &self.filters {
            match filter {
                Filter::Penalties(p) => p.apply(&mut candidates),
                Filter::TopK(k) => filters::top_k(&mut candidates, *k, self.min_keep),
                Filter::Typical(p) => filters::typical(&mut candidates, *p, self.min_keep),
                Filter::TopP(p) => filters::top_p(&mut candidates, *p, self.min_keep),
                Filter::MinP(p) => filters::min_p(&mut candidates, *p, self.min_keep),
                Filter::Temperature(t) => filters::temperature(&mut candidates, *t),
                Filter::DynamicTemperature {
                    temperature,
                    range,
                    exponent,
                } => filters::dynamic_temperature(&mut candidates, *temperature, *range, *exponent),
            }
        }
        Ok(candidates)
    }

    /// Pick one token from the logits of the last evaluated position.
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, SamplingError> {
        let mut candidates = self.filtered(logits)?;
        if candidates.is_empty() {
            return Err(SamplingError::NoCandidates);
        }

        let token = match self.terminal.as_mut() {
            Some(Terminal::Greedy) => candidates.argmax(),
            Some(Terminal::Mirostat(m)) => m.sample(candidates, &mut self.rng),
            Some(Terminal::Distribution) => candidates.draw(&mut self.rng),
            None => None,
        };
        token.ok_or(SamplingError::NoCandidates)
    }

    /// Record a chosen token in the stateful stages.
    pub fn accept(&mut self, token: TokenId) {
        for filter in &mut self.filters {
            if let Filter::Penalties(p) = filter {
                p.accept(token);
            }
        }
        if let Some(Terminal::Mirostat(m)) = self.terminal.as_mut() {
            m.accept(token);
        }
    }

    /// Push tokens into the penalty window without touching mirostat.
    pub fn observe(&mut self, tokens: &[TokenId]) {
        for filter in &mut self.filters {
            if let Filter::Penalties(p) = filter {
                for token in tokens {
                    p.accept(*token);
                }
            }
        }
    }

    pub fn reset_penalty_history(&mut self) {
        for filter in &mut self.filters {
            if let Filter::Penalties(p) = filter {
                p.reset();
            }
        }
    }

    /// Tokens currently in the penalty window, oldest first.
    pub fn penalty_window(&self) -> Vec<TokenId> {
        self.filters
            .iter()
            .find_map(|f| match f {
                Filter::Penalties(p) => Some(p.window().copied().collect()),
                _ => None,
            })
            .unwrap_or_default()
    }
}
