//! Sampling parameter record.

use serde::{Deserialize, Serialize};

/// Thresholds at or above this value disable typical, top-p and min-p filtering,
/// so `0.99995` behaves exactly like `1.0`.
pub const DISABLED_THRESHOLD: f32 = 0.9999;

/// Seed value meaning "draw a seed from the operating system".
pub const RANDOM_SEED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

/// Flat parameter set a [`super::SamplingChain`] is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Repetition-penalty lookback window. `0` disables, `-1` means the context length.
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    /// `<= 0` disables top-k.
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    /// `<= 0` selects greedy decoding. The filter stages still run before the
    /// greedy pick, so with `typical_p < 0.9999` (or a penalty) the chosen token
    /// can differ from the arg-max of the raw logits.
    pub temperature: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub mirostat: MirostatMode,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// When false the newline token is exempt from repetition penalties.
    pub penalize_newline: bool,
    pub seed: u32,
    /// Filters never cut the candidate set below this many tokens.
    pub min_keep: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            temperature: 0.8,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            mirostat: MirostatMode::Off,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: false,
            seed: RANDOM_SEED,
            min_keep: 1,
        }
    }
}

impl SamplingParams {
    /// Deterministic arg-max decoding with every filter off.
    pub fn greedy() -> Self {
        Self {
            penalty_last_n: 0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Mirostat 2.0 with the original defaults (tau 5.0, eta 0.1).
    pub fn mirostat_v2() -> Self {
        Self {
            mirostat: MirostatMode::V2,
            ..Default::default()
        }
    }

    /// Whether the penalty stage has anything to do.
    pub fn penalties_enabled(&self) -> bool {
        self.penalty_last_n != 0
            && (self.penalty_repeat != 1.0 || self.penalty_freq != 0.0 || self.penalty_present != 0.0)
    }

    /// The lookback window in tokens, with `-1` resolved to `context_length`.
    pub fn resolved_penalty_last_n(&self, context_length: usize) -> usize {
        if self.penalty_last_n < 0 {
            context_length
        } else {
            self.penalty_last_n as usize
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let thresholds = [
            ("top_p", self.top_p),
            ("min_p", self.min_p),
            ("typical_p", self.typical_p),
            ("temperature", self.temperature),
            ("penalty_repeat", self.penalty_repeat),
            ("penalty_freq", self.penalty_freq),
            ("penalty_present", self.penalty_present),
            ("dynatemp_range", self.dynatemp_range),
            ("dynatemp_exponent", self.dynatemp_exponent),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() {
                return Err(format!("{} must be a finite number", name));
            }
        }

        if self.penalty_last_n < -1 {
            return Err("penalty_last_n must be -1, 0 or a positive window".to_string());
        }

        if !(0.0..=1.0).contains(&self.top_p) {
            return Err("top_p must be between 0.0 and 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err("min_p must be between 0.0 and 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.typical_p) {
            return Err("typical_p must be between 0.0 and 1.0".to_string());
        }
        if self.penalty_repeat <= 0.0 {
            return Err("penalty_repeat must be greater than 0".to_string());
        }
        if self.dynatemp_range < 0.0 {
            return Err("dynatemp_range cannot be negative".to_string());
        }

        if self.mirostat != MirostatMode::Off {
            if self.mirostat_tau <= 0.0 || !self.mirostat_tau.is_finite() {
                return Err("mirostat_tau must be greater than 0".to_string());
            }
            if self.mirostat_eta <= 0.0 || !self.mirostat_eta.is_finite() {
                return Err("mirostat_eta must be greater than 0".to_string());
            }
        }

        Ok(())
    }
}
