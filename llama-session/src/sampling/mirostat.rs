//! Mirostat terminal selectors.
//!
//! Both versions keep a running estimate `mu` of the maximum surprise
//! (`-log2 p`) a chosen token may have. Sampling cuts the candidate set using
//! `mu`; accepting a token moves `mu` so that the observed surprise tracks the
//! target `tau`.

use rand::Rng;

use super::candidates::Candidates;
use crate::engine::TokenId;

/// Number of top candidates used by v1 to estimate the Zipf exponent.
pub const MIROSTAT_V1_M: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirostatVersion {
    V1,
    V2,
}

#[derive(Debug, Clone)]
pub struct Mirostat {
    version: MirostatVersion,
    vocab_size: usize,
    tau: f32,
    eta: f32,
    mu: f32,
    last: Option<Candidates>,
}

impl Mirostat {
    pub fn new(version: MirostatVersion, vocab_size: usize, tau: f32, eta: f32) -> Self {
        Self {
            version,
            vocab_size,
            tau,
            eta,
            mu: 2.0 * tau,
            last: None,
        }
    }

    pub fn version(&self) -> MirostatVersion {
        self.version
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }

    pub fn sample<R: Rng + ?Sized>(
        &mut self,
        mut candidates: Candidates,
        rng: &mut R,
    ) -> Option<TokenId> {
        match self.version {
            MirostatVersion::V1 => self.truncate_v1(&mut candidates),
            MirostatVersion::V2 => self.truncate_v2(&mut candidates),
        }
        let token = candidates.draw(rng);
        self.last = Some(candidates);
        token
    }

    /// Update `mu` from the surprise of `token` in the last sampled set.
    ///
    /// Tokens that were not part of that set leave `mu` unchanged.
    pub fn accept(&mut self, token: TokenId) {
        let Some(last) = self.last.take() else {
            return;
        };
        let Some(chosen) = last.find(token) else {
            return;
        };
        if chosen.p <= 0.0 {
            return;
        }
        let surprise = -chosen.p.log2();
        self.mu -= self.eta * (surprise - self.tau);
    }

    fn truncate_v1(&self, candidates: &mut Candidates) {
        candidates.softmax();
        let probs: Vec<f32> = candidates.as_slice().iter().map(|t| t.p).collect();

        let m = MIROSTAT_V1_M.min(probs.len());
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m.saturating_sub(1) {
            if probs[i + 1] <= 0.0 {
                break;
            }
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (probs[i] / probs[i + 1]).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }

        if sum_ti_sq <= 0.0 || sum_ti_bi <= 0.0 {
            candidates.truncate(1);
            return;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;
        let epsilon_hat = s_hat - 1.0;
        let n = self.vocab_size as f32;
        let k = ((epsilon_hat * 2f32.powf(self.mu)) / (1.0 - n.powf(-epsilon_hat))).powf(1.0 / s_hat);

        let k = if k.is_finite() { k.max(1.0) as usize } else { 1 };
        candidates.truncate(k.max(1));
    }

    fn truncate_v2(&self, candidates: &mut Candidates) {
        candidates.softmax();
        let keep = candidates
            .as_slice()
            .iter()
            .take_while(|t| -t.p.log2() <= self.mu)
            .count()
            .max(1);
        candidates.truncate(keep);
    }
}
