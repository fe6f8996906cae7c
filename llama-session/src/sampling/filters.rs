//! Deterministic filter stages.
//!
//! Each filter takes the candidate set left by the previous stage and either
//! rewrites logits (penalties, temperature) or removes candidates (top-k,
//! typical, top-p, min-p). None of them picks the final token.

use std::collections::{HashMap, VecDeque};

use super::candidates::{Candidates, TokenData};
use crate::engine::TokenId;

/// Repetition, frequency and presence penalties over the last `last_n` accepted tokens.
#[derive(Debug, Clone)]
pub struct Penalties {
    last_n: usize,
    repeat: f32,
    freq: f32,
    present: f32,
    penalize_newline: bool,
    newline: Option<TokenId>,
    window: VecDeque<TokenId>,
}

impl Penalties {
    pub fn new(
        last_n: usize,
        repeat: f32,
        freq: f32,
        present: f32,
        penalize_newline: bool,
        newline: Option<TokenId>,
    ) -> Self {
        Self {
            last_n,
            repeat,
            freq,
            present,
            penalize_newline,
            newline,
            window: VecDeque::with_capacity(last_n.min(4096)),
        }
    }

    pub fn accept(&mut self, token: TokenId) {
        if self.last_n == 0 {
            return;
        }
        if self.window.len() == self.last_n {
            self.window.pop_front();
        }
        self.window.push_back(token);
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn window(&self) -> impl Iterator<Item = &TokenId> {
        self.window.iter()
    }

    pub fn apply(&self, candidates: &mut Candidates) {
        if self.window.is_empty() {
            return;
        }

        let mut counts: HashMap<TokenId, u32> = HashMap::new();
        for token in &self.window {
            *counts.entry(*token).or_default() += 1;
        }

        let newline_logit = match (self.penalize_newline, self.newline) {
            (false, Some(nl)) => candidates.find(nl).map(|t| t.logit),
            _ => None,
        };

        for token in candidates.logits_mut() {
            let Some(&count) = counts.get(&token.id) else {
                continue;
            };
            if token.logit <= 0.0 {
                token.logit *= self.repeat;
            } else {
                token.logit /= self.repeat;
            }
            token.logit -= count as f32 * self.freq + self.present;
        }

        if let (Some(nl), Some(logit)) = (self.newline, newline_logit) {
            for token in candidates.logits_mut() {
                if token.id == nl {
                    token.logit = logit;
                }
            }
        }
    }
}

/// Keep the `k` highest logits.
pub fn top_k(candidates: &mut Candidates, k: usize, min_keep: usize) {
    let k = k.max(min_keep).min(candidates.len());
    candidates.sort_by_logit();
    candidates.truncate(k);
}

/// Locally typical sampling: keep the tokens whose surprise is closest to the
/// distribution's entropy until their mass reaches `p`.
pub fn typical(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if candidates.is_empty() {
        return;
    }
    candidates.softmax();
    let entropy = candidates.entropy();

    let mut scored: Vec<(f32, TokenData)> = candidates
        .as_slice()
        .iter()
        .map(|t| ((-t.p.ln() - entropy).abs(), *t))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut last = scored.len();
    for (i, (_, token)) in scored.iter().enumerate() {
        cumulative += token.p;
        if cumulative > p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }

    let kept = scored.into_iter().take(last).map(|(_, t)| t).collect();
    candidates.replace(kept, false);
}

/// Nucleus sampling: the smallest prefix whose cumulative probability reaches `p`.
pub fn top_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if candidates.is_empty() {
        return;
    }
    candidates.softmax();

    let mut cumulative = 0.0f32;
    let mut last = candidates.len();
    for (i, token) in candidates.as_slice().iter().enumerate() {
        cumulative += token.p;
        if cumulative >= p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }
    candidates.truncate(last);
}

/// Drop tokens whose probability is below `p` times the top probability.
pub fn min_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if candidates.is_empty() {
        return;
    }
    candidates.sort_by_logit();
    let min_logit = candidates.as_slice()[0].logit + p.ln();

    let keep = candidates
        .as_slice()
        .iter()
        .take_while(|t| t.logit >= min_logit)
        .count()
        .max(min_keep)
        .min(candidates.len());
    candidates.truncate(keep);
}

/// Divide logits by `temperature`.
pub fn temperature(candidates: &mut Candidates, temperature: f32) {
    for token in candidates.logits_mut() {
        token.logit /= temperature;
    }
}

/// Entropy-scaled temperature in `[temperature - range, temperature + range]`.
///
/// A flat distribution gets the high end, a peaked one the low end.
pub fn dynamic_temperature(candidates: &mut Candidates, temperature: f32, range: f32, exponent: f32) {
    if candidates.len() <= 1 {
        return;
    }
    let min_temp = (temperature - range).max(0.0);
    let max_temp = temperature + range;

    candidates.softmax();
    let max_entropy = (candidates.len() as f32).ln();
    let normalized = if max_entropy > 0.0 {
        candidates.entropy() / max_entropy
    } else {
        0.0
    };
    let dyn_temp = min_temp + (max_temp - min_temp) * normalized.powf(exponent);

    if dyn_temp > 0.0 {
        for token in candidates.logits_mut() {
            token.logit /= dyn_temp;
        }
    }
}
