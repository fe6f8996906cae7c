//! Candidate set passed between sampling stages.

use std::cmp::Ordering;

use rand::Rng;

use crate::engine::TokenId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// The surviving tokens of one sampling step.
///
/// Filters shrink the set; [`Candidates::softmax`] sorts it by logit (descending)
/// and recomputes probabilities over whatever is left, so each stage sees a
/// distribution renormalized over the survivors of the previous one.
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn ids(&self) -> Vec<TokenId> {
        self.data.iter().map(|t| t.id).collect()
    }

    /// Mutable access for stages that rewrite logits. Marks the set unsorted.
    pub fn logits_mut(&mut self) -> impl Iterator<Item = &mut TokenData> {
        self.sorted = false;
        self.data.iter_mut()
    }

    pub fn find(&self, id: TokenId) -> Option<&TokenData> {
        self.data.iter().find(|t| t.id == id)
    }

    pub fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sort descending and recompute probabilities from logits.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_by_logit();
        let max = self.data[0].logit;
        let mut sum = 0.0f32;
        for token in &mut self.data {
            let p = (token.logit - max).exp();
            token.p = p;
            sum += p;
        }
        if sum > 0.0 {
            for token in &mut self.data {
                token.p /= sum;
            }
        }
    }

    /// Keep the first `n` entries of the current order.
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    /// Replace the set with a reordered subset (used by typical filtering).
    pub fn replace(&mut self, data: Vec<TokenData>, sorted: bool) {
        self.data = data;
        self.sorted = sorted;
    }

    /// Index of the highest logit, ties broken by lowest token id.
    pub fn argmax(&self) -> Option<TokenId> {
        self.data
            .iter()
            .fold(None::<&TokenData>, |best, t| match best {
                None => Some(t),
                Some(b) if t.logit > b.logit || (t.logit == b.logit && t.id < b.id) => Some(t),
                keep => keep,
            })
            .map(|t| t.id)
    }

    /// Draw one token proportionally to its probability over the current set.
    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<TokenId> {
        self.softmax();
        let last = self.data.last()?.id;
        let target: f32 = rng.random();
        let mut cumulative = 0.0f32;
        for token in &self.data {
            cumulative += token.p;
            if target < cumulative {
                return Some(token.id);
            }
        }
        Some(last)
    }

    /// Shannon entropy (nats) of the current probabilities.
    pub fn entropy(&self) -> f32 {
        self.data
            .iter()
            .filter(|t| t.p > 0.0)
            .map(|t| -t.p * t.p.ln())
            .sum()
    }
}
