//! # Generation Stoppers
//!
//! Termination checks evaluated once per generated token, after the token's
//! text has been handed to the caller. The first stopper to return a
//! [`FinishReason`] ends generation:
//!
//! - [`EosStopper`]: the engine reported an end-of-generation token
//! - [`MaxTokensStopper`]: a token budget was used up
//! - [`MaxBytesStopper`]: emitted text exceeded a byte budget
//!
//! Caller cancellation is not a stopper; the generation loop checks the
//! callback's return value directly so the cancelled token is never fed back.

use std::fmt;

use crate::engine::TokenId;

pub mod eos;
pub mod max_bytes;
pub mod max_tokens;

pub use eos::EosStopper;
pub use max_bytes::MaxBytesStopper;
pub use max_tokens::MaxTokensStopper;

/// Reason why text generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine produced an end-of-generation token.
    EndOfGeneration,
    /// The callback asked to stop.
    Cancelled,
    /// `max_output_tokens` tokens were generated.
    MaxTokens,
    /// More than `max_output_bytes` bytes were emitted.
    MaxBytes,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::EndOfGeneration => "end of generation",
            FinishReason::Cancelled => "cancelled",
            FinishReason::MaxTokens => "maximum tokens reached",
            FinishReason::MaxBytes => "maximum output length reached",
        };
        f.write_str(s)
    }
}

/// One generated token as seen by the stoppers.
#[derive(Debug, Clone, Copy)]
pub struct TokenStep<'a> {
    pub token: TokenId,
    pub is_end_of_generation: bool,
    /// Text emitted to the caller for this token; empty when suppressed or buffered.
    pub emitted: &'a str,
}

/// Decides whether generation should stop after a token.
///
/// Stoppers keep their own running counts and are created fresh for every
/// prediction.
pub trait Stopper: Send {
    fn should_stop(&mut self, step: &TokenStep<'_>) -> Option<FinishReason>;
}

/// Run stoppers in order, returning the first reason reported.
///
/// Every stopper sees every token so running counts stay accurate.
pub fn first_reason(stoppers: &mut [Box<dyn Stopper>], step: &TokenStep<'_>) -> Option<FinishReason> {
    let mut reason = None;
    for stopper in stoppers.iter_mut() {
        let r = stopper.should_stop(step);
        if reason.is_none() {
            reason = r;
        }
    }
    reason
}
