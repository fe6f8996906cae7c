//! Native fault boundary.
//!
//! Calls into the native engine at a few well-known points (model load, context
//! creation, warm-up, grammar load, image embedding) run inside
//! [`catch_native`]. A panic raised by the engine binding at one of these points
//! becomes a [`SessionError::NativeFault`] instead of unwinding through the
//! controller.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::error::SessionError;

/// The guarded call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeBoundary {
    ModelLoad,
    ContextInit,
    Warmup,
    GrammarLoad,
    ImageEmbed,
}

impl fmt::Display for NativeBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeBoundary::ModelLoad => "model load",
            NativeBoundary::ContextInit => "context init",
            NativeBoundary::Warmup => "logits warm-up",
            NativeBoundary::GrammarLoad => "grammar load",
            NativeBoundary::ImageEmbed => "image embedding",
        };
        f.write_str(name)
    }
}

/// Run `f`, converting a panic into [`SessionError::NativeFault`].
///
/// The closure's own `Result` is passed through untouched.
pub fn catch_native<T, F>(boundary: NativeBoundary, f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, SessionError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Native fault during {}: {}", boundary, message);
            Err(SessionError::NativeFault { boundary, message })
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
