//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;

use llama_session::synthetic::{SyntheticBackend, SyntheticModel};
use llama_session::{SamplingParams, SessionConfig};

/// "2+2=" continues with " 4" then "." then end of sequence.
pub fn arithmetic_model() -> SyntheticModel {
    let mut model = SyntheticModel::with_pieces(&["2", "+", "="]);
    model.script(&["=", " 4", "."]);
    model
}

pub fn arithmetic_backend() -> SyntheticBackend {
    SyntheticBackend::new(arithmetic_model())
}

/// A model whose only piece, "a", always continues with itself.
pub fn looping_backend() -> SyntheticBackend {
    let mut model = SyntheticModel::new();
    let a = model.add_piece("a");
    model.link(a, a);
    SyntheticBackend::new(model)
}

pub fn greedy_config() -> SessionConfig {
    SessionConfig {
        context_length: 64,
        n_batch: 8,
        n_threads: 1,
        sampling: SamplingParams::greedy(),
        ..SessionConfig::new("tiny.gguf")
    }
}

pub fn persistent_config(state_path: &Path) -> SessionConfig {
    SessionConfig {
        save_load_state: true,
        state_path: Some(state_path.to_path_buf()),
        ..greedy_config()
    }
}

/// Collects streamed fragments; never asks to stop.
pub fn collect(fragments: &mut Vec<String>) -> impl FnMut(&str, f64) -> bool + '_ {
    move |fragment, _| {
        fragments.push(fragment.to_string());
        false
    }
}
