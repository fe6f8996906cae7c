//! # Llama Session
//!
//! Single-session inference controller for llama-style language models.
//!
//! A [`Session`] loads a model through a [`Backend`], builds a configurable
//! [`SamplingChain`], evaluates prompts (optionally preceded by a system prompt
//! and an image) and streams generated text through a callback. When the
//! context fills up, the [`ContextWindow`] rotates the KV cache instead of
//! failing, keeping a protected prefix. Session state (token history plus an
//! engine snapshot) can be persisted between runs with a [`SessionStateStore`].
//!
//! The native engine sits behind the [`InferenceEngine`] and [`Backend`]
//! traits. The [`synthetic`] module provides a deterministic engine used by the
//! tests and the `streaming` demo.

pub mod config;
pub mod context;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod generation;
pub mod guard;
pub mod handle;
pub mod image;
pub mod logging;
pub mod progress;
pub mod prompt;
pub mod sampling;
pub mod session;
pub mod shared;
pub mod state;
pub mod stopper;
pub mod synthetic;

// Re-export main types for convenience
pub use config::SessionConfig;
pub use context::{ContextWindow, ImageSpan, RotationPlan};
pub use decoder::Utf8Decoder;
pub use engine::{Backend, Batch, ContextParams, InferenceEngine, LoraAdapter, ModelParams, TokenId};
pub use error::{EngineError, ErrorCategory, SamplingError, SessionError};
pub use generation::{GenerationLoop, GenerationOutcome, GenerationSettings, PredictRequest};
pub use guard::NativeBoundary;
pub use image::ImageEvaluator;
pub use logging::init_tracing;
pub use progress::{LoadProgress, ProgressCallback, ProgressRegistry, ProgressToken};
pub use prompt::{PromptFormat, PromptTemplate};
pub use sampling::{Grammar, MirostatMode, SamplingChain, SamplingParams};
pub use session::Session;
pub use shared::SharedSession;
pub use state::{SessionState, SessionStateStore, StateFormatError};
pub use stopper::{FinishReason, Stopper};
