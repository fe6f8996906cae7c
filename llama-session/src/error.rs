//! Error types for session loading, generation and state persistence.
//!
//! Three layers of errors exist:
//!
//! - [`EngineError`] is what the native inference engine reports.
//! - [`SamplingError`] comes from the sampling chain.
//! - [`SessionError`] is the public taxonomy surfaced by [`crate::Session`].
//!
//! Every [`SessionError`] carries an [`ErrorCategory`] and a stable error code so
//! callers can route failures without matching on display strings.

use std::path::PathBuf;
use thiserror::Error;

use crate::guard::NativeBoundary;

/// Category of error for consistent handling and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User input or configuration error - can be fixed by user
    User,
    /// System resource or environmental error - may be temporary
    System,
    /// Internal logic error - indicates a bug
    Internal,
    /// Failure reported by the native engine or another collaborator
    External,
}

/// Errors reported by an [`crate::engine::InferenceEngine`] or [`crate::engine::Backend`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The native decode call returned a non-zero status.
    #[error("decode failed with status {status}")]
    Decode { status: i32 },

    /// The engine could not tokenize the given text.
    #[error("tokenization failed: {0}")]
    Tokenize(String),

    /// A token id could not be turned into its byte fragment.
    #[error("token {token} has no piece: {message}")]
    Piece { token: i32, message: String },

    /// A KV cache operation (sequence remove / shift) was rejected.
    #[error("kv cache operation failed: {0}")]
    KvCache(String),

    /// Model weights or the decode context could not be allocated.
    #[error("allocation failed: {0}")]
    Load(String),

    /// The engine state could not be captured or restored.
    #[error("engine state snapshot failed: {0}")]
    State(String),

    /// No logits are available for the last evaluated position.
    #[error("no logits available for the last evaluated position")]
    NoLogits,

    /// The batch has no free slots left.
    #[error("batch is full (capacity {capacity})")]
    BatchFull { capacity: usize },

    /// The engine does not implement the requested operation.
    #[error("operation not supported by this engine: {0}")]
    Unsupported(&'static str),
}

impl EngineError {
    /// Create a decode error from a native status code.
    pub fn decode(status: i32) -> Self {
        Self::Decode { status }
    }

    /// Create a tokenization error from a source error.
    pub fn tokenization<E: std::fmt::Display>(err: E) -> Self {
        Self::Tokenize(err.to_string())
    }

    /// Create a load error from a source error.
    pub fn load<E: std::fmt::Display>(err: E) -> Self {
        Self::Load(err.to_string())
    }
}

/// Errors raised by the sampling chain.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SamplingError {
    /// The chain has no stages because construction degraded.
    #[error("sampling chain is empty; it could not be constructed for vocabulary size {vocab_size}")]
    EmptyChain { vocab_size: usize },

    /// The logits slice does not match the vocabulary the chain was built for.
    #[error("expected {expected} logits, got {actual}")]
    LogitsLength { expected: usize, actual: usize },

    /// Every candidate was filtered out.
    #[error("no candidates left after filtering")]
    NoCandidates,
}

/// Errors surfaced by a [`crate::Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Model or engine context allocation failed; no session exists.
    #[error("session load failed: {0}")]
    Load(String),

    /// The grammar file exists but could not be parsed.
    #[error("grammar {path} is unusable: {message}")]
    Grammar { path: PathBuf, message: String },

    /// A native decode call failed for a batch.
    #[error("evaluation of {stage} failed: {source}")]
    Evaluation {
        stage: &'static str,
        #[source]
        source: EngineError,
    },

    /// The context window cannot make room for a required batch.
    #[error(
        "context rotation exhausted: {required} positions needed, n_past {n_past}, context length {context_length}, protected prefix {protected}"
    )]
    RotationExhausted {
        required: usize,
        n_past: usize,
        context_length: usize,
        protected: usize,
    },

    /// The persisted state file could not be read or written.
    #[error("session state {path}: {message}")]
    StateIo { path: PathBuf, message: String },

    /// The sampling chain failed to produce a token.
    #[error(transparent)]
    Sampling(#[from] SamplingError),

    /// The prompt could not be tokenized.
    #[error("tokenization failed: {0}")]
    Tokenization(#[source] EngineError),

    /// Image embedding failed or no image evaluator is configured.
    #[error("image prompt failed: {0}")]
    Image(String),

    /// Configuration validation failed.
    #[error("invalid session configuration: {0}")]
    Config(String),

    /// A native handle was used after it was released.
    #[error("{0} handle has been released")]
    InvalidHandle(&'static str),

    /// A panic escaped the native engine at a guarded boundary.
    #[error("native fault during {boundary}: {message}")]
    NativeFault {
        boundary: NativeBoundary,
        message: String,
    },

    /// The prompt produced no tokens and nothing is in the context to continue from.
    #[error("prompt produced no tokens and the context is empty")]
    EmptyPrompt,

    /// Another prediction is already running on this session.
    #[error("session is busy with another prediction")]
    Busy,

    /// The blocking worker running a prediction failed.
    #[error("generation worker failed: {0}")]
    Worker(String),
}

impl SessionError {
    /// Create a load error from a source error.
    pub fn load<E: std::fmt::Display>(err: E) -> Self {
        Self::Load(err.to_string())
    }

    /// Create an evaluation error for a named stage.
    pub fn evaluation(stage: &'static str, source: EngineError) -> Self {
        Self::Evaluation { stage, source }
    }

    /// Create a state I/O error for the given path.
    pub fn state_io<E: std::fmt::Display>(path: impl Into<PathBuf>, err: E) -> Self {
        Self::StateIo {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Get the error category for proper handling
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Load(_) => ErrorCategory::System,
            SessionError::Grammar { .. } => ErrorCategory::User,
            SessionError::Evaluation { .. } => ErrorCategory::External,
            SessionError::RotationExhausted { .. } => ErrorCategory::User,
            SessionError::StateIo { .. } => ErrorCategory::System,
            SessionError::Sampling(_) => ErrorCategory::Internal,
            SessionError::Tokenization(_) => ErrorCategory::External,
            SessionError::Image(_) => ErrorCategory::External,
            SessionError::Config(_) => ErrorCategory::User,
            SessionError::InvalidHandle(_) => ErrorCategory::Internal,
            SessionError::NativeFault { .. } => ErrorCategory::External,
            SessionError::EmptyPrompt => ErrorCategory::User,
            SessionError::Busy => ErrorCategory::System,
            SessionError::Worker(_) => ErrorCategory::Internal,
        }
    }

    /// Get a unique error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::Load(_) => "SESSION_LOAD_FAILED",
            SessionError::Grammar { .. } => "SESSION_GRAMMAR_INVALID",
            SessionError::Evaluation { .. } => "SESSION_EVALUATION_FAILED",
            SessionError::RotationExhausted { .. } => "SESSION_ROTATION_EXHAUSTED",
            SessionError::StateIo { .. } => "SESSION_STATE_IO",
            SessionError::Sampling(_) => "SESSION_SAMPLING_FAILED",
            SessionError::Tokenization(_) => "SESSION_TOKENIZATION_FAILED",
            SessionError::Image(_) => "SESSION_IMAGE_FAILED",
            SessionError::Config(_) => "SESSION_INVALID_CONFIG",
            SessionError::InvalidHandle(_) => "SESSION_INVALID_HANDLE",
            SessionError::NativeFault { .. } => "SESSION_NATIVE_FAULT",
            SessionError::EmptyPrompt => "SESSION_EMPTY_PROMPT",
            SessionError::Busy => "SESSION_BUSY",
            SessionError::Worker(_) => "SESSION_WORKER_FAILED",
        }
    }

    /// Check if this is a user-correctable error
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Whether a fresh `predict` on the same session may succeed after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SessionError::Evaluation { .. } | SessionError::Busy | SessionError::Sampling(_)
        )
    }
}

// Provide conversion from configuration validation errors
impl From<String> for SessionError {
    fn from(msg: String) -> Self {
        Self::Config(msg)
    }
}
