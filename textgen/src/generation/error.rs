//! Error types for generation sessions.

use crate::types::{BackendError, ErrorKind, ParameterError};
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;

/// Errors that escape a generation session.
///
/// Recoverable accelerator failures only show up here in strict mode;
/// otherwise they become a failed [`super::GenerationOutcome`].
#[derive(Debug, Error)]
pub enum GenerationError {
    /// No model is available in the slot.
    #[error("No model loaded: {0}")]
    NoModel(String),

    /// Parameters failed validation.
    #[error("Invalid generation parameters: {0}")]
    InvalidParameters(#[from] ParameterError),

    /// The prompt or a stop phrase could not be tokenized.
    #[error("Failed to tokenize: {0}")]
    Tokenization(String),

    /// The model primitive failed.
    #[error("Generation failed ({kind}): {source}")]
    Backend {
        kind: ErrorKind,
        #[source]
        source: BackendError,
    },

    /// The worker thread could not be started.
    #[error("Failed to start generation worker: {0}")]
    WorkerSpawn(String),

    /// The worker ended without reporting a result.
    #[error("Generation worker lost: {0}")]
    WorkerLost(String),
}

impl GenerationError {
    pub fn backend(source: BackendError) -> Self {
        Self::Backend {
            kind: source.kind(),
            source,
        }
    }

    pub fn tokenization<E: std::error::Error>(err: E) -> Self {
        Self::Tokenization(err.to_string())
    }

    /// The error kind callers see for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::NoModel(_) => ErrorKind::NoModel,
            GenerationError::Backend { kind, .. } => *kind,
            _ => ErrorKind::Unrecoverable,
        }
    }
}

impl TextgenError for GenerationError {
    fn category(&self) -> ErrorCategory {
        match self {
            GenerationError::NoModel(_) | GenerationError::InvalidParameters(_) => {
                ErrorCategory::User
            }
            GenerationError::Tokenization(_) => ErrorCategory::User,
            GenerationError::Backend { source, .. } => source.category(),
            GenerationError::WorkerSpawn(_) => ErrorCategory::System,
            GenerationError::WorkerLost(_) => ErrorCategory::Internal,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            GenerationError::NoModel(_) => "GEN_NO_MODEL",
            GenerationError::InvalidParameters(_) => "GEN_INVALID_PARAMETERS",
            GenerationError::Tokenization(_) => "GEN_TOKENIZATION",
            GenerationError::Backend { .. } => "GEN_BACKEND",
            GenerationError::WorkerSpawn(_) => "GEN_WORKER_SPAWN",
            GenerationError::WorkerLost(_) => "GEN_WORKER_LOST",
        }
    }

    fn user_friendly_message(&self) -> String {
        self.kind().diagnostic().to_string()
    }
}
