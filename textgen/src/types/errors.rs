//! Error kinds surfaced by generation and the errors raised by model primitives.
//!
//! [`ErrorKind`] is the small, copyable classification callers see in
//! [`crate::types::StreamEvent::Failed`]. [`BackendError`] is what the model,
//! codec and pipeline collaborators return; [`classify_backend_error`] maps one
//! onto the other.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;

/// Classification of a failed or aborted generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The slot is empty or its last load failed.
    NoModel,
    /// The accelerator ran out of memory; cached buffers were released.
    AcceleratorOutOfMemory,
    /// A recognised transient device-consistency error.
    AcceleratorFault,
    /// A hard-stop phrase appeared in the decoded output.
    HardStopTriggered,
    /// Generation exceeded its wall-clock budget.
    Timeout,
    /// Anything else.
    Unrecoverable,
}

impl ErrorKind {
    /// Short text shown to the user in place of generated output.
    pub fn diagnostic(&self) -> &'static str {
        match self {
            ErrorKind::NoModel => "No model is loaded. Choose a model and try again.",
            ErrorKind::AcceleratorOutOfMemory => {
                "The accelerator ran out of memory. Try a shorter prompt or fewer new tokens."
            }
            ErrorKind::AcceleratorFault => {
                "The accelerator reported a transient error. Please retry."
            }
            ErrorKind::HardStopTriggered => "Generation was stopped by a hard-stop phrase.",
            ErrorKind::Timeout => "Generation took too long and was stopped.",
            ErrorKind::Unrecoverable => "Generation failed with an unexpected error.",
        }
    }

    /// Whether the session boundary absorbs this kind instead of propagating it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoModel | ErrorKind::AcceleratorOutOfMemory | ErrorKind::AcceleratorFault
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NoModel => "no_model",
            ErrorKind::AcceleratorOutOfMemory => "accelerator_out_of_memory",
            ErrorKind::AcceleratorFault => "accelerator_fault",
            ErrorKind::HardStopTriggered => "hard_stop_triggered",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

/// Errors returned by model, codec and pipeline primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Accelerator out of memory: {0}")]
    OutOfMemory(String),

    #[error("Backend runtime error: {0}")]
    Runtime(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Generation worker panicked: {0}")]
    Panicked(String),
}

impl BackendError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn codec<E: std::error::Error>(err: E) -> Self {
        Self::Codec(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        classify_backend_error(self)
    }
}

impl TextgenError for BackendError {
    fn category(&self) -> ErrorCategory {
        match self.kind() {
            ErrorKind::AcceleratorOutOfMemory | ErrorKind::AcceleratorFault => {
                ErrorCategory::Device
            }
            _ => match self {
                BackendError::Codec(_) => ErrorCategory::User,
                _ => ErrorCategory::Internal,
            },
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            BackendError::OutOfMemory(_) => "BACKEND_OUT_OF_MEMORY",
            BackendError::Runtime(_) => "BACKEND_RUNTIME",
            BackendError::Codec(_) => "BACKEND_CODEC",
            BackendError::Panicked(_) => "BACKEND_PANICKED",
        }
    }

    fn user_friendly_message(&self) -> String {
        format!("{}\n💡 {}", self, self.kind().diagnostic())
    }
}

static DEVICE_FAULTS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"Expected all tensors to be on the same device",
        r"expected scalar type Half but found Float",
        r"probability tensor contains either",
        r"cublasLt ran into an error!",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

static OUT_OF_MEMORY: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([r"(?i)out of memory", r"(?i)\bOOM\b"]).unwrap_or_else(|_| RegexSet::empty())
});

/// Map a backend error onto the kind callers see.
///
/// Runtime messages are matched against the known transient device errors;
/// an out-of-memory message arriving as a plain runtime error is still
/// treated as out-of-memory.
pub fn classify_backend_error(error: &BackendError) -> ErrorKind {
    match error {
        BackendError::OutOfMemory(_) => ErrorKind::AcceleratorOutOfMemory,
        BackendError::Runtime(message) => {
            if OUT_OF_MEMORY.is_match(message) {
                ErrorKind::AcceleratorOutOfMemory
            } else if DEVICE_FAULTS.is_match(message) {
                ErrorKind::AcceleratorFault
            } else {
                ErrorKind::Unrecoverable
            }
        }
        BackendError::Codec(_) | BackendError::Panicked(_) => ErrorKind::Unrecoverable,
    }
}
