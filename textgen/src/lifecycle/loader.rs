//! Model loading contract and its errors.

use super::handle::ModelHandle;
use crate::backend::Device;
use crate::prompt::PromptConvention;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;

/// Model name that means "free the slot and load nothing".
pub const REMOVE_MODEL: &str = "[None/Remove]";

/// What to load into a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub base_model: String,
    #[serde(default)]
    pub adapter_weights: Option<String>,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub load_8bit: bool,
    /// Explicit prompt convention; inferred from the model name when absent.
    #[serde(default)]
    pub convention: Option<PromptConvention>,
}

impl ModelRequest {
    pub fn new(base_model: impl Into<String>) -> Self {
        Self {
            base_model: base_model.into(),
            adapter_weights: None,
            device: Device::default(),
            load_8bit: false,
            convention: None,
        }
    }

    /// A request that only frees the slot.
    pub fn remove() -> Self {
        Self::new(REMOVE_MODEL)
    }

    pub fn with_adapter_weights(mut self, adapter_weights: impl Into<String>) -> Self {
        self.adapter_weights = Some(adapter_weights.into());
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_convention(mut self, convention: PromptConvention) -> Self {
        self.convention = Some(convention);
        self
    }

    pub fn with_8bit(mut self, load_8bit: bool) -> Self {
        self.load_8bit = load_8bit;
        self
    }

    pub fn is_removal(&self) -> bool {
        let name = self.base_model.trim();
        name.is_empty() || name == REMOVE_MODEL
    }
}

/// Builds model handles and reclaims device memory.
///
/// The lifecycle manager calls `reclaim_memory` after dropping a handle and
/// before asking for the next one.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, request: &ModelRequest) -> Result<ModelHandle, ModelError>;

    /// Return freed device memory to the pool.
    async fn reclaim_memory(&self, device: Device);

    /// Bytes currently allocated on `device`, when the loader can tell.
    fn memory_in_use(&self, _device: Device) -> Option<u64> {
        None
    }
}

/// Errors that can occur while loading a model
#[derive(Debug, Error)]
pub enum ModelError {
    /// Weights could not be found
    #[error("Model not found: {0}\n📁 Verify the model name or path and that the weights are available")]
    NotFound(String),

    /// Adapter weights do not fit the base model
    #[error("Adapter {adapter} is incompatible with {base_model}: {reason}\n🧩 Pick adapter weights trained for this base model")]
    IncompatibleAdapter {
        base_model: String,
        adapter: String,
        reason: String,
    },

    /// Device allocation failed
    #[error("Allocation failed on {device}: {message}\n🔧 Free accelerator memory, load in 8-bit, or choose a smaller model")]
    Allocation { device: Device, message: String },

    /// Anything else raised while loading
    #[error("Model loading failed: {0}")]
    LoadingFailed(String),
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::LoadingFailed(message.into())
    }
}

impl TextgenError for ModelError {
    fn category(&self) -> ErrorCategory {
        match self {
            ModelError::NotFound(_) | ModelError::IncompatibleAdapter { .. } => {
                ErrorCategory::User
            }
            ModelError::Allocation { .. } => ErrorCategory::Device,
            ModelError::LoadingFailed(_) => ErrorCategory::System,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ModelError::NotFound(_) => "MODEL_NOT_FOUND",
            ModelError::IncompatibleAdapter { .. } => "MODEL_INCOMPATIBLE_ADAPTER",
            ModelError::Allocation { .. } => "MODEL_ALLOCATION",
            ModelError::LoadingFailed(_) => "MODEL_LOADING_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_requests() {
        assert!(ModelRequest::remove().is_removal());
        assert!(ModelRequest::new("  ").is_removal());
        assert!(!ModelRequest::new("tiny-chat").is_removal());
    }

    #[test]
    fn test_model_error_categories() {
        let err = ModelError::Allocation {
            device: Device::Accelerator(0),
            message: "needs 8 GiB".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Device);
        assert!(err.to_string().contains("accelerator:0"));
        assert!(ModelError::NotFound("x".into()).is_user_error());
    }
}
