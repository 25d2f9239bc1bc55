//! Loaded model handles.

use crate::backend::{Device, ModelKind};
use crate::prompt::PromptConvention;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A loaded, ready-to-run model with its codec, device and name.
///
/// Owned by [`super::ModelLifecycleManager`]; sessions only borrow it through a
/// [`super::ModelLease`].
#[derive(Debug)]
pub struct ModelHandle {
    name: String,
    kind: ModelKind,
    device: Device,
    adapter_weights: Option<String>,
    convention: PromptConvention,
    exec_lock: Arc<Mutex<()>>,
}

impl ModelHandle {
    pub fn new(name: impl Into<String>, kind: ModelKind, device: Device) -> Self {
        Self {
            name: name.into(),
            kind,
            device,
            adapter_weights: None,
            convention: PromptConvention::default(),
            exec_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_adapter_weights(mut self, adapter_weights: Option<String>) -> Self {
        self.adapter_weights = adapter_weights;
        self
    }

    pub fn with_convention(mut self, convention: PromptConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ModelKind {
        &self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn adapter_weights(&self) -> Option<&str> {
        self.adapter_weights.as_deref()
    }

    pub fn convention(&self) -> PromptConvention {
        self.convention
    }

    pub(crate) fn set_convention(&mut self, convention: PromptConvention) {
        self.convention = convention;
    }

    /// Wait for exclusive use of the model when it is not reentrant.
    ///
    /// Returns `None` for reentrant models. The guard is held by whoever runs
    /// the blocking call and released when that call returns.
    pub async fn acquire_execution(&self) -> Option<OwnedMutexGuard<()>> {
        if self.kind.is_reentrant() {
            None
        } else {
            Some(Arc::clone(&self.exec_lock).lock_owned().await)
        }
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name.clone(),
            device: self.device,
            adapter_weights: self.adapter_weights.clone(),
            convention: self.convention,
            pipeline: self.kind.is_pipeline(),
        }
    }
}

/// Serializable description of an active handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub device: Device,
    pub adapter_weights: Option<String>,
    pub convention: PromptConvention,
    pub pipeline: bool,
}
