//! Model and codec contracts consumed by the engine.
//!
//! The engine never runs numerical kernels itself. A loaded model is one of
//! two shapes, resolved once at load time into [`ModelKind`]:
//!
//! - [`ModelKind::Raw`]: a [`SequenceModel`] that produces token ids through a
//!   blocking, callback-driven `generate` call, plus the [`Codec`] used to
//!   tokenize prompts and decode output.
//! - [`ModelKind::Pipeline`]: a [`PipelineTask`] that maps text to text in one
//!   call (e.g. summarisation) and never streams.
//!
//! The [`scripted`] module provides deterministic implementations of all of
//! these for tests and demos.

use crate::types::{BackendError, GenerationParameters};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod scripted;

pub use scripted::{
    ScriptedCodec, ScriptedLoader, ScriptedModel, ScriptedModelBuilder, ScriptedPipeline,
};

/// Tokenizer contract.
pub trait Codec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError>;

    /// Decode ids to text. With `skip_special` set, special tokens (padding,
    /// end-of-sequence) produce no text.
    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String, BackendError>;

    fn pad_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> Option<u32>;
}

/// What the per-step callback asks the model to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    /// End the call at this step boundary and return what was produced.
    Stop,
}

/// A raw sequence model.
///
/// `generate` blocks the calling thread. It must invoke `on_token` once per
/// newly produced token of the first returned sequence and return promptly
/// after the callback answers [`StepControl::Stop`].
pub trait SequenceModel: Send + Sync {
    /// Returns the generated tokens (prompt excluded) of each returned
    /// sequence, at most `params.num_return_sequences` of them.
    fn generate(
        &self,
        input_ids: &[u32],
        params: &GenerationParameters,
        on_token: &mut dyn FnMut(u32) -> StepControl,
    ) -> Result<Vec<Vec<u32>>, BackendError>;

    /// Maximum number of tokens the model accepts, prompt and output together.
    fn max_context_length(&self) -> usize;

    /// Drop cached device buffers after a failed call.
    fn release_buffers(&self) {}

    /// Move weights off the accelerator ahead of teardown.
    fn offload(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Whether concurrent `generate` calls on one instance are safe.
    fn is_reentrant(&self) -> bool {
        false
    }
}

/// A structured text-to-text task.
pub trait PipelineTask: Send + Sync {
    fn run(&self, prompt: &str, max_length: usize) -> Result<String, BackendError>;

    fn release_buffers(&self) {}

    fn offload(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// The shape of a loaded model.
#[derive(Clone)]
pub enum ModelKind {
    Raw {
        model: Arc<dyn SequenceModel>,
        codec: Arc<dyn Codec>,
    },
    Pipeline {
        task: Arc<dyn PipelineTask>,
    },
}

impl ModelKind {
    pub fn raw(model: Arc<dyn SequenceModel>, codec: Arc<dyn Codec>) -> Self {
        ModelKind::Raw { model, codec }
    }

    pub fn pipeline(task: Arc<dyn PipelineTask>) -> Self {
        ModelKind::Pipeline { task }
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self, ModelKind::Pipeline { .. })
    }

    pub fn release_buffers(&self) {
        match self {
            ModelKind::Raw { model, .. } => model.release_buffers(),
            ModelKind::Pipeline { task } => task.release_buffers(),
        }
    }

    pub fn offload(&self) -> Result<(), BackendError> {
        match self {
            ModelKind::Raw { model, .. } => model.offload(),
            ModelKind::Pipeline { task } => task.offload(),
        }
    }

    pub fn is_reentrant(&self) -> bool {
        match self {
            ModelKind::Raw { model, .. } => model.is_reentrant(),
            ModelKind::Pipeline { .. } => false,
        }
    }
}

impl fmt::Debug for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Raw { model, .. } => f
                .debug_struct("Raw")
                .field("max_context_length", &model.max_context_length())
                .finish_non_exhaustive(),
            ModelKind::Pipeline { .. } => f.debug_struct("Pipeline").finish_non_exhaustive(),
        }
    }
}

/// Where a model's weights live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Accelerator(u32),
    #[default]
    Auto,
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(index) => write!(f, "accelerator:{}", index),
            Device::Auto => f.write_str("auto"),
        }
    }
}
