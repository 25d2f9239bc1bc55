//! # textgen
//!
//! Interactive text generation over a loaded sequence model: single-shot and
//! token-streaming delivery, multi-turn conversations with a bounded context,
//! and hot-swapping of the active model.
//!
//! ## Modules
//!
//! - [`stream`] - Worker-thread bridge from a blocking, callback-driven
//!   `generate` call to a cancellable stream of text increments
//! - [`stopper`] - Stop-sequence compilation and matching, plus token,
//!   deadline and end-of-sequence limits
//! - [`generation`] - One request end to end, including out-of-memory and
//!   device-fault recovery
//! - [`conversation`] - Turn history updates and bounded context rendering
//! - [`lifecycle`] - Loading, swapping and releasing models per slot
//! - [`agent`] - Caller-facing chat API tying the above together
//! - [`backend`] - Model and codec contracts, with scripted implementations
//! - [`config`] - Layered configuration (defaults, file, environment)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use textgen::backend::{ScriptedLoader, ScriptedModel};
//! use textgen::{ChatAgent, EngineConfig, ModelRequest, SlotId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = ScriptedLoader::new(8)
//!     .with_model("demo", ScriptedModel::builder().reply("Hello there."));
//! let agent = ChatAgent::from_config(EngineConfig::default(), Arc::new(loader))?;
//! agent
//!     .switch_model(SlotId::Primary, ModelRequest::new("demo"))
//!     .await?;
//!
//! let conversation = agent.open_conversation(SlotId::Primary).await;
//! let reply = agent.generate(conversation, "Hi!", None).await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod backend;
pub mod config;
pub mod conversation;
pub mod generation;
pub mod lifecycle;
pub mod prompt;
pub mod stopper;
pub mod storage;
pub mod stream;
pub mod types;

pub use agent::{AgentError, ChatAgent, EventStream};
pub use config::{ConfigError, ConfigProvider, EngineConfig};
pub use conversation::{ConversationContextManager, ConversationError};
pub use generation::{
    GenerationError, GenerationOutcome, GenerationRequest, GenerationSession, SessionConfig,
};
pub use lifecycle::{
    DegradedState, ModelHandle, ModelLease, ModelLifecycleManager, ModelLoader, ModelRequest,
    ModelSummary, SlotId, SlotStatus,
};
pub use prompt::{ConventionPromptBuilder, PromptBuilder, PromptConvention};
pub use stopper::{HaltPolicy, StopSequenceMatcher, StopSpec};
pub use stream::{StreamHandle, TokenStreamAdapter};
pub use types::{
    ChatTurn, ConversationHistory, ConversationId, ErrorKind, FinishReason, GenerationParameters,
    StreamEvent,
};
