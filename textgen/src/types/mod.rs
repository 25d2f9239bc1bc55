//! Core data types shared across the engine.
//!
//! Types are grouped by concern and re-exported here so callers can use
//! `textgen::types::*` without knowing the module layout.

pub mod conversation;
pub mod errors;
pub mod generation;
pub mod ids;
pub mod streaming;

pub use conversation::{ChatTurn, ConversationHistory};
pub use errors::{classify_backend_error, BackendError, ErrorKind};
pub use generation::{EarlyStopping, FinishReason, GenerationParameters, ParameterError};
pub use ids::ConversationId;
pub use streaming::StreamEvent;
