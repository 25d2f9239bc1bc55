//! Blocking-callback to pull-stream bridge.
//!
//! [`TokenStreamAdapter`] runs a model's blocking `generate` call on its own
//! worker thread and hands the consumer a [`StreamHandle`] that yields decoded
//! text increments in generation order. [`IncrementalDecoder`] turns token
//! ids into text without re-decoding the whole output on every step.

pub mod adapter;
pub mod decoder;

pub use adapter::{StopOutcome, StreamConfig, StreamHandle, StreamRequest, TokenStreamAdapter};
pub use decoder::IncrementalDecoder;
