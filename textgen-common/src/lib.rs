//! # Textgen Common
//!
//! Shared types, traits, and utilities for the textgen workspace.
//! Keeps error categorisation, configuration validation and log formatting
//! consistent between the engine and anything embedding it.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;

pub use async_utils::{with_timeout, TimeoutError};
pub use config::{DefaultConfig, ValidatedConfig};
pub use error::{ErrorCategory, TextgenError};
pub use logging::Pretty;
