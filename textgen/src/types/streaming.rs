//! Events delivered to stream consumers.

use super::errors::ErrorKind;
use serde::{Deserialize, Serialize};

/// One item of a generation stream.
///
/// For one call the sequence is zero or more `PartialText` followed by
/// exactly one terminal `Done` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    PartialText(String),
    Done(String),
    Failed(ErrorKind),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::PartialText(_))
    }
}
