//! Session settings derived from the engine configuration.

use crate::stopper::HaltPolicy;
use crate::stream::StreamConfig;
use std::time::Duration;

/// Settings shared by every generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Tokens kept free for output when truncating the prompt.
    pub reserved_output_tokens: usize,
    /// Re-raise accelerator errors after cleanup instead of reporting a failure.
    pub strict_accelerator_errors: bool,
    /// Literal phrases that abort generation when they appear in output.
    pub hard_stop_phrases: Vec<String>,
    pub halt_policy: HaltPolicy,
    pub channel_capacity: usize,
    pub cancel_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reserved_output_tokens: 256,
            strict_accelerator_errors: false,
            hard_stop_phrases: Vec::new(),
            halt_policy: HaltPolicy::All,
            channel_capacity: 64,
            cancel_grace: Duration::from_millis(2000),
        }
    }
}

impl SessionConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channel_capacity: self.channel_capacity,
            cancel_grace: self.cancel_grace,
        }
    }

    /// Prompt-token budget for a model with the given context length.
    pub fn prompt_budget(&self, max_context_length: usize) -> usize {
        max_context_length
            .saturating_sub(self.reserved_output_tokens)
            .max(1)
    }
}
