//! Generation parameters and finish reasons.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;

/// Beam-search early-stopping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStopping {
    /// Stop as soon as `num_beams` complete candidates exist.
    Enabled,
    /// Stop when a better candidate is unlikely.
    #[default]
    Disabled,
    /// Only stop when no better candidate can exist.
    Never,
}

/// Sampling and budget parameters for one generation call.
///
/// Validated once with [`GenerationParameters::validate`] and never mutated
/// while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_beams: u32,
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub repetition_penalty: f32,
    pub num_return_sequences: u32,
    pub early_stopping: EarlyStopping,
    /// Wall-clock budget in seconds.
    pub max_time_secs: u64,
    pub do_sample: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 1,
            max_new_tokens: 256,
            min_new_tokens: 0,
            repetition_penalty: 1.07,
            num_return_sequences: 1,
            early_stopping: EarlyStopping::Disabled,
            max_time_secs: 180,
            do_sample: false,
        }
    }
}

impl GenerationParameters {
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_min_new_tokens(mut self, min_new_tokens: usize) -> Self {
        self.min_new_tokens = min_new_tokens;
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time_secs = max_time.as_secs().max(1);
        self
    }

    pub fn with_beams(mut self, num_beams: u32, num_return_sequences: u32) -> Self {
        self.num_beams = num_beams;
        self.num_return_sequences = num_return_sequences;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32, top_k: u32) -> Self {
        self.do_sample = true;
        self.temperature = temperature;
        self.top_p = top_p;
        self.top_k = top_k;
        self
    }

    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }

    /// Copy of these parameters suitable for chat, which always returns a
    /// single sequence.
    pub fn for_chat(&self) -> Self {
        Self {
            num_return_sequences: 1,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        if !(0.0..=3.0).contains(&self.temperature) {
            return Err(ParameterError::OutOfRange {
                field: "temperature",
                value: self.temperature.to_string(),
                range: "0.0..=3.0",
            });
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ParameterError::OutOfRange {
                field: "top_p",
                value: self.top_p.to_string(),
                range: "0.0..=1.0",
            });
        }
        if self.num_beams == 0 {
            return Err(ParameterError::OutOfRange {
                field: "num_beams",
                value: "0".to_string(),
                range: ">= 1",
            });
        }
        if self.max_new_tokens == 0 {
            return Err(ParameterError::OutOfRange {
                field: "max_new_tokens",
                value: "0".to_string(),
                range: ">= 1",
            });
        }
        if self.min_new_tokens > self.max_new_tokens {
            return Err(ParameterError::Inconsistent(format!(
                "min_new_tokens ({}) exceeds max_new_tokens ({})",
                self.min_new_tokens, self.max_new_tokens
            )));
        }
        if self.repetition_penalty <= 0.0 || !self.repetition_penalty.is_finite() {
            return Err(ParameterError::OutOfRange {
                field: "repetition_penalty",
                value: self.repetition_penalty.to_string(),
                range: "> 0.0",
            });
        }
        if self.num_return_sequences == 0 {
            return Err(ParameterError::OutOfRange {
                field: "num_return_sequences",
                value: "0".to_string(),
                range: ">= 1",
            });
        }
        if !self.do_sample && self.num_return_sequences > self.num_beams {
            return Err(ParameterError::Inconsistent(format!(
                "num_return_sequences ({}) exceeds num_beams ({}) without sampling",
                self.num_return_sequences, self.num_beams
            )));
        }
        if self.max_time_secs == 0 {
            return Err(ParameterError::OutOfRange {
                field: "max_time_secs",
                value: "0".to_string(),
                range: ">= 1",
            });
        }
        Ok(())
    }
}

/// Rejected generation parameters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Parameter {field} = {value} is outside {range}")]
    OutOfRange {
        field: &'static str,
        value: String,
        range: &'static str,
    },

    #[error("Inconsistent parameters: {0}")]
    Inconsistent(String),
}

impl TextgenError for ParameterError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::User
    }

    fn error_code(&self) -> &'static str {
        match self {
            ParameterError::OutOfRange { .. } => "PARAM_OUT_OF_RANGE",
            ParameterError::Inconsistent(_) => "PARAM_INCONSISTENT",
        }
    }
}

/// Reason why text generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced its end-of-sequence token.
    EndOfSequence,
    /// Every configured stop sequence was satisfied.
    StopSequence,
    /// `max_new_tokens` were produced.
    MaxTokens,
    /// `max_time` elapsed.
    TimeLimit,
    /// The consumer cancelled the stream.
    Cancelled,
    /// The primitive returned without any stopper firing.
    ModelFinished,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FinishReason::EndOfSequence => "end of sequence",
            FinishReason::StopSequence => "stop sequence matched",
            FinishReason::MaxTokens => "maximum tokens reached",
            FinishReason::TimeLimit => "time limit reached",
            FinishReason::Cancelled => "cancelled",
            FinishReason::ModelFinished => "model finished",
        };
        f.write_str(text)
    }
}
