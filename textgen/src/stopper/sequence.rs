//! Stop-sequence compilation and matching.
//!
//! A [`StopSpec`] is a token sequence plus the number of times it must be
//! seen at the tail of the output before it counts as satisfied. Counts above
//! one exist for turn markers that the model is expected to produce once as
//! part of the echoed template before the real end of the turn.

use super::Stopper;
use crate::backend::Codec;
use crate::types::{BackendError, FinishReason};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// One compiled halting condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSpec {
    token_ids: Vec<u32>,
    required_encounters: usize,
}

impl StopSpec {
    /// `required_encounters` below one is treated as one.
    pub fn new(token_ids: Vec<u32>, required_encounters: usize) -> Self {
        Self {
            token_ids,
            required_encounters: required_encounters.max(1),
        }
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn required_encounters(&self) -> usize {
        self.required_encounters
    }

    /// Tokenize one phrase into the sequence that would appear mid-generation.
    ///
    /// Two tokenizer artifacts are removed: a leading padding token on a
    /// multi-token encoding, and the stray marker token some tokenizers put in
    /// front of text that begins with a newline. Returns `None` for phrases
    /// that encode to nothing.
    pub fn compile_phrase(
        phrase: &str,
        required_encounters: usize,
        codec: &dyn Codec,
    ) -> Result<Option<Self>, BackendError> {
        let mut ids = codec.encode(phrase)?;

        if ids.len() > 1 && ids.first().copied() == codec.pad_token_id() {
            ids.remove(0);
        }

        if phrase.starts_with('\n') && ids.len() > 1 {
            let first = codec.decode(&ids[..1], true)?;
            if !first.contains('\n') {
                ids.remove(0);
            }
        }

        if ids.is_empty() {
            warn!(phrase, "Stop phrase encodes to no tokens, ignoring it");
            return Ok(None);
        }

        debug!(phrase, tokens = ?ids, required_encounters, "Compiled stop phrase");
        Ok(Some(Self::new(ids, required_encounters)))
    }

    /// Compile `(phrase, required_encounters)` pairs.
    pub fn compile(
        phrases: &[(&str, usize)],
        codec: &dyn Codec,
    ) -> Result<Vec<Self>, BackendError> {
        let mut specs = Vec::with_capacity(phrases.len());
        for (phrase, required) in phrases {
            if let Some(spec) = Self::compile_phrase(phrase, *required, codec)? {
                specs.push(spec);
            }
        }
        Ok(specs)
    }
}

/// How satisfied specs combine into a halt decision.
///
/// Under `All` a convention with several markers only halts once the model has
/// produced every one of them as often as required. For `human_bot` that means
/// both `<human>:` and `<bot>:` with and without a leading newline, each
/// `<bot>:` form twice, which rarely happens; such turns usually run to
/// `max_new_tokens` and rely on response extraction to cut the text. Choose
/// `Any` to end a turn at the first satisfied marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltPolicy {
    /// Halt once every spec is satisfied.
    #[default]
    All,
    /// Halt once any spec is satisfied.
    Any,
}

/// Tracks matches of a set of [`StopSpec`]s against the output tail.
///
/// With no specs the matcher never halts.
#[derive(Debug, Clone)]
pub struct StopSequenceMatcher {
    specs: Vec<StopSpec>,
    counts: Vec<usize>,
    window: VecDeque<u32>,
    window_len: usize,
    policy: HaltPolicy,
    halted: bool,
}

impl StopSequenceMatcher {
    pub fn new(specs: Vec<StopSpec>) -> Self {
        let window_len = specs.iter().map(|s| s.token_ids.len()).max().unwrap_or(0);
        let counts = vec![0; specs.len()];
        Self {
            specs,
            counts,
            window: VecDeque::with_capacity(window_len),
            window_len,
            policy: HaltPolicy::default(),
            halted: false,
        }
    }

    pub fn with_policy(mut self, policy: HaltPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn specs(&self) -> &[StopSpec] {
        &self.specs
    }

    /// Completed matches per spec, in spec order.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Seed the tail window with prompt tokens without counting matches, so a
    /// sequence that straddles the end of the prompt can still complete.
    pub fn prime(&mut self, prompt_ids: &[u32]) {
        let start = prompt_ids.len().saturating_sub(self.window_len);
        for &token in &prompt_ids[start..] {
            self.push(token);
        }
    }

    fn push(&mut self, token: u32) {
        if self.window_len == 0 {
            return;
        }
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(token);
    }

    fn tail_matches(&self, sequence: &[u32]) -> bool {
        let len = sequence.len();
        len > 0
            && self.window.len() >= len
            && self
                .window
                .iter()
                .skip(self.window.len() - len)
                .eq(sequence.iter())
    }

    /// Observe one generated token and report whether generation must halt.
    pub fn observe(&mut self, token: u32) -> bool {
        if self.specs.is_empty() {
            return false;
        }
        self.push(token);

        for index in 0..self.specs.len() {
            if self.tail_matches(&self.specs[index].token_ids) {
                self.counts[index] += 1;
                debug!(
                    spec = index,
                    count = self.counts[index],
                    required = self.specs[index].required_encounters,
                    "Stop sequence matched"
                );
            }
        }

        let satisfied = |(spec, count): (&StopSpec, &usize)| *count >= spec.required_encounters;
        let mut pairs = self.specs.iter().zip(self.counts.iter());
        let halt = match self.policy {
            HaltPolicy::All => pairs.all(satisfied),
            HaltPolicy::Any => pairs.any(satisfied),
        };
        self.halted |= halt;
        self.halted
    }
}

impl Stopper for StopSequenceMatcher {
    fn should_stop(&mut self, token: u32) -> Option<FinishReason> {
        self.observe(token).then_some(FinishReason::StopSequence)
    }
}
