//! # Generation Stoppers Module
//!
//! Decides, one token at a time, when a generation call must end.
//!
//! ## Overview
//!
//! Every stopping condition implements [`Stopper`] and is evaluated from the
//! per-step callback of the model primitive, so it only ever sees the newest
//! token. Conditions available:
//!
//! - **End-of-Sequence**: [`EosStopper`] fires on the codec's EOS token
//! - **Token budget**: [`MaxTokensStopper`] fires after `max_new_tokens`
//! - **Wall clock**: [`DeadlineStopper`] fires once `max_time` has elapsed
//! - **Stop sequences**: [`StopSequenceMatcher`] fires once the compiled
//!   [`StopSpec`]s are satisfied
//!
//! [`HardStopDetector`] is different: it looks at decoded text on the
//! consumer side and turns a match into an immediate abort rather than a
//! normal finish.
//!
//! ## Composition
//!
//! [`StopperChain`] evaluates its stoppers in order on every token and the
//! first one to return a [`FinishReason`] ends generation with that reason.
//! Every stopper in the chain still observes the token, so stateful matchers
//! never miss part of a sequence.
//!
//! ```rust
//! use textgen::stopper::{EosStopper, MaxTokensStopper, Stopper, StopperChain};
//! use textgen::types::FinishReason;
//!
//! let mut chain = StopperChain::new(vec![
//!     Box::new(EosStopper::new(Some(2))),
//!     Box::new(MaxTokensStopper::new(3)),
//! ]);
//! assert_eq!(chain.should_stop(10), None);
//! assert_eq!(chain.should_stop(2), Some(FinishReason::EndOfSequence));
//! ```

use crate::types::FinishReason;

pub mod deadline;
pub mod eos;
pub mod hard_stop;
pub mod max_tokens;
pub mod sequence;

pub use deadline::DeadlineStopper;
pub use eos::EosStopper;
pub use hard_stop::HardStopDetector;
pub use max_tokens::MaxTokensStopper;
pub use sequence::{HaltPolicy, StopSequenceMatcher, StopSpec};

/// Trait for determining when to stop text generation.
///
/// ## Implementation Requirements
///
/// Implementing types must:
/// 1. Be `Send`, since they run on the generation worker thread
/// 2. Never panic; unexpected state is logged and treated as "continue"
/// 3. Work incrementally from the newest token, in bounded memory
///
/// Stoppers carry mutable state and are created per generation call.
pub trait Stopper: Send {
    /// Observe one newly generated token.
    ///
    /// # Returns
    ///
    /// * `Some(FinishReason)` - Generation should stop with the specified reason
    /// * `None` - Generation should continue
    fn should_stop(&mut self, token: u32) -> Option<FinishReason>;
}

/// Ordered set of stoppers where the first reason wins.
#[derive(Default)]
pub struct StopperChain {
    stoppers: Vec<Box<dyn Stopper>>,
}

impl StopperChain {
    pub fn new(stoppers: Vec<Box<dyn Stopper>>) -> Self {
        Self { stoppers }
    }

    pub fn push(&mut self, stopper: Box<dyn Stopper>) {
        self.stoppers.push(stopper);
    }

    pub fn len(&self) -> usize {
        self.stoppers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stoppers.is_empty()
    }
}

impl Stopper for StopperChain {
    fn should_stop(&mut self, token: u32) -> Option<FinishReason> {
        let mut reason = None;
        for stopper in &mut self.stoppers {
            let verdict = stopper.should_stop(token);
            if reason.is_none() {
                reason = verdict;
            }
        }
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let mut chain = StopperChain::new(vec![
            Box::new(EosStopper::new(Some(2))),
            Box::new(MaxTokensStopper::new(1)),
        ]);
        assert_eq!(chain.should_stop(2), Some(FinishReason::EndOfSequence));
    }

    #[test]
    fn test_every_stopper_observes_each_token() {
        let spec = StopSpec::new(vec![7, 8], 1);
        let mut chain = StopperChain::new(vec![
            Box::new(MaxTokensStopper::new(1)),
            Box::new(StopSequenceMatcher::new(vec![spec])),
        ]);
        assert_eq!(chain.should_stop(7), Some(FinishReason::MaxTokens));
        // the matcher saw 7, so 8 completes the sequence
        assert_eq!(chain.should_stop(8), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn test_empty_chain_never_stops() {
        let mut chain = StopperChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.should_stop(1), None);
    }
}
