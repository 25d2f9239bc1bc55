use super::Stopper;
use crate::types::FinishReason;
use tracing::{debug, warn};

/// Stopper that ends generation on the end-of-sequence token.
#[derive(Debug)]
pub struct EosStopper {
    eos_token_id: Option<u32>,
}

impl EosStopper {
    /// A codec without an EOS token yields a stopper that never fires.
    pub fn new(eos_token_id: Option<u32>) -> Self {
        if eos_token_id.is_none() {
            warn!("Codec has no end-of-sequence token; EOS detection disabled");
        }
        Self { eos_token_id }
    }
}

impl Stopper for EosStopper {
    fn should_stop(&mut self, token: u32) -> Option<FinishReason> {
        if Some(token) == self.eos_token_id {
            debug!(token, "End-of-sequence token generated");
            Some(FinishReason::EndOfSequence)
        } else {
            None
        }
    }
}
