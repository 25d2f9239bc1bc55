use super::Stopper;
use crate::types::FinishReason;
use tracing::{debug, info, warn};

/// Stopper that limits generation to a maximum number of tokens.
///
/// Counts every token the model produces after the prompt and fires on the
/// token that reaches the limit. Uses constant memory regardless of
/// generation length.
///
/// # Examples
///
/// ```rust
/// use textgen::stopper::{MaxTokensStopper, Stopper};
/// use textgen::types::FinishReason;
///
/// let mut stopper = MaxTokensStopper::new(2);
/// assert_eq!(stopper.should_stop(5), None);
/// assert_eq!(stopper.should_stop(6), Some(FinishReason::MaxTokens));
/// ```
#[derive(Debug)]
pub struct MaxTokensStopper {
    /// Maximum number of tokens allowed before stopping generation.
    ///
    /// Set to 0 to stop on the first token (useful for testing).
    max_tokens: usize,

    /// Running count of tokens generated so far.
    tokens_generated: usize,
}

impl MaxTokensStopper {
    pub fn new(max_tokens: usize) -> Self {
        debug!(
            "Creating MaxTokensStopper with limit: {} tokens",
            max_tokens
        );

        if max_tokens == 0 {
            warn!("MaxTokensStopper created with 0 token limit - will stop immediately");
        } else if max_tokens > 50000 {
            warn!(
                "MaxTokensStopper created with very high token limit ({}), consider if this is intentional",
                max_tokens
            );
        }

        Self {
            max_tokens,
            tokens_generated: 0,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn tokens_generated(&self) -> usize {
        self.tokens_generated
    }

    /// Tokens left before the limit, or 0 once it has been reached.
    pub fn tokens_remaining(&self) -> usize {
        self.max_tokens.saturating_sub(self.tokens_generated)
    }

    pub fn is_limit_reached(&self) -> bool {
        self.tokens_generated >= self.max_tokens
    }
}

impl Stopper for MaxTokensStopper {
    fn should_stop(&mut self, _token: u32) -> Option<FinishReason> {
        self.tokens_generated = self.tokens_generated.saturating_add(1);

        if self.is_limit_reached() {
            info!(
                max_tokens = self.max_tokens,
                tokens_generated = self.tokens_generated,
                "MaxTokensStopper triggered - stopping generation"
            );
            Some(FinishReason::MaxTokens)
        } else {
            if self.tokens_generated % 100 == 0 {
                debug!(
                    "Generation progress: {}/{} tokens ({}% complete)",
                    self.tokens_generated,
                    self.max_tokens,
                    (self.tokens_generated * 100 / self.max_tokens)
                );
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_tokens_stopper_creation() {
        let stopper = MaxTokensStopper::new(100);

        assert_eq!(stopper.max_tokens(), 100);
        assert_eq!(stopper.tokens_generated(), 0);
        assert_eq!(stopper.tokens_remaining(), 100);
    }

    #[test]
    fn test_fires_exactly_at_limit() {
        let mut stopper = MaxTokensStopper::new(3);
        assert_eq!(stopper.should_stop(1), None);
        assert_eq!(stopper.should_stop(1), None);
        assert_eq!(stopper.should_stop(1), Some(FinishReason::MaxTokens));
        assert!(stopper.is_limit_reached());
        assert_eq!(stopper.tokens_remaining(), 0);
    }

    #[test]
    fn test_zero_limit_stops_on_first_token() {
        let mut stopper = MaxTokensStopper::new(0);
        assert_eq!(stopper.should_stop(9), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn test_thread_safety() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<MaxTokensStopper>();
        assert_sync::<MaxTokensStopper>();
    }

    #[test]
    fn test_stopper_trait_compliance() {
        let stopper = MaxTokensStopper::new(100);
        let _boxed: Box<dyn Stopper> = Box::new(stopper);
    }
}
