use super::Stopper;
use crate::types::FinishReason;
use std::time::{Duration, Instant};
use tracing::info;

/// Stopper that enforces a wall-clock budget, checked at each step.
#[derive(Debug)]
pub struct DeadlineStopper {
    started: Instant,
    max_time: Duration,
}

impl DeadlineStopper {
    pub fn new(max_time: Duration) -> Self {
        Self {
            started: Instant::now(),
            max_time,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Stopper for DeadlineStopper {
    fn should_stop(&mut self, _token: u32) -> Option<FinishReason> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.max_time {
            info!(?elapsed, max_time = ?self.max_time, "Generation time limit reached");
            Some(FinishReason::TimeLimit)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        let mut generous = DeadlineStopper::new(Duration::from_secs(60));
        assert_eq!(generous.should_stop(1), None);

        let mut expired = DeadlineStopper::new(Duration::ZERO);
        assert_eq!(expired.should_stop(1), Some(FinishReason::TimeLimit));
    }
}
