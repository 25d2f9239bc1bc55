//! Shared async utilities and patterns

use std::time::Duration;
use tokio::time::timeout;

/// Execute an async operation with a timeout
pub async fn with_timeout<T, E, F>(
    operation: F,
    timeout_duration: Duration,
) -> Result<T, TimeoutError<E>>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    match timeout(timeout_duration, operation).await {
        Ok(result) => result.map_err(TimeoutError::Operation),
        Err(_) => {
            tracing::debug!(?timeout_duration, "Operation timed out");
            Err(TimeoutError::Timeout {
                duration: timeout_duration,
            })
        }
    }
}

/// Error type for timeout operations
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },
    #[error("Operation failed: {0}")]
    Operation(E),
}

impl<E> TimeoutError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::Timeout { .. })
    }
}
