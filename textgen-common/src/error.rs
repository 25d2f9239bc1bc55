//! Shared error traits for consistent error handling across crates

use std::fmt::Debug;

/// Category of error for consistent handling and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User input or configuration error - can be fixed by user
    User,
    /// System resource or environmental error - may be temporary
    System,
    /// Internal logic error - indicates a bug
    Internal,
    /// Accelerator / device error - usually cleared by releasing cached buffers
    Device,
}

/// Trait for all errors in the textgen ecosystem
///
/// Gives every crate error a category, a stable code for logs and metrics,
/// and a message suitable for showing in place of generated text.
pub trait TextgenError: std::error::Error + Send + Sync + Debug {
    /// Get the error category for proper handling
    fn category(&self) -> ErrorCategory;

    /// Get a unique error code for this error type
    fn error_code(&self) -> &'static str;

    /// Check if this is a user-correctable error
    fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error is potentially retriable
    fn is_retriable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::System | ErrorCategory::Device
        )
    }

    /// Get a user-friendly error message with actionable advice
    fn user_friendly_message(&self) -> String {
        format!("{}", self)
    }

    /// Get suggested recovery actions for this error
    fn recovery_suggestions(&self) -> Vec<String> {
        match self.category() {
            ErrorCategory::User => vec![
                "Check your input parameters".to_string(),
                "Review configuration settings".to_string(),
            ],
            ErrorCategory::System => vec![
                "Check system resources (memory, disk space)".to_string(),
                "Retry the operation".to_string(),
            ],
            ErrorCategory::Device => vec![
                "Retry with a shorter prompt or fewer new tokens".to_string(),
                "Switch to a smaller model or free accelerator memory".to_string(),
            ],
            ErrorCategory::Internal => vec![
                "Report this as a bug".to_string(),
                "Include error details and reproduction steps".to_string(),
            ],
        }
    }
}
