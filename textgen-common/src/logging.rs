//! Log formatting helpers

use serde::Serialize;
use std::fmt::Debug;

/// Renders a serialisable value as YAML on its own lines for log output.
///
/// Falls back to pretty `Debug` output when serialisation fails.
///
/// ```rust
/// use textgen_common::Pretty;
///
/// let params = vec![("temperature", 0.7)];
/// tracing::debug!("parameters: {}", Pretty(&params));
/// ```
pub struct Pretty<T>(pub T);

impl<T: Serialize + Debug> std::fmt::Display for Pretty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_yaml_ng::to_string(&self.0) {
            Ok(yaml) => write!(f, "\n{}", yaml),
            Err(_) => write!(f, "\n{:#?}", self.0),
        }
    }
}

impl<T: Serialize + Debug> std::fmt::Debug for Pretty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
