use crate::backend::Codec;
use crate::types::BackendError;
use std::sync::Arc;

const REPLACEMENT: char = '\u{FFFD}';
/// Special tokens never reach the caller's text.
const SKIP_SPECIAL: bool = true;

/// Stateful token-to-text decoder.
///
/// Each step decodes only the ids since the last emitted boundary (plus the
/// previous increment as left context), so cost per token stays constant. Text
/// that ends in an incomplete character is held back until the next token
/// completes it or [`IncrementalDecoder::flush`] is called. The concatenation
/// of all increments and the final flush equals a full decode of the same ids.
pub struct IncrementalDecoder {
    codec: Arc<dyn Codec>,
    ids: Vec<u32>,
    prefix_offset: usize,
    read_offset: usize,
    emitted: String,
}

impl IncrementalDecoder {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            ids: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
            emitted: String::new(),
        }
    }

    /// Add a token and return newly completed text, if any.
    pub fn push(&mut self, token: u32) -> Result<Option<String>, BackendError> {
        self.ids.push(token);

        let prefix_text = self.codec.decode(
            &self.ids[self.prefix_offset..self.read_offset],
            SKIP_SPECIAL,
        )?;
        let new_text = self
            .codec
            .decode(&self.ids[self.prefix_offset..], SKIP_SPECIAL)?;

        if new_text.len() <= prefix_text.len() || new_text.ends_with(REPLACEMENT) {
            return Ok(None);
        }

        match new_text.get(prefix_text.len()..) {
            Some(delta) => {
                let delta = delta.to_string();
                self.prefix_offset = self.read_offset;
                self.read_offset = self.ids.len();
                self.emitted.push_str(&delta);
                Ok(Some(delta))
            }
            None => Ok(None),
        }
    }

    /// Emit whatever is still held back.
    pub fn flush(&mut self) -> Result<Option<String>, BackendError> {
        if self.read_offset == self.ids.len() {
            return Ok(None);
        }
        let prefix_text = self.codec.decode(
            &self.ids[self.prefix_offset..self.read_offset],
            SKIP_SPECIAL,
        )?;
        let new_text = self
            .codec
            .decode(&self.ids[self.prefix_offset..], SKIP_SPECIAL)?;
        self.prefix_offset = self.read_offset;
        self.read_offset = self.ids.len();

        let delta = new_text.get(prefix_text.len()..).unwrap_or_default();
        if delta.is_empty() {
            Ok(None)
        } else {
            self.emitted.push_str(delta);
            Ok(Some(delta.to_string()))
        }
    }

    /// Text emitted so far.
    pub fn text(&self) -> &str {
        &self.emitted
    }

    pub fn tokens(&self) -> &[u32] {
        &self.ids
    }
}

impl std::fmt::Debug for IncrementalDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalDecoder")
            .field("tokens", &self.ids.len())
            .field("prefix_offset", &self.prefix_offset)
            .field("read_offset", &self.read_offset)
            .finish()
    }
}
