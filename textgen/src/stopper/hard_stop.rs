use tracing::info;

/// Watches decoded text for phrases that abort generation outright.
///
/// Deltas arrive in pieces, so the detector keeps just enough trailing text
/// to catch a phrase split across increments.
#[derive(Debug, Clone, Default)]
pub struct HardStopDetector {
    phrases: Vec<String>,
    carry: String,
    carry_chars: usize,
}

impl HardStopDetector {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .collect();
        let carry_chars = phrases
            .iter()
            .map(|p| p.chars().count())
            .max()
            .unwrap_or(1)
            .saturating_sub(1);
        Self {
            phrases,
            carry: String::new(),
            carry_chars,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Feed the next decoded increment; returns the phrase that fired, if any.
    pub fn observe(&mut self, delta: &str) -> Option<&str> {
        if self.phrases.is_empty() {
            return None;
        }
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(delta);

        let hit = self.phrases.iter().position(|p| buffer.contains(p.as_str()));

        let keep_from = buffer
            .char_indices()
            .rev()
            .nth(self.carry_chars.saturating_sub(1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.carry = if self.carry_chars == 0 {
            String::new()
        } else {
            buffer[keep_from..].to_string()
        };

        hit.map(|index| {
            let phrase = self.phrases[index].as_str();
            info!(phrase, "Hard stop phrase detected");
            phrase
        })
    }
}
