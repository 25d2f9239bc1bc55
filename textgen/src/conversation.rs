//! Turn history maintenance and bounded context rendering.
//!
//! Every operation takes a history and returns the next one, leaving the
//! input untouched, so callers can keep the old state until a new one is
//! accepted.

use crate::prompt::{PromptBuilder, PromptConvention};
use crate::types::{ChatTurn, ConversationHistory};
use std::sync::Arc;
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;
use tracing::debug;

/// The last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}

/// Errors from history updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("Conversation has no turns")]
    Empty,

    #[error("The last turn already has a response")]
    AlreadyAnswered,

    #[error("Turn {0} has no response but is not the trailing turn")]
    PendingTurnNotLast(usize),
}

impl TextgenError for ConversationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::User
    }

    fn error_code(&self) -> &'static str {
        match self {
            ConversationError::Empty => "CONVERSATION_EMPTY",
            ConversationError::AlreadyAnswered => "CONVERSATION_ALREADY_ANSWERED",
            ConversationError::PendingTurnNotLast(_) => "CONVERSATION_PENDING_TURN_NOT_LAST",
        }
    }
}

/// Owns the rules for changing a [`ConversationHistory`] and for rendering its
/// context.
pub struct ConversationContextManager {
    prompts: Arc<dyn PromptBuilder>,
    budget_chars: usize,
}

impl ConversationContextManager {
    pub fn new(prompts: Arc<dyn PromptBuilder>, budget_chars: usize) -> Self {
        Self {
            prompts,
            budget_chars,
        }
    }

    pub fn budget_chars(&self) -> usize {
        self.budget_chars
    }

    /// Add a pending turn. A trailing turn that never got a response is
    /// dropped first.
    pub fn append(
        &self,
        history: &ConversationHistory,
        user_text: impl Into<String>,
    ) -> ConversationHistory {
        let mut next = history.clone();
        if next.pending_turn().is_some() {
            debug!("Dropping interrupted turn before appending");
            next.pop();
        }
        next.push(ChatTurn::pending(user_text));
        next
    }

    /// Remove the last turn; empty histories are returned unchanged.
    pub fn undo(&self, history: &ConversationHistory) -> ConversationHistory {
        let mut next = history.clone();
        next.pop();
        next
    }

    /// Fill in the response of the trailing turn.
    pub fn commit(
        &self,
        history: &ConversationHistory,
        final_text: impl Into<String>,
    ) -> Result<ConversationHistory, ConversationError> {
        let mut next = history.clone();
        let turn = next.last_mut().ok_or(ConversationError::Empty)?;
        if !turn.is_pending() {
            return Err(ConversationError::AlreadyAnswered);
        }
        turn.response = Some(final_text.into());
        Ok(next)
    }

    /// Drop the last turn and submit its user text again.
    ///
    /// Returns the new history and the resubmitted text.
    pub fn retry(
        &self,
        history: &ConversationHistory,
    ) -> Result<(ConversationHistory, String), ConversationError> {
        let user_text = history
            .last()
            .map(|turn| turn.user_text.clone())
            .ok_or(ConversationError::Empty)?;
        let next = self.append(&self.undo(history), user_text.clone());
        Ok((next, user_text))
    }

    /// Context for the trailing turn, bounded by the configured budget.
    pub fn render_context(
        &self,
        history: &ConversationHistory,
        convention: PromptConvention,
    ) -> String {
        self.render_context_within(history, convention, self.budget_chars)
    }

    /// Render every turn but the last with the reduced template and keep the
    /// most recent `budget_chars` characters.
    pub fn render_context_within(
        &self,
        history: &ConversationHistory,
        convention: PromptConvention,
        budget_chars: usize,
    ) -> String {
        let turns = history.turns();
        let earlier = &turns[..turns.len().saturating_sub(1)];

        let mut context = String::new();
        for turn in earlier {
            context.push_str(&self.prompts.render_reduced(convention, turn));
            if !context.ends_with('\n') {
                context.push('\n');
            }
        }

        tail_chars(&context, budget_chars).to_string()
    }
}

impl std::fmt::Debug for ConversationContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationContextManager")
            .field("budget_chars", &self.budget_chars)
            .finish_non_exhaustive()
    }
}
