//! Conversation turn and history types.

use crate::conversation::ConversationError;
use serde::{Deserialize, Serialize};

/// One user-instruction / model-response pair.
///
/// Created with `response = None` when the user submits, and filled in once
/// generation completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user_text: String,
    pub response: Option<String>,
}

impl ChatTurn {
    pub fn pending(user_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            response: None,
        }
    }

    pub fn answered(user_text: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            response: Some(response.into()),
        }
    }

    /// Compose the user text from an instruction and an optional input.
    ///
    /// A `:` separator is inserted unless the instruction already ends with one.
    pub fn compose_user_text(instruction: &str, input: &str) -> String {
        if input.is_empty() {
            instruction.to_string()
        } else if instruction.ends_with(':') {
            format!("{}{}", instruction, input)
        } else {
            format!("{}:{}", instruction, input)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.response.is_none()
    }
}

/// Ordered turn history of a single conversation, oldest first.
///
/// Only the trailing turn may be pending. The mutating helpers are crate
/// private so the invariant is maintained by
/// [`crate::conversation::ConversationContextManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<ChatTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from existing turns, rejecting any pending turn that is
    /// not the last one.
    pub fn from_turns(turns: Vec<ChatTurn>) -> Result<Self, ConversationError> {
        let last = turns.len().saturating_sub(1);
        if let Some(index) = turns
            .iter()
            .enumerate()
            .position(|(i, t)| t.is_pending() && i != last)
        {
            return Err(ConversationError::PendingTurnNotLast(index));
        }
        Ok(Self { turns })
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    /// The trailing turn if it is still waiting for a response.
    pub fn pending_turn(&self) -> Option<&ChatTurn> {
        self.turns.last().filter(|t| t.is_pending())
    }

    pub(crate) fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    pub(crate) fn pop(&mut self) -> Option<ChatTurn> {
        self.turns.pop()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut ChatTurn> {
        self.turns.last_mut()
    }
}
