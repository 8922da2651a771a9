//! Conversation repair for providers that require a strictly alternating,
//! user-first history without empty turns.

use crate::chat::Role;
use crate::error::ChatError;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
    /// Provider-native media parts (inline or file data) attached to the turn.
    pub media: Vec<Value>,
}

impl HistoryTurn {
    fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.media.is_empty()
    }
}

/// Drops empty turns, trims everything before the first user turn and merges
/// consecutive same-role text-only turns with a newline separator.
pub fn repair(turns: Vec<HistoryTurn>) -> Result<Vec<HistoryTurn>, ChatError> {
    let non_blank = turns.into_iter().filter(|turn| !turn.is_blank());
    let user_first: Vec<HistoryTurn> = non_blank
        .skip_while(|turn| turn.role != Role::User)
        .collect();
    if user_first.is_empty() {
        return Err(ChatError::InvalidHistory(
            "conversation must contain at least one non-empty user turn".to_string(),
        ));
    }

    let mut merged: Vec<HistoryTurn> = Vec::with_capacity(user_first.len());
    for turn in user_first {
        if let Some(last) = merged.last_mut() {
            if last.role == turn.role && last.media.is_empty() && turn.media.is_empty() {
                last.text.push('\n');
                last.text.push_str(&turn.text);
                continue;
            }
        }
        merged.push(turn);
    }
    if merged.is_empty() {
        return Err(ChatError::InvalidHistory(
            "conversation is empty after repair".to_string(),
        ));
    }
    Ok(merged)
}
