//! Turn lifecycle: the phase a conversation turn is in, and the pure
//! mutations each phase applies to a conversation's working copy.

use serde::Serialize;

use crate::errors::AppError;
use crate::models::{Conversation, Message, MessageRole};

const TITLE_WORD_LIMIT: usize = 6;

/// Phase of the single active turn. `Settled` and `Aborted` both return here
/// as `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    Submitting { conversation_id: String },
    Streaming { conversation_id: String, message_id: String },
}

impl TurnPhase {
    pub fn name(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Submitting { .. } => "submitting",
            TurnPhase::Streaming { .. } => "streaming",
        }
    }

    pub fn active_conversation(&self) -> Option<&str> {
        match self {
            TurnPhase::Idle => None,
            TurnPhase::Submitting { conversation_id }
            | TurnPhase::Streaming { conversation_id, .. } => Some(conversation_id),
        }
    }

    /// Message id of the in-progress assistant reply, if `conversation_id` is streaming.
    pub fn streaming_message(&self, conversation_id: &str) -> Option<&str> {
        match self {
            TurnPhase::Streaming { conversation_id: active, message_id } if active == conversation_id => {
                Some(message_id)
            }
            _ => None,
        }
    }

    pub(crate) fn reject(&self, operation: &'static str, conversation_id: &str) -> AppError {
        AppError::InvalidTransition {
            operation,
            conversation_id: conversation_id.to_string(),
            phase: self.name(),
        }
    }
}

/// Why a turn ended early. Partial output is kept in every case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    Transport { message: String },
    Internal { message: String },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Transport { message } => write!(f, "transport failure: {message}"),
            AbortReason::Internal { message } => write!(f, "internal failure: {message}"),
        }
    }
}

/// Title for a conversation, taken from its first user message.
pub fn derive_title(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= TITLE_WORD_LIMIT {
        return text.to_string();
    }
    format!("{}...", words[..TITLE_WORD_LIMIT].join(" "))
}

/// Appends the user message for a new turn. `text` is already trimmed.
pub(crate) fn append_user_message(conversation: &mut Conversation, text: &str, model: &str) -> Message {
    if conversation.messages.is_empty() {
        conversation.title = derive_title(text);
    }
    let message = Message::user(text);
    conversation.messages.push(message.clone());
    conversation.model = model.to_string();
    conversation.touch();
    message
}

pub(crate) fn append_assistant_message(conversation: &mut Conversation, model: &str) -> Message {
    let message = Message::assistant(model);
    conversation.messages.push(message.clone());
    conversation.touch();
    message
}

/// Appends `fragment` to the trailing assistant message, which must be `message_id`.
pub(crate) fn append_fragment(
    conversation: &mut Conversation,
    message_id: &str,
    fragment: &str,
) -> Result<(), AppError> {
    let trailing = conversation
        .messages
        .last_mut()
        .filter(|m| m.role == MessageRole::Assistant && m.id == message_id)
        .ok_or_else(|| {
            AppError::Unexpected(format!(
                "conversation '{}' has no trailing assistant message '{message_id}'",
                conversation.id
            ))
        })?;
    if fragment.is_empty() {
        return Ok(());
    }
    trailing.content.push_str(fragment);
    conversation.touch();
    Ok(())
}
