//! Conversation Channel
//!
//! Append-only message log per user pair with live delivery. Writes to one
//! conversation are serialized by the pair lock; publishing happens under
//! the same lock, so subscribers see messages in `sent_at` order.

pub mod channel;
pub mod subscription;

pub use channel::{ConversationChannel, HistoryPage, MessageCursor};
pub use subscription::Subscription;

use chrono::{DateTime, Utc};
use kindred_common::models::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live event on one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// A message was appended
    Message(Message),
    /// The receiver read a message
    ReadReceipt {
        message_id: Uuid,
        reader_id: Uuid,
        read_at: DateTime<Utc>,
    },
}

impl ConversationEvent {
    /// The message carried by this event, if any
    pub fn message(&self) -> Option<&Message> {
        match self {
            ConversationEvent::Message(message) => Some(message),
            ConversationEvent::ReadReceipt { .. } => None,
        }
    }
}
