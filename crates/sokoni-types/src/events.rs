use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, Order};

/// Row change notifications pushed by the remote store.
///
/// Every subscriber receives every event; consumers filter by scope. A chat
/// session only acts on events carrying its own conversation id, an order
/// screen only on `OrderUpdated` for its buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StoreEvent {
    /// An order row changed (status advance).
    OrderUpdated { order: Order },

    /// A conversation row changed (new preview / last-message metadata).
    ConversationUpdated { conversation: Conversation },

    /// A new message row was inserted.
    MessageCreated { message: Message },
}

impl StoreEvent {
    /// Returns the conversation id if this event is scoped to one.
    /// `OrderUpdated` is not conversation-scoped and returns `None`.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::ConversationUpdated { conversation } => Some(conversation.id),
            Self::MessageCreated { message } => Some(message.conversation_id),
            Self::OrderUpdated { .. } => None,
        }
    }
}
