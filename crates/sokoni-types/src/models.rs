use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fixed order lifecycle. Strictly linear: a status only ever moves
/// forward one stage at a time and `Delivered` is terminal. Cancellation and
/// rejection are handled outside this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Ordered,
    Packed,
    Shipped,
    Delivered,
}

impl OrderStatus {
    pub const SEQUENCE: [OrderStatus; 4] = [
        OrderStatus::Ordered,
        OrderStatus::Packed,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    /// Position in the stage sequence, 0-based.
    pub fn index(&self) -> usize {
        match self {
            OrderStatus::Ordered => 0,
            OrderStatus::Packed => 1,
            OrderStatus::Shipped => 2,
            OrderStatus::Delivered => 3,
        }
    }

    /// The next stage, or `None` at the terminal stage.
    pub fn next(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Ordered => Some(OrderStatus::Packed),
            OrderStatus::Packed => Some(OrderStatus::Shipped),
            OrderStatus::Shipped => Some(OrderStatus::Delivered),
            OrderStatus::Delivered => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered)
    }

    /// Fractional progress for the stage indicator: 0.0 at `Ordered`,
    /// 1.0 at `Delivered`. Derived view only, never authoritative.
    pub fn progress(&self) -> f32 {
        self.index() as f32 / (Self::SEQUENCE.len() - 1) as f32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Ordered => "ordered",
            OrderStatus::Packed => "packed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One purchased line within an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    /// Unit price in minor currency units.
    pub unit_price: i64,
}

impl OrderItem {
    pub fn line_total(&self) -> i64 {
        self.unit_price * self.quantity as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub items: Vec<OrderItem>,
    /// Aggregate total in minor currency units.
    pub total: i64,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

/// Composite identity of a conversation: one per (product, producer, buyer)
/// triple, enforced by a unique constraint at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub product_id: Uuid,
    pub producer_id: Uuid,
    pub buyer_id: Uuid,
}

impl ConversationKey {
    /// The other participant, from `viewer`'s perspective.
    pub fn counterpart(&self, viewer: Uuid) -> Uuid {
        if viewer == self.producer_id {
            self.buyer_id
        } else {
            self.producer_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(flatten)]
    pub key: ConversationKey,
    /// Short preview of the most recent message, in canonical language.
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub last_sender_id: Option<Uuid>,
}

/// A chat message. `content` is always stored in the canonical language;
/// viewers see a translated projection. Immutable after insert except for
/// the read receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Payload for a message insert. The store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
}

/// A message payload parked locally while the store is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
}

impl From<QueuedMessage> for NewMessage {
    fn from(q: QueuedMessage) -> Self {
        NewMessage {
            conversation_id: q.conversation_id,
            sender_id: q.sender_id,
            content: q.content,
        }
    }
}
