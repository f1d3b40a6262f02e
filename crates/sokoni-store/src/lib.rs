pub mod memory;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use sokoni_types::events::StoreEvent;
use sokoni_types::models::{Conversation, ConversationKey, Message, NewMessage, Order, OrderStatus};

/// Errors at the remote store boundary.
///
/// `Unavailable` is the transient class: callers either retry on their next
/// natural trigger (order poll tick) or park the payload locally (message
/// outbox). Everything else is a definite answer from the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network down or service unreachable; safe to retry later.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("row not found")]
    NotFound,

    /// A unique constraint rejected the write. For conversations this means
    /// another caller created the same (product, producer, buyer) row first;
    /// re-read instead of failing.
    #[error("unique constraint violated")]
    DuplicateKey,

    /// The store returned a row that does not decode into its model type.
    /// Rejected here rather than letting half-formed rows reach the UI.
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Outcome of a conditional order-status update.
#[derive(Debug, Clone)]
pub enum OrderWrite {
    /// The expected-status check matched and the row was updated.
    Applied(Order),
    /// Someone else advanced the order first; carries the current row so the
    /// caller can refresh its projection instead of erroring.
    Conflict(Order),
}

/// The remote relational store the marketplace runs on. Consumed, never
/// implemented here beyond the gateways in this crate; orders, conversations
/// and messages are rows with a push notification per change.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn orders_for_buyer(&self, buyer_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// Conditional update: set the status to `next` only while the row still
    /// holds `expected`. A no-match comes back as [`OrderWrite::Conflict`],
    /// never as silent double-advance.
    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<OrderWrite, StoreError>;

    async fn find_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Create the conversation row for `key`. Fails with
    /// [`StoreError::DuplicateKey`] if the unique triple already exists.
    async fn create_conversation(&self, key: &ConversationKey) -> Result<Conversation, StoreError>;

    /// All messages in a conversation, newest first.
    async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Insert a message and refresh the owning conversation's preview row.
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    /// Set the read receipt on a message. Idempotent.
    async fn mark_read(&self, message_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Subscribe to row change notifications. Consumers filter by scope via
    /// [`StoreEvent::conversation_id`]; dropping the receiver ends delivery.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Resolve a conversation id for the composite key, creating the row if
/// absent. Idempotent under concurrent callers: the store's unique
/// constraint is the authority, and a duplicate-key rejection means another
/// caller won the race; re-read and return their row.
pub async fn resolve_conversation(
    store: &dyn RemoteStore,
    key: &ConversationKey,
) -> Result<Conversation, StoreError> {
    if let Some(existing) = store.find_conversation(key).await? {
        return Ok(existing);
    }

    match store.create_conversation(key).await {
        Ok(created) => Ok(created),
        Err(StoreError::DuplicateKey) => {
            tracing::debug!("conversation created concurrently, re-reading");
            store.find_conversation(key).await?.ok_or(StoreError::NotFound)
        }
        Err(e) => Err(e),
    }
}
