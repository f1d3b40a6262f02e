use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use sokoni_types::events::StoreEvent;
use sokoni_types::models::{Conversation, ConversationKey, Message, NewMessage, Order, OrderStatus};

use crate::{OrderWrite, RemoteStore, StoreError};

/// Longest conversation preview kept on the conversation row.
const PREVIEW_LEN: usize = 120;

/// In-process store with the same contract as the hosted one: unique
/// conversation triples, conditional status updates, and a broadcast push
/// channel per row change. Backs the demo binary and every engine test.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    orders: RwLock<HashMap<Uuid, Order>>,
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    messages: RwLock<Vec<Message>>,
    events: broadcast::Sender<StoreEvent>,
    /// Connectivity toggle: while false, every call fails `Unavailable`.
    online: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MemoryInner {
                orders: RwLock::new(HashMap::new()),
                conversations: RwLock::new(HashMap::new()),
                messages: RwLock::new(Vec::new()),
                events,
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing or regaining connectivity to the remote store.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.inner.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store offline".into()))
        }
    }

    /// Seed an order row. Test/demo setup, not part of the core contract.
    pub async fn put_order(&self, order: Order) {
        self.inner.orders.write().await.insert(order.id, order);
    }

    pub async fn order(&self, order_id: Uuid) -> Option<Order> {
        self.inner.orders.read().await.get(&order_id).cloned()
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine; nobody has subscribed yet.
        let _ = self.inner.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn orders_for_buyer(&self, buyer_id: Uuid) -> Result<Vec<Order>, StoreError> {
        self.check_online()?;
        let orders = self.inner.orders.read().await;
        let mut rows: Vec<Order> = orders
            .values()
            .filter(|o| o.buyer_id == buyer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<OrderWrite, StoreError> {
        self.check_online()?;
        let mut orders = self.inner.orders.write().await;
        let order = orders.get_mut(&order_id).ok_or(StoreError::NotFound)?;

        if order.status != expected {
            return Ok(OrderWrite::Conflict(order.clone()));
        }

        order.status = next;
        order.updated_at = Utc::now();
        let updated = order.clone();
        drop(orders);

        self.publish(StoreEvent::OrderUpdated {
            order: updated.clone(),
        });
        Ok(OrderWrite::Applied(updated))
    }

    async fn find_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, StoreError> {
        self.check_online()?;
        let conversations = self.inner.conversations.read().await;
        Ok(conversations.values().find(|c| c.key == *key).cloned())
    }

    async fn create_conversation(&self, key: &ConversationKey) -> Result<Conversation, StoreError> {
        self.check_online()?;
        // Uniqueness check and insert under one write lock, matching the
        // unique constraint a real row store enforces.
        let mut conversations = self.inner.conversations.write().await;
        if conversations.values().any(|c| c.key == *key) {
            return Err(StoreError::DuplicateKey);
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            key: *key,
            last_message: String::new(),
            last_message_at: Utc::now(),
            last_sender_id: None,
        };
        conversations.insert(conversation.id, conversation.clone());
        drop(conversations);

        self.publish(StoreEvent::ConversationUpdated {
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        self.check_online()?;
        let messages = self.inner.messages.read().await;
        let mut rows: Vec<Message> = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Newest first, matching the hosted store's default chat ordering.
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        self.check_online()?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            created_at: Utc::now(),
            read_at: None,
        };

        let conversation = {
            let mut conversations = self.inner.conversations.write().await;
            let conversation = conversations
                .get_mut(&new.conversation_id)
                .ok_or(StoreError::NotFound)?;

            conversation.last_message = preview_of(&message.content);
            conversation.last_message_at = message.created_at;
            conversation.last_sender_id = Some(message.sender_id);
            conversation.clone()
        };

        self.inner.messages.write().await.push(message.clone());

        // Insert first, then notify, same ordering the hosted store uses.
        self.publish(StoreEvent::MessageCreated {
            message: message.clone(),
        });
        self.publish(StoreEvent::ConversationUpdated { conversation });
        Ok(message)
    }

    async fn mark_read(&self, message_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_online()?;
        let mut messages = self.inner.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(StoreError::NotFound)?;
        if message.read_at.is_none() {
            message.read_at = Some(at);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }
}

fn preview_of(content: &str) -> String {
    if content.len() <= PREVIEW_LEN {
        content.to_string()
    } else {
        let mut end = PREVIEW_LEN;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        content[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve_conversation;

    fn order(buyer_id: Uuid, status: OrderStatus) -> Order {
        Order {
            id: Uuid::new_v4(),
            buyer_id,
            items: vec![],
            total: 2500,
            status,
            updated_at: Utc::now(),
        }
    }

    fn key() -> ConversationKey {
        ConversationKey {
            product_id: Uuid::new_v4(),
            producer_id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn conditional_update_applies_when_status_matches() {
        let store = MemoryStore::new();
        let buyer = Uuid::new_v4();
        let o = order(buyer, OrderStatus::Ordered);
        store.put_order(o.clone()).await;

        let write = store
            .update_order_status(o.id, OrderStatus::Ordered, OrderStatus::Packed)
            .await
            .unwrap();
        match write {
            OrderWrite::Applied(updated) => assert_eq!(updated.status, OrderStatus::Packed),
            OrderWrite::Conflict(_) => panic!("expected Applied"),
        }
    }

    #[tokio::test]
    async fn conditional_update_conflicts_on_stale_expectation() {
        let store = MemoryStore::new();
        let buyer = Uuid::new_v4();
        let o = order(buyer, OrderStatus::Packed);
        store.put_order(o.clone()).await;

        // Caller thinks the order is still at Ordered.
        let write = store
            .update_order_status(o.id, OrderStatus::Ordered, OrderStatus::Packed)
            .await
            .unwrap();
        match write {
            OrderWrite::Conflict(current) => assert_eq!(current.status, OrderStatus::Packed),
            OrderWrite::Applied(_) => panic!("expected Conflict"),
        }
        // Row untouched.
        assert_eq!(store.order(o.id).await.unwrap().status, OrderStatus::Packed);
    }

    #[tokio::test]
    async fn duplicate_conversation_rejected() {
        let store = MemoryStore::new();
        let k = key();
        store.create_conversation(&k).await.unwrap();
        let err = store.create_conversation(&k).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey));
    }

    #[tokio::test]
    async fn resolve_is_idempotent_under_concurrent_callers() {
        let store = MemoryStore::new();
        let k = key();

        // Two racing resolvers for the same triple.
        let (a, b) = tokio::join!(
            resolve_conversation(&store, &k),
            resolve_conversation(&store, &k),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.id, b.id, "both callers must get the same row");

        // And exactly one row exists.
        assert_eq!(store.inner.conversations.read().await.len(), 1);
    }

    #[tokio::test]
    async fn insert_refreshes_preview_and_notifies() {
        let store = MemoryStore::new();
        let k = key();
        let conversation = store.create_conversation(&k).await.unwrap();
        let mut events = store.subscribe();

        let sent = store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: k.buyer_id,
                content: "do you deliver on Fridays?".into(),
            })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            StoreEvent::MessageCreated { message } => assert_eq!(message.id, sent.id),
            other => panic!("expected MessageCreated, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            StoreEvent::ConversationUpdated { conversation } => {
                assert_eq!(conversation.last_message, "do you deliver on Fridays?");
                assert_eq!(conversation.last_sender_id, Some(k.buyer_id));
            }
            other => panic!("expected ConversationUpdated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn messages_come_back_newest_first() {
        let store = MemoryStore::new();
        let k = key();
        let conversation = store.create_conversation(&k).await.unwrap();
        for text in ["first", "second", "third"] {
            store
                .insert_message(NewMessage {
                    conversation_id: conversation.id,
                    sender_id: k.producer_id,
                    content: text.into(),
                })
                .await
                .unwrap();
            // Distinct timestamps for a deterministic sort.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let rows = store.messages(conversation.id).await.unwrap();
        let contents: Vec<&str> = rows.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn offline_store_refuses_every_call() {
        let store = MemoryStore::new();
        store.set_online(false);
        let err = store.orders_for_buyer(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        let err = store.find_conversation(&key()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let store = MemoryStore::new();
        let k = key();
        let conversation = store.create_conversation(&k).await.unwrap();
        let sent = store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: k.producer_id,
                content: "price is firm".into(),
            })
            .await
            .unwrap();

        let first = Utc::now();
        store.mark_read(sent.id, first).await.unwrap();
        store.mark_read(sent.id, Utc::now()).await.unwrap();

        let rows = store.messages(conversation.id).await.unwrap();
        assert_eq!(rows[0].read_at, Some(first), "first receipt wins");
    }
}
