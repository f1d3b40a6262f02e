/// HTTP gateway to the hosted row store.
///
/// Rows live behind a small REST surface; change notifications arrive on a
/// long-lived NDJSON stream (`GET /events`, one JSON [`StoreEvent`] per
/// line) which a background pump re-broadcasts to local subscribers. The
/// pump reconnects with a fixed backoff and stops when the store handle is
/// dropped.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use sokoni_types::events::StoreEvent;
use sokoni_types::models::{Conversation, ConversationKey, Message, NewMessage, Order, OrderStatus};

use crate::{OrderWrite, RemoteStore, StoreError};

/// How long to wait before reconnecting a dropped event stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Default bound on any single row request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RestStore {
    http: reqwest::Client,
    base: String,
    events: broadcast::Sender<StoreEvent>,
    pump_cancel: CancellationToken,
}

#[derive(Serialize)]
struct StatusUpdate {
    expected: OrderStatus,
    next: OrderStatus,
}

#[derive(Serialize)]
struct ReadReceipt {
    read_at: DateTime<Utc>,
}

impl RestStore {
    /// Connect to the store at `base_url` and start the event pump.
    pub fn connect(base_url: &str) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let (events, _) = broadcast::channel(256);
        let pump_cancel = CancellationToken::new();

        let store = Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            events: events.clone(),
            pump_cancel: pump_cancel.clone(),
        };

        tokio::spawn(run_event_pump(
            store.http.clone(),
            format!("{}/events", store.base),
            events,
            pump_cancel,
        ));

        Ok(store)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, StoreError> {
        let body = resp.text().await.map_err(transport)?;
        serde_json::from_str(&body).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            StatusCode::CONFLICT => Err(StoreError::DuplicateKey),
            s => Err(StoreError::Unavailable(format!("store returned {}", s))),
        }
    }
}

impl Drop for RestStore {
    fn drop(&mut self) {
        self.pump_cancel.cancel();
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn orders_for_buyer(&self, buyer_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let resp = self
            .http
            .get(self.url("/orders"))
            .query(&[("buyer_id", buyer_id.to_string())])
            .send()
            .await
            .map_err(transport)?;
        Self::decode(Self::check_status(resp)?).await
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<OrderWrite, StoreError> {
        let resp = self
            .http
            .post(self.url(&format!("/orders/{}/status", order_id)))
            .json(&StatusUpdate { expected, next })
            .send()
            .await
            .map_err(transport)?;

        // 409 carries the current row so the caller can refresh.
        if resp.status() == StatusCode::CONFLICT {
            let current: Order = Self::decode(resp).await?;
            return Ok(OrderWrite::Conflict(current));
        }
        let updated: Order = Self::decode(Self::check_status(resp)?).await?;
        Ok(OrderWrite::Applied(updated))
    }

    async fn find_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, StoreError> {
        let resp = self
            .http
            .get(self.url("/conversations"))
            .query(&[
                ("product_id", key.product_id.to_string()),
                ("producer_id", key.producer_id.to_string()),
                ("buyer_id", key.buyer_id.to_string()),
            ])
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(Self::check_status(resp)?).await
    }

    async fn create_conversation(&self, key: &ConversationKey) -> Result<Conversation, StoreError> {
        let resp = self
            .http
            .post(self.url("/conversations"))
            .json(key)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(Self::check_status(resp)?).await
    }

    async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let resp = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id)))
            .query(&[("order", "created_at.desc")])
            .send()
            .await
            .map_err(transport)?;
        Self::decode(Self::check_status(resp)?).await
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let resp = self
            .http
            .post(self.url(&format!("/conversations/{}/messages", new.conversation_id)))
            .json(&new)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(Self::check_status(resp)?).await
    }

    async fn mark_read(&self, message_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let resp = self
            .http
            .patch(self.url(&format!("/messages/{}", message_id)))
            .json(&ReadReceipt { read_at: at })
            .send()
            .await
            .map_err(transport)?;
        Self::check_status(resp)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

/// Consume the NDJSON event stream and re-broadcast each decoded event.
/// Runs until the owning store is dropped.
async fn run_event_pump(
    http: reqwest::Client,
    url: String,
    events: broadcast::Sender<StoreEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = http.get(&url).timeout(Duration::from_secs(24 * 3600)).send() => {
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        pump_stream(resp, &events, &cancel).await;
                    }
                    Ok(resp) => warn!("event stream rejected: {}", resp.status()),
                    Err(e) => warn!("event stream connect failed: {}", e),
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn pump_stream(
    resp: reqwest::Response,
    events: &broadcast::Sender<StoreEvent>,
    cancel: &CancellationToken,
) {
    let mut stream = resp.bytes_stream();
    let mut buf = bytes::BytesMut::with_capacity(4096);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        let data = match chunk {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                warn!("event stream error: {}", e);
                return;
            }
            None => return,
        };
        buf.extend_from_slice(&data);

        // Drain complete lines; a partial trailing line waits for more data.
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreEvent>(line) {
                Ok(event) => {
                    debug!("store event: {:?}", event);
                    let _ = events.send(event);
                }
                // A malformed event is dropped, not fatal to the stream.
                Err(e) => warn!("undecodable store event: {}", e),
            }
        }
    }
}
