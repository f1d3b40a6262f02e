/// Order lifecycle engine.
///
/// Owns the buyer's in-memory order projection and advances statuses along
/// the fixed stage sequence from two triggers: a periodic poll that moves
/// every non-terminal order one stage, and manual advances from the UI.
/// Both go through the store's conditional update, so two triggers racing
/// on the same order advance it exactly one stage: the loser sees a
/// conflict carrying the current row and refreshes instead of erroring.
///
/// Persistence and the projection are deliberately not atomic: the
/// projection only moves after the store confirms the write, so the screen
/// can never show progress that was never saved.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sokoni_store::{OrderWrite, RemoteStore, StoreError};
use sokoni_types::models::{Order, OrderStatus};

#[derive(Debug, Clone)]
pub struct OrderConfig {
    /// How often the automatic poll advances every non-terminal order.
    pub poll_interval: Duration,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rendering projection of one order. Derived from the authoritative row;
/// `progress` feeds the stage indicator fill.
#[derive(Debug, Clone)]
pub struct OrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub progress: f32,
    pub total: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            status: order.status,
            progress: order.status.progress(),
            total: order.total,
            updated_at: order.updated_at,
        }
    }
}

/// Updates pushed toward the UI layer.
#[derive(Debug, Clone)]
pub enum OrderUpdate {
    /// Wholesale projection refresh (initial load, explicit refresh, or a
    /// lost race that revealed newer remote state).
    Orders(Vec<OrderView>),
    /// One order moved exactly one stage.
    Advanced(OrderView),
    /// Manual advance on a terminal order; a signal, not an error.
    AlreadyDelivered(Uuid),
    /// Manual advance could not be persisted; the projection is unchanged.
    AdvanceFailed { order_id: Uuid, reason: String },
}

enum Command {
    Advance(Uuid),
    Refresh,
}

/// Handle held by the order screen. Dropping it (or calling `close`) tears
/// the engine down; a poll tick after teardown is a no-op.
pub struct OrderHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl OrderHandle {
    /// Advance one order a single stage.
    pub fn advance(&self, order_id: Uuid) {
        let _ = self.commands.send(Command::Advance(order_id));
    }

    /// Re-fetch the projection wholesale from the store.
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for OrderHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct OrderTracker;

impl OrderTracker {
    /// Load the buyer's orders and start the engine. Fails only when the
    /// initial fetch fails; that is the whole-screen error case, and callers
    /// retry by reopening.
    pub async fn open(
        store: Arc<dyn RemoteStore>,
        buyer_id: Uuid,
        config: OrderConfig,
    ) -> Result<(OrderHandle, mpsc::UnboundedReceiver<OrderUpdate>), OrderError> {
        let rows = store.orders_for_buyer(buyer_id).await?;
        info!("loaded {} orders for buyer {}", rows.len(), buyer_id);

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut engine = Engine {
            store,
            buyer_id,
            orders: rows.into_iter().map(|o| (o.id, o)).collect(),
            updates: update_tx,
        };
        engine.emit_snapshot();

        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            engine.run(command_rx, config.poll_interval, loop_cancel).await;
        });

        Ok((
            OrderHandle {
                commands: command_tx,
                cancel,
            },
            update_rx,
        ))
    }
}

struct Engine {
    store: Arc<dyn RemoteStore>,
    buyer_id: Uuid,
    orders: HashMap<Uuid, Order>,
    updates: mpsc::UnboundedSender<OrderUpdate>,
}

impl Engine {
    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut poll = tokio::time::interval(poll_interval);
        // The open() fetch just happened; skip the immediate first tick.
        poll.tick().await;

        loop {
            tokio::select! {
                // Teardown wins over a tick that became due at the same
                // instant; nothing may write state after close.
                biased;
                _ = cancel.cancelled() => {
                    debug!("order engine closed");
                    return;
                }
                _ = poll.tick() => self.poll_all().await,
                command = commands.recv() => match command {
                    Some(Command::Advance(order_id)) => self.advance_manual(order_id).await,
                    Some(Command::Refresh) => self.refresh().await,
                    None => return,
                },
            }
        }
    }

    /// Automatic trigger: every loaded non-terminal order moves one stage.
    /// Per-order failures are contained; the next tick retries naturally.
    async fn poll_all(&mut self) {
        let eligible: Vec<Uuid> = self
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.id)
            .collect();

        for order_id in eligible {
            if let Err(e) = self.advance_one(order_id).await {
                warn!("poll advance failed for order {}: {}", order_id, e);
            }
        }
    }

    /// Manual trigger. Terminal orders report already-delivered; transient
    /// failures surface as a notice with the projection untouched.
    async fn advance_manual(&mut self, order_id: Uuid) {
        let Some(order) = self.orders.get(&order_id) else {
            warn!("manual advance for unknown order {}", order_id);
            return;
        };
        if order.status.is_terminal() {
            self.emit(OrderUpdate::AlreadyDelivered(order_id));
            return;
        }
        if let Err(e) = self.advance_one(order_id).await {
            self.emit(OrderUpdate::AdvanceFailed {
                order_id,
                reason: e.to_string(),
            });
        }
    }

    /// Advance exactly one stage through the store's conditional update.
    async fn advance_one(&mut self, order_id: Uuid) -> Result<(), StoreError> {
        let Some(order) = self.orders.get(&order_id) else {
            return Ok(());
        };
        let Some(next) = order.status.next() else {
            return Ok(());
        };
        let expected = order.status;

        match self
            .store
            .update_order_status(order_id, expected, next)
            .await?
        {
            OrderWrite::Applied(updated) => {
                info!("order {} advanced {} -> {}", order_id, expected, updated.status);
                self.orders.insert(order_id, updated.clone());
                self.emit(OrderUpdate::Advanced(OrderView::from(&updated)));
            }
            OrderWrite::Conflict(current) => {
                // Someone else advanced it first. Adopt their state.
                debug!(
                    "order {} advanced elsewhere (now {}), refreshing projection",
                    order_id, current.status
                );
                self.orders.insert(order_id, current);
                self.emit_snapshot();
            }
        }
        Ok(())
    }

    async fn refresh(&mut self) {
        match self.store.orders_for_buyer(self.buyer_id).await {
            Ok(rows) => {
                self.orders = rows.into_iter().map(|o| (o.id, o)).collect();
                self.emit_snapshot();
            }
            Err(e) => warn!("order refresh failed: {}", e),
        }
    }

    fn emit_snapshot(&mut self) {
        let mut views: Vec<OrderView> = self.orders.values().map(OrderView::from).collect();
        views.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.emit(OrderUpdate::Orders(views));
    }

    fn emit(&mut self, update: OrderUpdate) {
        let _ = self.updates.send(update);
    }
}
