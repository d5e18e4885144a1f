//! Outbound event queue.
//!
//! Business transitions commit first and then enqueue their side effects
//! here; pushing never blocks and never fails the caller. A separate
//! [`OutboxWorker`] drains the queue:
//! - position notifications are attempted once and failures are logged
//! - refunds and auction messages are retried with backoff
//! - refunds that still fail are parked in the [`RefundBacklog`], which is
//!   persisted with the engine snapshot and requeued periodically
//!
//! Stopping the worker simply stops consumption.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use crate::ports::{AuctionTransport, NotificationSink, Wallet};
use crate::types::{AuctionMessage, Position, PositionId};

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Current position list of an owner, most recent first.
    Positions { owner: String, positions: Vec<Position> },
    /// Give back the price of a rejected wallet-funded purchase.
    Refund {
        position_id: PositionId,
        account: String,
        amount: Decimal,
    },
    /// Publish an auction event to the other groups.
    Auction(AuctionMessage),
}

/// A refund whose delivery exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRefund {
    pub position_id: PositionId,
    pub account: String,
    pub amount: Decimal,
}

impl From<PendingRefund> for OutboundEvent {
    fn from(r: PendingRefund) -> Self {
        OutboundEvent::Refund {
            position_id: r.position_id,
            account: r.account,
            amount: r.amount,
        }
    }
}

/// Refunds parked by the worker until the wallet is reachable again.
#[derive(Clone, Default)]
pub struct RefundBacklog {
    inner: Arc<Mutex<Vec<PendingRefund>>>,
}

impl RefundBacklog {
    pub async fn park(&self, refund: PendingRefund) {
        self.inner.lock().await.push(refund);
    }

    pub async fn list(&self) -> Vec<PendingRefund> {
        self.inner.lock().await.clone()
    }

    pub async fn take_all(&self) -> Vec<PendingRefund> {
        std::mem::take(&mut *self.inner.lock().await)
    }

    /// Replace the backlog with refunds loaded from a snapshot.
    pub async fn restore(&self, refunds: Vec<PendingRefund>) {
        *self.inner.lock().await = refunds;
    }
}

/// Sending half of the queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundEvent>,
    backlog: RefundBacklog,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                backlog: RefundBacklog::default(),
            },
            rx,
        )
    }

    /// Backlog shared with the worker draining this outbox.
    pub fn backlog(&self) -> RefundBacklog {
        self.backlog.clone()
    }

    /// Queue every parked refund again. Returns how many were requeued.
    pub async fn requeue_refunds(&self) -> usize {
        let parked = self.backlog.take_all().await;
        let count = parked.len();
        for refund in parked {
            self.push(refund.into());
        }
        if count > 0 {
            info!(count, "Parked refunds requeued");
        }
        count
    }

    pub fn push(&self, event: OutboundEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(event = ?e.0, "Outbox closed, event dropped");
        }
    }

    pub fn notify(&self, owner: String, positions: Vec<Position>) {
        self.push(OutboundEvent::Positions { owner, positions });
    }

    pub fn publish(&self, message: AuctionMessage) {
        self.push(OutboundEvent::Auction(message));
    }
}

/// Consumer of the outbox.
pub struct OutboxWorker {
    notifier: Arc<dyn NotificationSink>,
    transport: Arc<dyn AuctionTransport>,
    wallet: Arc<dyn Wallet>,
    backlog: RefundBacklog,
    retry: RetryPolicy,
}

impl OutboxWorker {
    pub fn new(
        notifier: Arc<dyn NotificationSink>,
        transport: Arc<dyn AuctionTransport>,
        wallet: Arc<dyn Wallet>,
        backlog: RefundBacklog,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            notifier,
            transport,
            wallet,
            backlog,
            retry,
        }
    }

    /// Consume events until every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<OutboundEvent>) {
        info!(transport = self.transport.name(), "Outbox worker started");
        while let Some(event) = rx.recv().await {
            self.dispatch(event).await;
        }
        info!("Outbox worker stopped");
    }

    /// Deliver a single event. Returns whether delivery succeeded.
    pub async fn dispatch(&self, event: OutboundEvent) -> bool {
        match event {
            OutboundEvent::Positions { owner, positions } => {
                match self.notifier.notify(&owner, &positions).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(owner, error = %e, "Notification failed");
                        false
                    }
                }
            }
            OutboundEvent::Refund {
                position_id,
                account,
                amount,
            } => {
                let wallet = &self.wallet;
                let target = account.as_str();
                let result = self
                    .retry
                    .run("refund", move || wallet.credit(target, amount))
                    .await;
                match result {
                    Ok(()) => {
                        info!(%position_id, account, %amount, "Refund credited");
                        true
                    }
                    Err(e) => {
                        error!(
                            %position_id,
                            account,
                            %amount,
                            error = %e,
                            "Refund failed, parked"
                        );
                        self.backlog
                            .park(PendingRefund {
                                position_id,
                                account,
                                amount,
                            })
                            .await;
                        false
                    }
                }
            }
            OutboundEvent::Auction(message) => {
                let transport = &self.transport;
                let payload = &message;
                let result = self
                    .retry
                    .run("auction", move || transport.send(payload))
                    .await;
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            kind = message.kind(),
                            transport = self.transport.name(),
                            error = %e,
                            "Auction message could not be published"
                        );
                        false
                    }
                }
            }
        }
    }
}
