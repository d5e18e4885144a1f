//! Request lifecycle.
//!
//! Turns a purchase intent into a position against the inventory ledger:
//! `Pending` on creation, then `Approved` or `Rejected` exactly once.
//! Every transition is applied while the fixture row is locked and is
//! followed by a notification of the owner's position list.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ledger::InventoryLedger;
use super::outbox::{OutboundEvent, Outbox};
use super::positions::PositionBook;
use crate::ports::Wallet;
use crate::types::{
    EngineError, FixtureId, GroupId, Outcome, Position, PositionId, PositionOrigin,
    PositionStatus,
};

/// A purchase intent.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    /// Idempotency key.
    pub id: PositionId,
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
    pub group: GroupId,
    pub owner: Option<String>,
    pub origin: PositionOrigin,
    /// Paid from the owner's wallet; refunded if rejected.
    pub wallet: bool,
    pub location: Option<String>,
}

impl NewRequest {
    /// A wallet-funded user purchase out of the general pool.
    pub fn purchase(
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
        group: GroupId,
        owner: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fixture_id,
            outcome,
            quantity,
            group,
            owner: Some(owner.to_string()),
            origin: PositionOrigin::Purchase,
            wallet: true,
            location: None,
        }
    }

    /// Units the group buys to hold in its reserved pool.
    pub fn trade(fixture_id: FixtureId, outcome: Outcome, quantity: u32, group: GroupId) -> Self {
        Self {
            id: Uuid::new_v4(),
            fixture_id,
            outcome,
            quantity,
            group,
            owner: None,
            origin: PositionOrigin::Trade,
            wallet: false,
            location: None,
        }
    }

    fn into_position(self) -> Position {
        Position {
            id: self.id,
            fixture_id: self.fixture_id,
            outcome: self.outcome,
            quantity: self.quantity,
            group: self.group,
            owner: self.owner,
            origin: self.origin,
            wallet: self.wallet,
            status: PositionStatus::Pending,
            paid: false,
            correct: false,
            location: self.location,
            created_at: Utc::now(),
        }
    }
}

pub struct RequestLifecycle {
    group_id: GroupId,
    unit_price: Decimal,
    /// Fraction taken off reserved purchases while the discount is on.
    discount_rate: Decimal,
    discount: AtomicBool,
    ledger: Arc<InventoryLedger>,
    positions: Arc<PositionBook>,
    wallet: Arc<dyn Wallet>,
    outbox: Outbox,
}

impl RequestLifecycle {
    pub fn new(
        group_id: GroupId,
        unit_price: Decimal,
        ledger: Arc<InventoryLedger>,
        positions: Arc<PositionBook>,
        wallet: Arc<dyn Wallet>,
        outbox: Outbox,
    ) -> Self {
        Self {
            group_id,
            unit_price,
            discount_rate: Decimal::ZERO,
            discount: AtomicBool::new(false),
            ledger,
            positions,
            wallet,
            outbox,
        }
    }

    pub fn with_discount_rate(mut self, rate: Decimal) -> Self {
        self.discount_rate = rate;
        self
    }

    /// Price of `qty` units.
    pub fn price(&self, qty: u32) -> Decimal {
        self.unit_price * Decimal::from(qty)
    }

    /// Price of `qty` units bought out of the reserved pool, discounted
    /// while the discount is on.
    pub fn reserved_price(&self, qty: u32) -> Decimal {
        let price = self.price(qty);
        if !self.discount_active() {
            return price;
        }
        (price * (Decimal::ONE - self.discount_rate))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
    }

    pub fn discount_active(&self) -> bool {
        self.discount.load(Ordering::SeqCst)
    }

    pub fn set_discount(&self, active: bool) {
        let previous = self.discount.swap(active, Ordering::SeqCst);
        if previous != active {
            info!(active, rate = %self.discount_rate, "Reserved purchase discount switched");
        }
    }

    /// Reserve inventory for a new request and record it as `Pending`.
    ///
    /// Fails with `CapacityExceeded` when the fixture has fewer than
    /// `quantity` units remaining; nothing is mutated in that case.
    pub async fn create_request(&self, request: NewRequest) -> Result<Position, EngineError> {
        if request.quantity == 0 {
            return Err(EngineError::Invalid("quantity must be positive".into()));
        }
        if request.origin == PositionOrigin::Trade && request.group != self.group_id {
            return Err(EngineError::Invalid(format!(
                "trade positions can only be opened for group {}",
                self.group_id
            )));
        }
        if request.origin == PositionOrigin::Reserved {
            return Err(EngineError::Invalid(
                "reserved-pool purchases are settled immediately".into(),
            ));
        }
        if self.positions.contains(request.id).await {
            return Err(EngineError::Conflict(format!("position {} already exists", request.id)));
        }

        let mut row = self.ledger.lock(request.fixture_id).await?;
        row.reserve(request.quantity)?;

        let position = request.into_position();
        if let Err(e) = self.positions.insert(position.clone()).await {
            // Lost a race on the same id.
            row.release(position.quantity)?;
            return Err(e);
        }
        let remaining = row.remaining;
        drop(row);

        info!(
            position_id = %position.id,
            fixture_id = position.fixture_id,
            outcome = %position.outcome,
            quantity = position.quantity,
            remaining,
            "Request created"
        );
        self.notify_owner(&position).await;
        Ok(position)
    }

    /// Resolve a pending request.
    ///
    /// Approval of a trade-origin position credits the group's reserved
    /// pool. Rejection returns the units to the general pool and, for a
    /// wallet-funded purchase, enqueues a refund of its price.
    pub async fn validate_request(
        &self,
        id: PositionId,
        valid: bool,
    ) -> Result<Position, EngineError> {
        let fixture_id = self.positions.get(id).await?.fixture_id;
        let mut row = self.ledger.lock(fixture_id).await?;

        // Re-read under the row lock; resolutions of one fixture are serialized.
        let position = self.positions.get(id).await?;
        if position.status.is_terminal() {
            return Err(already_resolved(&position));
        }

        let mut next = *row;
        if valid {
            if position.origin == PositionOrigin::Trade {
                next.adjust_reserved(position.outcome, i64::from(position.quantity))?;
            }
        } else {
            next.release(position.quantity)?;
        }

        let status = if valid {
            PositionStatus::Approved
        } else {
            PositionStatus::Rejected
        };
        let updated = self
            .positions
            .update(id, |p| {
                if p.status.is_terminal() {
                    return Err(already_resolved(p));
                }
                p.status = status;
                Ok(p.clone())
            })
            .await?;
        *row = next;
        drop(row);

        info!(
            position_id = %id,
            fixture_id = updated.fixture_id,
            status = %updated.status,
            remaining = next.remaining,
            "Request resolved"
        );

        if !valid && updated.wallet {
            self.outbox.push(OutboundEvent::Refund {
                position_id: id,
                account: updated.account(),
                amount: self.price(updated.quantity),
            });
        }
        self.notify_owner(&updated).await;
        Ok(updated)
    }

    /// Buy units out of the local group's reserved pool.
    ///
    /// The price is debited from the owner's wallet before the pool is
    /// touched; the resulting position is approved immediately.
    pub async fn purchase_reserved(
        &self,
        owner: &str,
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
        location: Option<String>,
    ) -> Result<Position, EngineError> {
        if quantity == 0 {
            return Err(EngineError::Invalid("quantity must be positive".into()));
        }
        let mut row = self.ledger.lock(fixture_id).await?;
        row.ensure_reserved(outcome, quantity)?;

        let price = self.reserved_price(quantity);
        self.wallet.debit(owner, price).await.map_err(|e| {
            warn!(owner, %price, error = %e, "Reserved purchase not funded");
            EngineError::from(e)
        })?;
        let reserved = row.adjust_reserved(outcome, -i64::from(quantity))?;

        let position = Position {
            id: Uuid::new_v4(),
            fixture_id,
            outcome,
            quantity,
            group: self.group_id,
            owner: Some(owner.to_string()),
            origin: PositionOrigin::Reserved,
            wallet: true,
            status: PositionStatus::Approved,
            paid: false,
            correct: false,
            location,
            created_at: Utc::now(),
        };
        self.positions.insert(position.clone()).await?;
        drop(row);

        info!(
            position_id = %position.id,
            fixture_id,
            %outcome,
            quantity,
            reserved,
            %price,
            "Reserved units sold"
        );
        self.notify_owner(&position).await;
        Ok(position)
    }

    /// Attach a user to a position that arrived without one.
    pub async fn link_position(
        &self,
        id: PositionId,
        owner: &str,
        location: Option<String>,
    ) -> Result<Position, EngineError> {
        let updated = self
            .positions
            .update(id, |p| {
                match p.owner.as_deref() {
                    Some(current) if current != owner => {
                        return Err(EngineError::Conflict(format!(
                            "position {id} already belongs to {current}"
                        )));
                    }
                    _ => {}
                }
                p.owner = Some(owner.to_string());
                if location.is_some() {
                    p.location = location;
                }
                Ok(p.clone())
            })
            .await?;
        debug!(position_id = %id, owner, "Position linked");
        self.notify_owner(&updated).await;
        Ok(updated)
    }

    pub async fn positions_for(&self, owner: &str) -> Vec<Position> {
        self.positions.for_owner(owner).await
    }

    async fn notify_owner(&self, position: &Position) {
        if let Some(owner) = &position.owner {
            let positions = self.positions.for_owner(owner).await;
            self.outbox.notify(owner.clone(), positions);
        }
    }
}

fn already_resolved(position: &Position) -> EngineError {
    EngineError::Conflict(format!(
        "position {} already resolved as {}",
        position.id, position.status
    ))
}
