//! Core engine: inventory ledger, request lifecycle, auction and settlement.
//!
//! [`Engine`] wires the components to a shared ledger and position book and
//! is what the binary and the HTTP layer talk to. Side effects leave through
//! the [`outbox::Outbox`] and are delivered by an [`outbox::OutboxWorker`].

pub mod auction;
pub mod ledger;
pub mod outbox;
pub mod positions;
pub mod requests;
pub mod retry;
pub mod settlement;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::ports::{FixtureStore, Wallet};
use crate::types::{
    AuctionId, AuctionMessage, EngineError, Fixture, FixtureId, FixtureInventory, FixtureStatus,
    GroupId, Offer, Outcome, Position, PositionId, PositionStatus, Proposal, ProposalId, Score,
};

use auction::{AuctionBook, AuctionHouse};
use ledger::InventoryLedger;
use outbox::{Outbox, PendingRefund};
use positions::PositionBook;
use requests::{NewRequest, RequestLifecycle};
use retry::RetryPolicy;
use settlement::{SettlementEngine, SettlementReport};

/// Static parameters of an engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Trading group this instance acts for.
    pub group_id: GroupId,
    /// Group whose approved positions are settled.
    pub payout_group: GroupId,
    /// Initial inventory of every fixture.
    pub bet_limit: u32,
    pub unit_price: Decimal,
    /// Fraction taken off reserved purchases while the discount is on.
    pub discount_rate: Decimal,
}

/// A fixture together with its inventory counters.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureView {
    #[serde(flatten)]
    pub fixture: Fixture,
    pub inventory: FixtureInventory,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub group_id: GroupId,
    pub payout_group: GroupId,
    pub fixtures: usize,
    pub positions: usize,
    pub pending: usize,
    pub open_offers: usize,
    pub unit_price: Decimal,
}

/// Full engine state, as persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub saved_at: DateTime<Utc>,
    pub group_id: GroupId,
    pub fixtures: Vec<Fixture>,
    pub inventories: Vec<FixtureInventory>,
    pub positions: Vec<Position>,
    pub offers: Vec<Offer>,
    pub proposals: Vec<Proposal>,
    /// Refunds still owed after their delivery failed.
    #[serde(default)]
    pub pending_refunds: Vec<PendingRefund>,
    /// Whether reserved purchases were discounted.
    #[serde(default)]
    pub discount: bool,
}

pub struct Engine {
    settings: EngineSettings,
    fixtures: Arc<dyn FixtureStore>,
    ledger: Arc<InventoryLedger>,
    positions: Arc<PositionBook>,
    book: Arc<AuctionBook>,
    requests: RequestLifecycle,
    auctions: AuctionHouse,
    settlement: SettlementEngine,
    outbox: Outbox,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        fixtures: Arc<dyn FixtureStore>,
        wallet: Arc<dyn Wallet>,
        outbox: Outbox,
        retry: RetryPolicy,
    ) -> Self {
        let ledger = Arc::new(InventoryLedger::new(settings.bet_limit));
        let positions = Arc::new(PositionBook::new());
        let book = Arc::new(AuctionBook::new());

        let requests = RequestLifecycle::new(
            settings.group_id,
            settings.unit_price,
            ledger.clone(),
            positions.clone(),
            wallet.clone(),
            outbox.clone(),
        )
        .with_discount_rate(settings.discount_rate);
        let auctions =
            AuctionHouse::new(settings.group_id, ledger.clone(), book.clone(), outbox.clone());
        let settlement = SettlementEngine::new(
            settings.payout_group,
            settings.unit_price,
            ledger.clone(),
            positions.clone(),
            fixtures.clone(),
            wallet,
            outbox.clone(),
            retry,
        );

        Self {
            settings,
            fixtures,
            ledger,
            positions,
            book,
            requests,
            auctions,
            settlement,
            outbox,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // -- Fixtures ---------------------------------------------------------

    /// Store fixture metadata and open its inventory row.
    ///
    /// Re-ingesting a fixture refreshes its metadata but never resets its
    /// counters.
    pub async fn ingest_fixture(&self, fixture: Fixture) -> Result<FixtureInventory, EngineError> {
        let fixture_id = fixture.id;
        self.fixtures.upsert_fixture(fixture).await.map_err(store_error)?;
        if self.ledger.open(fixture_id).await {
            info!(fixture_id, "Fixture ingested");
        }
        self.ledger.inventory(fixture_id).await
    }

    /// Record a status/score change; settles the fixture once it finishes.
    pub async fn update_fixture(
        &self,
        fixture_id: FixtureId,
        status: FixtureStatus,
        goals: Option<Score>,
    ) -> Result<Option<SettlementReport>, EngineError> {
        let mut fixture = self.load_fixture(fixture_id).await?;
        fixture.status = status;
        if goals.is_some() {
            fixture.goals = goals;
        }
        info!(fixture = %fixture, "Fixture updated");
        self.fixtures.upsert_fixture(fixture).await.map_err(store_error)?;

        if status.is_finished() {
            return self.settle_fixture(fixture_id).await.map(Some);
        }
        Ok(None)
    }

    pub async fn fixture(&self, fixture_id: FixtureId) -> Result<FixtureView, EngineError> {
        let fixture = self.load_fixture(fixture_id).await?;
        let inventory = self.ledger.inventory(fixture_id).await?;
        Ok(FixtureView { fixture, inventory })
    }

    /// Every fixture with an inventory row, ordered by id.
    pub async fn fixtures(&self) -> Result<Vec<FixtureView>, EngineError> {
        let mut views = Vec::new();
        for fixture in self.fixtures.list_fixtures().await.map_err(store_error)? {
            if let Ok(inventory) = self.ledger.inventory(fixture.id).await {
                views.push(FixtureView { fixture, inventory });
            }
        }
        Ok(views)
    }

    /// Scheduled fixtures with units left in the general pool.
    pub async fn available_fixtures(&self) -> Result<Vec<FixtureView>, EngineError> {
        Ok(self
            .fixtures()
            .await?
            .into_iter()
            .filter(|v| v.fixture.status == FixtureStatus::Scheduled && v.inventory.remaining > 0)
            .collect())
    }

    /// Scheduled fixtures on which the local group holds reserved units.
    pub async fn tradable_fixtures(&self) -> Result<Vec<FixtureView>, EngineError> {
        Ok(self
            .fixtures()
            .await?
            .into_iter()
            .filter(|v| {
                v.fixture.status == FixtureStatus::Scheduled && v.inventory.total_reserved() > 0
            })
            .collect())
    }

    pub async fn inventory(&self, fixture_id: FixtureId) -> Result<FixtureInventory, EngineError> {
        self.ledger.inventory(fixture_id).await
    }

    // -- Requests ---------------------------------------------------------

    pub async fn create_request(&self, request: NewRequest) -> Result<Position, EngineError> {
        self.requests.create_request(request).await
    }

    pub async fn validate_request(
        &self,
        id: PositionId,
        valid: bool,
    ) -> Result<Position, EngineError> {
        self.requests.validate_request(id, valid).await
    }

    pub async fn purchase_reserved(
        &self,
        owner: &str,
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
        location: Option<String>,
    ) -> Result<Position, EngineError> {
        self.requests
            .purchase_reserved(owner, fixture_id, outcome, quantity, location)
            .await
    }

    pub async fn link_position(
        &self,
        id: PositionId,
        owner: &str,
        location: Option<String>,
    ) -> Result<Position, EngineError> {
        self.requests.link_position(id, owner, location).await
    }

    pub async fn position(&self, id: PositionId) -> Result<Position, EngineError> {
        self.positions.get(id).await
    }

    /// Approved units on one outcome of a fixture, across all groups.
    pub async fn approved_quantity(&self, fixture_id: FixtureId, outcome: Outcome) -> u32 {
        self.positions.approved_quantity(fixture_id, outcome).await
    }

    pub async fn positions_for(&self, owner: &str) -> Vec<Position> {
        self.requests.positions_for(owner).await
    }

    pub fn discount(&self) -> bool {
        self.requests.discount_active()
    }

    pub fn set_discount(&self, active: bool) {
        self.requests.set_discount(active);
    }

    /// Flip the reserved purchase discount. Returns the new state.
    pub fn toggle_discount(&self) -> bool {
        let active = !self.discount();
        self.set_discount(active);
        active
    }

    // -- Auctions ---------------------------------------------------------

    pub async fn create_offer(
        &self,
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
    ) -> Result<Offer, EngineError> {
        self.auctions.create_offer(fixture_id, outcome, quantity).await
    }

    pub async fn create_proposal(
        &self,
        auction_id: AuctionId,
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
    ) -> Result<Proposal, EngineError> {
        self.auctions
            .create_proposal(auction_id, fixture_id, outcome, quantity)
            .await
    }

    pub async fn accept_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> Result<(Offer, Proposal), EngineError> {
        self.auctions.accept_proposal(proposal_id).await
    }

    pub async fn reject_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> Result<(Offer, Proposal), EngineError> {
        self.auctions.reject_proposal(proposal_id).await
    }

    /// Apply an auction message published by another group.
    pub async fn handle_message(&self, message: AuctionMessage) -> Result<(), EngineError> {
        self.auctions.handle_message(message).await
    }

    pub async fn open_offers(&self) -> Vec<Offer> {
        self.auctions.open_offers().await
    }

    pub async fn offer(&self, auction_id: AuctionId) -> Result<Offer, EngineError> {
        self.book.offer(auction_id).await
    }

    pub async fn proposals_for(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Proposal>, EngineError> {
        self.auctions.proposals_for(auction_id).await
    }

    // -- Settlement -------------------------------------------------------

    pub async fn settle_fixture(
        &self,
        fixture_id: FixtureId,
    ) -> Result<SettlementReport, EngineError> {
        self.settlement.settle_fixture(fixture_id).await
    }

    // -- State ------------------------------------------------------------

    pub async fn status(&self) -> EngineStatus {
        let positions = self.positions.all().await;
        EngineStatus {
            group_id: self.settings.group_id,
            payout_group: self.settings.payout_group,
            fixtures: self.ledger.all().await.len(),
            pending: positions
                .iter()
                .filter(|p| p.status == PositionStatus::Pending)
                .count(),
            positions: positions.len(),
            open_offers: self.auctions.open_offers().await.len(),
            unit_price: self.settings.unit_price,
        }
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        Ok(EngineSnapshot {
            saved_at: Utc::now(),
            group_id: self.settings.group_id,
            fixtures: self.fixtures.list_fixtures().await.map_err(store_error)?,
            inventories: self.ledger.all().await,
            positions: self.positions.all().await,
            offers: self.book.offers().await,
            proposals: self.book.proposals().await,
            pending_refunds: self.outbox.backlog().list().await,
            discount: self.discount(),
        })
    }

    /// Replace the engine state with a snapshot taken by the same group.
    pub async fn restore(&self, snapshot: EngineSnapshot) -> Result<(), EngineError> {
        if snapshot.group_id != self.settings.group_id {
            return Err(EngineError::Invalid(format!(
                "snapshot belongs to group {}, engine acts for group {}",
                snapshot.group_id, self.settings.group_id
            )));
        }
        for fixture in snapshot.fixtures {
            self.fixtures.upsert_fixture(fixture).await.map_err(store_error)?;
        }
        self.ledger.restore(snapshot.inventories).await;
        self.positions.restore(snapshot.positions).await;
        self.book.restore(snapshot.offers, snapshot.proposals).await;
        self.outbox.backlog().restore(snapshot.pending_refunds).await;
        self.set_discount(snapshot.discount);
        Ok(())
    }

    /// Queue the refunds parked after failed deliveries for another try.
    pub async fn retry_refunds(&self) -> usize {
        self.outbox.requeue_refunds().await
    }

    async fn load_fixture(&self, fixture_id: FixtureId) -> Result<Fixture, EngineError> {
        self.fixtures
            .get_fixture(fixture_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::not_found("fixture", fixture_id))
    }
}

fn store_error(e: anyhow::Error) -> EngineError {
    EngineError::TransientDependency(format!("fixture store: {e}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::{MemoryFixtureStore, MemoryWallet};
    use crate::ports::MockFixtureStore;
    use rust_decimal_macros::dec;

    fn settings() -> EngineSettings {
        EngineSettings {
            group_id: 2,
            payout_group: 2,
            bet_limit: 40,
            unit_price: dec!(1000),
            discount_rate: dec!(0.10),
        }
    }

    fn engine_with(fixtures: Arc<dyn FixtureStore>, wallet: Arc<dyn Wallet>) -> Engine {
        let (outbox, _rx) = Outbox::channel();
        Engine::new(settings(), fixtures, wallet, outbox, RetryPolicy::immediate(1))
    }

    fn engine() -> (Engine, Arc<MemoryWallet>) {
        let wallet = Arc::new(MemoryWallet::new());
        let engine = engine_with(Arc::new(MemoryFixtureStore::new()), wallet.clone());
        (engine, wallet)
    }

    #[tokio::test]
    async fn test_reingest_keeps_counters() {
        let (engine, _) = engine();
        engine.ingest_fixture(Fixture::sample(1)).await.unwrap();
        engine
            .create_request(NewRequest::purchase(1, Outcome::Home, 6, 2, "ana"))
            .await
            .unwrap();

        let mut refreshed = Fixture::sample(1);
        refreshed.round = "Regular Season - 13".into();
        let inventory = engine.ingest_fixture(refreshed).await.unwrap();
        assert_eq!(inventory.remaining, 34);
        assert_eq!(engine.fixture(1).await.unwrap().fixture.round, "Regular Season - 13");
    }

    #[tokio::test]
    async fn test_finishing_fixture_settles() {
        let (engine, wallet) = engine();
        engine.ingest_fixture(Fixture::sample(1)).await.unwrap();
        let p = engine
            .create_request(NewRequest::purchase(1, Outcome::Home, 10, 2, "ana"))
            .await
            .unwrap();
        engine.validate_request(p.id, true).await.unwrap();

        assert_eq!(
            engine.update_fixture(1, FixtureStatus::Live, Some(Score { home: 1, away: 0 })).await,
            Ok(None)
        );
        let report = engine
            .update_fixture(1, FixtureStatus::Finished, Some(Score { home: 2, away: 1 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.total_paid, dec!(18000));
        assert_eq!(wallet.balance("ana").await.unwrap(), dec!(18000));
        assert!(engine.position(p.id).await.unwrap().paid);
    }

    #[tokio::test]
    async fn test_available_and_tradable() {
        let (engine, _) = engine();
        for id in [1, 2, 3] {
            engine.ingest_fixture(Fixture::sample(id)).await.unwrap();
        }
        engine
            .create_request(NewRequest::purchase(2, Outcome::Away, 40, 2, "ana"))
            .await
            .unwrap();
        let trade = engine
            .create_request(NewRequest::trade(3, Outcome::Draw, 2, 2))
            .await
            .unwrap();
        engine.validate_request(trade.id, true).await.unwrap();

        let available: Vec<_> = engine
            .available_fixtures()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.fixture.id)
            .collect();
        assert_eq!(available, vec![1, 3]);

        let tradable: Vec<_> = engine
            .tradable_fixtures()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.fixture.id)
            .collect();
        assert_eq!(tradable, vec![3]);
    }

    #[tokio::test]
    async fn test_snapshot_restores_into_fresh_engine() {
        let (engine, _) = engine();
        engine.ingest_fixture(Fixture::sample(1)).await.unwrap();
        let trade = engine
            .create_request(NewRequest::trade(1, Outcome::Away, 5, 2))
            .await
            .unwrap();
        engine.validate_request(trade.id, true).await.unwrap();
        let offer = engine.create_offer(1, Outcome::Away, 2).await.unwrap();

        let snapshot = engine.snapshot().await.unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: EngineSnapshot = serde_json::from_str(&json).unwrap();

        let (fresh, _) = self::engine();
        fresh.restore(parsed).await.unwrap();
        let inventory = fresh.inventory(1).await.unwrap();
        assert_eq!(inventory.remaining, 35);
        assert_eq!(inventory.reserved_away, 3);
        assert_eq!(fresh.offer(offer.auction_id).await.unwrap(), offer);
        assert_eq!(fresh.status().await.positions, 1);
    }

    #[tokio::test]
    async fn test_parked_refunds_survive_restart() {
        let (engine, _) = engine();
        let refund = PendingRefund {
            position_id: uuid::Uuid::new_v4(),
            account: "ana".into(),
            amount: dec!(4000),
        };
        engine.outbox.backlog().park(refund.clone()).await;
        let json = serde_json::to_string(&engine.snapshot().await.unwrap()).unwrap();

        let (outbox, mut rx) = Outbox::channel();
        let fresh = Engine::new(
            settings(),
            Arc::new(MemoryFixtureStore::new()),
            Arc::new(MemoryWallet::new()),
            outbox,
            RetryPolicy::immediate(1),
        );
        fresh.restore(serde_json::from_str(&json).unwrap()).await.unwrap();
        assert_eq!(fresh.snapshot().await.unwrap().pending_refunds, vec![refund.clone()]);

        assert_eq!(fresh.retry_refunds().await, 1);
        assert_eq!(rx.try_recv().unwrap(), refund.into());
        assert!(fresh.snapshot().await.unwrap().pending_refunds.is_empty());
    }

    #[tokio::test]
    async fn test_discount_toggle_survives_restart() {
        let (engine, _) = engine();
        assert!(!engine.discount());
        assert!(engine.toggle_discount());
        let json = serde_json::to_string(&engine.snapshot().await.unwrap()).unwrap();

        let (fresh, _) = self::engine();
        fresh.restore(serde_json::from_str(&json).unwrap()).await.unwrap();
        assert!(fresh.discount());
        assert!(!fresh.toggle_discount());
        assert!(!fresh.snapshot().await.unwrap().discount);
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_snapshot() {
        let (engine, _) = engine();
        let mut snapshot = engine.snapshot().await.unwrap();
        snapshot.group_id = 7;
        assert!(matches!(engine.restore(snapshot).await, Err(EngineError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let mut store = MockFixtureStore::new();
        store
            .expect_get_fixture()
            .returning(|_| Err(anyhow::anyhow!("connection reset")));
        let engine = engine_with(Arc::new(store), Arc::new(MemoryWallet::new()));

        let err = engine.settle_fixture(1).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.reason_code(), "retryable");
    }
}
