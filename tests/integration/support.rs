//! In-memory exchange nodes for integration testing.
//!
//! A [`Node`] is one group's engine wired to in-memory collaborators. Its
//! outbox is drained by hand so tests decide when events are delivered and
//! which node receives the published auction messages.

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use fixture_exchange::engine::outbox::{OutboundEvent, Outbox, OutboxWorker};
use fixture_exchange::engine::retry::RetryPolicy;
use fixture_exchange::engine::{Engine, EngineSettings};
use fixture_exchange::ports::memory::{MemoryFixtureStore, MemoryTransport, MemoryWallet};
use fixture_exchange::ports::notify::TracingNotifier;
use fixture_exchange::types::*;

pub const BET_LIMIT: u32 = 40;

/// A scheduled fixture with a complete "Match Winner" market.
pub fn fixture(id: FixtureId) -> Fixture {
    Fixture {
        id,
        home_team: "Colo-Colo".to_string(),
        away_team: "Universidad de Chile".to_string(),
        league: "Primera Division".to_string(),
        round: "Regular Season - 20".to_string(),
        date: Utc::now() + Duration::days(2),
        status: FixtureStatus::Scheduled,
        goals: None,
        odds: vec![Odd {
            name: MATCH_WINNER.to_string(),
            values: vec![
                OddValue { bet: "Home".into(), odd: dec!(1.8) },
                OddValue { bet: "Draw".into(), odd: dec!(3.2) },
                OddValue { bet: "Away".into(), odd: dec!(4.5) },
            ],
        }],
    }
}

pub struct Node {
    pub engine: Arc<Engine>,
    pub wallet: Arc<MemoryWallet>,
    pub transport: Arc<MemoryTransport>,
    worker: OutboxWorker,
    rx: UnboundedReceiver<OutboundEvent>,
    /// Every event dispatched so far, in order.
    pub delivered: Vec<OutboundEvent>,
}

impl Node {
    pub fn new(group_id: GroupId) -> Self {
        Self::with_wallet(group_id, MemoryWallet::new())
    }

    pub fn with_wallet(group_id: GroupId, wallet: MemoryWallet) -> Self {
        let wallet = Arc::new(wallet);
        let transport = Arc::new(MemoryTransport::new());
        let (outbox, rx) = Outbox::channel();
        let backlog = outbox.backlog();
        let engine = Engine::new(
            EngineSettings {
                group_id,
                payout_group: group_id,
                bet_limit: BET_LIMIT,
                unit_price: dec!(1000),
                discount_rate: dec!(0.10),
            },
            Arc::new(MemoryFixtureStore::new()),
            wallet.clone(),
            outbox,
            RetryPolicy::immediate(2),
        );
        let worker = OutboxWorker::new(
            Arc::new(TracingNotifier),
            transport.clone(),
            wallet.clone(),
            backlog,
            RetryPolicy::immediate(2),
        );
        Self {
            engine: Arc::new(engine),
            wallet,
            transport,
            worker,
            rx,
            delivered: Vec::new(),
        }
    }

    /// Dispatch every queued outbox event. Returns how many were handled.
    pub async fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.worker.dispatch(event.clone()).await;
            self.delivered.push(event);
            count += 1;
        }
        count
    }

    /// Pump the outbox and feed the published auction messages to `peer`.
    pub async fn deliver_to(&mut self, peer: &Node) -> Vec<Result<(), EngineError>> {
        self.pump().await;
        let mut results = Vec::new();
        for message in self.transport.drain().await {
            results.push(peer.engine.handle_message(message).await);
        }
        results
    }

    /// Give the group `quantity` reserved units of `outcome` through an
    /// approved trade.
    pub async fn stock_reserved(&self, fixture_id: FixtureId, outcome: Outcome, quantity: u32) {
        let group = self.engine.settings().group_id;
        let trade = self
            .engine
            .create_request(fixture_exchange::engine::requests::NewRequest::trade(
                fixture_id, outcome, quantity, group,
            ))
            .await
            .expect("trade request");
        self.engine
            .validate_request(trade.id, true)
            .await
            .expect("trade approval");
    }
}
