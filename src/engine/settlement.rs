//! Settlement of finished fixtures.
//!
//! Every approved, unpaid position of the payout group is paid out at the
//! fixture's "Match Winner" multiplier and then flagged `paid`, so reruns
//! skip it. The fixture row stays locked for the whole batch.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::ledger::InventoryLedger;
use super::outbox::Outbox;
use super::positions::PositionBook;
use super::retry::RetryPolicy;
use crate::ports::{FixtureStore, Wallet};
use crate::types::{EngineError, FixtureId, GroupId, Outcome};

/// Summary of one settlement run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub fixture_id: FixtureId,
    pub winning_outcome: Outcome,
    /// Positions flagged paid by this run.
    pub settled: usize,
    /// Of those, positions that won.
    pub winners: usize,
    pub total_paid: Decimal,
}

/// `quantity * multiplier * unit_price`, rounded half-even to cents.
pub fn payout(quantity: u32, multiplier: Decimal, unit_price: Decimal) -> Decimal {
    (Decimal::from(quantity) * multiplier * unit_price)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

pub struct SettlementEngine {
    payout_group: GroupId,
    unit_price: Decimal,
    ledger: Arc<InventoryLedger>,
    positions: Arc<PositionBook>,
    fixtures: Arc<dyn FixtureStore>,
    wallet: Arc<dyn Wallet>,
    outbox: Outbox,
    retry: RetryPolicy,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payout_group: GroupId,
        unit_price: Decimal,
        ledger: Arc<InventoryLedger>,
        positions: Arc<PositionBook>,
        fixtures: Arc<dyn FixtureStore>,
        wallet: Arc<dyn Wallet>,
        outbox: Outbox,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            payout_group,
            unit_price,
            ledger,
            positions,
            fixtures,
            wallet,
            outbox,
            retry,
        }
    }

    /// Pay out every eligible position of a finished fixture.
    ///
    /// A wallet failure stops the run with `TransientDependency`; the
    /// positions paid so far stay paid and the rest are picked up by the
    /// next run.
    pub async fn settle_fixture(
        &self,
        fixture_id: FixtureId,
    ) -> Result<SettlementReport, EngineError> {
        let fixture = self
            .fixtures
            .get_fixture(fixture_id)
            .await
            .map_err(|e| EngineError::TransientDependency(format!("fixture store: {e}")))?
            .ok_or_else(|| EngineError::not_found("fixture", fixture_id))?;
        let winning = fixture.winning_outcome().ok_or_else(|| {
            EngineError::Conflict(format!("fixture {fixture_id} has no final result"))
        })?;
        let odds = fixture.match_winner_odds()?;

        let row = self.ledger.lock(fixture_id).await?;

        let mut report = SettlementReport {
            fixture_id,
            winning_outcome: winning,
            settled: 0,
            winners: 0,
            total_paid: Decimal::ZERO,
        };
        let mut owners = BTreeSet::new();
        let mut failure = None;

        for position in self.positions.settleable(fixture_id, self.payout_group).await {
            let correct = position.outcome == winning;
            if correct {
                let multiplier = odds.multiplier(position.outcome);
                let amount = payout(position.quantity, multiplier, self.unit_price);
                let account = position.account();
                let wallet = &self.wallet;
                let target = account.as_str();
                let credited = self
                    .retry
                    .run("payout", move || wallet.credit(target, amount))
                    .await;
                if let Err(e) = credited {
                    warn!(position_id = %position.id, account, %amount, error = %e, "Payout failed");
                    failure = Some(EngineError::from(e));
                    break;
                }
                report.winners += 1;
                report.total_paid += amount;
            }

            self.positions
                .update(position.id, |p| {
                    p.correct = correct;
                    p.paid = true;
                    Ok(())
                })
                .await?;
            report.settled += 1;
            if let Some(owner) = position.owner {
                owners.insert(owner);
            }
        }
        drop(row);

        for owner in owners {
            let positions = self.positions.for_owner(&owner).await;
            self.outbox.notify(owner, positions);
        }

        info!(
            fixture_id,
            winning = %winning,
            settled = report.settled,
            winners = report.winners,
            total_paid = %report.total_paid,
            "Fixture settled"
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
