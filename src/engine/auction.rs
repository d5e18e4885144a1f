//! Offer/proposal auction between trading groups.
//!
//! An offer withholds reserved units of the local group until it closes.
//! Counterparties bid with proposals; the offering group accepts exactly
//! one (every sibling is rejected and the offer closes) or rejects them
//! one at a time. The proposer's reserved pool is credited when the
//! acceptance reaches its own instance.
//!
//! Messages between groups are at-least-once and may arrive out of order.
//! Acceptance and rejection carry both records, so a receiver that never
//! saw the offer or proposal can still apply them, and replaying any
//! message is answered with `Conflict` instead of being reapplied.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::ledger::{FixtureLocks, InventoryLedger};
use super::outbox::Outbox;
use crate::types::{
    AuctionId, AuctionMessage, EngineError, FixtureId, GroupId, Offer, OfferStatus, Outcome,
    Proposal, ProposalId, ProposalStatus,
};

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BookState {
    offers: HashMap<AuctionId, Offer>,
    proposals: HashMap<ProposalId, Proposal>,
}

impl BookState {
    fn offer(&self, id: AuctionId) -> Result<&Offer, EngineError> {
        self.offers.get(&id).ok_or_else(|| EngineError::not_found("offer", id))
    }

    fn proposal(&self, id: ProposalId) -> Result<&Proposal, EngineError> {
        self.proposals
            .get(&id)
            .ok_or_else(|| EngineError::not_found("proposal", id))
    }

    fn insert_offer(&mut self, offer: Offer) -> Result<(), EngineError> {
        if self.offers.contains_key(&offer.auction_id) {
            return Err(EngineError::Conflict(format!("offer {} already exists", offer.auction_id)));
        }
        self.offers.insert(offer.auction_id, offer);
        Ok(())
    }

    fn insert_proposal(&mut self, proposal: Proposal) -> Result<(), EngineError> {
        if self.proposals.contains_key(&proposal.proposal_id) {
            return Err(EngineError::Conflict(format!(
                "proposal {} already exists",
                proposal.proposal_id
            )));
        }
        self.proposals.insert(proposal.proposal_id, proposal);
        Ok(())
    }

    /// Record an offer and proposal first seen inside a resolution message.
    fn adopt(&mut self, offer: &Offer, proposal: &Proposal) {
        self.offers.entry(offer.auction_id).or_insert_with(|| Offer {
            status: OfferStatus::Available,
            ..offer.clone()
        });
        self.proposals
            .entry(proposal.proposal_id)
            .or_insert_with(|| Proposal {
                status: ProposalStatus::Pending,
                ..proposal.clone()
            });
    }

    fn ensure_open(
        &self,
        auction_id: AuctionId,
        proposal_id: ProposalId,
    ) -> Result<(), EngineError> {
        if self.offer(auction_id)?.status == OfferStatus::Closed {
            return Err(EngineError::Conflict(format!("offer {auction_id} already closed")));
        }
        let proposal = self.proposal(proposal_id)?;
        if proposal.auction_id != auction_id {
            return Err(EngineError::Invalid(format!(
                "proposal {proposal_id} does not belong to offer {auction_id}"
            )));
        }
        if proposal.status != ProposalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "proposal {proposal_id} already {:?}",
                proposal.status
            )));
        }
        Ok(())
    }

    /// Accept one proposal, reject its siblings and close the offer.
    fn close(
        &mut self,
        auction_id: AuctionId,
        proposal_id: ProposalId,
    ) -> Result<(Offer, Proposal, usize), EngineError> {
        let offer = match self.offers.get_mut(&auction_id) {
            Some(offer) => {
                offer.status = OfferStatus::Closed;
                offer.clone()
            }
            None => return Err(EngineError::not_found("offer", auction_id)),
        };
        let mut rejected = 0;
        let mut accepted = None;
        for proposal in self.proposals.values_mut().filter(|p| p.auction_id == auction_id) {
            if proposal.proposal_id == proposal_id {
                proposal.status = ProposalStatus::Accepted;
                accepted = Some(proposal.clone());
            } else if proposal.status == ProposalStatus::Pending {
                proposal.status = ProposalStatus::Rejected;
                rejected += 1;
            }
        }
        let proposal = accepted.ok_or_else(|| EngineError::not_found("proposal", proposal_id))?;
        Ok((offer, proposal, rejected))
    }
}

/// Every offer and proposal known to this instance.
#[derive(Default)]
pub struct AuctionBook {
    inner: Mutex<BookState>,
}

impl AuctionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn offer(&self, id: AuctionId) -> Result<Offer, EngineError> {
        self.inner.lock().await.offer(id).cloned()
    }

    pub async fn proposal(&self, id: ProposalId) -> Result<Proposal, EngineError> {
        self.inner.lock().await.proposal(id).cloned()
    }

    pub async fn offers(&self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self.inner.lock().await.offers.values().cloned().collect();
        offers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        offers
    }

    pub async fn proposals(&self) -> Vec<Proposal> {
        let mut proposals: Vec<Proposal> =
            self.inner.lock().await.proposals.values().cloned().collect();
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        proposals
    }

    pub async fn restore(&self, offers: Vec<Offer>, proposals: Vec<Proposal>) {
        let mut inner = self.inner.lock().await;
        inner.offers = offers.into_iter().map(|o| (o.auction_id, o)).collect();
        inner.proposals = proposals.into_iter().map(|p| (p.proposal_id, p)).collect();
    }
}

// ---------------------------------------------------------------------------
// Auction house
// ---------------------------------------------------------------------------

pub struct AuctionHouse {
    group_id: GroupId,
    ledger: Arc<InventoryLedger>,
    book: Arc<AuctionBook>,
    outbox: Outbox,
}

impl AuctionHouse {
    pub fn new(
        group_id: GroupId,
        ledger: Arc<InventoryLedger>,
        book: Arc<AuctionBook>,
        outbox: Outbox,
    ) -> Self {
        Self {
            group_id,
            ledger,
            book,
            outbox,
        }
    }

    /// Offer `quantity` reserved units of `outcome` to the other groups.
    ///
    /// The units are withheld from the reserved pool immediately, under
    /// the fixture lock, so concurrent offers can never exceed it.
    pub async fn create_offer(
        &self,
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
    ) -> Result<Offer, EngineError> {
        ensure_positive(quantity)?;
        let mut row = self.ledger.lock(fixture_id).await?;
        row.ensure_reserved(outcome, quantity)?;

        let offer = Offer {
            auction_id: Uuid::new_v4(),
            fixture_id,
            outcome,
            quantity,
            group: self.group_id,
            status: OfferStatus::Available,
            created_at: Utc::now(),
        };
        self.book.inner.lock().await.insert_offer(offer.clone())?;
        let reserved = row.adjust_reserved(outcome, -i64::from(quantity))?;
        drop(row);

        info!(
            auction_id = %offer.auction_id,
            fixture_id,
            %outcome,
            quantity,
            reserved,
            "Offer created"
        );
        self.outbox.publish(AuctionMessage::Offer { offer: offer.clone() });
        Ok(offer)
    }

    /// Bid on another group's available offer.
    pub async fn create_proposal(
        &self,
        auction_id: AuctionId,
        fixture_id: FixtureId,
        outcome: Outcome,
        quantity: u32,
    ) -> Result<Proposal, EngineError> {
        ensure_positive(quantity)?;
        if !self.ledger.contains(fixture_id).await {
            return Err(EngineError::not_found("fixture", fixture_id));
        }

        let proposal = Proposal {
            proposal_id: Uuid::new_v4(),
            auction_id,
            fixture_id,
            outcome,
            quantity,
            group: self.group_id,
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
        };
        {
            let mut book = self.book.inner.lock().await;
            let offer = book.offer(auction_id)?;
            if offer.group == self.group_id {
                return Err(EngineError::Invalid("cannot bid on own offer".into()));
            }
            if offer.status == OfferStatus::Closed {
                return Err(EngineError::Conflict(format!("offer {auction_id} already closed")));
            }
            book.insert_proposal(proposal.clone())?;
        }

        info!(
            proposal_id = %proposal.proposal_id,
            %auction_id,
            fixture_id,
            %outcome,
            quantity,
            "Proposal submitted"
        );
        self.outbox.publish(AuctionMessage::Proposal {
            proposal: proposal.clone(),
        });
        Ok(proposal)
    }

    /// Accept a proposal on one of the local group's offers.
    ///
    /// A second acceptance on the same offer fails with `Conflict`.
    pub async fn accept_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> Result<(Offer, Proposal), EngineError> {
        let (offer, proposal) = self.records_for(proposal_id).await?;
        let (offer, proposal) = self.apply_acceptance(&offer, &proposal).await?;
        self.outbox.publish(AuctionMessage::Acceptance {
            offer: offer.clone(),
            proposal: proposal.clone(),
        });
        Ok((offer, proposal))
    }

    /// Turn down a single proposal; the offer stays available.
    pub async fn reject_proposal(
        &self,
        proposal_id: ProposalId,
    ) -> Result<(Offer, Proposal), EngineError> {
        let (offer, proposal) = self.records_for(proposal_id).await?;
        let (offer, proposal) = self.apply_rejection(&offer, &proposal).await?;
        self.outbox.publish(AuctionMessage::Rejection {
            offer: offer.clone(),
            proposal: proposal.clone(),
        });
        Ok((offer, proposal))
    }

    /// Apply a message published by another group.
    pub async fn handle_message(&self, message: AuctionMessage) -> Result<(), EngineError> {
        if message.sender() == self.group_id {
            debug!(kind = message.kind(), "Ignoring echo of own auction message");
            return Ok(());
        }

        match message {
            AuctionMessage::Offer { offer } => {
                ensure_positive(offer.quantity)?;
                if !self.ledger.contains(offer.fixture_id).await {
                    return Err(EngineError::not_found("fixture", offer.fixture_id));
                }
                let offer = Offer {
                    status: OfferStatus::Available,
                    ..offer
                };
                self.book.inner.lock().await.insert_offer(offer.clone())?;
                info!(auction_id = %offer.auction_id, group = offer.group, "Offer received");
            }
            AuctionMessage::Proposal { proposal } => {
                ensure_positive(proposal.quantity)?;
                if !self.ledger.contains(proposal.fixture_id).await {
                    return Err(EngineError::not_found("fixture", proposal.fixture_id));
                }
                let proposal = Proposal {
                    status: ProposalStatus::Pending,
                    ..proposal
                };
                let mut book = self.book.inner.lock().await;
                if book.offer(proposal.auction_id)?.status == OfferStatus::Closed {
                    return Err(EngineError::Conflict(format!(
                        "offer {} already closed",
                        proposal.auction_id
                    )));
                }
                book.insert_proposal(proposal.clone())?;
                info!(
                    proposal_id = %proposal.proposal_id,
                    auction_id = %proposal.auction_id,
                    group = proposal.group,
                    "Proposal received"
                );
            }
            AuctionMessage::Acceptance { offer, proposal } => {
                self.apply_acceptance(&offer, &proposal).await?;
            }
            AuctionMessage::Rejection { offer, proposal } => {
                self.apply_rejection(&offer, &proposal).await?;
            }
        }
        Ok(())
    }

    /// Available offers published by other groups.
    pub async fn open_offers(&self) -> Vec<Offer> {
        self.book
            .offers()
            .await
            .into_iter()
            .filter(|o| o.status == OfferStatus::Available && o.group != self.group_id)
            .collect()
    }

    pub async fn proposals_for(&self, auction_id: AuctionId) -> Result<Vec<Proposal>, EngineError> {
        let book = self.book.inner.lock().await;
        book.offer(auction_id)?;
        let mut proposals: Vec<Proposal> = book
            .proposals
            .values()
            .filter(|p| p.auction_id == auction_id)
            .cloned()
            .collect();
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(proposals)
    }

    /// Look up a proposal and its offer, which must belong to the local group.
    async fn records_for(
        &self,
        proposal_id: ProposalId,
    ) -> Result<(Offer, Proposal), EngineError> {
        let book = self.book.inner.lock().await;
        let proposal = book.proposal(proposal_id)?.clone();
        let offer = book.offer(proposal.auction_id)?.clone();
        if offer.group != self.group_id {
            return Err(EngineError::Invalid(format!(
                "offer {} belongs to group {}",
                offer.auction_id, offer.group
            )));
        }
        Ok((offer, proposal))
    }

    async fn apply_acceptance(
        &self,
        offer: &Offer,
        proposal: &Proposal,
    ) -> Result<(Offer, Proposal), EngineError> {
        let mut locks = self
            .ledger
            .lock_many(&[offer.fixture_id, proposal.fixture_id])
            .await?;
        let mut book = self.book.inner.lock().await;
        book.adopt(offer, proposal);
        book.ensure_open(offer.auction_id, proposal.proposal_id)?;

        if proposal.group == self.group_id {
            self.credit_proposer(&mut locks, proposal)?;
        }
        let (offer, proposal, rejected) = book.close(offer.auction_id, proposal.proposal_id)?;
        drop(book);
        drop(locks);

        info!(
            auction_id = %offer.auction_id,
            proposal_id = %proposal.proposal_id,
            offerer = offer.group,
            proposer = proposal.group,
            siblings_rejected = rejected,
            "Proposal accepted, offer closed"
        );
        Ok((offer, proposal))
    }

    fn credit_proposer(
        &self,
        locks: &mut FixtureLocks,
        proposal: &Proposal,
    ) -> Result<(), EngineError> {
        let row = locks.get_mut(proposal.fixture_id)?;
        let reserved = row.adjust_reserved(proposal.outcome, i64::from(proposal.quantity))?;
        debug!(
            fixture_id = proposal.fixture_id,
            outcome = %proposal.outcome,
            quantity = proposal.quantity,
            reserved,
            "Reserved pool credited by accepted proposal"
        );
        Ok(())
    }

    async fn apply_rejection(
        &self,
        offer: &Offer,
        proposal: &Proposal,
    ) -> Result<(Offer, Proposal), EngineError> {
        let mut book = self.book.inner.lock().await;
        book.adopt(offer, proposal);
        let current = book.proposal(proposal.proposal_id)?;
        if current.status != ProposalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "proposal {} already {:?}",
                proposal.proposal_id, current.status
            )));
        }
        let rejected = match book.proposals.get_mut(&proposal.proposal_id) {
            Some(p) => {
                p.status = ProposalStatus::Rejected;
                p.clone()
            }
            None => return Err(EngineError::not_found("proposal", proposal.proposal_id)),
        };
        let offer = book.offer(offer.auction_id)?.clone();
        drop(book);

        info!(
            auction_id = %offer.auction_id,
            proposal_id = %rejected.proposal_id,
            "Proposal rejected"
        );
        Ok((offer, rejected))
    }
}

fn ensure_positive(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::Invalid("quantity must be positive".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
