//! End-to-end exchange scenarios across one or more groups.

use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

use fixture_exchange::engine::outbox::OutboundEvent;
use fixture_exchange::engine::requests::NewRequest;
use fixture_exchange::ports::memory::MemoryWallet;
use fixture_exchange::ports::Wallet;
use fixture_exchange::storage;
use fixture_exchange::types::*;

use crate::support::{fixture, Node, BET_LIMIT};

const GROUP_A: GroupId = 1;
const GROUP_B: GroupId = 2;
const GROUP_C: GroupId = 3;

async fn node_with_fixture(group: GroupId, fixture_id: FixtureId) -> Node {
    let node = Node::new(group);
    node.engine.ingest_fixture(fixture(fixture_id)).await.unwrap();
    node
}

#[tokio::test]
async fn test_request_then_approval() {
    let mut node = node_with_fixture(GROUP_A, 7).await;

    let position = node
        .engine
        .create_request(NewRequest::purchase(7, Outcome::Home, 10, GROUP_A, "ana"))
        .await
        .unwrap();
    assert_eq!(position.status, PositionStatus::Pending);
    assert_eq!(node.engine.inventory(7).await.unwrap().remaining, 30);

    let approved = node.engine.validate_request(position.id, true).await.unwrap();
    assert_eq!(approved.status, PositionStatus::Approved);
    assert_eq!(node.engine.inventory(7).await.unwrap().remaining, 30);

    assert_eq!(node.pump().await, 2);
    let notified: Vec<_> = node
        .delivered
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::Positions { owner, positions } => {
                Some((owner.as_str(), positions[0].status))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        notified,
        vec![("ana", PositionStatus::Pending), ("ana", PositionStatus::Approved)]
    );
}

#[tokio::test]
async fn test_over_capacity_request_changes_nothing() {
    let mut node = node_with_fixture(GROUP_A, 7).await;
    let before = node.engine.inventory(7).await.unwrap();

    let err = node
        .engine
        .create_request(NewRequest::purchase(7, Outcome::Home, 50, GROUP_A, "ana"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CapacityExceeded { requested: 50, available: 40, .. }
    ));

    assert_eq!(node.engine.inventory(7).await.unwrap(), before);
    assert!(node.engine.positions_for("ana").await.is_empty());
    assert_eq!(node.pump().await, 0);
}

#[tokio::test]
async fn test_rejection_releases_and_refunds() {
    let mut node = node_with_fixture(GROUP_A, 7).await;
    let position = node
        .engine
        .create_request(NewRequest::purchase(7, Outcome::Draw, 4, GROUP_A, "ana"))
        .await
        .unwrap();
    assert_eq!(node.engine.inventory(7).await.unwrap().remaining, 36);

    let rejected = node.engine.validate_request(position.id, false).await.unwrap();
    assert_eq!(rejected.status, PositionStatus::Rejected);
    assert_eq!(node.engine.inventory(7).await.unwrap().remaining, BET_LIMIT);

    node.pump().await;
    assert_eq!(node.wallet.balance("ana").await.unwrap(), dec!(4000));

    // A second decision is refused and refunds nothing more.
    assert_err!(node.engine.validate_request(position.id, true).await);
    assert_eq!(node.pump().await, 0);
    assert_eq!(node.wallet.balance("ana").await.unwrap(), dec!(4000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_overallocate() {
    let node = node_with_fixture(GROUP_A, 7).await;

    let handles: Vec<_> = (0..60)
        .map(|i| {
            let engine = node.engine.clone();
            let owner = format!("user-{i}");
            tokio::spawn(async move {
                engine
                    .create_request(NewRequest::purchase(7, Outcome::Away, 1, GROUP_A, &owner))
                    .await
            })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::CapacityExceeded { .. })))
        .count();

    assert_eq!(accepted, 40);
    assert_eq!(refused, 20);
    assert_eq!(node.engine.inventory(7).await.unwrap().remaining, 0);
    assert_eq!(node.engine.status().await.pending, 40);

    let approvals: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|position| {
            let engine = node.engine.clone();
            let id = position.id;
            tokio::spawn(async move { engine.validate_request(id, true).await })
        })
        .collect();
    for approved in join_all(approvals).await {
        assert_ok!(approved.unwrap());
    }

    let approved = node.engine.approved_quantity(7, Outcome::Away).await;
    assert_eq!(approved, 40);
    assert!(approved <= BET_LIMIT);
    assert_eq!(node.engine.status().await.pending, 0);
    assert_eq!(node.engine.inventory(7).await.unwrap().remaining, 0);
}

#[tokio::test]
async fn test_cross_group_auction() {
    let mut a = node_with_fixture(GROUP_A, 7).await;
    let mut b = node_with_fixture(GROUP_B, 7).await;

    a.stock_reserved(7, Outcome::Away, 5).await;
    assert_eq!(a.engine.inventory(7).await.unwrap().reserved_away, 5);

    let offer = a.engine.create_offer(7, Outcome::Away, 5).await.unwrap();
    assert_eq!(a.engine.inventory(7).await.unwrap().reserved_away, 0);
    for result in a.deliver_to(&b).await {
        assert_ok!(result);
    }
    assert_eq!(b.engine.open_offers().await, vec![offer.clone()]);

    let proposal = b
        .engine
        .create_proposal(offer.auction_id, 7, Outcome::Home, 5)
        .await
        .unwrap();
    for result in b.deliver_to(&a).await {
        assert_ok!(result);
    }
    assert_eq!(a.engine.proposals_for(offer.auction_id).await.unwrap().len(), 1);

    let (closed, accepted) = a.engine.accept_proposal(proposal.proposal_id).await.unwrap();
    assert_eq!(closed.status, OfferStatus::Closed);
    assert_eq!(accepted.status, ProposalStatus::Accepted);
    for result in a.deliver_to(&b).await {
        assert_ok!(result);
    }

    let b_row = b.engine.inventory(7).await.unwrap();
    assert_eq!(b_row.reserved_home, 5);
    assert_eq!(b.engine.offer(offer.auction_id).await.unwrap().status, OfferStatus::Closed);
    assert!(b.engine.open_offers().await.is_empty());

    // Replayed acceptance is refused and credits nothing twice.
    let replay = a
        .delivered
        .iter()
        .find_map(|e| match e {
            OutboundEvent::Auction(m @ AuctionMessage::Acceptance { .. }) => Some(m.clone()),
            _ => None,
        })
        .unwrap();
    assert!(matches!(
        b.engine.handle_message(replay).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(b.engine.inventory(7).await.unwrap().reserved_home, 5);
}

#[tokio::test]
async fn test_competing_proposals_single_winner() {
    let mut a = node_with_fixture(GROUP_A, 7).await;
    let mut b = node_with_fixture(GROUP_B, 7).await;
    let mut c = node_with_fixture(GROUP_C, 7).await;

    a.stock_reserved(7, Outcome::Draw, 3).await;
    let offer = a.engine.create_offer(7, Outcome::Draw, 3).await.unwrap();
    a.pump().await;
    for message in a.transport.drain().await {
        b.engine.handle_message(message.clone()).await.unwrap();
        c.engine.handle_message(message).await.unwrap();
    }

    let from_b = b
        .engine
        .create_proposal(offer.auction_id, 7, Outcome::Home, 3)
        .await
        .unwrap();
    let from_c = c
        .engine
        .create_proposal(offer.auction_id, 7, Outcome::Away, 3)
        .await
        .unwrap();
    b.deliver_to(&a).await;
    c.deliver_to(&a).await;

    let (first, second) = tokio::join!(
        a.engine.accept_proposal(from_b.proposal_id),
        a.engine.accept_proposal(from_c.proposal_id)
    );
    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser, Err(EngineError::Conflict(_))));

    assert_eq!(a.engine.offer(offer.auction_id).await.unwrap().status, OfferStatus::Closed);
    let accepted: Vec<_> = a
        .engine
        .proposals_for(offer.auction_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.status == ProposalStatus::Accepted)
        .collect();
    assert_eq!(accepted.len(), 1);
}

#[tokio::test]
async fn test_reserved_purchase_debits_wallet() {
    let wallet = MemoryWallet::with_balances(&[("ana", dec!(5000))]).await;
    let node = Node::with_wallet(GROUP_A, wallet);
    node.engine.ingest_fixture(fixture(7)).await.unwrap();
    node.stock_reserved(7, Outcome::Home, 5).await;

    let position = node
        .engine
        .purchase_reserved("ana", 7, Outcome::Home, 2, Some("Santiago".into()))
        .await
        .unwrap();
    assert_eq!(position.status, PositionStatus::Approved);
    assert_eq!(position.origin, PositionOrigin::Reserved);
    assert_eq!(node.engine.inventory(7).await.unwrap().reserved_home, 3);
    assert_eq!(node.wallet.balance("ana").await.unwrap(), dec!(3000));

    let err = node
        .engine
        .purchase_reserved("ana", 7, Outcome::Home, 4, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { .. }));
    assert_eq!(node.wallet.balance("ana").await.unwrap(), dec!(3000));
}

#[tokio::test]
async fn test_settlement_pays_winners_once() {
    let node = node_with_fixture(GROUP_A, 7).await;
    let winner = node
        .engine
        .create_request(NewRequest::purchase(7, Outcome::Home, 10, GROUP_A, "ana"))
        .await
        .unwrap();
    let loser = node
        .engine
        .create_request(NewRequest::purchase(7, Outcome::Away, 2, GROUP_A, "ben"))
        .await
        .unwrap();
    let pending = node
        .engine
        .create_request(NewRequest::purchase(7, Outcome::Home, 1, GROUP_A, "cleo"))
        .await
        .unwrap();
    node.engine.validate_request(winner.id, true).await.unwrap();
    node.engine.validate_request(loser.id, true).await.unwrap();

    let report = node
        .engine
        .update_fixture(7, FixtureStatus::Finished, Some(Score { home: 2, away: 1 }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.winning_outcome, Outcome::Home);
    assert_eq!(report.settled, 2);
    assert_eq!(report.total_paid, dec!(18000));

    let winner = node.engine.position(winner.id).await.unwrap();
    assert!(winner.correct && winner.paid);
    let loser = node.engine.position(loser.id).await.unwrap();
    assert!(!loser.correct && loser.paid);
    assert!(!node.engine.position(pending.id).await.unwrap().paid);
    assert_eq!(node.wallet.balance("ana").await.unwrap(), dec!(18000));
    assert_eq!(node.wallet.balance("ben").await.unwrap(), Decimal::ZERO);

    let again = node.engine.settle_fixture(7).await.unwrap();
    assert_eq!(again.settled, 0);
    assert_eq!(node.wallet.balance("ana").await.unwrap(), dec!(18000));
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let node = node_with_fixture(GROUP_A, 7).await;
    node.stock_reserved(7, Outcome::Draw, 6).await;
    let offer = node.engine.create_offer(7, Outcome::Draw, 2).await.unwrap();

    let mut path = std::env::temp_dir();
    path.push(format!("exchange_restart_{}.json", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();
    storage::save_snapshot(&node.engine.snapshot().await.unwrap(), Some(&path)).unwrap();

    let restarted = Node::new(GROUP_A);
    let snapshot = storage::load_snapshot(Some(&path)).unwrap().unwrap();
    restarted.engine.restore(snapshot).await.unwrap();
    storage::delete_snapshot(Some(&path)).unwrap();

    let row = restarted.engine.inventory(7).await.unwrap();
    assert_eq!(row.remaining, 34);
    assert_eq!(row.reserved_draw, 4);
    assert_eq!(restarted.engine.offer(offer.auction_id).await.unwrap(), offer);
    assert_eq!(restarted.engine.fixture(7).await.unwrap().fixture.home_team, "Colo-Colo");
}
