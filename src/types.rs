//! Shared types for the fixture exchange.
//!
//! These types form the data model used across all modules. Outcome and
//! status strings coming from providers or peers are resolved into closed
//! enums here, once, so nothing downstream compares labels.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type FixtureId = u64;
pub type GroupId = u32;
pub type PositionId = Uuid;
pub type AuctionId = Uuid;
pub type ProposalId = Uuid;

/// Name of the odds market used for settlement multipliers.
pub const MATCH_WINNER: &str = "Match Winner";

/// Label the provider uses for a draw result.
const DRAW_LABEL: &str = "---";

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// One of the three settleable results of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Home,
    Away,
    Draw,
}

impl Outcome {
    pub const ALL: [Outcome; 3] = [Outcome::Home, Outcome::Away, Outcome::Draw];

    /// Resolve a result label against the fixture's team names.
    ///
    /// Accepts the canonical names, either team's name, and the provider's
    /// `---` draw marker.
    pub fn resolve(label: &str, home_team: &str, away_team: &str) -> Option<Self> {
        if let Ok(outcome) = label.parse() {
            return Some(outcome);
        }
        if label == home_team {
            Some(Outcome::Home)
        } else if label == away_team {
            Some(Outcome::Away)
        } else if label == DRAW_LABEL {
            Some(Outcome::Draw)
        } else {
            None
        }
    }

    /// The realized outcome for a final score.
    pub fn from_score(score: Score) -> Self {
        match score.home.cmp(&score.away) {
            std::cmp::Ordering::Greater => Outcome::Home,
            std::cmp::Ordering::Less => Outcome::Away,
            std::cmp::Ordering::Equal => Outcome::Draw,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Home => write!(f, "Home"),
            Outcome::Away => write!(f, "Away"),
            Outcome::Draw => write!(f, "Draw"),
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "home" => Ok(Outcome::Home),
            "away" => Ok(Outcome::Away),
            "draw" => Ok(Outcome::Draw),
            _ => Err(anyhow::anyhow!("Unknown outcome: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixtureStatus {
    Scheduled,
    Live,
    Finished,
    Cancelled,
}

impl FixtureStatus {
    /// Map a provider short status code (`NS`, `FT`, ...) to a status.
    pub fn from_short(code: &str) -> Self {
        match code.to_uppercase().as_str() {
            "NS" | "TBD" => FixtureStatus::Scheduled,
            "FT" | "AET" | "PEN" => FixtureStatus::Finished,
            "PST" | "CANC" | "ABD" | "AWD" | "WO" => FixtureStatus::Cancelled,
            _ => FixtureStatus::Live,
        }
    }

    pub fn is_finished(&self) -> bool {
        *self == FixtureStatus::Finished
    }
}

impl fmt::Display for FixtureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureStatus::Scheduled => write!(f, "scheduled"),
            FixtureStatus::Live => write!(f, "live"),
            FixtureStatus::Finished => write!(f, "finished"),
            FixtureStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Goals scored by each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub home: u32,
    pub away: u32,
}

/// A single selectable value inside an odds market ("Home" @ 1.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddValue {
    pub bet: String,
    pub odd: Decimal,
}

/// A named odds market for a fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Odd {
    pub name: String,
    pub values: Vec<OddValue>,
}

/// Decimal multipliers of the "Match Winner" market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchWinnerOdds {
    pub home: Decimal,
    pub away: Decimal,
    pub draw: Decimal,
}

impl MatchWinnerOdds {
    pub fn multiplier(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Home => self.home,
            Outcome::Away => self.away,
            Outcome::Draw => self.draw,
        }
    }

    fn from_odd(odd: &Odd) -> Option<Self> {
        let value = |outcome: Outcome| {
            odd.values
                .iter()
                .find(|v| v.bet.parse::<Outcome>().ok() == Some(outcome))
                .map(|v| v.odd)
        };
        Some(Self {
            home: value(Outcome::Home)?,
            away: value(Outcome::Away)?,
            draw: value(Outcome::Draw)?,
        })
    }
}

/// A sports match as held by the fixture store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: FixtureId,
    pub home_team: String,
    pub away_team: String,
    pub league: String,
    pub round: String,
    pub date: DateTime<Utc>,
    pub status: FixtureStatus,
    pub goals: Option<Score>,
    pub odds: Vec<Odd>,
}

impl fmt::Display for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} vs {} [{}]", self.id, self.home_team, self.away_team, self.status)?;
        if let Some(score) = self.goals {
            write!(f, " {}-{}", score.home, score.away)?;
        }
        Ok(())
    }
}

impl Fixture {
    /// Resolve a result label for this fixture.
    pub fn outcome_for(&self, label: &str) -> Option<Outcome> {
        Outcome::resolve(label, &self.home_team, &self.away_team)
    }

    /// The realized outcome, once the fixture is finished with a score.
    pub fn winning_outcome(&self) -> Option<Outcome> {
        if !self.status.is_finished() {
            return None;
        }
        self.goals.map(Outcome::from_score)
    }

    /// Named lookup of the "Match Winner" market.
    ///
    /// Several entries carrying identical values are tolerated; entries
    /// that disagree are a conflict.
    pub fn match_winner_odds(&self) -> Result<MatchWinnerOdds, EngineError> {
        let mut found: Option<MatchWinnerOdds> = None;
        for odd in self.odds.iter().filter(|o| o.name == MATCH_WINNER) {
            let parsed = MatchWinnerOdds::from_odd(odd).ok_or_else(|| {
                EngineError::Invalid(format!(
                    "fixture {} has an incomplete {MATCH_WINNER} market",
                    self.id
                ))
            })?;
            match found {
                Some(existing) if existing != parsed => {
                    return Err(EngineError::Conflict(format!(
                        "fixture {} has ambiguous {MATCH_WINNER} odds",
                        self.id
                    )));
                }
                _ => found = Some(parsed),
            }
        }
        found.ok_or_else(|| EngineError::not_found("odds", self.id))
    }

    #[cfg(test)]
    pub fn sample(id: FixtureId) -> Self {
        Fixture {
            id,
            home_team: "Colo-Colo".to_string(),
            away_team: "Universidad de Chile".to_string(),
            league: "Primera Division".to_string(),
            round: "Regular Season - 12".to_string(),
            date: Utc::now() + chrono::Duration::days(3),
            status: FixtureStatus::Scheduled,
            goals: None,
            odds: vec![Odd {
                name: MATCH_WINNER.to_string(),
                values: vec![
                    OddValue { bet: "Home".into(), odd: rust_decimal_macros::dec!(1.8) },
                    OddValue { bet: "Draw".into(), odd: rust_decimal_macros::dec!(3.2) },
                    OddValue { bet: "Away".into(), odd: rust_decimal_macros::dec!(4.5) },
                ],
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Per-fixture bet counters owned by the inventory ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureInventory {
    pub fixture_id: FixtureId,
    /// Inventory the row was opened with.
    pub capacity: u32,
    pub remaining: u32,
    pub reserved_home: u32,
    pub reserved_away: u32,
    pub reserved_draw: u32,
}

impl fmt::Display for FixtureInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fixture={} remaining={}/{} reserved(H/A/D)={}/{}/{}",
            self.fixture_id,
            self.remaining,
            self.capacity,
            self.reserved_home,
            self.reserved_away,
            self.reserved_draw,
        )
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Approved,
    Rejected,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Pending)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "pending"),
            PositionStatus::Approved => write!(f, "approved"),
            PositionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// How a position came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionOrigin {
    /// A purchase out of the fixture's general pool.
    Purchase,
    /// Units bought by the group to hold in its reserved pool (seller flag).
    Trade,
    /// A purchase out of the group's reserved pool.
    Reserved,
}

/// A claim on `quantity` units of one outcome of one fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
    pub group: GroupId,
    /// User that owns the claim; group-level positions may have none.
    pub owner: Option<String>,
    pub origin: PositionOrigin,
    /// Funded from the owner's wallet (refunded on rejection).
    pub wallet: bool,
    pub status: PositionStatus,
    pub paid: bool,
    pub correct: bool,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] fixture={} {} x{} group={} status={}{}",
            self.id,
            self.fixture_id,
            self.outcome,
            self.quantity,
            self.group,
            self.status,
            if self.paid { " (paid)" } else { "" },
        )
    }
}

impl Position {
    /// Wallet account that receives refunds and payouts.
    pub fn account(&self) -> String {
        match &self.owner {
            Some(owner) => owner.clone(),
            None => group_account(self.group),
        }
    }
}

/// Wallet account name of a trading group.
pub fn group_account(group: GroupId) -> String {
    format!("group:{group}")
}

// ---------------------------------------------------------------------------
// Auctions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferStatus {
    Available,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A group's advertisement of reserved units it is willing to release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub auction_id: AuctionId,
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
    pub group: GroupId,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "offer {} by group {}: fixture={} {} x{} ({:?})",
            self.auction_id, self.group, self.fixture_id, self.outcome, self.quantity, self.status,
        )
    }
}

/// A counterparty's bid against a specific offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub auction_id: AuctionId,
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
    pub group: GroupId,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proposal {} on {} by group {}: fixture={} {} x{} ({:?})",
            self.proposal_id,
            self.auction_id,
            self.group,
            self.fixture_id,
            self.outcome,
            self.quantity,
            self.status,
        )
    }
}

/// Event exchanged between trading groups over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuctionMessage {
    Offer { offer: Offer },
    Proposal { proposal: Proposal },
    /// Carries both records so a receiver that missed them can still apply it.
    Acceptance { offer: Offer, proposal: Proposal },
    Rejection { offer: Offer, proposal: Proposal },
}

impl AuctionMessage {
    /// Group that published this message.
    pub fn sender(&self) -> GroupId {
        match self {
            AuctionMessage::Offer { offer } => offer.group,
            AuctionMessage::Proposal { proposal } => proposal.group,
            AuctionMessage::Acceptance { offer, .. } | AuctionMessage::Rejection { offer, .. } => {
                offer.group
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuctionMessage::Offer { .. } => "offer",
            AuctionMessage::Proposal { .. } => "proposal",
            AuctionMessage::Acceptance { .. } => "acceptance",
            AuctionMessage::Rejection { .. } => "rejection",
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error taxonomy of the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Insufficient {pool} inventory on fixture {fixture_id}: requested {requested}, available {available}")]
    CapacityExceeded {
        fixture_id: FixtureId,
        pool: String,
        requested: u32,
        available: u32,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient funds for {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Dependency unavailable: {0}")]
    TransientDependency(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        EngineError::NotFound { kind, id: id.to_string() }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientDependency(_))
    }

    /// Stable reason code for rejection responses.
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::Conflict(_) => "conflict",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::Invalid(_) => "invalid",
            EngineError::TransientDependency(_) => "retryable",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
