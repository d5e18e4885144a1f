//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::requests::NewRequest;
use crate::engine::settlement::SettlementReport;
use crate::engine::{Engine, EngineStatus, FixtureView};
use crate::types::{
    AuctionId, AuctionMessage, EngineError, Fixture, FixtureId, FixtureInventory, FixtureStatus,
    GroupId, Offer, Outcome, Position, PositionId, PositionOrigin, Proposal, ProposalId, Score,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub engine: Arc<Engine>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub uptime_secs: i64,
}

/// Both sides of a resolved proposal.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResponse {
    pub offer: Offer,
    pub proposal: Proposal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixtureUpdateResponse {
    /// Present when the update finished the fixture.
    pub settlement: Option<SettlementReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountState {
    pub discount: bool,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureUpdateBody {
    pub status: FixtureStatus,
    #[serde(default)]
    pub goals: Option<Score>,
}

/// A bet request. Without `group` it is placed for this instance's group.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestBody {
    /// Idempotency key; generated when absent.
    #[serde(default)]
    pub id: Option<PositionId>,
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
    #[serde(default)]
    pub group: Option<GroupId>,
    #[serde(default)]
    pub owner: Option<String>,
    /// Units bought by the group for its reserved pool.
    #[serde(default)]
    pub trade: bool,
    #[serde(default)]
    pub location: Option<String>,
}

impl RequestBody {
    fn into_request(self, local_group: GroupId) -> NewRequest {
        let group = self.group.unwrap_or(local_group);
        let origin = if self.trade {
            PositionOrigin::Trade
        } else {
            PositionOrigin::Purchase
        };
        NewRequest {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            fixture_id: self.fixture_id,
            outcome: self.outcome,
            quantity: self.quantity,
            group,
            // Only this group's users pay from the local wallet.
            wallet: !self.trade && self.owner.is_some() && group == local_group,
            owner: self.owner,
            origin,
            location: self.location,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationBody {
    pub valid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservedPurchaseBody {
    pub owner: String,
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkBody {
    pub owner: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Units of one outcome, used for both offers and proposals.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitsBody {
    pub fixture_id: FixtureId,
    pub outcome: Outcome,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::CapacityExceeded { .. }
            | EngineError::InsufficientFunds { .. }
            | EngineError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::TransientDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.reason_code(),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        engine: state.engine.status().await,
        uptime_secs: uptime,
    })
}

/// GET /api/fixtures
pub async fn get_fixtures(
    State(state): State<AppState>,
) -> Result<Json<Vec<FixtureView>>, ApiError> {
    Ok(Json(state.engine.available_fixtures().await?))
}

/// GET /api/fixtures/tradable
pub async fn get_tradable_fixtures(
    State(state): State<AppState>,
) -> Result<Json<Vec<FixtureView>>, ApiError> {
    Ok(Json(state.engine.tradable_fixtures().await?))
}

/// GET /api/fixtures/:id
pub async fn get_fixture(
    State(state): State<AppState>,
    Path(id): Path<FixtureId>,
) -> Result<Json<FixtureView>, ApiError> {
    Ok(Json(state.engine.fixture(id).await?))
}

/// GET /api/offers
pub async fn get_offers(State(state): State<AppState>) -> Json<Vec<Offer>> {
    Json(state.engine.open_offers().await)
}

/// GET /api/offers/:id/proposals
pub async fn get_proposals(
    State(state): State<AppState>,
    Path(id): Path<AuctionId>,
) -> Result<Json<Vec<Proposal>>, ApiError> {
    Ok(Json(state.engine.proposals_for(id).await?))
}

/// GET /api/positions/:owner
pub async fn get_positions(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Json<Vec<Position>> {
    Json(state.engine.positions_for(&owner).await)
}

/// POST /api/auctions
///
/// Inbound auction message from another group. A replayed message answers
/// 409, which publishers treat as delivered.
pub async fn post_auction(
    State(state): State<AppState>,
    Json(message): Json<AuctionMessage>,
) -> Result<StatusCode, ApiError> {
    let kind = message.kind();
    let sender = message.sender();
    match state.engine.handle_message(message).await {
        Ok(()) => {
            debug!(kind, sender, "Auction message applied");
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            warn!(kind, sender, error = %e, "Auction message refused");
            Err(e.into())
        }
    }
}

/// POST /api/fixtures
pub async fn post_fixture(
    State(state): State<AppState>,
    Json(fixture): Json<Fixture>,
) -> Result<(StatusCode, Json<FixtureInventory>), ApiError> {
    let inventory = state.engine.ingest_fixture(fixture).await?;
    Ok((StatusCode::CREATED, Json(inventory)))
}

/// PATCH /api/fixtures/:id
///
/// A finishing update settles the fixture in the same call.
pub async fn patch_fixture(
    State(state): State<AppState>,
    Path(id): Path<FixtureId>,
    Json(body): Json<FixtureUpdateBody>,
) -> Result<Json<FixtureUpdateResponse>, ApiError> {
    let settlement = state.engine.update_fixture(id, body.status, body.goals).await?;
    Ok(Json(FixtureUpdateResponse { settlement }))
}

/// POST /api/fixtures/:id/settle
pub async fn post_settle(
    State(state): State<AppState>,
    Path(id): Path<FixtureId>,
) -> Result<Json<SettlementReport>, ApiError> {
    Ok(Json(state.engine.settle_fixture(id).await?))
}

/// POST /api/requests
pub async fn post_request(
    State(state): State<AppState>,
    Json(body): Json<RequestBody>,
) -> Result<(StatusCode, Json<Position>), ApiError> {
    let request = body.into_request(state.engine.settings().group_id);
    let position = state.engine.create_request(request).await?;
    Ok((StatusCode::CREATED, Json(position)))
}

/// PATCH /api/requests/:id
pub async fn patch_request(
    State(state): State<AppState>,
    Path(id): Path<PositionId>,
    Json(body): Json<ValidationBody>,
) -> Result<Json<Position>, ApiError> {
    Ok(Json(state.engine.validate_request(id, body.valid).await?))
}

/// POST /api/requests/reserved
pub async fn post_reserved_purchase(
    State(state): State<AppState>,
    Json(body): Json<ReservedPurchaseBody>,
) -> Result<(StatusCode, Json<Position>), ApiError> {
    let position = state
        .engine
        .purchase_reserved(
            &body.owner,
            body.fixture_id,
            body.outcome,
            body.quantity,
            body.location,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(position)))
}

/// POST /api/requests/:id/link
pub async fn post_link(
    State(state): State<AppState>,
    Path(id): Path<PositionId>,
    Json(body): Json<LinkBody>,
) -> Result<Json<Position>, ApiError> {
    Ok(Json(
        state.engine.link_position(id, &body.owner, body.location).await?,
    ))
}

/// POST /api/offers
pub async fn post_offer(
    State(state): State<AppState>,
    Json(body): Json<UnitsBody>,
) -> Result<(StatusCode, Json<Offer>), ApiError> {
    let offer = state
        .engine
        .create_offer(body.fixture_id, body.outcome, body.quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

/// POST /api/offers/:id/proposals
pub async fn post_proposal(
    State(state): State<AppState>,
    Path(id): Path<AuctionId>,
    Json(body): Json<UnitsBody>,
) -> Result<(StatusCode, Json<Proposal>), ApiError> {
    let proposal = state
        .engine
        .create_proposal(id, body.fixture_id, body.outcome, body.quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

/// POST /api/proposals/:id/accept
pub async fn post_accept(
    State(state): State<AppState>,
    Path(id): Path<ProposalId>,
) -> Result<Json<ResolutionResponse>, ApiError> {
    let (offer, proposal) = state.engine.accept_proposal(id).await?;
    Ok(Json(ResolutionResponse { offer, proposal }))
}

/// POST /api/proposals/:id/reject
pub async fn post_reject(
    State(state): State<AppState>,
    Path(id): Path<ProposalId>,
) -> Result<Json<ResolutionResponse>, ApiError> {
    let (offer, proposal) = state.engine.reject_proposal(id).await?;
    Ok(Json(ResolutionResponse { offer, proposal }))
}

/// GET /api/discount
pub async fn get_discount(State(state): State<AppState>) -> Json<DiscountState> {
    Json(DiscountState {
        discount: state.engine.discount(),
    })
}

/// POST /api/discount
///
/// Flips the reserved purchase discount.
pub async fn post_discount(State(state): State<AppState>) -> Json<DiscountState> {
    let discount = state.engine.toggle_discount();
    info!(discount, "Discount toggled");
    Json(DiscountState { discount })
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
