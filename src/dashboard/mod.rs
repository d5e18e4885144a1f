//! Dashboard: Axum web server for the exchange API.
//!
//! Serves the engine state, the commands that drive it (fixtures,
//! requests, offers, proposals, the discount switch) and the endpoint the
//! broker delivers other groups' auction messages to.
//! CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub use routes::{AppState, DashboardState};

/// Start the dashboard web server.
///
/// Binds the port before returning, then serves on a background task.
pub async fn spawn_dashboard(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind dashboard port {port}"))?;
    info!(port, "Dashboard server listening on http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Dashboard server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route(
            "/api/fixtures",
            get(routes::get_fixtures).post(routes::post_fixture),
        )
        .route("/api/fixtures/tradable", get(routes::get_tradable_fixtures))
        .route(
            "/api/fixtures/:id",
            get(routes::get_fixture).patch(routes::patch_fixture),
        )
        .route("/api/fixtures/:id/settle", post(routes::post_settle))
        .route("/api/requests", post(routes::post_request))
        .route("/api/requests/reserved", post(routes::post_reserved_purchase))
        .route("/api/requests/:id", patch(routes::patch_request))
        .route("/api/requests/:id/link", post(routes::post_link))
        .route("/api/offers", get(routes::get_offers).post(routes::post_offer))
        .route(
            "/api/offers/:id/proposals",
            get(routes::get_proposals).post(routes::post_proposal),
        )
        .route("/api/proposals/:id/accept", post(routes::post_accept))
        .route("/api/proposals/:id/reject", post(routes::post_reject))
        .route("/api/positions/:owner", get(routes::get_positions))
        .route(
            "/api/discount",
            get(routes::get_discount).post(routes::post_discount),
        )
        .route("/api/auctions", post(routes::post_auction))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
