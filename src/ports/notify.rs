//! Notification sinks.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::NotificationSink;
use crate::types::{Position, PositionStatus};

/// Writes position updates to the log. Stands in for the websocket
/// fan-out when no push channel is configured.
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, owner: &str, positions: &[Position]) -> Result<()> {
        let pending = positions
            .iter()
            .filter(|p| p.status == PositionStatus::Pending)
            .count();
        info!(
            owner,
            positions = positions.len(),
            pending,
            latest = ?positions.first().map(|p| p.id),
            "Positions updated"
        );
        Ok(())
    }
}
