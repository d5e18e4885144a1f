//! Position book: every bet claim known to this instance.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{
    EngineError, FixtureId, GroupId, Outcome, Position, PositionId, PositionStatus,
};

#[derive(Default)]
pub struct PositionBook {
    inner: RwLock<HashMap<PositionId, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new position. The id is an idempotency key: an existing
    /// entry is never overwritten.
    pub async fn insert(&self, position: Position) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(&position.id) {
            return Err(EngineError::Conflict(format!("position {} already exists", position.id)));
        }
        inner.insert(position.id, position);
        Ok(())
    }

    pub async fn contains(&self, id: PositionId) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    pub async fn get(&self, id: PositionId) -> Result<Position, EngineError> {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("position", id))
    }

    /// Mutate a position in place. `f` decides whether the change is valid;
    /// on error nothing is written.
    pub async fn update<T>(
        &self,
        id: PositionId,
        f: impl FnOnce(&mut Position) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut inner = self.inner.write().await;
        let position = inner
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("position", id))?;
        let mut draft = position.clone();
        let out = f(&mut draft)?;
        *position = draft;
        Ok(out)
    }

    /// Positions of an owner, most recent first.
    pub async fn for_owner(&self, owner: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .inner
            .read()
            .await
            .values()
            .filter(|p| p.owner.as_deref() == Some(owner))
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        positions
    }

    /// Approved, unpaid positions of `group` on a fixture.
    pub async fn settleable(&self, fixture_id: FixtureId, group: GroupId) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .inner
            .read()
            .await
            .values()
            .filter(|p| {
                p.fixture_id == fixture_id
                    && p.group == group
                    && p.status == PositionStatus::Approved
                    && !p.paid
            })
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        positions
    }

    /// Approved quantity on one outcome of a fixture, across all groups.
    pub async fn approved_quantity(&self, fixture_id: FixtureId, outcome: Outcome) -> u32 {
        self.inner
            .read()
            .await
            .values()
            .filter(|p| {
                p.fixture_id == fixture_id
                    && p.outcome == outcome
                    && p.status == PositionStatus::Approved
            })
            .map(|p| p.quantity)
            .sum()
    }

    pub async fn all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.inner.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        positions
    }

    pub async fn restore(&self, positions: Vec<Position>) {
        let mut inner = self.inner.write().await;
        inner.clear();
        for position in positions {
            inner.insert(position.id, position);
        }
    }
}
