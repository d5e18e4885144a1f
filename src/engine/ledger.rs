//! Inventory ledger: per-fixture bet counters.
//!
//! Each fixture row sits behind its own async mutex. Every counter
//! transition is a read-modify-write performed while that row is locked,
//! so operations on one fixture never interleave and operations on
//! different fixtures never wait on each other. Callers that need several
//! rows go through [`InventoryLedger::lock_many`], which acquires them in
//! ascending fixture id order.
//!
//! Guards may be held across awaits (settlement holds its row while it
//! calls the wallet). Lock order is always rows first, then books.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::types::{EngineError, FixtureId, FixtureInventory, Outcome};

pub type InventoryGuard = OwnedMutexGuard<FixtureInventory>;

// ---------------------------------------------------------------------------
// Row operations
// ---------------------------------------------------------------------------

impl FixtureInventory {
    pub fn open(fixture_id: FixtureId, capacity: u32) -> Self {
        Self {
            fixture_id,
            capacity,
            remaining: capacity,
            reserved_home: 0,
            reserved_away: 0,
            reserved_draw: 0,
        }
    }

    pub fn reserved(&self, outcome: Outcome) -> u32 {
        match outcome {
            Outcome::Home => self.reserved_home,
            Outcome::Away => self.reserved_away,
            Outcome::Draw => self.reserved_draw,
        }
    }

    fn reserved_mut(&mut self, outcome: Outcome) -> &mut u32 {
        match outcome {
            Outcome::Home => &mut self.reserved_home,
            Outcome::Away => &mut self.reserved_away,
            Outcome::Draw => &mut self.reserved_draw,
        }
    }

    pub fn total_reserved(&self) -> u32 {
        self.reserved_home + self.reserved_away + self.reserved_draw
    }

    /// Fail with `CapacityExceeded` unless `qty` units remain.
    pub fn ensure_remaining(&self, qty: u32) -> Result<(), EngineError> {
        if qty > self.remaining {
            return Err(EngineError::CapacityExceeded {
                fixture_id: self.fixture_id,
                pool: "remaining".to_string(),
                requested: qty,
                available: self.remaining,
            });
        }
        Ok(())
    }

    /// Fail with `CapacityExceeded` unless `qty` reserved units of `outcome` exist.
    pub fn ensure_reserved(&self, outcome: Outcome, qty: u32) -> Result<(), EngineError> {
        let available = self.reserved(outcome);
        if qty > available {
            return Err(EngineError::CapacityExceeded {
                fixture_id: self.fixture_id,
                pool: format!("reserved {outcome}"),
                requested: qty,
                available,
            });
        }
        Ok(())
    }

    /// Take `qty` units out of the general pool.
    pub fn reserve(&mut self, qty: u32) -> Result<(), EngineError> {
        ensure_positive(qty)?;
        self.ensure_remaining(qty)?;
        self.remaining -= qty;
        Ok(())
    }

    /// Return `qty` units to the general pool.
    pub fn release(&mut self, qty: u32) -> Result<(), EngineError> {
        ensure_positive(qty)?;
        let restored = self.remaining.checked_add(qty).filter(|r| *r <= self.capacity);
        match restored {
            Some(remaining) => {
                self.remaining = remaining;
                Ok(())
            }
            None => Err(EngineError::Conflict(format!(
                "release of {qty} would exceed capacity {} on fixture {}",
                self.capacity, self.fixture_id
            ))),
        }
    }

    /// Apply a signed delta to a reserved counter. Returns the new value.
    pub fn adjust_reserved(&mut self, outcome: Outcome, delta: i64) -> Result<u32, EngineError> {
        let current = self.reserved(outcome);
        let next = i64::from(current) + delta;
        if next < 0 {
            return Err(EngineError::CapacityExceeded {
                fixture_id: self.fixture_id,
                pool: format!("reserved {outcome}"),
                requested: delta.unsigned_abs().min(u64::from(u32::MAX)) as u32,
                available: current,
            });
        }
        let next = u32::try_from(next)
            .map_err(|_| EngineError::Invalid(format!("reserved {outcome} overflow")))?;
        *self.reserved_mut(outcome) = next;
        Ok(next)
    }
}

fn ensure_positive(qty: u32) -> Result<(), EngineError> {
    if qty == 0 {
        return Err(EngineError::Invalid("quantity must be positive".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Owner of every fixture's inventory counters.
pub struct InventoryLedger {
    rows: RwLock<HashMap<FixtureId, Arc<Mutex<FixtureInventory>>>>,
    bet_limit: u32,
}

/// Several row guards held together, acquired in ascending id order.
pub struct FixtureLocks {
    guards: Vec<InventoryGuard>,
}

impl FixtureLocks {
    pub fn get(&self, fixture_id: FixtureId) -> Result<&FixtureInventory, EngineError> {
        self.guards
            .iter()
            .map(|g| &**g)
            .find(|row| row.fixture_id == fixture_id)
            .ok_or_else(|| EngineError::not_found("fixture lock", fixture_id))
    }

    pub fn get_mut(&mut self, fixture_id: FixtureId) -> Result<&mut FixtureInventory, EngineError> {
        self.guards
            .iter_mut()
            .map(|g| &mut **g)
            .find(|row| row.fixture_id == fixture_id)
            .ok_or_else(|| EngineError::not_found("fixture lock", fixture_id))
    }
}

impl InventoryLedger {
    pub fn new(bet_limit: u32) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            bet_limit,
        }
    }

    /// Create the row for a fixture at full inventory. Existing rows are
    /// left untouched. Returns whether a row was created.
    pub async fn open(&self, fixture_id: FixtureId) -> bool {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&fixture_id) {
            return false;
        }
        rows.insert(
            fixture_id,
            Arc::new(Mutex::new(FixtureInventory::open(fixture_id, self.bet_limit))),
        );
        info!(fixture_id, capacity = self.bet_limit, "Inventory row opened");
        true
    }

    /// Replace all rows (snapshot restore).
    pub async fn restore(&self, inventories: Vec<FixtureInventory>) {
        let mut rows = self.rows.write().await;
        rows.clear();
        for inventory in inventories {
            rows.insert(inventory.fixture_id, Arc::new(Mutex::new(inventory)));
        }
    }

    pub async fn contains(&self, fixture_id: FixtureId) -> bool {
        self.rows.read().await.contains_key(&fixture_id)
    }

    async fn row(&self, fixture_id: FixtureId) -> Result<Arc<Mutex<FixtureInventory>>, EngineError> {
        self.rows
            .read()
            .await
            .get(&fixture_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("fixture", fixture_id))
    }

    /// Lock a single fixture row.
    pub async fn lock(&self, fixture_id: FixtureId) -> Result<InventoryGuard, EngineError> {
        Ok(self.row(fixture_id).await?.lock_owned().await)
    }

    /// Lock several fixture rows in ascending id order. Duplicates are
    /// locked once.
    pub async fn lock_many(&self, fixture_ids: &[FixtureId]) -> Result<FixtureLocks, EngineError> {
        let mut ids = fixture_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        // Resolve every row before taking any lock so a missing fixture
        // fails without holding the others.
        let mut rows = Vec::with_capacity(ids.len());
        for id in &ids {
            rows.push(self.row(*id).await?);
        }

        let mut guards = Vec::with_capacity(rows.len());
        for row in rows {
            guards.push(row.lock_owned().await);
        }
        Ok(FixtureLocks { guards })
    }

    /// Current counters of a fixture.
    pub async fn inventory(&self, fixture_id: FixtureId) -> Result<FixtureInventory, EngineError> {
        Ok(*self.lock(fixture_id).await?)
    }

    /// Counters of every fixture, ordered by id.
    pub async fn all(&self) -> Vec<FixtureInventory> {
        let rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(*row.lock().await);
        }
        out.sort_by_key(|row| row.fixture_id);
        out
    }

    /// Take `qty` units of the general pool for `outcome`.
    pub async fn reserve(
        &self,
        fixture_id: FixtureId,
        outcome: Outcome,
        qty: u32,
    ) -> Result<FixtureInventory, EngineError> {
        let mut row = self.lock(fixture_id).await?;
        row.reserve(qty)?;
        debug!(fixture_id, %outcome, qty, remaining = row.remaining, "Reserved");
        Ok(*row)
    }

    /// Give `qty` units back to the general pool.
    pub async fn release(
        &self,
        fixture_id: FixtureId,
        outcome: Outcome,
        qty: u32,
    ) -> Result<FixtureInventory, EngineError> {
        let mut row = self.lock(fixture_id).await?;
        row.release(qty)?;
        debug!(fixture_id, %outcome, qty, remaining = row.remaining, "Released");
        Ok(*row)
    }

    /// Apply a signed delta to the reserved counter of `outcome`.
    pub async fn adjust_reserved(
        &self,
        fixture_id: FixtureId,
        outcome: Outcome,
        delta: i64,
    ) -> Result<FixtureInventory, EngineError> {
        let mut row = self.lock(fixture_id).await?;
        let reserved = row.adjust_reserved(outcome, delta)?;
        debug!(fixture_id, %outcome, delta, reserved, "Reserved adjusted");
        Ok(*row)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
