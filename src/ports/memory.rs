//! In-memory collaborators.
//!
//! Used by the binary when no external service is configured and by the
//! tests. All state lives behind async locks and is fully inspectable.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{AuctionTransport, FixtureStore, Wallet, WalletError};
use crate::types::{AuctionMessage, Fixture, FixtureId};

// ---------------------------------------------------------------------------
// Fixture store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryFixtureStore {
    fixtures: RwLock<HashMap<FixtureId, Fixture>>,
}

impl MemoryFixtureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FixtureStore for MemoryFixtureStore {
    async fn get_fixture(&self, id: FixtureId) -> Result<Option<Fixture>> {
        Ok(self.fixtures.read().await.get(&id).cloned())
    }

    async fn upsert_fixture(&self, fixture: Fixture) -> Result<()> {
        self.fixtures.write().await.insert(fixture.id, fixture);
        Ok(())
    }

    async fn list_fixtures(&self) -> Result<Vec<Fixture>> {
        let mut fixtures: Vec<Fixture> = self.fixtures.read().await.values().cloned().collect();
        fixtures.sort_by_key(|f| f.id);
        Ok(fixtures)
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Balances keyed by account name. Debits never overdraw.
#[derive(Default)]
pub struct MemoryWallet {
    balances: RwLock<HashMap<String, Decimal>>,
}

impl MemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_balances(balances: &[(&str, Decimal)]) -> Self {
        let wallet = Self::new();
        {
            let mut inner = wallet.balances.write().await;
            for (account, amount) in balances {
                inner.insert(account.to_string(), *amount);
            }
        }
        wallet
    }
}

#[async_trait]
impl Wallet for MemoryWallet {
    async fn credit(&self, account: &str, amount: Decimal) -> Result<(), WalletError> {
        let mut balances = self.balances.write().await;
        let balance = balances.entry(account.to_string()).or_insert(Decimal::ZERO);
        *balance += amount;
        let updated = *balance;
        debug!(account, %amount, balance = %updated, "Wallet credited");
        Ok(())
    }

    async fn debit(&self, account: &str, amount: Decimal) -> Result<(), WalletError> {
        let mut balances = self.balances.write().await;
        let balance = balances.entry(account.to_string()).or_insert(Decimal::ZERO);
        if *balance < amount {
            return Err(WalletError::InsufficientFunds {
                account: account.to_string(),
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        let updated = *balance;
        debug!(account, %amount, balance = %updated, "Wallet debited");
        Ok(())
    }

    async fn balance(&self, account: &str) -> Result<Decimal, WalletError> {
        Ok(self
            .balances
            .read()
            .await
            .get(account)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Collects published messages so another engine can be fed with them.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<AuctionMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every message published so far.
    pub async fn drain(&self) -> Vec<AuctionMessage> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl AuctionTransport for MemoryTransport {
    async fn send(&self, message: &AuctionMessage) -> Result<()> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
