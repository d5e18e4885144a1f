//! External collaborators of the engine.
//!
//! Defines the traits the engine talks through and provides in-process
//! implementations:
//! - `memory`: fixture store, wallet and transport held in memory
//! - `broker`: HTTP publisher for cross-group auction messages
//! - `notify`: notification sink that writes to the log

pub mod broker;
pub mod memory;
pub mod notify;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[cfg(test)]
use mockall::automock;

use crate::types::{AuctionMessage, Fixture, FixtureId, Position};

/// Source of fixture metadata, results and odds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FixtureStore: Send + Sync {
    async fn get_fixture(&self, id: FixtureId) -> Result<Option<Fixture>>;

    /// Insert or replace a fixture.
    async fn upsert_fixture(&self, fixture: Fixture) -> Result<()>;

    async fn list_fixtures(&self) -> Result<Vec<Fixture>>;
}

/// Failure of a wallet call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WalletError {
    #[error("Insufficient balance in {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("Wallet unavailable: {0}")]
    Unavailable(String),
}

/// Balance ledger of users and groups.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn credit(&self, account: &str, amount: Decimal) -> Result<(), WalletError>;

    async fn debit(&self, account: &str, amount: Decimal) -> Result<(), WalletError>;

    async fn balance(&self, account: &str) -> Result<Decimal, WalletError>;
}

/// Push channel for an owner's current position list. Best effort.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, owner: &str, positions: &[Position]) -> Result<()>;
}

/// Delivery of auction events to the other trading groups.
/// At-least-once, unordered.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuctionTransport: Send + Sync {
    async fn send(&self, message: &AuctionMessage) -> Result<()>;

    /// Transport name for logging.
    fn name(&self) -> &str;
}

impl From<WalletError> for crate::types::EngineError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::InsufficientFunds {
                account,
                needed,
                available,
            } => crate::types::EngineError::InsufficientFunds {
                account,
                needed,
                available,
            },
            WalletError::Unavailable(reason) => {
                crate::types::EngineError::TransientDependency(format!("wallet: {reason}"))
            }
        }
    }
}
