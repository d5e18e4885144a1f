//! HTTP publisher for cross-group auction messages.
//!
//! Posts each message as JSON to the broker's publisher endpoint with a
//! bearer token. A 409 from the receiving side means the message was
//! already applied and counts as delivered.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

use super::AuctionTransport;
use crate::types::AuctionMessage;

pub struct HttpBroker {
    client: Client,
    url: String,
    token: SecretString,
}

impl HttpBroker {
    pub fn new(url: String, token: SecretString, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build broker HTTP client")?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl AuctionTransport for HttpBroker {
    async fn send(&self, message: &AuctionMessage) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(self.token.expose_secret())
            .json(message)
            .send()
            .await
            .with_context(|| format!("Broker unreachable at {}", self.url))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            debug!(kind = message.kind(), %status, "Auction message published");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Broker rejected {} message ({status}): {body}", message.kind())
    }

    fn name(&self) -> &str {
        "http-broker"
    }
}

/// Transport used when the broker is disabled: messages are only logged.
pub struct DisabledBroker;

#[async_trait]
impl AuctionTransport for DisabledBroker {
    async fn send(&self, message: &AuctionMessage) -> Result<()> {
        debug!(kind = message.kind(), "Broker disabled, auction message not published");
        Ok(())
    }

    fn name(&self) -> &str {
        "disabled"
    }
}
