//! Contracts of the external collaborators the pipeline consumes.
//!
//! Concrete adapters live next door: [`crate::utils::rpc`] (chain logs, code probe),
//! [`crate::utils::ranking`] (top holders), [`crate::utils::pricing`] and
//! [`crate::utils::alerts`] (notifications). Tests substitute fakes or mocks.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// One row of a top-holder ranking, in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderRow {
    pub address: String,
    pub amount: Decimal,
}

/// A log as returned by `eth_getLogs`, still in wire form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    pub removed: bool,
}

/// Current token price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: Decimal,
    pub as_of: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HolderRankingSource: Send + Sync {
    /// Top `limit` holders of `token`, largest first.
    async fn query(&self, token: &Address, limit: usize) -> Result<Vec<HolderRow>, SourceError>;

    /// Short name for logs.
    fn name(&self) -> String;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainLogSource: Send + Sync {
    /// Latest block number seen by the provider.
    async fn chain_head(&self) -> Result<u64, SourceError>;

    /// Logs emitted by `token` with `topic0 == topic` in `[from_block, to_block]`.
    async fn poll_logs(
        &self,
        token: &Address,
        topic: &B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SourceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractCodeProbe: Send + Sync {
    async fn is_contract(&self, address: &Address) -> Result<bool, SourceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PricingSource: Send + Sync {
    async fn get_price(&self, token: &Address) -> Result<PriceQuote, SourceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), SourceError>;
}
