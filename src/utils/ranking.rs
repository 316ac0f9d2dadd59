//! Top-holder ranking sources: Chainbase (keyed), Ethplorer (free key, mainnet) and a fallback chain

use alloy_primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::SourceError;
use crate::utils::sources::{HolderRankingSource, HolderRow};

const CHAINBASE_URL: &str = "https://api.chainbase.online/v1/token/top-holders";
const ETHPLORER_URL: &str = "https://api.ethplorer.io/getTopTokenHolders";
/// Ethplorer's free key caps the page size
const ETHPLORER_MAX_LIMIT: usize = 100;

fn http_client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn status_error(source: &str, status: reqwest::StatusCode) -> SourceError {
    if status.as_u16() == 429 {
        SourceError::QuotaExhausted(format!("{} quota exhausted (429)", source))
    } else if status.is_server_error() {
        SourceError::Transient(format!("{} HTTP {}", source, status))
    } else {
        SourceError::Malformed(format!("{} HTTP {}", source, status))
    }
}

/// Balance fields arrive as strings or numbers, sometimes in scientific notation
fn lenient_decimal(value: Option<&Value>) -> Decimal {
    let text = match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Decimal::ZERO,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .unwrap_or(Decimal::ZERO)
}

fn rows_from(items: &[Value], address_keys: &[&str], amount_keys: &[&str]) -> Vec<HolderRow> {
    items
        .iter()
        .filter_map(|item| {
            let address = address_keys
                .iter()
                .find_map(|k| item.get(*k).and_then(Value::as_str))?;
            let amount = lenient_decimal(amount_keys.iter().find_map(|k| item.get(*k)));
            Some(HolderRow {
                address: address.to_string(),
                amount,
            })
        })
        .collect()
}

/// Chainbase top-holders API
pub struct ChainbaseRanking {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chain_id: u64,
}

impl ChainbaseRanking {
    pub fn new(api_key: &str, chain_id: u64, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: CHAINBASE_URL.to_string(),
            api_key: api_key.to_string(),
            chain_id,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }
}

#[async_trait]
impl HolderRankingSource for ChainbaseRanking {
    async fn query(&self, token: &Address, limit: usize) -> Result<Vec<HolderRow>, SourceError> {
        let response = self
            .client
            .get(&self.base_url)
            .header("x-api-key", &self.api_key)
            .query(&[
                ("chain_id", self.chain_id.to_string()),
                ("contract_address", format!("{:#x}", token)),
                ("page", "1".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("chainbase", status));
        }

        let body: Value = response.json().await?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::Malformed("chainbase: missing data".to_string()))?;
        Ok(rows_from(data, &["wallet_address", "address"], &["amount", "original_amount"]))
    }

    fn name(&self) -> String {
        "chainbase".to_string()
    }
}

/// Ethplorer top-holders API (Ethereum mainnet only)
pub struct EthplorerRanking {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EthplorerRanking {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: ETHPLORER_URL.to_string(),
            api_key: "freekey".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }
}

#[async_trait]
impl HolderRankingSource for EthplorerRanking {
    async fn query(&self, token: &Address, limit: usize) -> Result<Vec<HolderRow>, SourceError> {
        let url = format!("{}/{:#x}", self.base_url.trim_end_matches('/'), token);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("apiKey", self.api_key.clone()),
                ("limit", limit.min(ETHPLORER_MAX_LIMIT).to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("ethplorer", status));
        }

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error") {
            return Err(SourceError::Malformed(format!("ethplorer: {}", error)));
        }
        let holders = body
            .get("holders")
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::Malformed("ethplorer: missing holders".to_string()))?;
        Ok(rows_from(holders, &["address"], &["balance"]))
    }

    fn name(&self) -> String {
        "ethplorer".to_string()
    }
}

/// Tries each source in order and returns the first non-empty answer
pub struct FallbackRanking {
    sources: Vec<Arc<dyn HolderRankingSource>>,
}

impl FallbackRanking {
    pub fn new(sources: Vec<Arc<dyn HolderRankingSource>>) -> Self {
        let names: Vec<String> = sources.iter().map(|s| s.name()).collect();
        info!(target: "RANKING", "Holder ranking sources: {}", names.join(" -> "));
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl HolderRankingSource for FallbackRanking {
    async fn query(&self, token: &Address, limit: usize) -> Result<Vec<HolderRow>, SourceError> {
        let mut quota_hit = false;
        let mut failures = Vec::new();

        for source in &self.sources {
            match source.query(token, limit).await {
                Ok(rows) if !rows.is_empty() => return Ok(rows),
                Ok(_) => {
                    warn!(target: "RANKING", "{} returned no holders", source.name());
                    failures.push(format!("{}: empty", source.name()));
                }
                Err(e) => {
                    warn!(target: "RANKING", "{} failed: {}", source.name(), e);
                    quota_hit |= e.is_quota();
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        let detail = if failures.is_empty() {
            "no ranking source configured".to_string()
        } else {
            failures.join("; ")
        };
        if quota_hit {
            Err(SourceError::QuotaExhausted(detail))
        } else {
            Err(SourceError::Transient(detail))
        }
    }

    fn name(&self) -> String {
        self.sources
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join("+")
    }
}
