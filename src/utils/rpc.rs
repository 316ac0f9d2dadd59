//! EVM JSON-RPC client (read-only): block head, Transfer logs, contract code, token metadata

use alloy_primitives::{hex, Address, B256, U256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::modules::enricher::TokenMetadata;
use crate::utils::sources::{ChainLogSource, ContractCodeProbe, RawLog};

/// `decimals()`
const DECIMALS_SELECTOR: &str = "0x313ce567";
/// `symbol()`
const SYMBOL_SELECTOR: &str = "0x95d89b41";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC service over HTTP
pub struct EvmRpcService {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl EvmRpcService {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = url.into();
        info!(target: "RPC", "Using JSON-RPC endpoint {}", crate::config::mask_url(&url));
        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SourceError::QuotaExhausted(format!("{}: rate limited", method)));
        }
        if !status.is_success() {
            return Err(SourceError::Transient(format!("{}: HTTP {}", method, status)));
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(err) = parsed.error {
            // Provider-side limits (range too wide, too many results) clear on retry or config change
            return Err(SourceError::Transient(format!(
                "{}: rpc error {}: {}",
                method, err.code, err.message
            )));
        }
        let result = parsed
            .result
            .ok_or_else(|| SourceError::Malformed(format!("{}: empty result", method)))?;
        serde_json::from_value(result)
            .map_err(|e| SourceError::Malformed(format!("{}: {}", method, e)))
    }

    async fn eth_call(&self, to: &Address, data: &str) -> Result<Vec<u8>, SourceError> {
        let raw: String = self
            .call("eth_call", json!([{ "to": format!("{:#x}", to), "data": data }, "latest"]))
            .await?;
        hex::decode(raw.trim_start_matches("0x")).map_err(|_| SourceError::Malformed(format!("eth_call: bad hex {}", raw)))
    }

    pub async fn token_decimals(&self, token: &Address) -> Result<u8, SourceError> {
        let bytes = self.eth_call(token, DECIMALS_SELECTOR).await?;
        if bytes.len() < 32 {
            return Err(SourceError::Malformed("decimals(): short return data".to_string()));
        }
        let value = U256::from_be_slice(&bytes[..32]);
        u64::try_from(value)
            .ok()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| SourceError::Malformed(format!("decimals(): {}", value)))
    }

    pub async fn token_symbol(&self, token: &Address) -> Result<String, SourceError> {
        let bytes = self.eth_call(token, SYMBOL_SELECTOR).await?;
        decode_symbol(&bytes)
            .ok_or_else(|| SourceError::Malformed("symbol(): undecodable return data".to_string()))
    }

    /// Decimals are required; a missing symbol falls back to `TOKEN`.
    pub async fn token_metadata(&self, token: &Address) -> Result<TokenMetadata, SourceError> {
        let decimals = self.token_decimals(token).await?;
        let symbol = match self.token_symbol(token).await {
            Ok(symbol) if !symbol.is_empty() => symbol,
            Ok(_) => "TOKEN".to_string(),
            Err(e) => {
                debug!(target: "RPC", "symbol() unavailable: {}", e);
                "TOKEN".to_string()
            }
        };
        Ok(TokenMetadata {
            address: *token,
            decimals,
            symbol,
        })
    }
}

/// ABI `string` return, or a right-padded `bytes32` for older tokens
fn decode_symbol(bytes: &[u8]) -> Option<String> {
    if bytes.len() == 32 {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(32);
        return String::from_utf8(bytes[..end].to_vec()).ok();
    }
    if bytes.len() < 64 {
        return None;
    }
    let offset = word_to_usize(&bytes[..32])?;
    let len_end = offset.checked_add(32)?;
    let len = word_to_usize(bytes.get(offset..len_end)?)?;
    let data = bytes.get(len_end..len_end.checked_add(len)?)?;
    String::from_utf8(data.to_vec()).ok()
}

fn word_to_usize(word: &[u8]) -> Option<usize> {
    let value = u64::try_from(U256::from_be_slice(word)).ok()?;
    usize::try_from(value).ok()
}

fn parse_hex_u64(raw: &str) -> Result<u64, SourceError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| SourceError::Malformed(format!("not a hex quantity: {}", raw)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| SourceError::Malformed(format!("not a hex quantity: {}", raw)))
}

#[async_trait]
impl ChainLogSource for EvmRpcService {
    async fn chain_head(&self) -> Result<u64, SourceError> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&raw)
    }

    async fn poll_logs(
        &self,
        token: &Address,
        topic: &B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SourceError> {
        let filter = json!({
            "address": format!("{:#x}", token),
            "topics": [format!("{:#x}", topic)],
            "fromBlock": format!("{:#x}", from_block),
            "toBlock": format!("{:#x}", to_block),
        });
        self.call("eth_getLogs", json!([filter])).await
    }
}

#[async_trait]
impl ContractCodeProbe for EvmRpcService {
    async fn is_contract(&self, address: &Address) -> Result<bool, SourceError> {
        let code: String = self
            .call("eth_getCode", json!([format!("{:#x}", address), "latest"]))
            .await?;
        let code = code.trim_start_matches("0x");
        Ok(!code.is_empty() && code.chars().any(|c| c != '0'))
    }
}
