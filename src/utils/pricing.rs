//! DefiLlama current-price lookup

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::SourceError;
use crate::utils::sources::{PriceQuote, PricingSource};

const DEFILLAMA_URL: &str = "https://coins.llama.fi/prices/current";

#[derive(Debug, Deserialize)]
struct PricesResponse {
    #[serde(default)]
    coins: HashMap<String, CoinPrice>,
}

#[derive(Debug, Deserialize)]
struct CoinPrice {
    price: f64,
    timestamp: Option<i64>,
}

pub struct DefiLlamaPricing {
    client: reqwest::Client,
    base_url: String,
    /// Chain prefix in DefiLlama coin keys, e.g. `ethereum`, `bsc`
    chain_prefix: String,
}

impl DefiLlamaPricing {
    pub fn new(chain_prefix: &str, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: DEFILLAMA_URL.to_string(),
            chain_prefix: chain_prefix.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn coin_key(&self, token: &Address) -> String {
        format!("{}:{:#x}", self.chain_prefix, token)
    }
}

/// Pick the quote for `key` out of a DefiLlama response. Keys are matched case-insensitively.
fn quote_from(body: PricesResponse, key: &str) -> Result<PriceQuote, SourceError> {
    let coin = body
        .coins
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, coin)| coin)
        .ok_or_else(|| SourceError::Malformed(format!("no price for {}", key)))?;

    // f64 Display is the shortest exact round-trip form and never uses an exponent
    let price = Decimal::from_str(&coin.price.to_string())
        .map_err(|_| SourceError::Malformed(format!("unusable price {}", coin.price)))?;
    if price <= Decimal::ZERO {
        return Err(SourceError::Malformed(format!("non-positive price {}", price)));
    }
    let as_of: DateTime<Utc> = coin
        .timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now);

    Ok(PriceQuote { price, as_of })
}

#[async_trait]
impl PricingSource for DefiLlamaPricing {
    async fn get_price(&self, token: &Address) -> Result<PriceQuote, SourceError> {
        let key = self.coin_key(token);
        let url = format!("{}/{}", self.base_url, key);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SourceError::QuotaExhausted("defillama rate limited".to_string()));
        }
        if !status.is_success() {
            return Err(SourceError::Transient(format!("defillama HTTP {}", status)));
        }

        let body: PricesResponse = response.json().await?;
        let quote = quote_from(body, &key)?;
        debug!(target: "PRICING", "💲 {} = ${} (as of {})", key, quote.price, quote.as_of);
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::utils::test_http::serve_json;
    use serde_json::json;

    fn response(json: &str) -> PricesResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_quote_from_response() {
        let body = response(
            r#"{"coins":{"ethereum:0x6982508145454Ce325dDbE47a25d4ec3d2311933":
                {"decimals":18,"symbol":"PEPE","price":0.00001234,"timestamp":1700000000,"confidence":0.99}}}"#,
        );
        let quote = quote_from(body, "ethereum:0x6982508145454ce325ddbe47a25d4ec3d2311933").unwrap();
        assert_eq!(quote.price, Decimal::from_str("0.00001234").unwrap());
        assert_eq!(quote.as_of.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_missing_coin_is_malformed() {
        let body = response(r#"{"coins":{}}"#);
        assert!(matches!(
            quote_from(body, "ethereum:0xabc"),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn test_zero_price_rejected() {
        let body = response(r#"{"coins":{"bsc:0x01":{"price":0}}}"#);
        assert!(quote_from(body, "bsc:0x01").is_err());
    }

    #[test]
    fn test_coin_key_uses_chain_prefix() {
        let pricing = DefiLlamaPricing::new("bsc", Duration::from_secs(5)).unwrap();
        assert_eq!(
            pricing.coin_key(&Address::repeat_byte(0xab)),
            format!("bsc:0x{}", "ab".repeat(20))
        );
    }

    #[tokio::test]
    async fn test_get_price() {
        let token = Address::repeat_byte(0xab);
        let mut body = json!({"coins": {}});
        body["coins"][format!("ethereum:{:#x}", token).as_str()] =
            json!({"price": 2.5, "timestamp": 1_700_000_000});
        let url = serve_json(200, body).await;
        let pricing = DefiLlamaPricing::new("ethereum", Duration::from_secs(5))
            .unwrap()
            .with_base_url(&url);

        let quote = pricing.get_price(&token).await.unwrap();
        assert_eq!(quote.price, Decimal::from_str("2.5").unwrap());
        assert_eq!(quote.as_of.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_http_errors() {
        let token = Address::repeat_byte(0xab);

        let url = serve_json(429, json!({})).await;
        let pricing = DefiLlamaPricing::new("ethereum", Duration::from_secs(5))
            .unwrap()
            .with_base_url(&url);
        assert!(pricing.get_price(&token).await.unwrap_err().is_quota());

        let url = serve_json(503, json!({})).await;
        let pricing = DefiLlamaPricing::new("ethereum", Duration::from_secs(5))
            .unwrap()
            .with_base_url(&url);
        assert!(matches!(
            pricing.get_price(&token).await,
            Err(SourceError::Transient(_))
        ));
    }
}
