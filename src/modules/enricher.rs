//! Enricher - token units, USD value and the alert threshold

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::EnrichError;
use crate::modules::matcher::Direction;
use crate::modules::poller::TransferEvent;
use crate::modules::registry::WhaleEntry;
use crate::utils::sources::{PriceQuote, PricingSource};

/// Digits a `Decimal` mantissa can always hold
const MAX_DECIMAL_DIGITS: usize = 28;

/// Token metadata resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenMetadata {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

/// A transfer that cleared the threshold, ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub event: TransferEvent,
    pub direction: Direction,
    pub whale_address: Address,
    pub whale_label: String,
    pub rank: u32,
    pub token_amount: Decimal,
    pub symbol: String,
    pub price: Decimal,
    pub usd_value: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    Alert(Box<AlertRecord>),
    BelowThreshold { usd_value: Decimal },
}

/// Scale a raw integer amount by `decimals`. Fractional digits beyond what `Decimal` can carry
/// are truncated; integer parts that do not fit are an error.
pub fn to_decimal_units(raw: U256, decimals: u8) -> Result<Decimal, EnrichError> {
    let overflow = || EnrichError::AmountOverflow {
        raw: raw.to_string(),
    };

    let digits = raw.to_string();
    let scale = decimals as usize;
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);

    let int_part = int_part.trim_start_matches('0');
    if int_part.len() > MAX_DECIMAL_DIGITS {
        return Err(overflow());
    }
    let frac_part = &frac_part[..frac_part.len().min(MAX_DECIMAL_DIGITS - int_part.len())];

    let combined = format!("{}{}", int_part, frac_part);
    let mantissa: i128 = if combined.is_empty() {
        0
    } else {
        combined.parse().map_err(|_| overflow())?
    };
    let value = Decimal::try_from_i128_with_scale(mantissa, frac_part.len() as u32)
        .map_err(|_| overflow())?;
    Ok(value.normalize())
}

pub struct Enricher {
    metadata: TokenMetadata,
    pricing: Arc<dyn PricingSource>,
    threshold: Decimal,
    price_max_age: Duration,
    cached_price: Mutex<Option<(PriceQuote, Instant)>>,
}

impl Enricher {
    pub fn new(
        metadata: TokenMetadata,
        pricing: Arc<dyn PricingSource>,
        threshold: Decimal,
        price_max_age: Duration,
    ) -> Self {
        Self {
            metadata,
            pricing,
            threshold,
            price_max_age,
            cached_price: Mutex::new(None),
        }
    }

    pub fn metadata(&self) -> &TokenMetadata {
        &self.metadata
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Value a classified transfer and apply the threshold
    pub async fn enrich(
        &self,
        event: &TransferEvent,
        direction: Direction,
        whale: &WhaleEntry,
    ) -> Result<Enrichment, EnrichError> {
        let token_amount = to_decimal_units(event.raw_amount, self.metadata.decimals)?;
        let quote = self.current_price().await?;

        let usd_value = token_amount
            .checked_mul(quote.price)
            .ok_or_else(|| EnrichError::AmountOverflow {
                raw: event.raw_amount.to_string(),
            })?;

        if usd_value < self.threshold {
            debug!(
                target: "ENRICHER",
                "{} of {} {} worth ${} is below ${}",
                direction,
                token_amount,
                self.metadata.symbol,
                usd_value.round_dp(2),
                self.threshold
            );
            return Ok(Enrichment::BelowThreshold { usd_value });
        }

        Ok(Enrichment::Alert(Box::new(AlertRecord {
            event: event.clone(),
            direction,
            whale_address: whale.address,
            whale_label: whale.label.clone(),
            rank: whale.rank,
            token_amount,
            symbol: self.metadata.symbol.clone(),
            price: quote.price,
            usd_value,
            created_at: Utc::now(),
        })))
    }

    /// Cached price while it is younger than `price_max_age`, otherwise a fresh lookup
    pub async fn current_price(&self) -> Result<PriceQuote, EnrichError> {
        let cached = self.cached_price.lock().clone();
        if let Some((quote, fetched_at)) = cached {
            if fetched_at.elapsed() < self.price_max_age {
                return Ok(quote);
            }
        }

        let quote = self
            .pricing
            .get_price(&self.metadata.address)
            .await
            .map_err(|e| {
                warn!(target: "ENRICHER", "Price lookup failed: {}", e);
                EnrichError::PriceUnavailable(e)
            })?;

        *self.cached_price.lock() = Some((quote.clone(), Instant::now()));
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::utils::sources::MockPricingSource;
    use alloy_primitives::B256;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn metadata(decimals: u8) -> TokenMetadata {
        TokenMetadata {
            address: Address::repeat_byte(0xee),
            decimals,
            symbol: "PEPE".to_string(),
        }
    }

    fn event(raw_amount: U256) -> TransferEvent {
        TransferEvent {
            tx_hash: B256::repeat_byte(1),
            log_index: 4,
            block_number: 19_000_000,
            from: Address::repeat_byte(0xa1),
            to: Address::repeat_byte(0x33),
            raw_amount,
            token_address: Address::repeat_byte(0xee),
        }
    }

    fn whale() -> WhaleEntry {
        WhaleEntry::new(Address::repeat_byte(0xa1), 5, dec("1000000")).with_label("Binance 14")
    }

    fn fixed_price(price: &'static str) -> MockPricingSource {
        let mut pricing = MockPricingSource::new();
        pricing.expect_get_price().returning(move |_| {
            Ok(PriceQuote {
                price: dec(price),
                as_of: Utc::now(),
            })
        });
        pricing
    }

    fn six_thousand_tokens() -> U256 {
        U256::from(6u64) * U256::from(10u64).pow(U256::from(21u64))
    }

    #[test]
    fn test_to_decimal_units() {
        assert_eq!(to_decimal_units(six_thousand_tokens(), 18).unwrap(), dec("6000"));
        assert_eq!(to_decimal_units(U256::from(1u64), 18).unwrap(), dec("0.000000000000000001"));
        assert_eq!(to_decimal_units(U256::from(1_500_000u64), 6).unwrap(), dec("1.5"));
        assert_eq!(to_decimal_units(U256::from(42u64), 0).unwrap(), dec("42"));
        assert_eq!(to_decimal_units(U256::ZERO, 18).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_to_decimal_units_truncates_excess_precision() {
        // 10^30 + 1 with 18 decimals: 13 integer digits, fraction cut to 15 digits
        let raw = U256::from(10u64).pow(U256::from(30u64)) + U256::from(1u64);
        assert_eq!(to_decimal_units(raw, 18).unwrap(), dec("1000000000000"));
    }

    #[test]
    fn test_to_decimal_units_overflow() {
        assert!(matches!(
            to_decimal_units(U256::MAX, 0),
            Err(EnrichError::AmountOverflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_above_threshold_alerts() {
        let enricher = Enricher::new(
            metadata(18),
            Arc::new(fixed_price("2.00")),
            dec("10000"),
            Duration::from_secs(60),
        );

        let result = enricher
            .enrich(&event(six_thousand_tokens()), Direction::Sell, &whale())
            .await
            .unwrap();
        let record = match result {
            Enrichment::Alert(record) => record,
            other => panic!("expected an alert, got {:?}", other),
        };
        assert_eq!(record.token_amount, dec("6000"));
        assert_eq!(record.usd_value, dec("12000"));
        assert_eq!(record.rank, 5);
        assert_eq!(record.whale_label, "Binance 14");
        assert_eq!(record.direction, Direction::Sell);
    }

    #[tokio::test]
    async fn test_below_threshold_drops() {
        let enricher = Enricher::new(
            metadata(18),
            Arc::new(fixed_price("2.00")),
            dec("10000"),
            Duration::from_secs(60),
        );

        let raw = U256::from(4u64) * U256::from(10u64).pow(U256::from(21u64));
        let result = enricher.enrich(&event(raw), Direction::Buy, &whale()).await.unwrap();
        assert_eq!(result, Enrichment::BelowThreshold { usd_value: dec("8000") });
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let enricher = Enricher::new(
            metadata(18),
            Arc::new(fixed_price("2")),
            dec("12000"),
            Duration::from_secs(60),
        );
        let result = enricher
            .enrich(&event(six_thousand_tokens()), Direction::Buy, &whale())
            .await
            .unwrap();
        assert!(matches!(result, Enrichment::Alert(_)));
    }

    #[tokio::test]
    async fn test_price_failure_is_not_below_threshold() {
        let mut pricing = MockPricingSource::new();
        pricing
            .expect_get_price()
            .returning(|_| Err(SourceError::Transient("503".into())));
        let enricher = Enricher::new(
            metadata(18),
            Arc::new(pricing),
            dec("10000"),
            Duration::from_secs(60),
        );

        let result = enricher
            .enrich(&event(six_thousand_tokens()), Direction::Sell, &whale())
            .await;
        assert!(matches!(result, Err(EnrichError::PriceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_price_is_cached() {
        let mut pricing = MockPricingSource::new();
        pricing.expect_get_price().times(1).returning(|_| {
            Ok(PriceQuote {
                price: Decimal::ONE,
                as_of: Utc::now(),
            })
        });
        let enricher = Enricher::new(
            metadata(18),
            Arc::new(pricing),
            dec("10000"),
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            assert_eq!(enricher.current_price().await.unwrap().price, Decimal::ONE);
        }
    }
}
