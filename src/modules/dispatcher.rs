//! Alert Dispatcher - formats alerts and delivers them with bounded retry
//!
//! Delivery is best effort: after `max_attempts` failures the alert is dropped and logged.

use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::modules::enricher::AlertRecord;
use crate::error::SourceError;
use crate::utils::address::{checksum, shorten_address};
use crate::utils::alerts::escape_markdown;
use crate::utils::backoff::{Backoff, BackoffPolicy};
use crate::utils::sources::NotificationSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Dropped { attempts: u32 },
    /// Shutdown arrived while waiting to retry
    Cancelled,
}

pub struct AlertDispatcher {
    sink: Arc<dyn NotificationSink>,
    policy: BackoffPolicy,
    max_attempts: u32,
    explorer: String,
    shutdown: watch::Receiver<bool>,
}

impl AlertDispatcher {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        policy: BackoffPolicy,
        max_attempts: u32,
        explorer: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sink,
            policy,
            max_attempts: max_attempts.max(1),
            explorer: explorer.into(),
            shutdown,
        }
    }

    pub fn format(&self, record: &AlertRecord) -> String {
        format_alert(record, &self.explorer)
    }

    pub async fn dispatch(&self, record: &AlertRecord) -> DispatchOutcome {
        let message = self.format(record);
        let mut backoff = Backoff::new(self.policy);
        let mut shutdown = self.shutdown.clone();

        for attempt in 1..=self.max_attempts {
            let err = match self.sink.send(&message).await {
                Ok(()) => return DispatchOutcome::Delivered { attempts: attempt },
                Err(e) => e,
            };
            // The sink refused the message itself; resending the same text cannot help
            if matches!(err, SourceError::Malformed(_)) {
                error!(
                    target: "DISPATCH",
                    "Dropping {} alert for tx {}, rejected by sink: {}",
                    record.direction,
                    record.event.tx_hash,
                    err
                );
                return DispatchOutcome::Dropped { attempts: attempt };
            }
            if attempt == self.max_attempts {
                error!(
                    target: "DISPATCH",
                    "Dropping {} alert for tx {} after {} attempts: {}",
                    record.direction,
                    record.event.tx_hash,
                    attempt,
                    err
                );
                return DispatchOutcome::Dropped { attempts: attempt };
            }

            let delay = backoff.next_delay();
            warn!(
                target: "DISPATCH",
                "Delivery attempt {}/{} failed: {} - retrying in {:?}",
                attempt,
                self.max_attempts,
                err,
                delay
            );
            if *shutdown.borrow() {
                return DispatchOutcome::Cancelled;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return DispatchOutcome::Cancelled,
            }
        }

        DispatchOutcome::Dropped {
            attempts: self.max_attempts,
        }
    }
}

/// Telegram-flavoured Markdown rendering of an alert
pub fn format_alert(record: &AlertRecord, explorer: &str) -> String {
    let tx = format!("{:#x}", record.event.tx_hash);
    format!(
        "🐋 *WHALE {}* {}\n\n\
         *Whale:* #{} {}\n\
         *Address:* `{}`\n\
         *Amount:* {} {}\n\
         *Value:* ${}\n\
         *Price:* ${}\n\
         *Block:* {}\n\
         *Tx:* [{}]({}/tx/{})",
        record.direction,
        record.direction.emoji(),
        record.rank,
        escape_markdown(&record.whale_label),
        checksum(&record.whale_address),
        group_thousands(record.token_amount.round_dp_with_strategy(2, RoundingStrategy::ToZero)),
        escape_markdown(&record.symbol),
        group_thousands(record.usd_value.round_dp(2)),
        record.price.normalize(),
        record.event.block_number,
        shorten_tx(&tx),
        explorer.trim_end_matches('/'),
        tx
    )
}

fn shorten_tx(tx: &str) -> String {
    if tx.len() <= 14 {
        return tx.to_string();
    }
    format!("{}...{}", &tx[..8], &tx[tx.len() - 6..])
}

/// `1234567.5` -> `1,234,567.5`
pub fn group_thousands(value: Decimal) -> String {
    let text = value.to_string();
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}

/// Short form used in log lines
pub fn describe(record: &AlertRecord) -> String {
    format!(
        "{} #{} {} {} {} (${})",
        record.direction,
        record.rank,
        shorten_address(&record.whale_address, 4),
        record.token_amount.round_dp(2),
        record.symbol,
        record.usd_value.round_dp(2)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::matcher::Direction;
    use crate::modules::poller::TransferEvent;
    use crate::utils::sources::MockNotificationSink;
    use alloy_primitives::{Address, B256, U256};
    use chrono::Utc;
    use std::str::FromStr;
    use std::time::Duration;

    fn record() -> AlertRecord {
        AlertRecord {
            event: TransferEvent {
                tx_hash: B256::repeat_byte(0xab),
                log_index: 2,
                block_number: 19_000_000,
                from: Address::repeat_byte(0xa1),
                to: Address::repeat_byte(0x33),
                raw_amount: U256::from(1u64),
                token_address: Address::repeat_byte(0xee),
            },
            direction: Direction::Sell,
            whale_address: Address::repeat_byte(0xa1),
            whale_label: "Binance 14".to_string(),
            rank: 5,
            token_amount: Decimal::from_str("6000").unwrap(),
            symbol: "PEPE".to_string(),
            price: Decimal::from_str("2.00").unwrap(),
            usd_value: Decimal::from_str("12000").unwrap(),
            created_at: Utc::now(),
        }
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(Decimal::from(12_000)), "12,000");
        assert_eq!(group_thousands(Decimal::from_str("1234567.50").unwrap()), "1,234,567.50");
        assert_eq!(group_thousands(Decimal::from(999)), "999");
        assert_eq!(group_thousands(Decimal::from(-1_000)), "-1,000");
    }

    #[test]
    fn test_message_contents() {
        let message = format_alert(&record(), "https://etherscan.io/");
        assert!(message.contains("*WHALE SELL* 🔴"));
        assert!(message.contains("#5 Binance 14"));
        assert!(message.contains("6,000 PEPE"));
        assert!(message.contains("$12,000"));
        assert!(message.contains("*Block:* 19000000"));
        assert!(message.contains(&format!(
            "https://etherscan.io/tx/0x{}",
            "ab".repeat(32)
        )));
    }

    #[test]
    fn test_label_and_symbol_are_escaped() {
        let mut record = record();
        record.whale_label = "Binance_14".to_string();
        record.symbol = "*WOJAK_".to_string();
        let message = format_alert(&record, "https://etherscan.io");
        assert!(message.contains("*Whale:* #5 Binance\\_14\n"));
        assert!(message.contains("6,000 \\*WOJAK\\_\n"));
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_retried() {
        let mut sink = MockNotificationSink::new();
        sink.expect_send()
            .times(1)
            .returning(|_| Err(SourceError::Malformed("400 can't parse entities".into())));
        let (_tx, rx) = watch::channel(false);
        let dispatcher = AlertDispatcher::new(Arc::new(sink), fast_policy(), 5, "https://etherscan.io", rx);

        assert_eq!(
            dispatcher.dispatch(&record()).await,
            DispatchOutcome::Dropped { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_retries_then_delivers() {
        let mut sink = MockNotificationSink::new();
        let mut calls = 0;
        sink.expect_send().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(SourceError::Transient("502".into()))
            } else {
                Ok(())
            }
        });
        let (_tx, rx) = watch::channel(false);
        let dispatcher = AlertDispatcher::new(Arc::new(sink), fast_policy(), 5, "https://etherscan.io", rx);

        assert_eq!(
            dispatcher.dispatch(&record()).await,
            DispatchOutcome::Delivered { attempts: 3 }
        );
    }

    #[tokio::test]
    async fn test_drops_after_max_attempts() {
        let mut sink = MockNotificationSink::new();
        sink.expect_send()
            .times(3)
            .returning(|_| Err(SourceError::Transient("down".into())));
        let (_tx, rx) = watch::channel(false);
        let dispatcher = AlertDispatcher::new(Arc::new(sink), fast_policy(), 3, "https://etherscan.io", rx);

        assert_eq!(
            dispatcher.dispatch(&record()).await,
            DispatchOutcome::Dropped { attempts: 3 }
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_retry() {
        let mut sink = MockNotificationSink::new();
        sink.expect_send()
            .times(1)
            .returning(|_| Err(SourceError::Transient("down".into())));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let dispatcher = AlertDispatcher::new(Arc::new(sink), fast_policy(), 5, "https://etherscan.io", rx);

        assert_eq!(dispatcher.dispatch(&record()).await, DispatchOutcome::Cancelled);
    }
}
