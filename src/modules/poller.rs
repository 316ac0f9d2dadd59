//! Log Poller - confirmed ERC20 Transfer logs, in order, with an all-or-nothing cursor

use alloy_primitives::{b256, Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, SourceError};
use crate::modules::dedup::ProcessedKey;
use crate::utils::address::parse_address;
use crate::utils::alerts::escape_markdown;
use crate::utils::backoff::{Backoff, BackoffPolicy};
use crate::utils::sources::{ChainLogSource, NotificationSink, RawLog};
use crate::utils::{MetricsService, StateStore};

/// Consecutive fetch failures before the stall notice goes out
pub const STALL_NOTICE_AFTER: u32 = 5;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// A decoded ERC20 transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub from: Address,
    pub to: Address,
    pub raw_amount: U256,
    pub token_address: Address,
}

impl TransferEvent {
    pub fn key(&self) -> ProcessedKey {
        ProcessedKey::new(self.tx_hash, self.log_index)
    }

    /// Stream position, used for ordering
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Decode a raw `eth_getLogs` entry into a transfer event
pub fn decode_transfer(raw: &RawLog) -> Result<TransferEvent, DecodeError> {
    if raw.removed {
        return Err(DecodeError::Removed);
    }
    // ERC721 Transfer shares topic0 but indexes the token id as a 4th topic
    if raw.topics.len() != 3 {
        return Err(DecodeError::TopicCount(raw.topics.len()));
    }

    let topic0 = parse_word("topics[0]", &raw.topics[0])?;
    if topic0 != TRANSFER_TOPIC {
        return Err(DecodeError::NotTransfer(raw.topics[0].clone()));
    }
    let from = Address::from_word(parse_word("topics[1]", &raw.topics[1])?);
    let to = Address::from_word(parse_word("topics[2]", &raw.topics[2])?);

    let raw_amount = parse_amount(&raw.data)?;

    let tx_hash_raw = raw
        .transaction_hash
        .as_deref()
        .ok_or(DecodeError::MissingField("transactionHash"))?;
    let tx_hash = parse_word("transactionHash", tx_hash_raw)?;

    let block_number = parse_quantity(
        "blockNumber",
        raw.block_number
            .as_deref()
            .ok_or(DecodeError::MissingField("blockNumber"))?,
    )?;
    let log_index = parse_quantity(
        "logIndex",
        raw.log_index
            .as_deref()
            .ok_or(DecodeError::MissingField("logIndex"))?,
    )?;

    let token_address = parse_address(&raw.address).ok_or_else(|| DecodeError::InvalidField {
        field: "address",
        value: raw.address.clone(),
    })?;

    Ok(TransferEvent {
        tx_hash,
        log_index,
        block_number,
        from,
        to,
        raw_amount,
        token_address,
    })
}

fn parse_word(field: &'static str, value: &str) -> Result<B256, DecodeError> {
    let invalid = || DecodeError::InvalidField {
        field,
        value: value.to_string(),
    };
    let hex = value.strip_prefix("0x").ok_or_else(invalid)?;
    if hex.len() != 64 {
        return Err(invalid());
    }
    B256::from_str(hex).map_err(|_| invalid())
}

fn parse_quantity(field: &'static str, value: &str) -> Result<u64, DecodeError> {
    let invalid = || DecodeError::InvalidField {
        field,
        value: value.to_string(),
    };
    let hex = value.strip_prefix("0x").ok_or_else(invalid)?;
    u64::from_str_radix(hex, 16).map_err(|_| invalid())
}

fn parse_amount(data: &str) -> Result<U256, DecodeError> {
    let invalid = || DecodeError::InvalidField {
        field: "data",
        value: data.to_string(),
    };
    let hex = data.strip_prefix("0x").ok_or_else(invalid)?;
    // uint256 is exactly one 32-byte word
    if hex.len() != 64 {
        return Err(invalid());
    }
    U256::from_str_radix(hex, 16).map_err(|_| invalid())
}

/// Last block whose logs have been fully handed downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCursor {
    pub last_confirmed_block: u64,
}

impl FetchCursor {
    pub fn new(last_confirmed_block: u64) -> Self {
        Self {
            last_confirmed_block,
        }
    }

    /// Next inclusive range to fetch, capped at `max_range` blocks. `None` when nothing new
    /// is confirmed.
    pub fn next_range(&self, chain_head: u64, confirmation_depth: u64, max_range: u64) -> Option<(u64, u64)> {
        let safe_head = chain_head.checked_sub(confirmation_depth)?;
        let from = self.last_confirmed_block.checked_add(1)?;
        if from > safe_head {
            return None;
        }
        let to = safe_head.min(from.saturating_add(max_range.max(1) - 1));
        Some((from, to))
    }

    fn advance_to(&mut self, block: u64) {
        if block > self.last_confirmed_block {
            self.last_confirmed_block = block;
        }
    }
}

/// How downstream finished an event. Only `Cancelled` stops the current range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Completed,
    Cancelled,
}

/// Downstream stage fed by the poller, one event at a time, in stream order
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: TransferEvent) -> HandleResult;
}

/// Poller settings
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub token: Address,
    pub poll_interval: Duration,
    pub confirmation_depth: u64,
    pub max_block_range: u64,
    pub backoff: BackoffPolicy,
}

/// Result of one poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTick {
    /// Nothing confirmed past the cursor
    Idle { chain_head: u64 },
    /// `[from, to]` fully handed downstream, cursor now at `to`
    Processed {
        from: u64,
        to: u64,
        events: usize,
        decode_errors: usize,
        caught_up: bool,
    },
    /// Downstream cancelled mid-range; cursor moved past fully handled blocks only
    Interrupted { from: u64, to: u64 },
}

/// Log Poller module
pub struct LogPoller {
    settings: PollerSettings,
    source: Arc<dyn ChainLogSource>,
    handler: Arc<dyn EventHandler>,
    store: Option<Arc<StateStore>>,
    metrics: Option<Arc<MetricsService>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    cursor: FetchCursor,
    backoff: Backoff,
    stall_notified: bool,
}

impl LogPoller {
    pub fn new(
        settings: PollerSettings,
        source: Arc<dyn ChainLogSource>,
        handler: Arc<dyn EventHandler>,
        cursor: FetchCursor,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff);
        Self {
            settings,
            source,
            handler,
            store: None,
            metrics: None,
            notifier: None,
            cursor,
            backoff,
            stall_notified: false,
        }
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn cursor(&self) -> FetchCursor {
        self.cursor
    }

    /// One iteration: find the confirmed range, fetch, decode, emit in order, advance.
    pub async fn poll_once(&mut self) -> Result<PollTick, SourceError> {
        let started = Instant::now();
        let chain_head = self.source.chain_head().await;
        self.observe_latency("eth_blockNumber", started);
        let chain_head = chain_head?;

        if let Some(metrics) = &self.metrics {
            metrics.chain_head.set(chain_head as i64);
        }

        if chain_head < self.cursor.last_confirmed_block {
            warn!(
                target: "POLLER",
                "Chain head {} is behind cursor {} - provider lagging or reorg, waiting",
                chain_head,
                self.cursor.last_confirmed_block
            );
            return Ok(PollTick::Idle { chain_head });
        }

        let Some((from, to)) = self.cursor.next_range(
            chain_head,
            self.settings.confirmation_depth,
            self.settings.max_block_range,
        ) else {
            return Ok(PollTick::Idle { chain_head });
        };

        let started = Instant::now();
        let logs = self
            .source
            .poll_logs(&self.settings.token, &TRANSFER_TOPIC, from, to)
            .await;
        self.observe_latency("eth_getLogs", started);
        let logs = logs?;

        if let Some(metrics) = &self.metrics {
            metrics.logs_fetched.inc_by(logs.len() as u64);
        }

        let mut events = Vec::with_capacity(logs.len());
        let mut decode_errors = 0;
        for raw in &logs {
            match decode_transfer(raw) {
                Ok(event) if event.block_number < from || event.block_number > to => {
                    warn!(
                        target: "POLLER",
                        "Dropping log outside requested range [{}, {}]: block {}",
                        from,
                        to,
                        event.block_number
                    );
                    decode_errors += 1;
                }
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        target: "POLLER",
                        "Dropping malformed log (tx {:?}): {}",
                        raw.transaction_hash,
                        e
                    );
                    decode_errors += 1;
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.decode_errors.inc_by(decode_errors as u64);
        }

        // Providers usually return logs in order, but nothing guarantees it
        events.sort_by_key(TransferEvent::position);
        let count = events.len();

        for event in events {
            let block = event.block_number;
            if self.handler.handle(event).await == HandleResult::Cancelled {
                // Blocks before this one were handed over in full
                if block > from {
                    self.cursor.advance_to(block - 1);
                    self.persist_cursor();
                }
                info!(
                    target: "POLLER",
                    "Range [{}, {}] interrupted at block {}, cursor at {}",
                    from,
                    to,
                    block,
                    self.cursor.last_confirmed_block
                );
                return Ok(PollTick::Interrupted { from, to });
            }
        }

        self.cursor.advance_to(to);
        self.persist_cursor();

        let caught_up = to + self.settings.confirmation_depth >= chain_head;
        debug!(
            target: "POLLER",
            "Processed blocks [{}, {}]: {} transfers, {} dropped",
            from,
            to,
            count,
            decode_errors
        );

        Ok(PollTick::Processed {
            from,
            to,
            events: count,
            decode_errors,
            caught_up,
        })
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "POLLER",
            "📡 Polling Transfer logs from block {} (confirmations: {}, interval: {}s)",
            self.cursor.last_confirmed_block + 1,
            self.settings.confirmation_depth,
            self.settings.poll_interval.as_secs()
        );

        while !*shutdown.borrow() {
            let wait = match self.poll_once().await {
                Ok(tick) => {
                    self.record_success();
                    match tick {
                        PollTick::Processed { caught_up: false, .. } => Duration::ZERO,
                        PollTick::Interrupted { .. } => break,
                        _ => self.settings.poll_interval,
                    }
                }
                Err(e) => self.record_failure(&e).await,
            };

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            target: "POLLER",
            "Poller stopped at block {}",
            self.cursor.last_confirmed_block
        );
    }

    /// Count a failed tick and return the backoff delay. Sends one stall notice per streak
    /// once [`STALL_NOTICE_AFTER`] failures pile up.
    pub async fn record_failure(&mut self, err: &SourceError) -> Duration {
        let delay = self.backoff.next_delay();
        let failures = self.backoff.failures();
        if let Some(metrics) = &self.metrics {
            metrics.poll_errors.inc();
        }
        error!(
            target: "POLLER",
            "Log fetch failed ({} in a row): {} - retrying in {:?}",
            failures,
            err,
            delay
        );

        if failures >= STALL_NOTICE_AFTER && !self.stall_notified {
            self.stall_notified = true;
            if let Some(notifier) = &self.notifier {
                let message = format!(
                    "🚨 *Log polling stalled*\n\n{} failures in a row, last: {}\nCursor held at block {}.",
                    failures,
                    escape_markdown(&err.to_string()),
                    self.cursor.last_confirmed_block
                );
                if let Err(e) = notifier.send(&message).await {
                    warn!(target: "POLLER", "Stall notice not delivered: {}", e);
                }
            }
        }
        delay
    }

    /// A successful tick ends the failure streak
    pub fn record_success(&mut self) {
        let failures = self.backoff.failures();
        if failures > 0 {
            info!(
                target: "POLLER",
                "✅ Log polling recovered after {} failed attempt(s)",
                failures
            );
        }
        self.backoff.reset();
        self.stall_notified = false;
    }

    fn persist_cursor(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.cursor_block.set(self.cursor.last_confirmed_block as i64);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save_cursor(&self.settings.token, self.cursor) {
                error!(target: "POLLER", "Failed to persist cursor: {}", e);
            }
        }
    }

    fn observe_latency(&self, method: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_rpc(method, started.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sources::{MockChainLogSource, MockNotificationSink};
    use parking_lot::Mutex;

    const TOKEN: &str = "0x6982508145454ce325ddbe47a25d4ec3d2311933";

    fn word(addr_byte: u8) -> String {
        format!("0x{}{}", "00".repeat(12), format!("{:02x}", addr_byte).repeat(20))
    }

    fn raw_log(block: u64, log_index: u64, tx_byte: u8) -> RawLog {
        RawLog {
            address: TOKEN.to_string(),
            topics: vec![format!("{:#x}", TRANSFER_TOPIC), word(0xaa), word(0xbb)],
            data: format!("0x{:064x}", 5_000u64),
            block_number: Some(format!("{:#x}", block)),
            transaction_hash: Some(format!("0x{}", format!("{:02x}", tx_byte).repeat(32))),
            log_index: Some(format!("{:#x}", log_index)),
            removed: false,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, u64)>>,
        cancel_after: Option<usize>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: TransferEvent) -> HandleResult {
            let mut seen = self.seen.lock();
            if self.cancel_after == Some(seen.len()) {
                return HandleResult::Cancelled;
            }
            seen.push(event.position());
            HandleResult::Completed
        }
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            token: parse_address(TOKEN).unwrap(),
            poll_interval: Duration::from_secs(12),
            confirmation_depth: 6,
            max_block_range: 100,
            backoff: BackoffPolicy::default(),
        }
    }

    #[test]
    fn test_decode_transfer() {
        let event = decode_transfer(&raw_log(100, 3, 0x11)).unwrap();
        assert_eq!(event.block_number, 100);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.from, Address::repeat_byte(0xaa));
        assert_eq!(event.to, Address::repeat_byte(0xbb));
        assert_eq!(event.raw_amount, U256::from(5_000u64));
        assert_eq!(event.tx_hash, B256::repeat_byte(0x11));
        assert_eq!(event.token_address, parse_address(TOKEN).unwrap());
    }

    #[test]
    fn test_decode_rejects_malformed_logs() {
        let mut removed = raw_log(1, 0, 1);
        removed.removed = true;
        assert_eq!(decode_transfer(&removed), Err(DecodeError::Removed));

        let mut nft = raw_log(1, 0, 1);
        nft.topics.push(word(0x01));
        assert_eq!(decode_transfer(&nft), Err(DecodeError::TopicCount(4)));

        let mut approval = raw_log(1, 0, 1);
        approval.topics[0] =
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925".to_string();
        assert!(matches!(decode_transfer(&approval), Err(DecodeError::NotTransfer(_))));

        let mut short_data = raw_log(1, 0, 1);
        short_data.data = "0x01".to_string();
        assert!(matches!(
            decode_transfer(&short_data),
            Err(DecodeError::InvalidField { field: "data", .. })
        ));

        let mut no_hash = raw_log(1, 0, 1);
        no_hash.transaction_hash = None;
        assert_eq!(
            decode_transfer(&no_hash),
            Err(DecodeError::MissingField("transactionHash"))
        );
    }

    #[test]
    fn test_next_range_respects_confirmations_and_cap() {
        let cursor = FetchCursor::new(100);
        assert_eq!(cursor.next_range(106, 6, 50), None);
        assert_eq!(cursor.next_range(107, 6, 50), Some((101, 101)));
        assert_eq!(cursor.next_range(1_000, 6, 50), Some((101, 150)));
        assert_eq!(cursor.next_range(3, 6, 50), None);
    }

    #[tokio::test]
    async fn test_poll_emits_in_order_and_advances() {
        let mut source = MockChainLogSource::new();
        source.expect_chain_head().returning(|| Ok(120));
        source
            .expect_poll_logs()
            .withf(|_, topic, from, to| *topic == TRANSFER_TOPIC && *from == 101 && *to == 114)
            .returning(|_, _, _, _| {
                let mut bad = raw_log(110, 0, 9);
                bad.data = "garbage".to_string();
                Ok(vec![raw_log(112, 1, 2), raw_log(105, 7, 1), bad, raw_log(112, 0, 3)])
            });

        let recorder = Arc::new(Recorder::default());
        let mut poller = LogPoller::new(
            settings(),
            Arc::new(source),
            recorder.clone(),
            FetchCursor::new(100),
        );

        let tick = poller.poll_once().await.unwrap();
        assert_eq!(
            tick,
            PollTick::Processed {
                from: 101,
                to: 114,
                events: 3,
                decode_errors: 1,
                caught_up: true,
            }
        );
        assert_eq!(*recorder.seen.lock(), vec![(105, 7), (112, 0), (112, 1)]);
        assert_eq!(poller.cursor(), FetchCursor::new(114));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cursor() {
        let mut source = MockChainLogSource::new();
        source.expect_chain_head().returning(|| Ok(500));
        source
            .expect_poll_logs()
            .returning(|_, _, _, _| Err(SourceError::Transient("timeout".into())));

        let recorder = Arc::new(Recorder::default());
        let mut poller =
            LogPoller::new(settings(), Arc::new(source), recorder.clone(), FetchCursor::new(100));

        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.cursor(), FetchCursor::new(100));
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_commits_only_finished_blocks() {
        let mut source = MockChainLogSource::new();
        source.expect_chain_head().returning(|| Ok(120));
        source
            .expect_poll_logs()
            .returning(|_, _, _, _| Ok(vec![raw_log(101, 0, 1), raw_log(102, 0, 2)]));

        let recorder = Arc::new(Recorder {
            cancel_after: Some(1),
            ..Default::default()
        });
        let mut poller =
            LogPoller::new(settings(), Arc::new(source), recorder.clone(), FetchCursor::new(100));

        let tick = poller.poll_once().await.unwrap();
        assert_eq!(tick, PollTick::Interrupted { from: 101, to: 114 });
        assert_eq!(poller.cursor(), FetchCursor::new(101));
        assert_eq!(*recorder.seen.lock(), vec![(101, 0)]);
    }

    #[tokio::test]
    async fn test_cancel_inside_first_block_keeps_cursor() {
        let mut source = MockChainLogSource::new();
        source.expect_chain_head().returning(|| Ok(120));
        source.expect_poll_logs().returning(|_, _, _, _| {
            Ok(vec![raw_log(101, 0, 1), raw_log(101, 1, 2), raw_log(103, 0, 3)])
        });

        let recorder = Arc::new(Recorder {
            cancel_after: Some(1),
            ..Default::default()
        });
        let store = Arc::new(StateStore::in_memory().unwrap());
        let mut poller =
            LogPoller::new(settings(), Arc::new(source), recorder.clone(), FetchCursor::new(100))
                .with_store(store.clone());

        let tick = poller.poll_once().await.unwrap();
        assert_eq!(tick, PollTick::Interrupted { from: 101, to: 114 });
        assert_eq!(poller.cursor(), FetchCursor::new(100));
        assert_eq!(store.load_cursor(&settings().token).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stall_notice_once_per_streak() {
        let mut notifier = MockNotificationSink::new();
        notifier
            .expect_send()
            .withf(|message| message.contains("stalled") && message.contains("block 100"))
            .times(2)
            .returning(|_| Ok(()));

        let mut poller = LogPoller::new(
            settings(),
            Arc::new(MockChainLogSource::new()),
            Arc::new(Recorder::default()),
            FetchCursor::new(100),
        )
        .with_notifier(Arc::new(notifier));

        let err = SourceError::Transient("connection refused".into());
        for _ in 0..STALL_NOTICE_AFTER + 3 {
            poller.record_failure(&err).await;
        }

        // Recovery re-arms the notice for the next outage
        poller.record_success();
        for _ in 0..STALL_NOTICE_AFTER - 1 {
            poller.record_failure(&err).await;
        }
        poller.record_failure(&err).await;
    }

    #[tokio::test]
    async fn test_idle_when_nothing_confirmed() {
        let mut source = MockChainLogSource::new();
        source.expect_chain_head().returning(|| Ok(105));
        source.expect_poll_logs().never();

        let mut poller = LogPoller::new(
            settings(),
            Arc::new(source),
            Arc::new(Recorder::default()),
            FetchCursor::new(100),
        );
        assert_eq!(poller.poll_once().await.unwrap(), PollTick::Idle { chain_head: 105 });
        assert_eq!(poller.cursor(), FetchCursor::new(100));
    }

    #[tokio::test]
    async fn test_catch_up_in_chunks() {
        let mut source = MockChainLogSource::new();
        source.expect_chain_head().returning(|| Ok(1_000));
        source.expect_poll_logs().returning(|_, _, _, _| Ok(vec![]));

        let mut poller = LogPoller::new(
            settings(),
            Arc::new(source),
            Arc::new(Recorder::default()),
            FetchCursor::new(100),
        );

        let tick = poller.poll_once().await.unwrap();
        assert!(matches!(
            tick,
            PollTick::Processed { from: 101, to: 200, caught_up: false, .. }
        ));
        let tick = poller.poll_once().await.unwrap();
        assert!(matches!(tick, PollTick::Processed { from: 201, to: 300, .. }));
        assert_eq!(poller.cursor(), FetchCursor::new(300));
    }
}
