//! Per-event pipeline: order check, dedup, match, enrich, dispatch

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::EnrichError;
use crate::log_whale;
use crate::modules::dedup::DedupFilter;
use crate::modules::dispatcher::{describe, AlertDispatcher, DispatchOutcome};
use crate::modules::enricher::{Enricher, Enrichment};
use crate::modules::matcher::{classify, Classification};
use crate::modules::poller::{EventHandler, HandleResult, TransferEvent};
use crate::modules::registry::WhaleRegistry;
use crate::utils::{MetricsService, StateStore};

/// What happened to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Duplicate,
    OutOfOrder,
    Ignored,
    /// Mint or burn not surfaced as an alert
    Suppressed,
    BelowThreshold,
    PriceUnavailable,
    /// Amount too large to value
    Unvalued,
    Alerted,
    DispatchDropped,
    /// Shutdown interrupted the event; it was not marked processed
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub events_seen: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub ignored: u64,
    pub suppressed: u64,
    pub below_threshold: u64,
    pub price_misses: u64,
    pub alerts_sent: u64,
    pub alerts_dropped: u64,
}

#[derive(Default)]
struct Counters {
    events_seen: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    ignored: AtomicU64,
    suppressed: AtomicU64,
    below_threshold: AtomicU64,
    price_misses: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_dropped: AtomicU64,
}

pub struct AlertPipeline {
    registry: Arc<WhaleRegistry>,
    dedup: Arc<DedupFilter>,
    enricher: Arc<Enricher>,
    dispatcher: Arc<AlertDispatcher>,
    alert_on_mint_burn: bool,
    store: Option<Arc<StateStore>>,
    metrics: Option<Arc<MetricsService>>,
    shutdown: watch::Receiver<bool>,
    last_position: Mutex<Option<(u64, u64)>>,
    counters: Counters,
}

impl AlertPipeline {
    pub fn new(
        registry: Arc<WhaleRegistry>,
        dedup: Arc<DedupFilter>,
        enricher: Arc<Enricher>,
        dispatcher: Arc<AlertDispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            dedup,
            enricher,
            dispatcher,
            alert_on_mint_burn: false,
            store: None,
            metrics: None,
            shutdown,
            last_position: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn with_mint_burn_alerts(mut self, enabled: bool) -> Self {
        self.alert_on_mint_burn = enabled;
        self
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one event through the pipeline
    pub async fn process(&self, event: TransferEvent) -> PipelineOutcome {
        if *self.shutdown.borrow() {
            return PipelineOutcome::Cancelled;
        }
        self.counters.events_seen.fetch_add(1, Ordering::Relaxed);

        if !self.accept_position(&event) {
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.out_of_order.inc();
            }
            return PipelineOutcome::OutOfOrder;
        }

        let key = event.key();
        if !self.dedup.check_and_mark(key) {
            debug!(target: "PIPELINE", "Duplicate {}:{}", event.tx_hash, event.log_index);
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.duplicates.inc();
            }
            return PipelineOutcome::Duplicate;
        }

        let snapshot = self.registry.read();
        let classification = classify(&event, &snapshot);
        drop(snapshot);
        self.record_classification(&classification);

        let Some(direction) = classification.direction() else {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::Ignored;
        };
        let whale = match classification {
            Classification::Buy(whale) | Classification::Sell(whale) => whale,
            Classification::Mint(Some(whale)) | Classification::Burn(Some(whale))
                if self.alert_on_mint_burn =>
            {
                whale
            }
            _ => {
                debug!(target: "PIPELINE", "{} suppressed (tx {})", direction, event.tx_hash);
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                return PipelineOutcome::Suppressed;
            }
        };

        let record = match self.enricher.enrich(&event, direction, &whale).await {
            Ok(Enrichment::Alert(record)) => record,
            Ok(Enrichment::BelowThreshold { .. }) => {
                self.counters.below_threshold.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.below_threshold.inc();
                }
                return PipelineOutcome::BelowThreshold;
            }
            Err(EnrichError::PriceUnavailable(e)) => {
                warn!(
                    target: "PIPELINE",
                    "Skipping {} by #{} in tx {}: price unavailable ({})",
                    direction,
                    whale.rank,
                    event.tx_hash,
                    e
                );
                self.counters.price_misses.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.price_misses.inc();
                }
                return PipelineOutcome::PriceUnavailable;
            }
            Err(e @ EnrichError::AmountOverflow { .. }) => {
                error!(target: "PIPELINE", "Cannot value tx {}: {}", event.tx_hash, e);
                return PipelineOutcome::Unvalued;
            }
        };

        match self.dispatcher.dispatch(&record).await {
            DispatchOutcome::Delivered { attempts } => {
                log_whale!("{} (attempts: {})", describe(&record), attempts);
                self.counters.alerts_sent.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .alerts_sent
                        .with_label_values(&[record.direction.as_str()])
                        .inc();
                }
                if let Some(store) = &self.store {
                    if let Err(e) = store.save_alert(&record, &self.dispatcher.format(&record)) {
                        error!(target: "PIPELINE", "Failed to record alert: {}", e);
                    }
                }
                PipelineOutcome::Alerted
            }
            DispatchOutcome::Dropped { .. } => {
                self.counters.alerts_dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.alerts_dropped.inc();
                }
                PipelineOutcome::DispatchDropped
            }
            DispatchOutcome::Cancelled => {
                self.dedup.release(&key);
                PipelineOutcome::Cancelled
            }
        }
    }

    /// Positions must not go backwards. An equal position is left to dedup.
    fn accept_position(&self, event: &TransferEvent) -> bool {
        let position = event.position();
        let mut last = self.last_position.lock();
        match *last {
            Some(previous) if position < previous => {
                warn!(
                    target: "PIPELINE",
                    "Rejected out-of-order event at {:?} (last {:?}, tx {})",
                    position,
                    previous,
                    event.tx_hash
                );
                false
            }
            _ => {
                *last = Some(position);
                true
            }
        }
    }

    fn record_classification(&self, classification: &Classification) {
        if let Some(metrics) = &self.metrics {
            let label = classification
                .direction()
                .map(|d| d.as_str().to_ascii_lowercase())
                .unwrap_or_else(|| "ignore".to_string());
            metrics.record_classification(&label);
        }
    }

    pub fn get_stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            events_seen: c.events_seen.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            out_of_order: c.out_of_order.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            below_threshold: c.below_threshold.load(Ordering::Relaxed),
            price_misses: c.price_misses.load(Ordering::Relaxed),
            alerts_sent: c.alerts_sent.load(Ordering::Relaxed),
            alerts_dropped: c.alerts_dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventHandler for AlertPipeline {
    async fn handle(&self, event: TransferEvent) -> HandleResult {
        match self.process(event).await {
            PipelineOutcome::Cancelled => HandleResult::Cancelled,
            _ => HandleResult::Completed,
        }
    }
}
