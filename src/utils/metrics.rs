//! Prometheus metrics service for WhaleGuard

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics service for Prometheus
#[derive(Clone)]
pub struct MetricsService {
    registry: Registry,
    start_time: Instant,

    // Poller
    pub logs_fetched: IntCounter,
    pub decode_errors: IntCounter,
    pub poll_errors: IntCounter,
    pub chain_head: IntGauge,
    pub cursor_block: IntGauge,

    // Pipeline
    pub duplicates: IntCounter,
    pub out_of_order: IntCounter,
    pub events_classified: IntCounterVec,
    pub below_threshold: IntCounter,
    pub price_misses: IntCounter,
    pub alerts_sent: IntCounterVec,
    pub alerts_dropped: IntCounter,

    // Roster
    pub roster_refreshes: IntCounterVec,
    pub roster_size: IntGauge,
    pub roster_generation: IntGauge,
    pub roster_degraded: IntGauge,

    // System
    pub rpc_latency: HistogramVec,
    pub uptime: IntGauge,
}

impl MetricsService {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let logs_fetched = IntCounter::new("whaleguard_logs_fetched_total", "Transfer logs fetched")?;
        let decode_errors =
            IntCounter::new("whaleguard_decode_errors_total", "Malformed logs dropped")?;
        let poll_errors = IntCounter::new("whaleguard_poll_errors_total", "Failed poll ticks")?;
        let chain_head = IntGauge::new("whaleguard_chain_head", "Latest block seen")?;
        let cursor_block = IntGauge::new("whaleguard_cursor_block", "Last fully processed block")?;

        let duplicates =
            IntCounter::new("whaleguard_duplicates_total", "Events rejected as duplicates")?;
        let out_of_order =
            IntCounter::new("whaleguard_out_of_order_total", "Events rejected as out of order")?;
        let events_classified = IntCounterVec::new(
            Opts::new("whaleguard_events_classified_total", "Events by classification"),
            &["classification"],
        )?;
        let below_threshold =
            IntCounter::new("whaleguard_below_threshold_total", "Whale transfers below threshold")?;
        let price_misses =
            IntCounter::new("whaleguard_price_misses_total", "Events dropped without a price")?;
        let alerts_sent = IntCounterVec::new(
            Opts::new("whaleguard_alerts_sent_total", "Alerts delivered"),
            &["direction"],
        )?;
        let alerts_dropped =
            IntCounter::new("whaleguard_alerts_dropped_total", "Alerts dropped after retries")?;

        let roster_refreshes = IntCounterVec::new(
            Opts::new("whaleguard_roster_refreshes_total", "Roster refreshes by outcome"),
            &["outcome"],
        )?;
        let roster_size = IntGauge::new("whaleguard_roster_size", "Whales in the active roster")?;
        let roster_generation =
            IntGauge::new("whaleguard_roster_generation", "Active roster generation")?;
        let roster_degraded =
            IntGauge::new("whaleguard_roster_degraded", "1 while roster refresh is failing")?;

        let rpc_latency = HistogramVec::new(
            HistogramOpts::new("whaleguard_rpc_latency_seconds", "RPC latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method"],
        )?;
        let uptime = IntGauge::new("whaleguard_uptime_seconds", "Application uptime")?;

        registry.register(Box::new(logs_fetched.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(poll_errors.clone()))?;
        registry.register(Box::new(chain_head.clone()))?;
        registry.register(Box::new(cursor_block.clone()))?;
        registry.register(Box::new(duplicates.clone()))?;
        registry.register(Box::new(out_of_order.clone()))?;
        registry.register(Box::new(events_classified.clone()))?;
        registry.register(Box::new(below_threshold.clone()))?;
        registry.register(Box::new(price_misses.clone()))?;
        registry.register(Box::new(alerts_sent.clone()))?;
        registry.register(Box::new(alerts_dropped.clone()))?;
        registry.register(Box::new(roster_refreshes.clone()))?;
        registry.register(Box::new(roster_size.clone()))?;
        registry.register(Box::new(roster_generation.clone()))?;
        registry.register(Box::new(roster_degraded.clone()))?;
        registry.register(Box::new(rpc_latency.clone()))?;
        registry.register(Box::new(uptime.clone()))?;

        info!(target: "METRICS", "Prometheus metrics initialized");

        Ok(Self {
            registry,
            start_time: Instant::now(),
            logs_fetched,
            decode_errors,
            poll_errors,
            chain_head,
            cursor_block,
            duplicates,
            out_of_order,
            events_classified,
            below_threshold,
            price_misses,
            alerts_sent,
            alerts_dropped,
            roster_refreshes,
            roster_size,
            roster_generation,
            roster_degraded,
            rpc_latency,
            uptime,
        })
    }

    pub fn observe_rpc(&self, method: &str, elapsed: Duration) {
        self.rpc_latency
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_classification(&self, classification: &str) {
        self.events_classified
            .with_label_values(&[classification])
            .inc();
    }

    /// Get metrics as Prometheus text format
    pub fn get_metrics(&self) -> prometheus::Result<String> {
        self.uptime.set(self.start_time.elapsed().as_secs() as i64);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
