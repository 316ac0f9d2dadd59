//! Roster Refresher - rebuilds the whale roster on a timer and degrades gracefully
//!
//! One refresh walks `Idle -> Fetching -> Publishing | Degraded`. A failed refresh leaves the
//! active snapshot untouched; the degraded warning fires once per failure streak and retries
//! stay on the normal interval.

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SourceError;
use crate::modules::registry::{WhaleEntry, WhaleRegistry, WhaleSnapshot};
use crate::utils::address::{checksum, is_burn_address, parse_address, shorten_address};
use crate::utils::alerts::escape_markdown;
use crate::utils::backoff::{Backoff, BackoffPolicy};
use crate::utils::sources::{ContractCodeProbe, HolderRankingSource, HolderRow, NotificationSink};
use crate::utils::{MetricsService, StateStore};

/// Extra rows requested so cleaning still leaves `roster_size` entries
const QUERY_HEADROOM: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefresherState {
    Idle,
    Fetching,
    Publishing,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Published { generation: u64, whales: usize },
    Degraded { reason: SourceError, first_in_streak: bool },
}

#[derive(Debug, Clone)]
pub struct RosterSettings {
    pub token: Address,
    pub roster_size: usize,
    pub refresh_interval: Duration,
    pub individual_holders_only: bool,
    pub exclusions: HashSet<Address>,
    pub labels: HashMap<Address, String>,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterStats {
    pub state: RefresherState,
    pub generation: u64,
    pub whales: usize,
    pub refreshes_ok: u64,
    pub refreshes_failed: u64,
    pub failure_streak: u64,
    pub degraded_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct RosterRefresher {
    settings: RosterSettings,
    ranking: Arc<dyn HolderRankingSource>,
    probe: Option<Arc<dyn ContractCodeProbe>>,
    registry: Arc<WhaleRegistry>,
    notifier: Option<Arc<dyn NotificationSink>>,
    store: Option<Arc<StateStore>>,
    metrics: Option<Arc<MetricsService>>,

    state: RwLock<RefresherState>,
    degraded_since: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    failure_streak: AtomicU64,
    refreshes_ok: AtomicU64,
    refreshes_failed: AtomicU64,
}

impl RosterRefresher {
    pub fn new(
        settings: RosterSettings,
        ranking: Arc<dyn HolderRankingSource>,
        registry: Arc<WhaleRegistry>,
    ) -> Self {
        Self {
            settings,
            ranking,
            probe: None,
            registry,
            notifier: None,
            store: None,
            metrics: None,
            state: RwLock::new(RefresherState::Idle),
            degraded_since: RwLock::new(None),
            last_error: RwLock::new(None),
            failure_streak: AtomicU64::new(0),
            refreshes_ok: AtomicU64::new(0),
            refreshes_failed: AtomicU64::new(0),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ContractCodeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
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

    pub fn state(&self) -> RefresherState {
        *self.state.read()
    }

    pub fn is_degraded(&self) -> bool {
        self.failure_streak.load(Ordering::SeqCst) > 0
    }

    /// One refresh cycle. Never touches the active snapshot on failure.
    pub async fn refresh_once(&self) -> RefreshOutcome {
        *self.state.write() = RefresherState::Fetching;
        let generation = self.registry.generation() + 1;

        let entries = match self.fetch_clean_roster().await {
            Ok(entries) => entries,
            Err(reason) => return self.enter_degraded(reason).await,
        };

        *self.state.write() = RefresherState::Publishing;
        let snapshot = WhaleSnapshot::build(generation, entries);
        let whales = snapshot.len();

        let active = Arc::new(snapshot);
        if !self.registry.publish_shared(Arc::clone(&active)) {
            let reason = SourceError::Transient(format!("generation {} was not accepted", generation));
            return self.enter_degraded(reason).await;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save_snapshot(&self.settings.token, &active) {
                error!(target: "ROSTER", "Failed to persist roster: {}", e);
            }
        }

        self.refreshes_ok.fetch_add(1, Ordering::SeqCst);
        let previous_streak = self.failure_streak.swap(0, Ordering::SeqCst);
        if previous_streak > 0 {
            let since = self.degraded_since.write().take();
            info!(
                target: "ROSTER",
                "✅ Roster refresh recovered after {} failed attempt(s) (degraded since {})",
                previous_streak,
                since.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown".to_string())
            );
        }
        *self.last_error.write() = None;
        *self.state.write() = RefresherState::Idle;

        if let Some(metrics) = &self.metrics {
            metrics.roster_refreshes.with_label_values(&["published"]).inc();
            metrics.roster_size.set(whales as i64);
            metrics.roster_generation.set(generation as i64);
            metrics.roster_degraded.set(0);
        }

        RefreshOutcome::Published { generation, whales }
    }

    /// Query the ranking source and clean the rows into ranked entries
    async fn fetch_clean_roster(&self) -> Result<Vec<WhaleEntry>, SourceError> {
        let limit = self.settings.roster_size + QUERY_HEADROOM;
        let rows = self.ranking.query(&self.settings.token, limit).await?;
        debug!(
            target: "ROSTER",
            "{} returned {} holder rows",
            self.ranking.name(),
            rows.len()
        );

        let entries = self.clean(rows).await?;
        if entries.is_empty() {
            return Err(SourceError::Malformed("no holders left after cleaning".to_string()));
        }
        Ok(entries)
    }

    /// Apply the cleaning rules in source order and assign consecutive ranks.
    pub async fn clean(&self, rows: Vec<HolderRow>) -> Result<Vec<WhaleEntry>, SourceError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(self.settings.roster_size);

        for row in rows {
            if entries.len() >= self.settings.roster_size {
                break;
            }
            let Some(address) = parse_address(&row.address) else {
                warn!(target: "ROSTER", "Skipping holder with invalid address: {}", row.address);
                continue;
            };
            if is_burn_address(&address) || !seen.insert(address) {
                continue;
            }
            if self.settings.exclusions.contains(&address) {
                debug!(target: "ROSTER", "Excluded {}", shorten_address(&address, 4));
                continue;
            }
            if self.settings.individual_holders_only {
                if let Some(probe) = &self.probe {
                    if probe.is_contract(&address).await? {
                        debug!(target: "ROSTER", "Dropped contract holder {}", shorten_address(&address, 4));
                        continue;
                    }
                }
            }

            let rank = entries.len() as u32 + 1;
            let mut entry = WhaleEntry::new(address, rank, row.amount);
            if let Some(label) = self.settings.labels.get(&address) {
                entry = entry.with_label(label.clone());
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn enter_degraded(&self, reason: SourceError) -> RefreshOutcome {
        *self.state.write() = RefresherState::Degraded;
        self.refreshes_failed.fetch_add(1, Ordering::SeqCst);
        *self.last_error.write() = Some(reason.to_string());
        let streak = self.failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
        let first_in_streak = streak == 1;

        if let Some(metrics) = &self.metrics {
            let outcome = if reason.is_quota() { "quota_exhausted" } else { "failed" };
            metrics.roster_refreshes.with_label_values(&[outcome]).inc();
            metrics.roster_degraded.set(1);
        }

        let active = self.registry.read();
        if first_in_streak {
            *self.degraded_since.write() = Some(Utc::now());
            warn!(
                target: "ROSTER",
                "⚠️ Roster refresh failed, DEGRADED: {} - monitoring continues on generation {} ({} whales)",
                reason,
                active.generation,
                active.len()
            );
            if let Some(notifier) = &self.notifier {
                let message = format!(
                    "⚠️ *Roster refresh degraded*\n\nReason: {}\nStill watching {} whales from generation {}.",
                    escape_markdown(&reason.to_string()),
                    active.len(),
                    active.generation
                );
                if let Err(e) = notifier.send(&message).await {
                    warn!(target: "ROSTER", "Degraded notice not delivered: {}", e);
                }
            }
        } else {
            debug!(target: "ROSTER", "Roster refresh still failing ({} in a row): {}", streak, reason);
        }

        RefreshOutcome::Degraded {
            reason,
            first_in_streak,
        }
    }

    /// Make sure a non-empty roster is active before events are consumed. Restores the
    /// persisted snapshot when there is one, otherwise refreshes with backoff until one
    /// succeeds. Returns `false` if shutdown arrives first.
    pub async fn ensure_initial(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if !self.registry.read().is_empty() {
            return true;
        }

        if let Some(store) = &self.store {
            match store.load_snapshot(&self.settings.token) {
                Ok(Some(snapshot)) if !snapshot.is_empty() => {
                    info!(
                        target: "ROSTER",
                        "Restored roster generation {} ({} whales, built {})",
                        snapshot.generation,
                        snapshot.len(),
                        snapshot.built_at.to_rfc3339()
                    );
                    let (generation, whales) = (snapshot.generation, snapshot.len());
                    if self.registry.publish(snapshot) {
                        if let Some(metrics) = &self.metrics {
                            metrics.roster_size.set(whales as i64);
                            metrics.roster_generation.set(generation as i64);
                        }
                        return true;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(target: "ROSTER", "Could not restore roster: {}", e),
            }
        }

        let mut backoff = Backoff::new(self.settings.backoff);
        loop {
            if *shutdown.borrow() {
                return false;
            }
            if let RefreshOutcome::Published { .. } = self.refresh_once().await {
                return true;
            }
            let delay = backoff.next_delay();
            info!(target: "ROSTER", "No roster yet, retrying in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Refresh on the configured interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "ROSTER",
            "🐋 Roster refresher running (top {}, every {}s, source {})",
            self.settings.roster_size,
            self.settings.refresh_interval.as_secs(),
            self.ranking.name()
        );

        let period = self.settings.refresh_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let RefreshOutcome::Published { generation, whales } = self.refresh_once().await {
                if let Some(top) = self.registry.read().ranked().first() {
                    debug!(
                        target: "ROSTER",
                        "Generation {} ready: {} whales, top {}",
                        generation,
                        whales,
                        checksum(&top.address)
                    );
                }
            }
        }

        *self.state.write() = RefresherState::Idle;
        info!(target: "ROSTER", "Roster refresher stopped");
    }

    pub fn get_stats(&self) -> RosterStats {
        let active = self.registry.read();
        RosterStats {
            state: self.state(),
            generation: active.generation,
            whales: active.len(),
            refreshes_ok: self.refreshes_ok.load(Ordering::SeqCst),
            refreshes_failed: self.refreshes_failed.load(Ordering::SeqCst),
            failure_streak: self.failure_streak.load(Ordering::SeqCst),
            degraded_since: *self.degraded_since.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}
