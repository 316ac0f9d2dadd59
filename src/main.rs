//! WhaleGuard binary: wires the roster, poller and alert pipeline together

use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use whaleguard::config::Config;
use whaleguard::dashboard::server::AppState;
use whaleguard::dashboard::DashboardServer;
use whaleguard::modules::poller::PollerSettings;
use whaleguard::modules::{
    AlertDispatcher, AlertPipeline, DedupFilter, Enricher, FetchCursor, LogPoller, RosterRefresher,
    RosterSettings, TokenMetadata, WhaleRegistry,
};
use whaleguard::utils::address::checksum;
use whaleguard::utils::backoff::Backoff;
use whaleguard::utils::pricing::DefiLlamaPricing;
use whaleguard::utils::ranking::{ChainbaseRanking, EthplorerRanking, FallbackRanking};
use whaleguard::utils::sources::{ChainLogSource, HolderRankingSource, NotificationSink};
use whaleguard::utils::{init_logger, AlertService, EvmRpcService, MetricsService, StateStore};

const BANNER: &str = r#"
  __        __ _             _         ____                          _
  \ \      / /| |__    __ _ | |  ___  / ___| _   _   __ _  _ __   __| |
   \ \ /\ / / | '_ \  / _` || | / _ \| |  _ | | | | / _` || '__| / _` |
    \ V  V /  | | | || (_| || ||  __/| |_| || |_| || (_| || |   | (_| |
     \_/\_/   |_| |_| \__,_||_| \___| \____| \__,_| \__,_||_|    \__,_|

        ERC20 whale monitor (read-only)
"#;

/// WhaleGuard application
struct WhaleGuard {
    config: Config,
    store: Arc<StateStore>,
    metrics: Arc<MetricsService>,
    alerts: AlertService,
    rpc: Arc<EvmRpcService>,
    registry: Arc<WhaleRegistry>,
    refresher: Arc<RosterRefresher>,
    pipeline: Arc<AlertPipeline>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    started: Instant,
}

impl WhaleGuard {
    async fn new(config: Config, shutdown_tx: Arc<watch::Sender<bool>>) -> Result<Self> {
        let shutdown_rx = shutdown_tx.subscribe();

        let store = Arc::new(StateStore::new(&config.state_db_path)?);
        let metrics = Arc::new(MetricsService::new().context("registering metrics")?);
        let alerts = AlertService::new(&config)?;
        let rpc = Arc::new(EvmRpcService::new(config.rpc_url.clone(), config.rpc_timeout)?);

        let ranking = build_ranking(&config)?;
        let pricing = Arc::new(DefiLlamaPricing::new(
            config.chain.defillama_prefix,
            config.http_timeout,
        )?);

        let metadata = resolve_metadata(&config, &rpc, shutdown_rx.clone()).await?;
        info!(
            target: "WHALEGUARD",
            "Token {} ({} decimals) at {}",
            metadata.symbol,
            metadata.decimals,
            checksum(&metadata.address)
        );

        let registry = Arc::new(WhaleRegistry::new());
        let notifier: Arc<dyn NotificationSink> = Arc::new(alerts.clone());

        let mut refresher = RosterRefresher::new(
            RosterSettings {
                token: config.token_address,
                roster_size: config.roster_size,
                refresh_interval: config.roster_refresh_interval,
                individual_holders_only: config.individual_holders_only,
                exclusions: config.static_exclusion_list.clone(),
                labels: config.whale_labels.clone(),
                backoff: config.backoff,
            },
            ranking,
            Arc::clone(&registry),
        )
        .with_notifier(Arc::clone(&notifier))
        .with_store(Arc::clone(&store))
        .with_metrics(Arc::clone(&metrics));
        if config.individual_holders_only {
            refresher = refresher.with_probe(rpc.clone());
        }

        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        let dedup = Arc::new(DedupFilter::new(capacity, config.dedup_window));
        let enricher = Arc::new(Enricher::new(
            metadata,
            pricing,
            config.usd_threshold,
            config.price_max_age,
        ));
        let dispatcher = Arc::new(AlertDispatcher::new(
            notifier,
            config.backoff,
            config.dispatch_max_attempts,
            config.chain.explorer,
            shutdown_rx.clone(),
        ));
        let pipeline = AlertPipeline::new(
            Arc::clone(&registry),
            dedup,
            enricher,
            dispatcher,
            shutdown_rx,
        )
        .with_mint_burn_alerts(config.alert_on_mint_burn)
        .with_store(Arc::clone(&store))
        .with_metrics(Arc::clone(&metrics));

        Ok(Self {
            config,
            store,
            metrics,
            alerts,
            rpc,
            registry,
            refresher: Arc::new(refresher),
            pipeline: Arc::new(pipeline),
            shutdown_tx,
            started: Instant::now(),
        })
    }

    /// Where polling resumes: the persisted cursor, or `REPLAY_BLOCKS` behind the safe head
    async fn starting_cursor(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<FetchCursor>> {
        if let Some(cursor) = self.store.load_cursor(&self.config.token_address)? {
            info!(
                target: "WHALEGUARD",
                "Resuming after block {}",
                cursor.last_confirmed_block
            );
            return Ok(Some(cursor));
        }

        let mut backoff = Backoff::new(self.config.backoff);
        let head = loop {
            match self.rpc.chain_head().await {
                Ok(head) => break head,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(target: "WHALEGUARD", "Chain head unavailable: {} - retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return Ok(None);
                            }
                        }
                    }
                }
            }
        };
        let start = head
            .saturating_sub(self.config.confirmation_depth)
            .saturating_sub(self.config.replay_blocks);
        info!(
            target: "WHALEGUARD",
            "No saved cursor, starting after block {} (head {}, replay {})",
            start,
            head,
            self.config.replay_blocks
        );
        Ok(Some(FetchCursor::new(start)))
    }

    async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if !self.refresher.ensure_initial(&mut shutdown_rx).await {
            info!(target: "WHALEGUARD", "Shutdown before a roster was loaded");
            return Ok(());
        }

        let Some(cursor) = self.starting_cursor(&mut shutdown_rx).await? else {
            info!(target: "WHALEGUARD", "Shutdown before polling started");
            return Ok(());
        };
        self.send_notice(self.startup_notice()).await;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(
            Arc::clone(&self.refresher).run(self.shutdown_tx.subscribe()),
        ));

        let handler: Arc<dyn whaleguard::modules::poller::EventHandler> = self.pipeline.clone();
        let source: Arc<dyn ChainLogSource> = self.rpc.clone();
        let poller = LogPoller::new(
            PollerSettings {
                token: self.config.token_address,
                poll_interval: self.config.poll_interval,
                confirmation_depth: self.config.confirmation_depth,
                max_block_range: self.config.max_block_range,
                backoff: self.config.backoff,
            },
            source,
            handler,
            cursor,
        )
        .with_store(Arc::clone(&self.store))
        .with_metrics(Arc::clone(&self.metrics))
        .with_notifier(Arc::new(self.alerts.clone()));
        tasks.push(tokio::spawn(poller.run(self.shutdown_tx.subscribe())));

        tasks.push(tokio::spawn(status_printer(
            self.config.status_print_interval,
            self.config.token_address,
            Arc::clone(&self.registry),
            Arc::clone(&self.refresher),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.store),
            self.shutdown_tx.subscribe(),
        )));

        if self.config.dashboard_port > 0 {
            let server = DashboardServer::new(
                self.config.dashboard_port,
                AppState {
                    token: checksum(&self.config.token_address),
                    chain: self.config.chain.name,
                    registry: Arc::clone(&self.registry),
                    refresher: Arc::clone(&self.refresher),
                    pipeline: Arc::clone(&self.pipeline),
                    store: Arc::clone(&self.store),
                    alerts: self.alerts.clone(),
                    metrics: Arc::clone(&self.metrics),
                    start_time: self.started,
                },
            );
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.start(shutdown).await {
                    error!(target: "DASHBOARD", "Status server failed: {}", e);
                }
            }));
        } else {
            info!(target: "WHALEGUARD", "Status server disabled");
        }

        info!(target: "WHALEGUARD", "✅ All components started");

        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        self.shutdown(tasks).await;
        Ok(())
    }

    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        info!(target: "WHALEGUARD", "Shutting down...");
        self.shutdown_tx.send_replace(true);

        for task in tasks {
            if let Err(e) = task.await {
                error!(target: "WHALEGUARD", "Task ended abnormally: {}", e);
            }
        }

        self.send_notice(self.shutdown_notice()).await;
        info!(target: "WHALEGUARD", "✅ Shutdown complete");
    }

    fn startup_notice(&self) -> String {
        format!(
            "🐋 *WhaleGuard started*\n\nToken: `{}`\nChain: {}\nThreshold: ${}\nWatching top {} holders ({} loaded)",
            checksum(&self.config.token_address),
            self.config.chain.name,
            self.config.usd_threshold,
            self.config.roster_size,
            self.registry.read().len()
        )
    }

    fn shutdown_notice(&self) -> String {
        let stats = self.pipeline.get_stats();
        format!(
            "🛑 *WhaleGuard stopped*\n\nEvents: {}\nAlerts sent: {}\nAlerts dropped: {}\nUptime: {}s",
            stats.events_seen,
            stats.alerts_sent,
            stats.alerts_dropped,
            self.started.elapsed().as_secs()
        )
    }

    /// Best effort, a single attempt
    async fn send_notice(&self, message: String) {
        if let Err(e) = self.alerts.send(&message).await {
            warn!(target: "WHALEGUARD", "System notice not delivered: {}", e);
        }
    }
}

/// Chainbase when a key is set, Ethplorer on mainnet, in that order
fn build_ranking(config: &Config) -> Result<Arc<dyn HolderRankingSource>> {
    let mut sources: Vec<Arc<dyn HolderRankingSource>> = Vec::new();
    if let Some(key) = &config.chainbase_api_key {
        sources.push(Arc::new(ChainbaseRanking::new(
            key,
            config.chain.chain_id,
            config.http_timeout,
        )?));
    }
    if config.chain.key == "ethereum" {
        sources.push(Arc::new(EthplorerRanking::new(config.http_timeout)?));
    }

    let ranking = FallbackRanking::new(sources);
    if ranking.is_empty() {
        anyhow::bail!(
            "no holder ranking source for chain {}: set CHAINBASE_API_KEY",
            config.chain.key
        );
    }
    Ok(Arc::new(ranking))
}

/// `decimals()` is required, so retry until it resolves or shutdown is requested
async fn resolve_metadata(
    config: &Config,
    rpc: &EvmRpcService,
    mut shutdown: watch::Receiver<bool>,
) -> Result<TokenMetadata> {
    let mut backoff = Backoff::new(config.backoff);
    loop {
        if *shutdown.borrow() {
            anyhow::bail!("shutdown while resolving token metadata");
        }
        match rpc.token_metadata(&config.token_address).await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    target: "WHALEGUARD",
                    "Token metadata unavailable ({} attempts): {} - retrying in {:?}",
                    backoff.failures(),
                    e,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            anyhow::bail!("shutdown while resolving token metadata");
                        }
                    }
                }
            }
        }
    }
}

async fn status_printer(
    period: Duration,
    token: Address,
    registry: Arc<WhaleRegistry>,
    refresher: Arc<RosterRefresher>,
    pipeline: Arc<AlertPipeline>,
    store: Arc<StateStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
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

        let snapshot = registry.read();
        let stats = pipeline.get_stats();
        let cursor = store
            .load_cursor(&token)
            .ok()
            .flatten()
            .map(|c| c.last_confirmed_block.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            target: "WHALEGUARD",
            "📊 roster={} gen={}{} cursor={} events={} alerts={} dropped={} below_threshold={} price_misses={}",
            snapshot.len(),
            snapshot.generation,
            if refresher.is_degraded() { " (degraded)" } else { "" },
            cursor,
            stats.events_seen,
            stats.alerts_sent,
            stats.alerts_dropped,
            stats.below_threshold,
            stats.price_misses
        );
    }
}

/// Flips the shutdown flag on Ctrl+C or SIGTERM
async fn forward_signals(shutdown_tx: Arc<watch::Sender<bool>>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "WHALEGUARD", "Received Ctrl+C"),
        _ = terminate => info!(target: "WHALEGUARD", "Received SIGTERM"),
    }
    shutdown_tx.send_replace(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    println!("{}", BANNER);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(target: "WHALEGUARD", "Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(target: "WHALEGUARD", "Configuration: {}", config.summary());

    let (shutdown_tx, _) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn(forward_signals(Arc::clone(&shutdown_tx)));

    let app = WhaleGuard::new(config, shutdown_tx).await?;
    app.run().await
}
