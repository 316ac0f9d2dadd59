//! HTTP status API: health, readiness, roster, recent alerts and Prometheus metrics

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::modules::pipeline::PipelineStats;
use crate::modules::roster::RosterStats;
use crate::modules::{AlertPipeline, RosterRefresher, WhaleEntry, WhaleRegistry};
use crate::utils::alerts::SentMessage;
use crate::utils::database::{DbStats, StoredAlert};
use crate::utils::{AlertService, MetricsService, StateStore};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Query params for list endpoints
#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime: f64,
    token: String,
    chain: &'static str,
    roster_generation: u64,
    roster_degraded: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    roster: RosterStats,
    pipeline: PipelineStats,
    database: Option<DbStats>,
    telegram_enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhalesResponse {
    generation: u64,
    built_at: String,
    whales: Vec<WhaleEntry>,
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub token: String,
    pub chain: &'static str,
    pub registry: Arc<WhaleRegistry>,
    pub refresher: Arc<RosterRefresher>,
    pub pipeline: Arc<AlertPipeline>,
    pub store: Arc<StateStore>,
    pub alerts: AlertService,
    pub metrics: Arc<MetricsService>,
    pub start_time: Instant,
}

/// Status server
pub struct DashboardServer {
    port: u16,
    state: AppState,
}

impl DashboardServer {
    pub fn new(port: u16, state: AppState) -> Self {
        Self { port, state }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/api/stats", get(get_stats))
            .route("/api/whales", get(get_whales))
            .route("/api/alerts", get(get_alerts))
            .route("/api/messages", get(get_messages))
            .route("/metrics", get(get_metrics))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` flips
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = self.router();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(target: "DASHBOARD", "✅ Status server listening on http://localhost:{}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;

        info!(target: "DASHBOARD", "Status server stopped");
        Ok(())
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime: state.start_time.elapsed().as_secs_f64(),
        token: state.token.clone(),
        chain: state.chain,
        roster_generation: state.registry.generation(),
        roster_degraded: state.refresher.is_degraded(),
    })
}

/// Ready once a non-empty roster is active
async fn readiness_check(State(state): State<AppState>) -> Response {
    let snapshot = state.registry.read();
    if snapshot.is_empty() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false, "whales": 0})),
        )
            .into_response()
    } else {
        Json(serde_json::json!({
            "ready": true,
            "whales": snapshot.len(),
            "generation": snapshot.generation,
        }))
        .into_response()
    }
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let database = match state.store.stats() {
        Ok(stats) => Some(stats),
        Err(e) => {
            error!(target: "DASHBOARD", "Failed to read database stats: {}", e);
            None
        }
    };
    Json(StatsResponse {
        roster: state.refresher.get_stats(),
        pipeline: state.pipeline.get_stats(),
        database,
        telegram_enabled: state.alerts.telegram_enabled(),
    })
}

async fn get_whales(State(state): State<AppState>) -> Json<WhalesResponse> {
    let snapshot = state.registry.read();
    Json(WhalesResponse {
        generation: snapshot.generation,
        built_at: snapshot.built_at.to_rfc3339(),
        whales: snapshot.ranked().into_iter().cloned().collect(),
    })
}

async fn get_alerts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = i64::try_from(params.limit()).unwrap_or(DEFAULT_LIST_LIMIT as i64);
    match state.store.recent_alerts(limit) {
        Ok(alerts) => Json::<Vec<StoredAlert>>(alerts).into_response(),
        Err(e) => {
            error!(target: "DASHBOARD", "Failed to read alerts: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "alerts unavailable"})),
            )
                .into_response()
        }
    }
}

async fn get_messages(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<SentMessage>> {
    Json(state.alerts.get_recent(params.limit()))
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.get_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(target: "DASHBOARD", "Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::roster::RosterSettings;
    use crate::modules::{
        AlertDispatcher, DedupFilter, Enricher, TokenMetadata, WhaleSnapshot,
    };
    use crate::utils::backoff::BackoffPolicy;
    use crate::utils::sources::{MockHolderRankingSource, MockPricingSource};
    use alloy_primitives::Address;
    use rust_decimal::Decimal;
    use std::collections::{HashMap, HashSet};
    use std::num::NonZeroUsize;
    use std::time::Duration;

    fn state(registry: Arc<WhaleRegistry>) -> AppState {
        let token = Address::repeat_byte(0x77);
        let (_tx, rx) = watch::channel(false);
        let alerts = AlertService::log_only();
        let refresher = RosterRefresher::new(
            RosterSettings {
                token,
                roster_size: 20,
                refresh_interval: Duration::from_secs(3600),
                individual_holders_only: false,
                exclusions: HashSet::new(),
                labels: HashMap::new(),
                backoff: BackoffPolicy::default(),
            },
            Arc::new(MockHolderRankingSource::new()),
            Arc::clone(&registry),
        );
        let enricher = Enricher::new(
            TokenMetadata {
                address: token,
                decimals: 18,
                symbol: "TKN".to_string(),
            },
            Arc::new(MockPricingSource::new()),
            Decimal::from(10_000),
            Duration::from_secs(60),
        );
        let dispatcher = AlertDispatcher::new(
            Arc::new(alerts.clone()),
            BackoffPolicy::default(),
            1,
            "https://etherscan.io",
            rx.clone(),
        );
        let dedup = DedupFilter::new(NonZeroUsize::new(16).unwrap(), Duration::from_secs(60));
        let pipeline = AlertPipeline::new(
            Arc::clone(&registry),
            Arc::new(dedup),
            Arc::new(enricher),
            Arc::new(dispatcher),
            rx,
        );

        AppState {
            token: format!("{:#x}", token),
            chain: "Ethereum",
            registry,
            refresher: Arc::new(refresher),
            pipeline: Arc::new(pipeline),
            store: Arc::new(StateStore::in_memory().unwrap()),
            alerts,
            metrics: Arc::new(MetricsService::new().unwrap()),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_not_ready_until_roster_loaded() {
        let registry = Arc::new(WhaleRegistry::new());
        let response = readiness_check(State(state(Arc::clone(&registry)))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        registry.publish(WhaleSnapshot::build(
            1,
            vec![WhaleEntry::new(Address::repeat_byte(1), 1, Decimal::ONE)],
        ));
        let response = readiness_check(State(state(registry))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_whales_are_ranked() {
        let registry = Arc::new(WhaleRegistry::new());
        registry.publish(WhaleSnapshot::build(
            3,
            vec![
                WhaleEntry::new(Address::repeat_byte(2), 2, Decimal::ONE),
                WhaleEntry::new(Address::repeat_byte(1), 1, Decimal::TEN),
            ],
        ));
        let Json(body) = get_whales(State(state(registry))).await;
        assert_eq!(body.generation, 3);
        assert_eq!(body.whales[0].rank, 1);
        assert_eq!(body.whales[1].rank, 2);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = get_metrics(State(state(Arc::new(WhaleRegistry::new())))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_list_limit_is_clamped() {
        assert_eq!(ListParams { limit: None }.limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(ListParams { limit: Some(0) }.limit(), 1);
        assert_eq!(ListParams { limit: Some(10_000) }.limit(), MAX_LIST_LIMIT);
    }
}
