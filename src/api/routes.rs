use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::db::{AlertStore, EventStore, OddsStore};
use crate::detector::{AlertEngine, AlertStats};
use crate::error::AppError;
use crate::feed::messages::parse_failures;
use crate::fetcher::{BreakerState, RateLimitedFetcher};
use crate::registry::{MarketTypeRegistry, RegistryMetrics};
use crate::types::{AlertQuery, AlertType, EventRecord, MovementAlert};

const DEFAULT_ALERT_LIMIT: i64 = 50;
const MAX_ALERT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub alerts: Arc<dyn AlertStore>,
    pub odds: Arc<dyn OddsStore>,
    pub events: Arc<dyn EventStore>,
    pub registry: Arc<MarketTypeRegistry>,
    pub engine: Arc<AlertEngine>,
    pub fetcher: Arc<RateLimitedFetcher>,
    pub latency: Arc<LatencyStats>,
    pub health: Arc<HealthState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/alerts", get(get_alerts))
        .route("/events/:id/odds", get(get_event_odds))
        .route("/health", get(get_health))
        .route("/stats/summary", get(get_stats_summary))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(rename = "type")]
    pub alert_type: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: Option<i64>,
}

impl AlertsQuery {
    fn into_query(self) -> Result<AlertQuery, AppError> {
        let alert_type = match self.alert_type.as_deref().filter(|s| !s.is_empty()) {
            None => None,
            Some(raw) => Some(
                AlertType::parse(raw).ok_or_else(|| AppError::BadRequest(format!("unknown alert type: {raw}")))?,
            ),
        };
        Ok(AlertQuery {
            alert_type,
            min_confidence: self.min_confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            limit: self.limit.unwrap_or(DEFAULT_ALERT_LIMIT).clamp(1, MAX_ALERT_LIMIT),
        })
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct OddsView {
    pub market_type_id: i64,
    pub market_code: Option<String>,
    pub outcome: String,
    pub current: Decimal,
    pub opening: Decimal,
    pub highest: Decimal,
    pub lowest: Decimal,
    pub previous: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct EventOddsResponse {
    pub event: EventRecord,
    pub odds: Vec<OddsView>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub breaker: BreakerState,
    #[serde(flatten)]
    pub health: HealthSnapshot,
}

#[derive(Serialize)]
pub struct SummaryResponse {
    pub alerts: AlertStats,
    pub registry: RegistryMetrics,
    pub breaker: BreakerState,
    pub breaker_trips: u64,
    pub breaker_rejected: u64,
    pub parse_failures: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_alerts(
    State(state): State<ApiState>,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<Vec<MovementAlert>>, AppError> {
    let query = params.into_query()?;
    Ok(Json(state.alerts.active_alerts(&query).await?))
}

async fn get_event_odds(
    State(state): State<ApiState>,
    Path(event_id): Path<i64>,
) -> Result<Json<EventOddsResponse>, AppError> {
    let event = state
        .events
        .find_event(event_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("event {event_id}")))?;

    let mut snapshots = state.odds.fetch_snapshots(&[event_id]).await?;
    snapshots.sort_by(|a, b| a.key().cmp(&b.key()));
    let odds = snapshots
        .into_iter()
        .map(|s| OddsView {
            market_code: state.registry.by_id(s.market_type_id).map(|m| m.code),
            market_type_id: s.market_type_id,
            outcome: s.outcome,
            current: s.current,
            opening: s.opening,
            highest: s.highest,
            lowest: s.lowest,
            previous: s.previous,
            updated_at: s.updated_at,
        })
        .collect();

    Ok(Json(EventOddsResponse { event, odds }))
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let breaker = state.fetcher.breaker_state();
    Json(HealthResponse {
        status: if breaker == BreakerState::Closed { "ok" } else { "degraded" },
        breaker,
        health: state.health.snapshot(),
    })
}

async fn get_stats_summary(State(state): State<ApiState>) -> Json<SummaryResponse> {
    let breaker = state.fetcher.breaker();
    Json(SummaryResponse {
        alerts: state.engine.stats(),
        registry: state.registry.metrics(),
        breaker: breaker.state(),
        breaker_trips: breaker.trips(),
        breaker_rejected: breaker.rejected(),
        parse_failures: parse_failures(),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}
