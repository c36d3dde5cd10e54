//! HTTP API handlers for Barnwatch.
//!
//! All responses are JSON. Store failures are logged and mapped to
//! `500 Internal Server Error`; threshold lookups never fail.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::Utc;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::aggregation::{
    SummaryCache, compute_alert_history, compute_farm_detail, compute_farm_summaries,
    compute_room_detail, compute_room_logs, generate_alerts,
};
use crate::estimator::{EstimatorConfig, ThresholdBasis, ThresholdEstimator};
use crate::kst::server_now_kst;
use crate::model::{
    AlertHistoryQuery, AlertHistoryResponse, AlertsQuery, AlertsResponse, FarmDetail,
    FarmDetailQuery, FarmSummaryResponse, RoomDetail, RoomLogsQuery, RoomLogsResponse,
};
use crate::source::{BarnStore, SnapshotSource};

/// How long a farm summary is reused.
const SUMMARY_CACHE_TTL: Duration = Duration::from_secs(10);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotSource>,
    pub estimator: Arc<ThresholdEstimator>,
    pub summary_cache: Arc<SummaryCache>,
}

impl AppState {
    /// Wire a store into both the estimator and the aggregation handlers.
    pub fn new<S: BarnStore + 'static>(store: Arc<S>, estimator_config: EstimatorConfig) -> Self {
        let estimator = ThresholdEstimator::new(store.clone(), estimator_config);
        Self {
            store,
            estimator: Arc::new(estimator),
            summary_cache: Arc::new(SummaryCache::new(SUMMARY_CACHE_TTL)),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/farms/summary", get(get_farm_summary))
        .route("/farms/:regist_no/detail", get(get_farm_detail))
        .route("/farms/:regist_no/threshold", get(get_farm_threshold))
        .route("/rooms/:key12", get(get_room))
        .route("/rooms/:key12/logs", get(get_room_logs))
        .route("/alerts", get(get_alerts))
        .route("/alerts/history", get(get_alert_history))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Response for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub db_ok: bool,
    pub server_now_kst: String,
    pub offline_default_th_sec: i64,
    pub global_offline_th_sec: i64,
    pub cache_ttl_sec: u64,
    pub lookback_min: u64,
}

/// GET /health - Store connectivity and effective offline settings.
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            false
        }
    };

    let config = state.estimator.config();
    Json(HealthResponse {
        db_ok,
        server_now_kst: server_now_kst(),
        offline_default_th_sec: config.default_threshold_sec,
        global_offline_th_sec: state.estimator.global_offline_threshold_sec().await,
        cache_ttl_sec: config.cache_ttl.as_secs(),
        lookback_min: config.lookback.as_secs() / 60,
    })
}

/// GET /farms/summary - State counts of every farm.
///
/// # Response
///
/// ```json
/// {
///     "server_now_kst": "2026-01-22T10:45:00.000+09:00",
///     "items": [
///         {
///             "regist_no": "FARM01",
///             "total_rooms": 60,
///             "normal": 55,
///             "warn": 3,
///             "danger": 0,
///             "offline": 2,
///             "offline_threshold_sec": 211,
///             "last_updated_at_kst": "2026-01-22T10:44:58.000+09:00",
///             "freshness_sec": 2
///         }
///     ]
/// }
/// ```
#[instrument(skip(state))]
pub async fn get_farm_summary(
    State(state): State<AppState>,
) -> Result<Json<FarmSummaryResponse>, StatusCode> {
    if let Some(cached) = state.summary_cache.get() {
        return Ok(Json(cached));
    }

    match compute_farm_summaries(state.store.as_ref(), &state.estimator, Utc::now()).await {
        Ok(response) => {
            info!(farm_count = response.items.len(), "Farm summary computed");
            state.summary_cache.store(response.clone());
            Ok(Json(response))
        }
        Err(e) => {
            warn!(error = %e, "Failed to compute farm summary");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /farms/:regist_no/detail - Rooms of one farm grouped by stall.
///
/// # Query Parameters
///
/// - `stall_no` (optional): Restrict to stall 1, 2 or 3; anything else is
///   ignored
#[instrument(skip(state))]
pub async fn get_farm_detail(
    State(state): State<AppState>,
    Path(regist_no): Path<String>,
    Query(query): Query<FarmDetailQuery>,
) -> Result<Json<FarmDetail>, StatusCode> {
    match compute_farm_detail(
        state.store.as_ref(),
        &state.estimator,
        &regist_no,
        query.stall_no(),
        Utc::now(),
    )
    .await
    {
        Ok(detail) => {
            info!(
                regist_no = %regist_no,
                rooms = detail.total_rooms,
                offline = detail.summary.counts.offline,
                "Farm detail queried"
            );
            Ok(Json(detail))
        }
        Err(e) => {
            warn!(regist_no = %regist_no, error = %e, "Failed to compute farm detail");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Response for `GET /farms/:regist_no/threshold`.
#[derive(Debug, Serialize)]
pub struct ThresholdResponse {
    pub regist_no: String,
    pub offline_threshold_sec: i64,
    pub basis: Option<ThresholdBasis>,
    pub sample_count: Option<usize>,
    pub interval_count: Option<usize>,
    pub p95_interval_sec: Option<i64>,
    pub age_sec: Option<u64>,
}

/// GET /farms/:regist_no/threshold - Effective offline threshold and how it
/// was derived.
#[instrument(skip(state))]
pub async fn get_farm_threshold(
    State(state): State<AppState>,
    Path(regist_no): Path<String>,
) -> Json<ThresholdResponse> {
    let offline_threshold_sec = state.estimator.farm_offline_threshold_sec(&regist_no).await;
    let entry = state.estimator.farm_entry(&regist_no);

    Json(ThresholdResponse {
        regist_no,
        offline_threshold_sec,
        basis: entry.as_ref().map(|e| e.basis),
        sample_count: entry.as_ref().map(|e| e.sample_count),
        interval_count: entry.as_ref().map(|e| e.interval_count),
        p95_interval_sec: entry.as_ref().and_then(|e| e.p95_interval_sec),
        age_sec: entry.as_ref().map(|e| e.computed_at.elapsed().as_secs()),
    })
}

/// GET /rooms/:key12 - Mapping, timing, state, sensors and motors of one room.
///
/// `404` when the room is not mapped or has no snapshot.
#[instrument(skip(state))]
pub async fn get_room(
    State(state): State<AppState>,
    Path(key12): Path<String>,
) -> Result<Json<RoomDetail>, StatusCode> {
    match compute_room_detail(state.store.as_ref(), &state.estimator, &key12, Utc::now()).await {
        Ok(Some(room)) => {
            info!(key12 = %key12, state = room.state.as_str(), "Room queried");
            Ok(Json(room))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(key12 = %key12, error = %e, "Failed to load room");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /rooms/:key12/logs - State log of one room, newest first.
///
/// # Query Parameters
///
/// - `from`, `to` (optional): RFC 3339 bounds on the measurement time
/// - `limit` (optional): Page size, 1-300 (default: 120)
/// - `cursor` (optional): `next_cursor` of the previous page
#[instrument(skip(state))]
pub async fn get_room_logs(
    State(state): State<AppState>,
    Path(key12): Path<String>,
    Query(query): Query<RoomLogsQuery>,
) -> Result<Json<RoomLogsResponse>, StatusCode> {
    match compute_room_logs(
        state.store.as_ref(),
        &key12,
        query.window(),
        query.limit(),
        Utc::now(),
    )
    .await
    {
        Ok(logs) => {
            info!(key12 = %key12, items = logs.items.len(), "Room logs queried");
            Ok(Json(logs))
        }
        Err(e) => {
            warn!(key12 = %key12, error = %e, "Failed to read room logs");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /alerts/history - Recent warn/danger/offline events.
///
/// # Query Parameters
///
/// - `range` (optional): `1h`, `6h` or `24h` (default: `6h`)
/// - `limit` (optional): 1-200 (default: 50)
/// - `states` (optional): Comma-separated states (default:
///   `warn,danger,offline`)
#[instrument(skip(state))]
pub async fn get_alert_history(
    State(state): State<AppState>,
    Query(query): Query<AlertHistoryQuery>,
) -> Result<Json<AlertHistoryResponse>, StatusCode> {
    match compute_alert_history(
        state.store.as_ref(),
        &state.estimator,
        query.range(),
        query.limit(),
        &query.states(),
        Utc::now(),
    )
    .await
    {
        Ok(history) => {
            info!(items = history.items.len(), "Alert history queried");
            Ok(Json(history))
        }
        Err(e) => {
            warn!(error = %e, "Failed to compute alert history");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /alerts - Rooms in warn, danger or offline state.
///
/// # Query Parameters
///
/// - `regist_no` (optional): Restrict to one farm
#[instrument(skip(state))]
pub async fn get_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertsResponse>, StatusCode> {
    match generate_alerts(
        state.store.as_ref(),
        &state.estimator,
        query.regist_no.as_deref(),
        Utc::now(),
    )
    .await
    {
        Ok(response) => {
            info!(alert_count = response.alerts.len(), "Alerts queried");
            Ok(Json(response))
        }
        Err(e) => {
            warn!(error = %e, "Failed to generate alerts");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
