//! HTTP request handlers.

use super::AppState;
use crate::db::{decode_digest, latency_quantile, ConversionEvent, DeliveryFilter, OutcomeCounters};
use crate::monitor::DeliveryStats;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

pub async fn handle_health() -> impl IntoResponse {
    "OK"
}

// ============================================================================
// API: Events
// ============================================================================

/// Accept a conversion and dispatch it in the background.
pub async fn handle_ingest_event(
    State(state): State<AppState>,
    Json(event): Json<ConversionEvent>,
) -> impl IntoResponse {
    let conversion_id = event.id;
    let dispatched = state.dispatcher.ingest_event(event).is_some();

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "conversion_id": conversion_id,
            "dispatched": dispatched,
        })),
    )
}

// ============================================================================
// API: Deliveries
// ============================================================================

pub async fn handle_get_deliveries(
    State(state): State<AppState>,
    Query(filter): Query<DeliveryFilter>,
) -> impl IntoResponse {
    match state.store.list_attempts(&filter) {
        Ok(attempts) => Json(attempts).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_cancel_delivery(
    State(state): State<AppState>,
    Path((conversion_id, profile_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    match state.dispatcher.cancel(conversion_id, profile_id) {
        Ok(cancelled) => Json(json!({
            "conversion_id": conversion_id,
            "profile_id": profile_id,
            "cancelled": cancelled,
        }))
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Profiles
// ============================================================================

pub async fn handle_get_profiles(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_profiles() {
        Ok(profiles) => Json(profiles).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub window_secs: Option<u64>,
    pub profile_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub window_secs: u64,
    pub overall: DeliveryStats,
    pub profiles: BTreeMap<i64, DeliveryStats>,
}

pub async fn handle_get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let window = query
        .window_secs
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(state.monitor.config().window);

    let response = match query.profile_id {
        // One profile: `overall` is that profile's figure.
        Some(id) => {
            let stats = state.monitor.profile_stats(id, window);
            StatsResponse {
                window_secs: window.as_secs(),
                overall: stats.clone(),
                profiles: BTreeMap::from([(id, stats)]),
            }
        }
        None => StatsResponse {
            window_secs: window.as_secs(),
            overall: state.monitor.get_stats(window),
            profiles: state.monitor.all_profile_stats(window),
        },
    };
    Json(response)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub profile_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// A stored snapshot with its latency digest expanded.
#[derive(Debug, Serialize)]
pub struct SnapshotView {
    pub profile_id: i64,
    pub window_start: DateTime<Utc>,
    pub window_seconds: i64,
    #[serde(flatten)]
    pub counters: OutcomeCounters,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
}

pub async fn handle_get_stats_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let end = query.end.unwrap_or_else(Utc::now);
    let start = query.start.unwrap_or(end - ChronoDuration::hours(24));
    if start >= end {
        return (StatusCode::BAD_REQUEST, "start must be before end").into_response();
    }

    match state.store.get_monitoring_snapshots(query.profile_id, start, end) {
        Ok(snapshots) => {
            let views: Vec<SnapshotView> = snapshots
                .into_iter()
                .map(|s| {
                    let digest = decode_digest(&s.latency_digest);
                    SnapshotView {
                        profile_id: s.profile_id,
                        window_start: s.window_start,
                        window_seconds: s.window_seconds,
                        counters: s.counters,
                        latency_p50_ms: digest.as_ref().map(|td| latency_quantile(td, 0.5)),
                        latency_p95_ms: digest.as_ref().map(|td| latency_quantile(td, 0.95)),
                    }
                })
                .collect();
            Json(views).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{
        digest_latencies, encode_digest, AntifraudLevel, ConversionStatus, MonitoringSnapshot,
        PostbackProfile, Store,
    };
    use crate::delivery::{Dispatcher, DispatcherConfig};
    use crate::monitor::{MonitorConfig, MonitoringService, Outcome};
    use crate::postback::{TrackerCredentials, TrackerRegistry};
    use axum::body::to_bytes;
    use axum::response::Response;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    fn app_state() -> (AppState, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let monitor = Arc::new(MonitoringService::new(MonitorConfig::default(), tx));
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(TrackerRegistry::new(TrackerCredentials::new())),
            monitor.clone(),
            DispatcherConfig::default(),
        )
        .unwrap();
        let state = AppState {
            config: ServerConfig::default(),
            store,
            dispatcher,
            monitor,
        };
        (state, tmp)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_returns_accepted() {
        let (state, _tmp) = app_state();
        let event = ConversionEvent {
            id: 5,
            clickid: "c".to_string(),
            antifraud_level: AntifraudLevel::Ok,
            status: ConversionStatus::Approved,
            ..Default::default()
        };

        let resp = handle_ingest_event(State(state.clone()), Json(event.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["dispatched"], true);

        let again = handle_ingest_event(State(state), Json(event)).await.into_response();
        assert_eq!(again.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(again).await["dispatched"], false);
    }

    #[tokio::test]
    async fn test_ingest_without_level_is_hard_blocked() {
        let (state, _tmp) = app_state();
        state
            .store
            .upsert_profile(&PostbackProfile {
                id: 1,
                name: "main".to_string(),
                endpoint_url: "https://t.test/pb".to_string(),
                ..Default::default()
            })
            .unwrap();

        let body = br#"{"id": 8, "clickid": "c", "type": "reg", "status": "pending",
            "antifraud_level": null, "advertiser_id": 1, "partner_id": 2,
            "offer_id": 3, "campaign_id": 4}"#;
        let Json(event) = Json::<ConversionEvent>::from_bytes(body).unwrap();

        let resp = handle_ingest_event(State(state.clone()), Json(event)).await.into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            state.store.get_conversion(8).unwrap().antifraud_level,
            AntifraudLevel::Unknown
        );

        let filter = DeliveryFilter {
            conversion_id: Some(8),
            ..Default::default()
        };
        let mut rows = Vec::new();
        for _ in 0..50 {
            rows = state.store.list_attempts(&filter).unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].skipped_reason, Some(crate::db::SkipReason::HardBlock));
    }

    #[tokio::test]
    async fn test_profiles_listing() {
        let (state, _tmp) = app_state();
        state
            .store
            .upsert_profile(&PostbackProfile {
                id: 3,
                name: "main".to_string(),
                endpoint_url: "https://t.test/pb".to_string(),
                ..Default::default()
            })
            .unwrap();

        let resp = handle_get_profiles(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body[0]["id"], 3);
        assert_eq!(body[0]["tracker"], "custom");
    }

    #[tokio::test]
    async fn test_cancel_endpoint() {
        let (state, _tmp) = app_state();
        let resp = handle_cancel_delivery(State(state.clone()), Path((1, 2)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["cancelled"], false);

        let retry = state.store.get_retry_state(1, 2).unwrap().unwrap();
        assert_eq!(retry.status, crate::db::RetryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (state, _tmp) = app_state();
        state.monitor.record_outcome(9, Outcome::Success { latency_ms: 10.0 });
        state.monitor.record_outcome(9, Outcome::Failure { latency_ms: 10.0 });

        let query = StatsQuery {
            window_secs: Some(600),
            profile_id: None,
        };
        let resp = handle_get_stats(State(state), Query(query)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["window_secs"], 600);
        assert_eq!(body["overall"]["success_rate"], 0.5);
        assert_eq!(body["profiles"]["9"]["failures"], 1);
    }

    #[tokio::test]
    async fn test_stats_for_one_profile() {
        let (state, _tmp) = app_state();
        state.monitor.record_outcome(9, Outcome::Success { latency_ms: 10.0 });
        state.monitor.record_outcome(7, Outcome::Failure { latency_ms: 10.0 });

        let query = StatsQuery {
            window_secs: None,
            profile_id: Some(9),
        };
        let resp = handle_get_stats(State(state.clone()), Query(query))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["overall"]["success_rate"], 1.0);
        assert_eq!(body["overall"]["failures"], 0);
        assert_eq!(body["profiles"].as_object().unwrap().len(), 1);
        assert_eq!(body["profiles"]["9"]["successes"], 1);

        // A profile with no traffic still gets a figure.
        let query = StatsQuery {
            window_secs: None,
            profile_id: Some(42),
        };
        let resp = handle_get_stats(State(state), Query(query)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["overall"]["successes"], 0);
        assert_eq!(body["overall"]["success_rate"], 1.0);
    }

    #[tokio::test]
    async fn test_history_endpoint() {
        let (state, _tmp) = app_state();
        let now = Utc::now();
        let digest = digest_latencies(&[10.0, 20.0, 30.0]).unwrap();
        state
            .store
            .add_monitoring_snapshots(&[MonitoringSnapshot {
                profile_id: 4,
                window_start: now - ChronoDuration::hours(1),
                window_seconds: 300,
                counters: OutcomeCounters {
                    successes: 3,
                    ..Default::default()
                },
                latency_digest: encode_digest(&digest),
            }])
            .unwrap();

        let query = HistoryQuery {
            profile_id: Some(4),
            start: None,
            end: None,
        };
        let resp = handle_get_stats_history(State(state.clone()), Query(query))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["successes"], 3);
        assert!(body[0]["latency_p50_ms"].is_number());

        let bad = HistoryQuery {
            profile_id: None,
            start: Some(now),
            end: Some(now - ChronoDuration::hours(1)),
        };
        let resp = handle_get_stats_history(State(state), Query(bad)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
