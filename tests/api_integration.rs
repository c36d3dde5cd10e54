//! Integration tests for Barnwatch API endpoints.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::TestServer;
use chrono::{Duration, Utc};
use tower::ServiceExt;

use barnwatch::api::{AppState, router};
use barnwatch::config::Config;
use barnwatch::estimator::EstimatorConfig;
use barnwatch::model::{
    MotorSnapshot, RoomLogRow, RoomMapping, RoomSnapshotRow, SensorSnapshot, VentMode,
};
use barnwatch::storage::Storage;

async fn create_storage() -> Storage {
    Storage::new("sqlite::memory:").await.unwrap()
}

fn create_test_server(storage: &Storage) -> TestServer {
    let state = AppState::new(Arc::new(storage.clone()), EstimatorConfig::default());
    TestServer::new(router(state)).unwrap()
}

async fn add_room(storage: &Storage, key12: &str, regist_no: &str, room_no: i32) {
    storage
        .upsert_mapping(&RoomMapping {
            key12: key12.to_string(),
            regist_no: regist_no.to_string(),
            stall_no: 1,
            room_no,
            vent_mode: VentMode::Exhaust,
            blower_count: 2,
            vent_count: 4,
        })
        .await
        .unwrap();
}

async fn add_snapshot(storage: &Storage, key12: &str, sensors: SensorSnapshot, age_sec: i64) {
    let updated_at = Utc::now() - Duration::seconds(age_sec);
    storage
        .upsert_snapshot(&RoomSnapshotRow {
            key12: key12.to_string(),
            measure_ts: updated_at,
            updated_at,
            sensors,
            motors: MotorSnapshot {
                blower: vec![Some(1), Some(1)],
                exhaust_vent: Some(vec![Some(40)]),
                intake_vent: None,
            },
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_health_endpoint() {
    let storage = create_storage().await;
    let server = create_test_server(&storage);

    let response = server.get("/health").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["db_ok"], true);
    assert_eq!(body["offline_default_th_sec"], 211);
    assert_eq!(body["global_offline_th_sec"], 211);
    assert_eq!(body["cache_ttl_sec"], 300);
    assert_eq!(body["lookback_min"], 120);
    assert!(body["server_now_kst"].as_str().unwrap().ends_with("+09:00"));
}

#[tokio::test]
async fn test_summary_empty() {
    let storage = create_storage().await;
    let server = create_test_server(&storage);

    let response = server.get("/farms/summary").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_summary_classifies_rooms() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_room(&storage, "FARM01010102", "FARM01", 2).await;
    add_room(&storage, "FARM01010103", "FARM01", 3).await;

    let warm = SensorSnapshot::from_readings(&[310], &[], &[2000], &[], &[]);
    add_snapshot(&storage, "FARM01010101", warm.clone(), 100).await;
    add_snapshot(&storage, "FARM01010102", warm, 301).await;

    let server = create_test_server(&storage);
    let response = server.get("/farms/summary").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let farm = &body["items"][0];
    assert_eq!(farm["regist_no"], "FARM01");
    assert_eq!(farm["total_rooms"], 3);
    assert_eq!(farm["warn"], 1);
    assert_eq!(farm["offline"], 2);
    assert_eq!(farm["normal"], 0);
    assert_eq!(farm["offline_threshold_sec"], 211);
}

#[tokio::test]
async fn test_summary_is_cached_briefly() {
    let storage = create_storage().await;
    let server = create_test_server(&storage);

    server.get("/farms/summary").await.assert_status_ok();
    add_room(&storage, "FARM01010101", "FARM01", 1).await;

    let body: serde_json::Value = server.get("/farms/summary").await.json();
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_farm_detail() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010102", "FARM01", 2).await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_snapshot(
        &storage,
        "FARM01010101",
        SensorSnapshot::from_readings(&[], &[], &[3800], &[], &[]),
        5,
    )
    .await;
    add_snapshot(&storage, "FARM01010102", SensorSnapshot::default(), 15).await;

    let server = create_test_server(&storage);
    let response = server.get("/farms/FARM01/detail?stall_no=1").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["total_rooms"], 2);
    assert_eq!(body["summary"]["danger"], 1);
    assert_eq!(body["summary"]["normal"], 1);
    let rooms = body["stalls"][0]["rooms"].as_array().unwrap();
    assert_eq!(rooms[0]["room_no"], 1);
    assert_eq!(rooms[0]["state"], "danger");
    assert_eq!(rooms[0]["breached"][0], "co2");
    assert_eq!(rooms[1]["state"], "normal");
    assert!(rooms[1].get("breached").is_none());
}

#[tokio::test]
async fn test_farm_detail_ignores_unparseable_stall() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_snapshot(&storage, "FARM01010101", SensorSnapshot::default(), 5).await;

    let server = create_test_server(&storage);

    for query in ["stall_no=abc", "stall_no=", "stall_no=7"] {
        let response = server.get(&format!("/farms/FARM01/detail?{query}")).await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["total_rooms"], 1, "query {query}");
    }
}

#[tokio::test]
async fn test_non_positive_default_threshold_is_rejected() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_snapshot(&storage, "FARM01010101", SensorSnapshot::default(), 5).await;

    let config = Config::from_lookup(|key| match key {
        "OFFLINE_TH_DEFAULT_SEC" => Some("-5".to_string()),
        "OFFLINE_CACHE_TTL_SEC" => Some("0".to_string()),
        _ => None,
    });
    let state = AppState::new(Arc::new(storage.clone()), config.estimator);
    let server = TestServer::new(router(state)).unwrap();

    let response = server.get("/farms/summary").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["items"][0]["offline_threshold_sec"], 211);
    assert_eq!(body["items"][0]["normal"], 1);
}

#[tokio::test]
async fn test_room_endpoint() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_room(&storage, "FARM01010102", "FARM01", 2).await;
    add_snapshot(
        &storage,
        "FARM01010101",
        SensorSnapshot::from_readings(&[360], &[], &[], &[], &[]),
        12,
    )
    .await;

    let server = create_test_server(&storage);
    let response = server.get("/rooms/FARM01010101").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["mapping"]["regist_no"], "FARM01");
    assert_eq!(body["state"], "danger");
    assert_eq!(body["timing"]["freshness_sec"], 12);
    assert_eq!(body["sensors"]["temperature"][0], 360);
    assert_eq!(body["motors"]["vent_mode"], "exhaust");
    assert_eq!(body["motors"]["active_vent"][0], 40);

    // Mapped without a snapshot, and not mapped at all.
    server
        .get("/rooms/FARM01010102")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .get("/rooms/FARM09999999")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_room_logs_endpoint_pages() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    let now = Utc::now();
    for minutes in 1..=3 {
        let at = now - Duration::minutes(minutes);
        storage
            .append_state_log(&RoomLogRow {
                key12: "FARM01010101".to_string(),
                measure_ts: at,
                created_at: at,
                sensors: SensorSnapshot::from_readings(&[250 + minutes], &[], &[], &[], &[]),
                motors: MotorSnapshot::default(),
            })
            .await
            .unwrap();
    }

    let server = create_test_server(&storage);
    let first: serde_json::Value = server
        .get("/rooms/FARM01010101/logs?limit=2&from=garbage")
        .await
        .json();

    let items = first["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["sensors"]["temperature"][0], 251);
    let cursor = first["next_cursor"].as_str().unwrap().to_string();

    let second = server
        .get("/rooms/FARM01010101/logs")
        .add_query_param("limit", 2)
        .add_query_param("cursor", &cursor)
        .await;
    second.assert_status_ok();
    let body: serde_json::Value = second.json();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["sensors"]["temperature"][0], 253);
    assert!(body.get("next_cursor").is_none());
}

#[tokio::test]
async fn test_alert_history_endpoint() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_room(&storage, "FARM01010102", "FARM01", 2).await;
    add_snapshot(&storage, "FARM01010102", SensorSnapshot::default(), 900).await;
    let at = Utc::now() - Duration::minutes(5);
    storage
        .append_state_log(&RoomLogRow {
            key12: "FARM01010101".to_string(),
            measure_ts: at,
            created_at: at,
            sensors: SensorSnapshot::from_readings(&[], &[], &[2600], &[], &[]),
            motors: MotorSnapshot::default(),
        })
        .await
        .unwrap();

    let server = create_test_server(&storage);

    let body: serde_json::Value = server.get("/alerts/history?range=1h").await.json();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["state"], "warn");
    assert_eq!(items[0]["max_values"]["co2"], 2600);
    assert_eq!(items[1]["state"], "offline");

    let body: serde_json::Value = server
        .get("/alerts/history?states=offline&limit=abc")
        .await
        .json();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["key12"], "FARM01010102");
}

#[tokio::test]
async fn test_threshold_defaults_without_mappings() {
    let storage = create_storage().await;
    let server = create_test_server(&storage);

    let response = server.get("/farms/FARM09/threshold").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["offline_threshold_sec"], 211);
    assert_eq!(body["basis"], "no_mappings");
    assert_eq!(body["sample_count"], 0);
}

#[tokio::test]
async fn test_threshold_learned_from_cadence() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    let now = Utc::now();
    for i in 0..60 {
        storage
            .record_state_log("FARM01010101", now - Duration::seconds(60 * i))
            .await
            .unwrap();
    }

    let server = create_test_server(&storage);
    let response = server.get("/farms/FARM01/threshold").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["basis"], "computed");
    assert_eq!(body["p95_interval_sec"], 60);
    assert_eq!(body["offline_threshold_sec"], 210);
    assert_eq!(body["sample_count"], 60);
}

#[tokio::test]
async fn test_alerts_endpoint() {
    let storage = create_storage().await;
    add_room(&storage, "FARM01010101", "FARM01", 1).await;
    add_room(&storage, "FARM02010101", "FARM02", 1).await;

    let server = create_test_server(&storage);
    let response = server.get("/alerts?regist_no=FARM02").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let alerts = body["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["key12"], "FARM02010101");
    assert_eq!(alerts[0]["state"], "offline");
}

#[tokio::test]
async fn test_router_oneshot() {
    let storage = create_storage().await;
    let app = router(AppState::new(Arc::new(storage), EstimatorConfig::default()));

    let response = app
        .oneshot(Request::builder().uri("/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
