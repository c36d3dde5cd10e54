//! Farm-level views built from room mappings, latest snapshots and the
//! per-farm offline threshold.
//!
//! Every room goes through [`classify`]; this module only groups, counts and
//! formats the results.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::classify::{ChannelLimits, breached_channels, channel_max, classify};
use crate::estimator::ThresholdEstimator;
use crate::kst::to_kst_iso;
use crate::model::{
    AlertHistoryItem, AlertHistoryResponse, AlertsResponse, ChannelMaxima, FarmDetail,
    FarmDetailSummary, FarmSummary, FarmSummaryResponse, HistoryRange, LogWindow, MotorsView,
    RoomAlert, RoomDetail, RoomLogPoint, RoomLogsResponse, RoomMapping, RoomSnapshotLite,
    RoomSnapshotRow, RoomState, RoomTiming, SensorChannel, SensorSnapshot, StallDetail,
    StateCounts, VentMode,
};
use crate::source::SnapshotSource;
use crate::stats::{freshness_sec, percentile_nearest_rank};

/// Stall numbers accepted as a detail filter.
const STALL_RANGE: std::ops::RangeInclusive<i32> = 1..=3;

/// State of a room given its (possibly missing) snapshot.
///
/// A room that never reported counts as offline.
fn room_state(
    snapshot: Option<&RoomSnapshotRow>,
    offline_threshold_sec: i64,
    now: DateTime<Utc>,
) -> (RoomState, Option<i64>) {
    match snapshot {
        Some(snapshot) => {
            let freshness = freshness_sec(now, snapshot.updated_at);
            (
                classify(&snapshot.sensors, offline_threshold_sec, freshness),
                Some(freshness),
            )
        }
        None => (RoomState::Offline, None),
    }
}

async fn snapshots_by_key(
    store: &dyn SnapshotSource,
    mappings: &[RoomMapping],
) -> anyhow::Result<HashMap<String, RoomSnapshotRow>> {
    let key12s: Vec<String> = mappings.iter().map(|m| m.key12.clone()).collect();
    let snapshots = store.latest_snapshots(&key12s).await?;
    Ok(snapshots
        .into_iter()
        .map(|s| (s.key12.clone(), s))
        .collect())
}

/// Compute per-farm state counts for every mapped farm.
///
/// Rooms without a snapshot count as offline.
pub async fn compute_farm_summaries(
    store: &dyn SnapshotSource,
    estimator: &ThresholdEstimator,
    now: DateTime<Utc>,
) -> anyhow::Result<FarmSummaryResponse> {
    let mappings = store.room_mappings(None, None).await?;
    let snapshots = snapshots_by_key(store, &mappings).await?;

    let mut farms: BTreeMap<&str, Vec<&RoomMapping>> = BTreeMap::new();
    for mapping in &mappings {
        farms.entry(mapping.regist_no.as_str()).or_default().push(mapping);
    }

    let mut items = Vec::with_capacity(farms.len());
    for (regist_no, rooms) in farms {
        let offline_threshold_sec = estimator.farm_offline_threshold_sec(regist_no).await;

        let mut counts = StateCounts::default();
        let mut last_updated_at: Option<DateTime<Utc>> = None;
        for mapping in &rooms {
            let snapshot = snapshots.get(&mapping.key12);
            if let Some(snapshot) = snapshot {
                last_updated_at = last_updated_at.max(Some(snapshot.updated_at));
            }
            let (state, _) = room_state(snapshot, offline_threshold_sec, now);
            counts.record(state);
        }

        items.push(FarmSummary {
            regist_no: regist_no.to_string(),
            total_rooms: rooms.len() as u32,
            counts,
            offline_threshold_sec,
            last_updated_at_kst: last_updated_at.map(to_kst_iso),
            freshness_sec: last_updated_at.map(|at| freshness_sec(now, at)),
        });
    }

    Ok(FarmSummaryResponse {
        server_now_kst: to_kst_iso(now),
        items,
    })
}

/// Compute the stall/room breakdown of one farm.
///
/// Rooms without a snapshot are left out, as are stalls with no remaining
/// rooms. A `stall_no` outside 1-3 is ignored.
pub async fn compute_farm_detail(
    store: &dyn SnapshotSource,
    estimator: &ThresholdEstimator,
    regist_no: &str,
    stall_no: Option<i32>,
    now: DateTime<Utc>,
) -> anyhow::Result<FarmDetail> {
    let stall_no = stall_no.filter(|n| STALL_RANGE.contains(n));
    let mappings = store.room_mappings(Some(regist_no), stall_no).await?;
    let offline_threshold_sec = estimator.farm_offline_threshold_sec(regist_no).await;

    if mappings.is_empty() {
        return Ok(FarmDetail {
            server_now_kst: to_kst_iso(now),
            regist_no: regist_no.to_string(),
            total_rooms: 0,
            offline_threshold_sec,
            summary: FarmDetailSummary {
                counts: StateCounts::default(),
                last_updated_at_kst: None,
                freshness_p50_sec: None,
                freshness_p95_sec: None,
            },
            stalls: Vec::new(),
        });
    }

    let snapshots = snapshots_by_key(store, &mappings).await?;

    let mut by_stall: BTreeMap<i32, Vec<&RoomMapping>> = BTreeMap::new();
    for mapping in &mappings {
        by_stall.entry(mapping.stall_no).or_default().push(mapping);
    }

    let mut counts = StateCounts::default();
    let mut last_updated_at: Option<DateTime<Utc>> = None;
    let mut freshness_values = Vec::new();
    let mut stalls = Vec::new();

    for (stall_no, rooms) in by_stall {
        let mut lite = Vec::new();
        for mapping in rooms {
            let Some(snapshot) = snapshots.get(&mapping.key12) else {
                continue;
            };
            last_updated_at = last_updated_at.max(Some(snapshot.updated_at));

            let freshness = freshness_sec(now, snapshot.updated_at);
            freshness_values.push(freshness);

            let state = classify(&snapshot.sensors, offline_threshold_sec, freshness);
            counts.record(state);

            let breached = if state == RoomState::Offline {
                Vec::new()
            } else {
                breached_channels(&snapshot.sensors)
                    .into_iter()
                    .map(|(channel, _, _)| channel)
                    .collect()
            };

            lite.push(RoomSnapshotLite {
                key12: mapping.key12.clone(),
                stall_no: mapping.stall_no,
                room_no: mapping.room_no,
                vent_mode: mapping.vent_mode,
                blower_count: mapping.blower_count,
                vent_count: mapping.vent_count,
                measure_ts_kst: to_kst_iso(snapshot.measure_ts),
                updated_at_kst: to_kst_iso(snapshot.updated_at),
                freshness_sec: freshness,
                state,
                breached,
            });
        }

        if !lite.is_empty() {
            lite.sort_by_key(|room| room.room_no);
            stalls.push(StallDetail {
                stall_no,
                rooms: lite,
            });
        }
    }

    freshness_values.sort_unstable();

    Ok(FarmDetail {
        server_now_kst: to_kst_iso(now),
        regist_no: regist_no.to_string(),
        total_rooms: counts.total(),
        offline_threshold_sec,
        summary: FarmDetailSummary {
            counts,
            last_updated_at_kst: last_updated_at.map(to_kst_iso),
            freshness_p50_sec: percentile_nearest_rank(&freshness_values, 0.5),
            freshness_p95_sec: percentile_nearest_rank(&freshness_values, 0.95),
        },
        stalls,
    })
}

/// List every room that is not `normal`, most severe first.
pub async fn generate_alerts(
    store: &dyn SnapshotSource,
    estimator: &ThresholdEstimator,
    regist_no: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<AlertsResponse> {
    let mappings = store.room_mappings(regist_no, None).await?;
    let snapshots = snapshots_by_key(store, &mappings).await?;

    let mut thresholds: HashMap<&str, i64> = HashMap::new();
    let mut alerts = Vec::new();

    for mapping in &mappings {
        let offline_threshold_sec = match thresholds.get(mapping.regist_no.as_str()) {
            Some(th) => *th,
            None => {
                let th = estimator
                    .farm_offline_threshold_sec(&mapping.regist_no)
                    .await;
                thresholds.insert(mapping.regist_no.as_str(), th);
                th
            }
        };

        let snapshot = snapshots.get(&mapping.key12);
        let (state, freshness) = room_state(snapshot, offline_threshold_sec, now);
        if state == RoomState::Normal {
            continue;
        }

        alerts.push(RoomAlert {
            key12: mapping.key12.clone(),
            regist_no: mapping.regist_no.clone(),
            stall_no: mapping.stall_no,
            room_no: mapping.room_no,
            state,
            last_seen_kst: snapshot.map(|s| to_kst_iso(s.updated_at)),
            freshness_sec: freshness,
            message: generate_alert_message(mapping, state, snapshot, freshness, offline_threshold_sec),
        });
    }

    alerts.sort_by(|a, b| b.state.cmp(&a.state).then_with(|| a.key12.cmp(&b.key12)));

    Ok(AlertsResponse {
        server_now_kst: to_kst_iso(now),
        alerts,
    })
}

/// Full view of one room: mapping, timing, state, sensors and motors.
///
/// `None` when the room is not mapped or has never reported.
pub async fn compute_room_detail(
    store: &dyn SnapshotSource,
    estimator: &ThresholdEstimator,
    key12: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<RoomDetail>> {
    let Some(mapping) = store.room(key12).await? else {
        debug!(key12 = %key12, "Room is not mapped");
        return Ok(None);
    };
    let Some(snapshot) = store
        .latest_snapshots(&[key12.to_string()])
        .await?
        .into_iter()
        .next()
    else {
        debug!(key12 = %key12, "Room has no snapshot");
        return Ok(None);
    };

    let offline_threshold_sec = estimator
        .farm_offline_threshold_sec(&mapping.regist_no)
        .await;
    let freshness = freshness_sec(now, snapshot.updated_at);
    let state = classify(&snapshot.sensors, offline_threshold_sec, freshness);
    let motors = MotorsView::new(&snapshot.motors, mapping.vent_mode);

    Ok(Some(RoomDetail {
        server_now_kst: to_kst_iso(now),
        timing: RoomTiming {
            measure_ts_kst: to_kst_iso(snapshot.measure_ts),
            updated_at_kst: to_kst_iso(snapshot.updated_at),
            freshness_sec: freshness,
        },
        offline_threshold_sec,
        state,
        sensors: snapshot.sensors,
        motors,
        mapping,
    }))
}

/// One page of a room's state log, newest first.
///
/// Reads one row past `limit`; when it exists the last returned row's
/// `measure_ts` becomes the cursor of the next page.
pub async fn compute_room_logs(
    store: &dyn SnapshotSource,
    key12: &str,
    window: LogWindow,
    limit: usize,
    now: DateTime<Utc>,
) -> anyhow::Result<RoomLogsResponse> {
    let vent_mode = store
        .room(key12)
        .await?
        .map(|mapping| mapping.vent_mode)
        .unwrap_or(VentMode::Exhaust);

    let mut rows = store.room_logs(key12, window, limit + 1).await?;
    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let next_cursor = if has_more {
        rows.last().map(|row| to_kst_iso(row.measure_ts))
    } else {
        None
    };

    let items = rows
        .into_iter()
        .map(|row| RoomLogPoint {
            measure_ts_kst: to_kst_iso(row.measure_ts),
            created_at_kst: to_kst_iso(row.created_at),
            motors: MotorsView::new(&row.motors, vent_mode),
            sensors: row.sensors,
        })
        .collect();

    Ok(RoomLogsResponse {
        server_now_kst: to_kst_iso(now),
        key12: key12.to_string(),
        items,
        next_cursor,
    })
}

/// Minimum number of log rows scanned for the alert history.
const HISTORY_MIN_SCAN: usize = 200;

fn channel_maxima(sensors: &SensorSnapshot) -> ChannelMaxima {
    let max = |channel: SensorChannel| channel_max(sensors.channel(channel));
    ChannelMaxima {
        temperature: max(SensorChannel::Temperature),
        humidity: max(SensorChannel::Humidity),
        co2: max(SensorChannel::Co2),
        ammonia: max(SensorChannel::Ammonia),
        static_pressure: max(SensorChannel::StaticPressure),
    }
}

/// Recent state changes matching `states`, newest first.
///
/// Logged rows are classified on their readings alone, since a logged row
/// was fresh when written. Offline entries come from the most recently
/// updated snapshots that are now past their farm's threshold. Rows of
/// unmapped rooms are skipped.
pub async fn compute_alert_history(
    store: &dyn SnapshotSource,
    estimator: &ThresholdEstimator,
    range: HistoryRange,
    limit: usize,
    states: &[RoomState],
    now: DateTime<Utc>,
) -> anyhow::Result<AlertHistoryResponse> {
    let since = now - chrono::Duration::minutes(range.minutes());
    let logs = store
        .state_logs_since(since, (limit * 3).max(HISTORY_MIN_SCAN))
        .await?;
    let snapshots = store.recent_snapshots(limit).await?;

    let mut key12s: Vec<String> = logs
        .iter()
        .map(|row| row.key12.clone())
        .chain(snapshots.iter().map(|row| row.key12.clone()))
        .collect();
    key12s.sort();
    key12s.dedup();
    let mappings: HashMap<String, RoomMapping> = store
        .mappings_for(&key12s)
        .await?
        .into_iter()
        .map(|m| (m.key12.clone(), m))
        .collect();

    let item = |mapping: &RoomMapping, state, at: DateTime<Utc>, sensors: &SensorSnapshot| {
        AlertHistoryItem {
            key12: mapping.key12.clone(),
            regist_no: mapping.regist_no.clone(),
            stall_no: mapping.stall_no,
            room_no: mapping.room_no,
            state,
            occurred_at_kst: to_kst_iso(at),
            occurred_at: at,
            max_values: channel_maxima(sensors),
        }
    };

    let mut items = Vec::new();
    for log in &logs {
        let Some(mapping) = mappings.get(&log.key12) else {
            continue;
        };
        let state = classify(&log.sensors, i64::MAX, 0);
        if states.contains(&state) {
            items.push(item(mapping, state, log.created_at, &log.sensors));
        }
    }

    if states.contains(&RoomState::Offline) {
        for snapshot in &snapshots {
            let Some(mapping) = mappings.get(&snapshot.key12) else {
                continue;
            };
            let offline_threshold_sec = estimator
                .farm_offline_threshold_sec(&mapping.regist_no)
                .await;
            let freshness = freshness_sec(now, snapshot.updated_at);
            if classify(&snapshot.sensors, offline_threshold_sec, freshness) == RoomState::Offline {
                items.push(item(
                    mapping,
                    RoomState::Offline,
                    snapshot.updated_at,
                    &snapshot.sensors,
                ));
            }
        }
    }

    items.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
    items.truncate(limit);

    Ok(AlertHistoryResponse {
        server_now_kst: to_kst_iso(now),
        items,
    })
}

/// Generate a human-readable alert message.
fn generate_alert_message(
    mapping: &RoomMapping,
    state: RoomState,
    snapshot: Option<&RoomSnapshotRow>,
    freshness: Option<i64>,
    offline_threshold_sec: i64,
) -> String {
    let room = format!(
        "Room {} of stall {} on farm '{}'",
        mapping.room_no, mapping.stall_no, mapping.regist_no
    );

    match (state, snapshot, freshness) {
        (RoomState::Offline, Some(_), Some(freshness)) => format!(
            "OFFLINE: {room} has not reported for {freshness}s \
             (threshold {offline_threshold_sec}s)."
        ),
        (RoomState::Offline, _, _) => format!("OFFLINE: {room} has never reported."),
        (_, Some(snapshot), _) => {
            let details: Vec<String> = breached_channels(&snapshot.sensors)
                .into_iter()
                .map(|(channel, level, max)| {
                    let limits = ChannelLimits::for_channel(channel);
                    let limit = if level == RoomState::Danger {
                        limits.danger
                    } else {
                        limits.warn
                    };
                    format!("{} {} (limit {})", channel.label(), max, limit)
                })
                .collect();
            let prefix = if state == RoomState::Danger {
                "DANGER"
            } else {
                "WARNING"
            };
            format!("{prefix}: {room}: {}.", details.join(", "))
        }
        _ => format!("{room} state: {}", state.as_str()),
    }
}

/// Short-lived cache of the farm summary response.
///
/// The summary touches every mapped room, so repeated dashboard polls
/// within `ttl` reuse the last result.
pub struct SummaryCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, FarmSummaryResponse)>>,
}

impl SummaryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<FarmSummaryResponse> {
        let entry = self.entry.lock().unwrap_or_else(|p| p.into_inner());
        entry
            .as_ref()
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, response)| response.clone())
    }

    pub fn store(&self, response: FarmSummaryResponse) {
        let mut entry = self.entry.lock().unwrap_or_else(|p| p.into_inner());
        *entry = Some((Instant::now(), response));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::EstimatorConfig;
    use crate::model::{MotorSnapshot, RoomLogRow};
    use crate::storage::Storage;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    async fn setup() -> (Arc<Storage>, ThresholdEstimator) {
        let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());
        let estimator = ThresholdEstimator::new(storage.clone(), EstimatorConfig::default());
        (storage, estimator)
    }

    async fn add_room(
        storage: &Storage,
        key12: &str,
        regist_no: &str,
        stall_no: i32,
        room_no: i32,
        snapshot: Option<(SensorSnapshot, DateTime<Utc>)>,
    ) {
        storage
            .upsert_mapping(&RoomMapping {
                key12: key12.to_string(),
                regist_no: regist_no.to_string(),
                stall_no,
                room_no,
                vent_mode: VentMode::Exhaust,
                blower_count: 1,
                vent_count: 2,
            })
            .await
            .unwrap();

        if let Some((sensors, updated_at)) = snapshot {
            storage
                .upsert_snapshot(&RoomSnapshotRow {
                    key12: key12.to_string(),
                    measure_ts: updated_at,
                    updated_at,
                    sensors,
                    motors: MotorSnapshot::default(),
                })
                .await
                .unwrap();
        }
    }

    fn healthy() -> SensorSnapshot {
        SensorSnapshot::from_readings(&[250], &[600], &[1500], &[50], &[300])
    }

    #[tokio::test]
    async fn test_summary_empty() {
        let (storage, estimator) = setup().await;

        let summary = compute_farm_summaries(&*storage, &estimator, Utc::now())
            .await
            .unwrap();

        assert!(summary.items.is_empty());
    }

    #[tokio::test]
    async fn test_summary_counts_states() {
        let (storage, estimator) = setup().await;
        let now = Utc::now();

        add_room(&storage, "FARM01010101", "FARM01", 1, 1, Some((healthy(), now))).await;
        add_room(
            &storage,
            "FARM01010102",
            "FARM01",
            1,
            2,
            Some((SensorSnapshot::from_readings(&[310], &[], &[2000], &[], &[]), now)),
        )
        .await;
        add_room(
            &storage,
            "FARM01010103",
            "FARM01",
            1,
            3,
            Some((
                SensorSnapshot::from_readings(&[], &[], &[3700], &[], &[]),
                now - ChronoDuration::seconds(30),
            )),
        )
        .await;
        // Stale beyond the 211s default.
        add_room(
            &storage,
            "FARM01010104",
            "FARM01",
            1,
            4,
            Some((healthy(), now - ChronoDuration::seconds(212))),
        )
        .await;
        // Never reported.
        add_room(&storage, "FARM01010105", "FARM01", 1, 5, None).await;
        add_room(&storage, "FARM02010101", "FARM02", 1, 1, Some((healthy(), now))).await;

        let summary = compute_farm_summaries(&*storage, &estimator, now)
            .await
            .unwrap();

        assert_eq!(summary.items.len(), 2);
        let farm = &summary.items[0];
        assert_eq!(farm.regist_no, "FARM01");
        assert_eq!(farm.total_rooms, 5);
        assert_eq!(
            farm.counts,
            StateCounts {
                normal: 1,
                warn: 1,
                danger: 1,
                offline: 2,
            }
        );
        assert_eq!(farm.offline_threshold_sec, 211);
        assert_eq!(farm.freshness_sec, Some(0));
        assert_eq!(summary.items[1].counts.normal, 1);
    }

    #[tokio::test]
    async fn test_detail_groups_by_stall_and_skips_missing() {
        let (storage, estimator) = setup().await;
        let now = Utc::now();

        add_room(&storage, "FARM01020102", "FARM01", 2, 2, Some((healthy(), now - ChronoDuration::seconds(40)))).await;
        add_room(&storage, "FARM01020101", "FARM01", 2, 1, Some((healthy(), now - ChronoDuration::seconds(20)))).await;
        add_room(&storage, "FARM01010101", "FARM01", 1, 1, Some((healthy(), now - ChronoDuration::seconds(10)))).await;
        add_room(&storage, "FARM01030101", "FARM01", 3, 1, None).await;

        let detail = compute_farm_detail(&*storage, &estimator, "FARM01", None, now)
            .await
            .unwrap();

        assert_eq!(detail.total_rooms, 3);
        assert_eq!(detail.stalls.len(), 2);
        assert_eq!(detail.stalls[0].stall_no, 1);
        let stall_two: Vec<i32> = detail.stalls[1].rooms.iter().map(|r| r.room_no).collect();
        assert_eq!(stall_two, vec![1, 2]);
        assert_eq!(detail.summary.counts.normal, 3);
        assert_eq!(detail.summary.freshness_p50_sec, Some(20));
        assert_eq!(detail.summary.freshness_p95_sec, Some(40));
    }

    #[tokio::test]
    async fn test_detail_stall_filter_and_range() {
        let (storage, estimator) = setup().await;
        let now = Utc::now();

        add_room(&storage, "FARM01010101", "FARM01", 1, 1, Some((healthy(), now))).await;
        add_room(&storage, "FARM01020101", "FARM01", 2, 1, Some((healthy(), now))).await;

        let only_two = compute_farm_detail(&*storage, &estimator, "FARM01", Some(2), now)
            .await
            .unwrap();
        assert_eq!(only_two.stalls.len(), 1);
        assert_eq!(only_two.stalls[0].stall_no, 2);

        let ignored = compute_farm_detail(&*storage, &estimator, "FARM01", Some(9), now)
            .await
            .unwrap();
        assert_eq!(ignored.stalls.len(), 2);
    }

    #[tokio::test]
    async fn test_detail_unknown_farm() {
        let (storage, estimator) = setup().await;

        let detail = compute_farm_detail(&*storage, &estimator, "NOPE", None, Utc::now())
            .await
            .unwrap();

        assert_eq!(detail.total_rooms, 0);
        assert!(detail.stalls.is_empty());
        assert_eq!(detail.summary.freshness_p50_sec, None);
    }

    #[tokio::test]
    async fn test_alerts_sorted_by_severity() {
        let (storage, estimator) = setup().await;
        let now = Utc::now();

        add_room(&storage, "FARM01010101", "FARM01", 1, 1, Some((healthy(), now))).await;
        add_room(
            &storage,
            "FARM01010102",
            "FARM01",
            1,
            2,
            Some((SensorSnapshot::from_readings(&[310], &[], &[], &[], &[]), now)),
        )
        .await;
        add_room(
            &storage,
            "FARM01010103",
            "FARM01",
            1,
            3,
            Some((SensorSnapshot::from_readings(&[], &[], &[], &[310], &[]), now)),
        )
        .await;
        add_room(&storage, "FARM01010104", "FARM01", 1, 4, None).await;

        let response = generate_alerts(&*storage, &estimator, Some("FARM01"), now)
            .await
            .unwrap();

        let states: Vec<RoomState> = response.alerts.iter().map(|a| a.state).collect();
        assert_eq!(
            states,
            vec![RoomState::Offline, RoomState::Danger, RoomState::Warn]
        );
        assert!(response.alerts[0].message.contains("never reported"));
        assert!(response.alerts[1].message.contains("ammonia 310 (limit 300)"));
        assert!(response.alerts[2].message.starts_with("WARNING"));
    }

    #[tokio::test]
    async fn test_room_detail_found_and_missing() {
        let (storage, estimator) = setup().await;
        let now = Utc::now();

        add_room(&storage, "FARM01010101", "FARM01", 1, 1, None).await;
        storage
            .upsert_mapping(&RoomMapping {
                key12: "FARM01010102".to_string(),
                regist_no: "FARM01".to_string(),
                stall_no: 1,
                room_no: 2,
                vent_mode: VentMode::Intake,
                blower_count: 2,
                vent_count: 4,
            })
            .await
            .unwrap();
        storage
            .upsert_snapshot(&RoomSnapshotRow {
                key12: "FARM01010102".to_string(),
                measure_ts: now - ChronoDuration::seconds(40),
                updated_at: now - ChronoDuration::seconds(30),
                sensors: SensorSnapshot::from_readings(&[], &[850], &[], &[], &[]),
                motors: MotorSnapshot {
                    blower: vec![Some(1), Some(0)],
                    exhaust_vent: None,
                    intake_vent: Some(vec![Some(35)]),
                },
            })
            .await
            .unwrap();

        let detail = compute_room_detail(&*storage, &estimator, "FARM01010102", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.mapping.room_no, 2);
        assert_eq!(detail.state, RoomState::Warn);
        assert_eq!(detail.timing.freshness_sec, 30);
        assert_eq!(detail.offline_threshold_sec, 211);
        assert_eq!(detail.motors.vent_mode, VentMode::Intake);
        assert_eq!(detail.motors.active_vent, vec![Some(35)]);

        // Mapped but never reported.
        assert!(
            compute_room_detail(&*storage, &estimator, "FARM01010101", now)
                .await
                .unwrap()
                .is_none()
        );
        // Not mapped.
        assert!(
            compute_room_detail(&*storage, &estimator, "FARM09999999", now)
                .await
                .unwrap()
                .is_none()
        );
    }

    async fn add_log(storage: &Storage, key12: &str, at: DateTime<Utc>, sensors: SensorSnapshot) {
        storage
            .append_state_log(&RoomLogRow {
                key12: key12.to_string(),
                measure_ts: at,
                created_at: at,
                sensors,
                motors: MotorSnapshot::default(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_room_logs_paging() {
        let (storage, _) = setup().await;
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        add_room(&storage, "FARM01010101", "FARM01", 1, 1, None).await;
        for minutes in 1..=5 {
            add_log(&storage, "FARM01010101", now - ChronoDuration::minutes(minutes), healthy()).await;
        }

        let first = compute_room_logs(&*storage, "FARM01010101", LogWindow::default(), 2, now)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();
        assert_eq!(cursor, to_kst_iso(now - ChronoDuration::minutes(2)));

        let before = DateTime::parse_from_rfc3339(&cursor)
            .unwrap()
            .with_timezone(&Utc);
        let window = LogWindow {
            before: Some(before),
            ..Default::default()
        };
        let second = compute_room_logs(&*storage, "FARM01010101", window, 3, now)
            .await
            .unwrap();
        let times: Vec<String> = second.items.iter().map(|i| i.measure_ts_kst.clone()).collect();
        assert_eq!(
            times,
            vec![
                to_kst_iso(now - ChronoDuration::minutes(3)),
                to_kst_iso(now - ChronoDuration::minutes(4)),
                to_kst_iso(now - ChronoDuration::minutes(5)),
            ]
        );
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_alert_history_filters_states() {
        let (storage, estimator) = setup().await;
        let now = Utc::now();

        // Stale snapshot: offline now.
        add_room(
            &storage,
            "FARM01010101",
            "FARM01",
            1,
            1,
            Some((healthy(), now - ChronoDuration::minutes(15))),
        )
        .await;
        add_room(&storage, "FARM01010102", "FARM01", 1, 2, Some((healthy(), now))).await;

        let warm = SensorSnapshot::from_readings(&[310], &[], &[], &[], &[]);
        let hot = SensorSnapshot::from_readings(&[360], &[], &[], &[], &[]);
        add_log(&storage, "FARM01010102", now - ChronoDuration::minutes(20), warm).await;
        add_log(&storage, "FARM01010102", now - ChronoDuration::minutes(10), hot.clone()).await;
        add_log(&storage, "FARM01010102", now - ChronoDuration::minutes(5), healthy()).await;
        // Outside the one-hour range.
        add_log(&storage, "FARM01010102", now - ChronoDuration::hours(2), hot.clone()).await;
        // Unmapped room.
        add_log(&storage, "FARM09010101", now - ChronoDuration::minutes(1), hot).await;

        let all = compute_alert_history(
            &*storage,
            &estimator,
            HistoryRange::OneHour,
            50,
            &[RoomState::Warn, RoomState::Danger, RoomState::Offline],
            now,
        )
        .await
        .unwrap();
        let states: Vec<RoomState> = all.items.iter().map(|i| i.state).collect();
        assert_eq!(
            states,
            vec![RoomState::Danger, RoomState::Offline, RoomState::Warn]
        );
        assert_eq!(all.items[0].max_values.temperature, 360);
        assert_eq!(all.items[1].key12, "FARM01010101");

        let danger_only = compute_alert_history(
            &*storage,
            &estimator,
            HistoryRange::OneDay,
            1,
            &[RoomState::Danger],
            now,
        )
        .await
        .unwrap();
        assert_eq!(danger_only.items.len(), 1);
        assert_eq!(
            danger_only.items[0].occurred_at,
            DateTime::from_timestamp_millis((now - ChronoDuration::minutes(10)).timestamp_millis())
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_cache_expires() {
        let cache = SummaryCache::new(Duration::from_secs(10));
        assert!(cache.get().is_none());

        cache.store(FarmSummaryResponse {
            server_now_kst: "2026-01-22T10:45:00.000+09:00".to_string(),
            items: vec![],
        });
        assert!(cache.get().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get().is_none());
    }
}
