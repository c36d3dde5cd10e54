//! PostgREST (Supabase REST) client.
//!
//! Reads the hosted barn tables over `/rest/v1/<table>`:
//!
//! - `eqpmn_mapping_set_v3`: room unit to farm/stall/room mapping
//! - `room_state_log_v3`: one row per reported room state, used for cadence
//! - `room_raw_snapshot_v3`: latest raw readings per room unit
//!
//! Identifier lists are sent as `in.(...)` filters, so large lists are split
//! into chunks to keep request URLs bounded, and each chunk is paged through
//! with `limit`/`offset` because the server caps rows per response.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;
use crate::model::{
    IntervalSample, LogWindow, MotorSnapshot, RoomLogRow, RoomMapping, RoomSnapshotRow,
    SensorChannel, SensorSnapshot, VentMode,
};
use crate::source::{SampleSource, SnapshotSource};

const MAPPING_TABLE: &str = "eqpmn_mapping_set_v3";
const STATE_LOG_TABLE: &str = "room_state_log_v3";
const SNAPSHOT_TABLE: &str = "room_raw_snapshot_v3";

/// Identifiers per `in.(...)` filter.
const KEY12_CHUNK: usize = 100;

/// Rows requested per page.
const PAGE_SIZE: usize = 1000;

const MAPPING_SELECT: &str =
    "key12,isind_regist_no,stall_no,room_no,vent_mode,blower_count,vent_count";

/// Motor output columns.
const MOTOR_COLUMNS: &str = "ec01,ec02,ec03";

/// Client for a PostgREST endpoint.
#[derive(Clone)]
pub struct PostgrestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// A single `column=operator.value` filter.
type Filter = (&'static str, String);

impl PostgrestClient {
    /// Create a client for `project_url` (e.g. `https://xyz.supabase.co`).
    ///
    /// Every request is bounded by `timeout`.
    pub fn new(project_url: &str, api_key: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }

    /// Build the request URL for a table query.
    fn table_url(&self, table: &str, select: &str, filters: &[Filter]) -> String {
        let mut url = format!(
            "{}/{}?select={}",
            self.base_url,
            table,
            urlencoding::encode(select)
        );
        for (column, condition) in filters {
            url.push('&');
            url.push_str(column);
            url.push('=');
            url.push_str(&urlencoding::encode(condition));
        }
        url
    }

    /// Run one SELECT and decode the JSON array it returns.
    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        select: &str,
        filters: &[Filter],
    ) -> Result<Vec<T>, SourceError> {
        let url = self.table_url(table, select, filters);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status { status, body });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Page through a SELECT until a short page arrives.
    async fn select_all<T: DeserializeOwned>(
        &self,
        table: &str,
        select: &str,
        filters: &[Filter],
    ) -> Result<Vec<T>, SourceError> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let mut paged = filters.to_vec();
            paged.push(("limit", PAGE_SIZE.to_string()));
            paged.push(("offset", offset.to_string()));

            let page: Vec<T> = self.select(table, select, &paged).await?;
            let len = page.len();
            all.extend(page);
            if len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        debug!(table, rows = all.len(), "PostgREST select finished");
        Ok(all)
    }
}

/// `in.(a,b,c)` filter value.
fn in_list(values: &[String]) -> String {
    format!("in.({})", values.join(","))
}

fn timestamp_filter(op: &str, at: DateTime<Utc>) -> String {
    format!("{op}.{}", at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// `select` list of a snapshot or log table: `leading` columns, then every
/// sensor and motor column.
fn channel_select(leading: &str) -> String {
    let sensors: Vec<&str> = SensorChannel::ALL.iter().map(|c| c.wire_key()).collect();
    format!("{leading},{},{MOTOR_COLUMNS}", sensors.join(","))
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Key12Row {
    key12: String,
}

#[derive(Debug, Deserialize)]
struct MappingRow {
    key12: String,
    isind_regist_no: String,
    stall_no: i32,
    room_no: i32,
    #[serde(default)]
    vent_mode: Option<String>,
    #[serde(default)]
    blower_count: Option<i32>,
    #[serde(default)]
    vent_count: Option<i32>,
}

impl From<MappingRow> for RoomMapping {
    fn from(row: MappingRow) -> Self {
        RoomMapping {
            key12: row.key12,
            regist_no: row.isind_regist_no,
            stall_no: row.stall_no,
            room_no: row.room_no,
            vent_mode: VentMode::parse(row.vent_mode.as_deref().unwrap_or_default()),
            blower_count: row.blower_count.unwrap_or(0),
            vent_count: row.vent_count.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StateLogRow {
    key12: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SnapshotRow {
    key12: String,
    measure_ts: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    sensors: SensorSnapshot,
    #[serde(flatten)]
    motors: MotorSnapshot,
}

impl From<SnapshotRow> for RoomSnapshotRow {
    fn from(row: SnapshotRow) -> Self {
        RoomSnapshotRow {
            key12: row.key12,
            measure_ts: row.measure_ts.unwrap_or(row.updated_at),
            updated_at: row.updated_at,
            sensors: row.sensors,
            motors: row.motors,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    key12: String,
    measure_ts: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    sensors: SensorSnapshot,
    #[serde(flatten)]
    motors: MotorSnapshot,
}

impl From<HistoryRow> for RoomLogRow {
    fn from(row: HistoryRow) -> Self {
        RoomLogRow {
            key12: row.key12,
            measure_ts: row.measure_ts.unwrap_or(row.created_at),
            created_at: row.created_at,
            sensors: row.sensors,
            motors: row.motors,
        }
    }
}

#[async_trait]
impl SampleSource for PostgrestClient {
    async fn farm_key12s(&self, regist_no: &str) -> Result<Vec<String>, SourceError> {
        let rows: Vec<Key12Row> = self
            .select_all(
                MAPPING_TABLE,
                "key12",
                &[
                    ("isind_regist_no", format!("eq.{regist_no}")),
                    ("order", "key12".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.key12).collect())
    }

    async fn samples_since(
        &self,
        key12s: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<IntervalSample>, SourceError> {
        let mut sorted = key12s.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut samples = Vec::new();
        for chunk in sorted.chunks(KEY12_CHUNK) {
            let rows: Vec<StateLogRow> = self
                .select_all(
                    STATE_LOG_TABLE,
                    "key12,created_at",
                    &[
                        ("key12", in_list(chunk)),
                        ("created_at", timestamp_filter("gte", since)),
                        ("order", "key12,created_at.asc".to_string()),
                    ],
                )
                .await?;
            samples.extend(rows.into_iter().map(|r| IntervalSample {
                key12: r.key12,
                created_at: r.created_at,
            }));
        }
        Ok(samples)
    }
}

#[async_trait]
impl SnapshotSource for PostgrestClient {
    async fn room_mappings(
        &self,
        regist_no: Option<&str>,
        stall_no: Option<i32>,
    ) -> Result<Vec<RoomMapping>, SourceError> {
        let mut filters: Vec<Filter> = Vec::new();
        if let Some(regist_no) = regist_no {
            filters.push(("isind_regist_no", format!("eq.{regist_no}")));
        }
        if let Some(stall_no) = stall_no {
            filters.push(("stall_no", format!("eq.{stall_no}")));
        }
        filters.push(("order", "key12".to_string()));

        let rows: Vec<MappingRow> = self
            .select_all(MAPPING_TABLE, MAPPING_SELECT, &filters)
            .await?;
        Ok(rows.into_iter().map(RoomMapping::from).collect())
    }

    async fn room(&self, key12: &str) -> Result<Option<RoomMapping>, SourceError> {
        let rows: Vec<MappingRow> = self
            .select(
                MAPPING_TABLE,
                MAPPING_SELECT,
                &[("key12", format!("eq.{key12}")), ("limit", "1".to_string())],
            )
            .await?;
        Ok(rows.into_iter().next().map(RoomMapping::from))
    }

    async fn mappings_for(&self, key12s: &[String]) -> Result<Vec<RoomMapping>, SourceError> {
        let mut mappings = Vec::new();
        for chunk in key12s.chunks(KEY12_CHUNK) {
            let rows: Vec<MappingRow> = self
                .select_all(MAPPING_TABLE, MAPPING_SELECT, &[("key12", in_list(chunk))])
                .await?;
            mappings.extend(rows.into_iter().map(RoomMapping::from));
        }
        Ok(mappings)
    }

    async fn recent_snapshots(&self, limit: usize) -> Result<Vec<RoomSnapshotRow>, SourceError> {
        let rows: Vec<SnapshotRow> = self
            .select(
                SNAPSHOT_TABLE,
                &channel_select("key12,measure_ts,updated_at"),
                &[
                    ("order", "updated_at.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(RoomSnapshotRow::from).collect())
    }

    async fn room_logs(
        &self,
        key12: &str,
        window: LogWindow,
        limit: usize,
    ) -> Result<Vec<RoomLogRow>, SourceError> {
        let mut filters: Vec<Filter> = vec![("key12", format!("eq.{key12}"))];
        if let Some(from) = window.from {
            filters.push(("measure_ts", timestamp_filter("gte", from)));
        }
        if let Some(to) = window.to {
            filters.push(("measure_ts", timestamp_filter("lte", to)));
        }
        if let Some(before) = window.before {
            filters.push(("measure_ts", timestamp_filter("lt", before)));
        }
        filters.push(("order", "measure_ts.desc".to_string()));
        filters.push(("limit", limit.to_string()));

        let rows: Vec<HistoryRow> = self
            .select(
                STATE_LOG_TABLE,
                &channel_select("key12,measure_ts,created_at"),
                &filters,
            )
            .await?;
        Ok(rows.into_iter().map(RoomLogRow::from).collect())
    }

    async fn state_logs_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RoomLogRow>, SourceError> {
        let rows: Vec<HistoryRow> = self
            .select(
                STATE_LOG_TABLE,
                &channel_select("key12,measure_ts,created_at"),
                &[
                    ("created_at", timestamp_filter("gte", since)),
                    ("order", "created_at.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(RoomLogRow::from).collect())
    }

    async fn latest_snapshots(
        &self,
        key12s: &[String],
    ) -> Result<Vec<RoomSnapshotRow>, SourceError> {
        let select = channel_select("key12,measure_ts,updated_at");

        let mut snapshots = Vec::new();
        for chunk in key12s.chunks(KEY12_CHUNK) {
            let rows: Vec<SnapshotRow> = self
                .select_all(SNAPSHOT_TABLE, &select, &[("key12", in_list(chunk))])
                .await?;
            snapshots.extend(rows.into_iter().map(RoomSnapshotRow::from));
        }
        Ok(snapshots)
    }

    async fn ping(&self) -> Result<(), SourceError> {
        let _: Vec<Key12Row> = self
            .select(SNAPSHOT_TABLE, "key12", &[("limit", "1".to_string())])
            .await?;
        Ok(())
    }
}
