//! SQLite storage layer for Barnwatch.
//!
//! Holds room mappings, the room state log the estimator reads reporting
//! cadence from, and the latest raw snapshot per room. Timestamps are stored
//! as Unix milliseconds, sensor and motor channels as JSON documents.
//!
//! Nothing upstream writes into this store. It is filled through the write
//! methods below, either by [`Storage::seed`] at startup (see
//! `BARNWATCH_SEED_FILE`) or directly from tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;

use crate::error::SourceError;
use crate::model::{
    IntervalSample, LogWindow, MotorSnapshot, RoomLogRow, RoomMapping, RoomSnapshotRow,
    SensorSnapshot, VentMode,
};
use crate::source::{SampleSource, SnapshotSource};

const MAPPING_COLUMNS: &str =
    "key12, regist_no, stall_no, room_no, vent_mode, blower_count, vent_count";
const SNAPSHOT_COLUMNS: &str = "key12, measure_ts, updated_at, sensors, motors";
const LOG_COLUMNS: &str = "key12, measure_ts, created_at, sensors, motors";

/// Rows loaded into an empty store at startup.
#[derive(Debug, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub mappings: Vec<RoomMapping>,
    #[serde(default)]
    pub snapshots: Vec<RoomSnapshotRow>,
    #[serde(default)]
    pub state_logs: Vec<RoomLogRow>,
}

/// Identifiers bound per `IN (...)` query.
const KEY12_CHUNK: usize = 500;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:barnwatch.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self, SourceError> {
        // A single connection keeps "sqlite::memory:" one shared database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<(), SourceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS room_mapping (
                key12 TEXT PRIMARY KEY,
                regist_no TEXT NOT NULL,
                stall_no INTEGER NOT NULL,
                room_no INTEGER NOT NULL,
                vent_mode TEXT NOT NULL,
                blower_count INTEGER NOT NULL,
                vent_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_room_mapping_regist_no
            ON room_mapping(regist_no, stall_no)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS room_state_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key12 TEXT NOT NULL,
                measure_ts INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                sensors TEXT NOT NULL,
                motors TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_room_state_log_key12_created
            ON room_state_log(key12, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_room_state_log_key12_measure
            ON room_state_log(key12, measure_ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_room_state_log_created
            ON room_state_log(created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS room_snapshot (
                key12 TEXT PRIMARY KEY,
                measure_ts INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                sensors TEXT NOT NULL,
                motors TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace the mapping of a room unit.
    pub async fn upsert_mapping(&self, mapping: &RoomMapping) -> Result<(), SourceError> {
        sqlx::query(
            r#"
            INSERT INTO room_mapping
                (key12, regist_no, stall_no, room_no, vent_mode, blower_count, vent_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key12) DO UPDATE SET
                regist_no = excluded.regist_no,
                stall_no = excluded.stall_no,
                room_no = excluded.room_no,
                vent_mode = excluded.vent_mode,
                blower_count = excluded.blower_count,
                vent_count = excluded.vent_count
            "#,
        )
        .bind(&mapping.key12)
        .bind(&mapping.regist_no)
        .bind(mapping.stall_no)
        .bind(mapping.room_no)
        .bind(mapping.vent_mode.as_str())
        .bind(mapping.blower_count)
        .bind(mapping.vent_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a state log row.
    pub async fn append_state_log(&self, log: &RoomLogRow) -> Result<(), SourceError> {
        let sensors = serde_json::to_string(&log.sensors)?;
        let motors = serde_json::to_string(&log.motors)?;

        sqlx::query(
            r#"
            INSERT INTO room_state_log (key12, measure_ts, created_at, sensors, motors)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.key12)
        .bind(log.measure_ts.timestamp_millis())
        .bind(log.created_at.timestamp_millis())
        .bind(sensors)
        .bind(motors)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append an empty state log row, measured when it was created.
    pub async fn record_state_log(
        &self,
        key12: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), SourceError> {
        self.append_state_log(&RoomLogRow {
            key12: key12.to_string(),
            measure_ts: created_at,
            created_at,
            sensors: SensorSnapshot::default(),
            motors: MotorSnapshot::default(),
        })
        .await
    }

    /// Insert or replace the latest snapshot of a room unit.
    pub async fn upsert_snapshot(&self, snapshot: &RoomSnapshotRow) -> Result<(), SourceError> {
        let sensors = serde_json::to_string(&snapshot.sensors)?;
        let motors = serde_json::to_string(&snapshot.motors)?;

        sqlx::query(
            r#"
            INSERT INTO room_snapshot (key12, measure_ts, updated_at, sensors, motors)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key12) DO UPDATE SET
                measure_ts = excluded.measure_ts,
                updated_at = excluded.updated_at,
                sensors = excluded.sensors,
                motors = excluded.motors
            "#,
        )
        .bind(&snapshot.key12)
        .bind(snapshot.measure_ts.timestamp_millis())
        .bind(snapshot.updated_at.timestamp_millis())
        .bind(sensors)
        .bind(motors)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load mappings, snapshots and state logs in one pass.
    pub async fn seed(&self, data: &SeedData) -> Result<(), SourceError> {
        for mapping in &data.mappings {
            self.upsert_mapping(mapping).await?;
        }
        for snapshot in &data.snapshots {
            self.upsert_snapshot(snapshot).await?;
        }
        for log in &data.state_logs {
            self.append_state_log(log).await?;
        }

        info!(
            mappings = data.mappings.len(),
            snapshots = data.snapshots.len(),
            state_logs = data.state_logs.len(),
            "Store seeded"
        );
        Ok(())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, SourceError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| SourceError::Timestamp(ms.to_string()))
}

fn mapping_from_row(row: &SqliteRow) -> RoomMapping {
    let vent_mode: String = row.get("vent_mode");
    RoomMapping {
        key12: row.get("key12"),
        regist_no: row.get("regist_no"),
        stall_no: row.get("stall_no"),
        room_no: row.get("room_no"),
        vent_mode: VentMode::parse(&vent_mode),
        blower_count: row.get("blower_count"),
        vent_count: row.get("vent_count"),
    }
}

fn snapshot_from_row(row: &SqliteRow) -> Result<RoomSnapshotRow, SourceError> {
    let sensors: String = row.get("sensors");
    let motors: String = row.get("motors");
    Ok(RoomSnapshotRow {
        key12: row.get("key12"),
        measure_ts: from_millis(row.get("measure_ts"))?,
        updated_at: from_millis(row.get("updated_at"))?,
        sensors: serde_json::from_str(&sensors)?,
        motors: serde_json::from_str(&motors)?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<RoomLogRow, SourceError> {
    let sensors: String = row.get("sensors");
    let motors: String = row.get("motors");
    Ok(RoomLogRow {
        key12: row.get("key12"),
        measure_ts: from_millis(row.get("measure_ts"))?,
        created_at: from_millis(row.get("created_at"))?,
        sensors: serde_json::from_str(&sensors)?,
        motors: serde_json::from_str(&motors)?,
    })
}

/// Append `key12 IN (?, ?, ...)` for one chunk of identifiers.
fn push_key12_list(query: &mut QueryBuilder<'_, Sqlite>, chunk: &[String]) {
    query.push("key12 IN (");
    let mut ids = query.separated(", ");
    for key12 in chunk {
        ids.push_bind(key12.clone());
    }
    ids.push_unseparated(")");
}

#[async_trait]
impl SampleSource for Storage {
    async fn farm_key12s(&self, regist_no: &str) -> Result<Vec<String>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT key12 FROM room_mapping
            WHERE regist_no = ?
            ORDER BY key12
            "#,
        )
        .bind(regist_no)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("key12")).collect())
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
            let mut query = QueryBuilder::<Sqlite>::new(
                "SELECT key12, created_at FROM room_state_log WHERE created_at >= ",
            );
            query.push_bind(since.timestamp_millis());
            query.push(" AND ");
            push_key12_list(&mut query, chunk);
            query.push(" ORDER BY key12, created_at");

            let rows = query.build().fetch_all(&self.pool).await?;
            for row in &rows {
                samples.push(IntervalSample {
                    key12: row.get("key12"),
                    created_at: from_millis(row.get("created_at"))?,
                });
            }
        }

        Ok(samples)
    }
}

#[async_trait]
impl SnapshotSource for Storage {
    async fn room_mappings(
        &self,
        regist_no: Option<&str>,
        stall_no: Option<i32>,
    ) -> Result<Vec<RoomMapping>, SourceError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MAPPING_COLUMNS} FROM room_mapping WHERE 1 = 1"
        ));
        if let Some(regist_no) = regist_no {
            query.push(" AND regist_no = ").push_bind(regist_no);
        }
        if let Some(stall_no) = stall_no {
            query.push(" AND stall_no = ").push_bind(stall_no);
        }
        query.push(" ORDER BY key12");

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(mapping_from_row).collect())
    }

    async fn latest_snapshots(
        &self,
        key12s: &[String],
    ) -> Result<Vec<RoomSnapshotRow>, SourceError> {
        let mut snapshots = Vec::new();
        for chunk in key12s.chunks(KEY12_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM room_snapshot WHERE "
            ));
            push_key12_list(&mut query, chunk);

            let rows = query.build().fetch_all(&self.pool).await?;
            for row in &rows {
                snapshots.push(snapshot_from_row(row)?);
            }
        }

        Ok(snapshots)
    }

    async fn room(&self, key12: &str) -> Result<Option<RoomMapping>, SourceError> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM room_mapping WHERE key12 = ?"
        ))
        .bind(key12)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(mapping_from_row))
    }

    async fn mappings_for(&self, key12s: &[String]) -> Result<Vec<RoomMapping>, SourceError> {
        let mut mappings = Vec::new();
        for chunk in key12s.chunks(KEY12_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {MAPPING_COLUMNS} FROM room_mapping WHERE "
            ));
            push_key12_list(&mut query, chunk);

            let rows = query.build().fetch_all(&self.pool).await?;
            mappings.extend(rows.iter().map(mapping_from_row));
        }

        Ok(mappings)
    }

    async fn recent_snapshots(&self, limit: usize) -> Result<Vec<RoomSnapshotRow>, SourceError> {
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM room_snapshot ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn room_logs(
        &self,
        key12: &str,
        window: LogWindow,
        limit: usize,
    ) -> Result<Vec<RoomLogRow>, SourceError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {LOG_COLUMNS} FROM room_state_log WHERE key12 = "
        ));
        query.push_bind(key12.to_string());
        if let Some(from) = window.from {
            query.push(" AND measure_ts >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = window.to {
            query.push(" AND measure_ts <= ").push_bind(to.timestamp_millis());
        }
        if let Some(before) = window.before {
            query.push(" AND measure_ts < ").push_bind(before.timestamp_millis());
        }
        query.push(" ORDER BY measure_ts DESC, id DESC LIMIT ");
        query.push_bind(limit as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn state_logs_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RoomLogRow>, SourceError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM room_state_log \
             WHERE created_at >= ? ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(since.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }

    async fn ping(&self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
