//! Capabilities the core reads data through.
//!
//! The estimator only needs [`SampleSource`]; farm aggregation additionally
//! uses [`SnapshotSource`]. Both are implemented by the SQLite
//! [`crate::storage::Storage`] and the REST
//! [`crate::data_sources::PostgrestClient`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SourceError;
use crate::model::{IntervalSample, LogWindow, RoomLogRow, RoomMapping, RoomSnapshotRow};

/// History reads used for offline-threshold estimation.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Device-channel identifiers (key12) belonging to a farm.
    async fn farm_key12s(&self, regist_no: &str) -> Result<Vec<String>, SourceError>;

    /// History rows of the given identifiers created at or after `since`,
    /// ordered by identifier then ascending time.
    ///
    /// Implementors batch large identifier sets themselves.
    async fn samples_since(
        &self,
        key12s: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<IntervalSample>, SourceError>;
}

/// Room mappings, snapshots and state logs used by the read endpoints.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Room mappings, optionally restricted to one farm and stall, ordered by
    /// key12.
    async fn room_mappings(
        &self,
        regist_no: Option<&str>,
        stall_no: Option<i32>,
    ) -> Result<Vec<RoomMapping>, SourceError>;

    /// Mapping of a single room unit.
    async fn room(&self, key12: &str) -> Result<Option<RoomMapping>, SourceError>;

    /// Mappings of the given identifiers; unknown identifiers are skipped.
    async fn mappings_for(&self, key12s: &[String]) -> Result<Vec<RoomMapping>, SourceError>;

    /// Latest snapshot of each identifier that has one.
    async fn latest_snapshots(&self, key12s: &[String])
    -> Result<Vec<RoomSnapshotRow>, SourceError>;

    /// The `limit` most recently updated snapshots, newest first.
    async fn recent_snapshots(&self, limit: usize) -> Result<Vec<RoomSnapshotRow>, SourceError>;

    /// State log of one room inside `window`, newest `measure_ts` first.
    async fn room_logs(
        &self,
        key12: &str,
        window: LogWindow,
        limit: usize,
    ) -> Result<Vec<RoomLogRow>, SourceError>;

    /// State log rows of every room created at or after `since`, newest
    /// first.
    async fn state_logs_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RoomLogRow>, SourceError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), SourceError>;
}

/// A store that serves both the estimator and aggregation.
pub trait BarnStore: SampleSource + SnapshotSource {}

impl<T: SampleSource + SnapshotSource> BarnStore for T {}
