//! Data models for Barnwatch.
//!
//! Sensor readings are kept in raw device units. Several channels are stored
//! pre-scaled by ten (temperature 30.0C arrives as `300`), so every
//! comparison in [`crate::classify`] happens against raw-unit limits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One of the five environment channels reported by a room unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorChannel {
    Temperature,
    Humidity,
    Co2,
    Ammonia,
    StaticPressure,
}

impl SensorChannel {
    /// Every channel, in wire order.
    pub const ALL: [SensorChannel; 5] = [
        SensorChannel::Temperature,
        SensorChannel::Humidity,
        SensorChannel::Co2,
        SensorChannel::Ammonia,
        SensorChannel::StaticPressure,
    ];

    /// Column name used by the upstream store (`es01` .. `es09`).
    pub fn wire_key(&self) -> &'static str {
        match self {
            SensorChannel::Temperature => "es01",
            SensorChannel::Humidity => "es02",
            SensorChannel::Co2 => "es03",
            SensorChannel::Ammonia => "es04",
            SensorChannel::StaticPressure => "es09",
        }
    }

    /// Human-readable channel name.
    pub fn label(&self) -> &'static str {
        match self {
            SensorChannel::Temperature => "temperature",
            SensorChannel::Humidity => "humidity",
            SensorChannel::Co2 => "co2",
            SensorChannel::Ammonia => "ammonia",
            SensorChannel::StaticPressure => "static pressure",
        }
    }
}

/// Latest sensor readings of one room.
///
/// A device may report several readings per channel, so each channel is a
/// sequence. An empty sequence means the sensor is not installed. Entries
/// that were null or non-numeric upstream are kept as `None` and ignored by
/// the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    #[serde(default, alias = "es01", deserialize_with = "lenient_readings")]
    pub temperature: Vec<Option<i64>>,

    #[serde(default, alias = "es02", deserialize_with = "lenient_readings")]
    pub humidity: Vec<Option<i64>>,

    #[serde(default, alias = "es03", deserialize_with = "lenient_readings")]
    pub co2: Vec<Option<i64>>,

    #[serde(default, alias = "es04", deserialize_with = "lenient_readings")]
    pub ammonia: Vec<Option<i64>>,

    #[serde(
        default,
        alias = "es09",
        alias = "staticPressure",
        deserialize_with = "lenient_readings"
    )]
    pub static_pressure: Vec<Option<i64>>,
}

impl SensorSnapshot {
    /// Readings of a single channel.
    pub fn channel(&self, channel: SensorChannel) -> &[Option<i64>] {
        match channel {
            SensorChannel::Temperature => &self.temperature,
            SensorChannel::Humidity => &self.humidity,
            SensorChannel::Co2 => &self.co2,
            SensorChannel::Ammonia => &self.ammonia,
            SensorChannel::StaticPressure => &self.static_pressure,
        }
    }

    /// Build a snapshot from fully numeric channel arrays.
    pub fn from_readings(
        temperature: &[i64],
        humidity: &[i64],
        co2: &[i64],
        ammonia: &[i64],
        static_pressure: &[i64],
    ) -> Self {
        let wrap = |values: &[i64]| values.iter().copied().map(Some).collect();
        Self {
            temperature: wrap(temperature),
            humidity: wrap(humidity),
            co2: wrap(co2),
            ammonia: wrap(ammonia),
            static_pressure: wrap(static_pressure),
        }
    }
}

/// Latest motor outputs of one room.
///
/// Blowers (`ec01`) are always reported. Rooms report their vent outputs
/// either as exhaust (`ec02`) or intake (`ec03`); the other is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorSnapshot {
    #[serde(default, alias = "ec01", deserialize_with = "lenient_readings")]
    pub blower: Vec<Option<i64>>,

    #[serde(default, alias = "ec02", deserialize_with = "lenient_optional_readings")]
    pub exhaust_vent: Option<Vec<Option<i64>>>,

    #[serde(default, alias = "ec03", deserialize_with = "lenient_optional_readings")]
    pub intake_vent: Option<Vec<Option<i64>>>,
}

impl MotorSnapshot {
    /// Whichever vent output the room reports, exhaust first.
    pub fn active_vent(&self) -> &[Option<i64>] {
        self.exhaust_vent
            .as_deref()
            .or(self.intake_vent.as_deref())
            .unwrap_or_default()
    }
}

/// Accepts `null` for a whole channel and maps every non-numeric entry to
/// `None`. Fractional numbers are floored, which keeps `>=` against integer
/// limits unchanged.
fn lenient_readings<'de, D>(deserializer: D) -> Result<Vec<Option<i64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .iter()
        .map(reading_from_value)
        .collect())
}

/// Like [`lenient_readings`], but keeps a `null` channel distinct from an
/// empty one.
fn lenient_optional_readings<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<Option<i64>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|values| values.iter().map(reading_from_value).collect()))
}

fn reading_from_value(value: &serde_json::Value) -> Option<i64> {
    let serde_json::Value::Number(number) = value else {
        return None;
    };
    if let Some(v) = number.as_i64() {
        return Some(v);
    }
    number
        .as_f64()
        .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
        .map(|f| f.floor() as i64)
}

/// Health state of a room.
///
/// Recomputed on every classification; the core never stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomState {
    /// No channel reached its warn limit.
    Normal,
    /// At least one channel reached its warn limit.
    Warn,
    /// At least one channel reached its danger limit.
    Danger,
    /// The latest reading is older than the farm's offline threshold.
    Offline,
}

impl RoomState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomState::Normal => "normal",
            RoomState::Warn => "warn",
            RoomState::Danger => "danger",
            RoomState::Offline => "offline",
        }
    }

    /// Parse a lowercase state name, ignoring surrounding whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "normal" => Some(RoomState::Normal),
            "warn" => Some(RoomState::Warn),
            "danger" => Some(RoomState::Danger),
            "offline" => Some(RoomState::Offline),
            _ => None,
        }
    }
}

/// Which threshold a value applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThresholdScope {
    Global,
    Farm(String),
}

/// A timestamped history row of one device channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSample {
    pub key12: String,
    pub created_at: DateTime<Utc>,
}

/// Ventilation mode of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VentMode {
    Exhaust,
    Intake,
}

impl VentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VentMode::Exhaust => "exhaust",
            VentMode::Intake => "intake",
        }
    }

    /// Parse the store's text column. Unknown values read as exhaust.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "intake" => VentMode::Intake,
            _ => VentMode::Exhaust,
        }
    }
}

/// Mapping of one room unit (key12) to its farm, stall and room numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMapping {
    pub key12: String,
    pub regist_no: String,
    pub stall_no: i32,
    pub room_no: i32,
    pub vent_mode: VentMode,
    pub blower_count: i32,
    pub vent_count: i32,
}

/// Latest raw snapshot of a room as stored upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomSnapshotRow {
    pub key12: String,
    pub measure_ts: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sensors: SensorSnapshot,
    #[serde(default)]
    pub motors: MotorSnapshot,
}

/// One row of a room's state log: what the room reported at `measure_ts`,
/// stored at `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomLogRow {
    pub key12: String,
    pub measure_ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sensors: SensorSnapshot,
    #[serde(default)]
    pub motors: MotorSnapshot,
}

/// Bounds of a room log read. All bounds are optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogWindow {
    /// Inclusive lower bound on `measure_ts`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `measure_ts`.
    pub to: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `measure_ts`, from a paging cursor.
    pub before: Option<DateTime<Utc>>,
}

/// Room counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub normal: u32,
    pub warn: u32,
    pub danger: u32,
    pub offline: u32,
}

impl StateCounts {
    pub fn record(&mut self, state: RoomState) {
        match state {
            RoomState::Normal => self.normal += 1,
            RoomState::Warn => self.warn += 1,
            RoomState::Danger => self.danger += 1,
            RoomState::Offline => self.offline += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.normal + self.warn + self.danger + self.offline
    }
}

/// One row of `GET /farms/summary`.
#[derive(Debug, Clone, Serialize)]
pub struct FarmSummary {
    pub regist_no: String,
    pub total_rooms: u32,
    #[serde(flatten)]
    pub counts: StateCounts,
    pub offline_threshold_sec: i64,
    pub last_updated_at_kst: Option<String>,
    pub freshness_sec: Option<i64>,
}

/// Response for `GET /farms/summary`.
#[derive(Debug, Clone, Serialize)]
pub struct FarmSummaryResponse {
    pub server_now_kst: String,
    pub items: Vec<FarmSummary>,
}

/// A room inside a farm detail response.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshotLite {
    pub key12: String,
    pub stall_no: i32,
    pub room_no: i32,
    pub vent_mode: VentMode,
    pub blower_count: i32,
    pub vent_count: i32,
    pub measure_ts_kst: String,
    pub updated_at_kst: String,
    pub freshness_sec: i64,
    pub state: RoomState,
    /// Channels at or above their warn limit, most severe first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub breached: Vec<SensorChannel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StallDetail {
    pub stall_no: i32,
    pub rooms: Vec<RoomSnapshotLite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmDetailSummary {
    #[serde(flatten)]
    pub counts: StateCounts,
    pub last_updated_at_kst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness_p50_sec: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness_p95_sec: Option<i64>,
}

/// Response for `GET /farms/:regist_no/detail`.
#[derive(Debug, Clone, Serialize)]
pub struct FarmDetail {
    pub server_now_kst: String,
    pub regist_no: String,
    pub total_rooms: u32,
    pub offline_threshold_sec: i64,
    pub summary: FarmDetailSummary,
    pub stalls: Vec<StallDetail>,
}

/// Query parameters for `GET /farms/:regist_no/detail`.
#[derive(Debug, Default, Deserialize)]
pub struct FarmDetailQuery {
    /// Restrict to one stall (1-3). Unparseable or out-of-range values are
    /// ignored.
    pub stall_no: Option<String>,
}

impl FarmDetailQuery {
    pub fn stall_no(&self) -> Option<i32> {
        self.stall_no.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

/// Motor outputs as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MotorsView {
    pub blower: Vec<Option<i64>>,
    pub vent_mode: VentMode,
    pub exhaust_vent: Option<Vec<Option<i64>>>,
    pub intake_vent: Option<Vec<Option<i64>>>,
    pub active_vent: Vec<Option<i64>>,
}

impl MotorsView {
    pub fn new(motors: &MotorSnapshot, vent_mode: VentMode) -> Self {
        Self {
            blower: motors.blower.clone(),
            vent_mode,
            exhaust_vent: motors.exhaust_vent.clone(),
            intake_vent: motors.intake_vent.clone(),
            active_vent: motors.active_vent().to_vec(),
        }
    }
}

/// Timing block of a room detail.
#[derive(Debug, Clone, Serialize)]
pub struct RoomTiming {
    pub measure_ts_kst: String,
    pub updated_at_kst: String,
    pub freshness_sec: i64,
}

/// Response for `GET /rooms/:key12`.
#[derive(Debug, Clone, Serialize)]
pub struct RoomDetail {
    pub server_now_kst: String,
    pub mapping: RoomMapping,
    pub timing: RoomTiming,
    pub offline_threshold_sec: i64,
    pub state: RoomState,
    pub sensors: SensorSnapshot,
    pub motors: MotorsView,
}

/// Default page size of a room log read.
pub const ROOM_LOGS_DEFAULT_LIMIT: usize = 120;

/// Largest page size of a room log read.
pub const ROOM_LOGS_MAX_LIMIT: usize = 300;

/// Query parameters for `GET /rooms/:key12/logs`.
///
/// Timestamps are RFC 3339 in any offset. Values that do not parse are
/// ignored rather than rejected.
#[derive(Debug, Default, Deserialize)]
pub struct RoomLogsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<String>,
    /// `next_cursor` of the previous page.
    pub cursor: Option<String>,
}

impl RoomLogsQuery {
    /// Page size, clamped to 1-300.
    pub fn limit(&self) -> usize {
        parse_clamped(self.limit.as_deref(), ROOM_LOGS_DEFAULT_LIMIT, ROOM_LOGS_MAX_LIMIT)
    }

    pub fn window(&self) -> LogWindow {
        LogWindow {
            from: self.from.as_deref().and_then(parse_timestamp),
            to: self.to.as_deref().and_then(parse_timestamp),
            before: self.cursor.as_deref().and_then(parse_timestamp),
        }
    }
}

/// One point of a room's log.
#[derive(Debug, Clone, Serialize)]
pub struct RoomLogPoint {
    pub measure_ts_kst: String,
    pub created_at_kst: String,
    pub sensors: SensorSnapshot,
    pub motors: MotorsView,
}

/// Response for `GET /rooms/:key12/logs`.
#[derive(Debug, Clone, Serialize)]
pub struct RoomLogsResponse {
    pub server_now_kst: String,
    pub key12: String,
    pub items: Vec<RoomLogPoint>,
    /// Pass back as `cursor` to read the next (older) page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Look-back range of the alert history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    OneHour,
    SixHours,
    OneDay,
}

impl HistoryRange {
    /// Parse `1h`, `6h` or `24h`. Anything else reads as six hours.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("1h") => HistoryRange::OneHour,
            Some("24h") => HistoryRange::OneDay,
            _ => HistoryRange::SixHours,
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            HistoryRange::OneHour => 60,
            HistoryRange::SixHours => 360,
            HistoryRange::OneDay => 1440,
        }
    }
}

pub const ALERT_HISTORY_DEFAULT_LIMIT: usize = 50;
pub const ALERT_HISTORY_MAX_LIMIT: usize = 200;

/// Query parameters for `GET /alerts/history`.
#[derive(Debug, Default, Deserialize)]
pub struct AlertHistoryQuery {
    /// `1h`, `6h` (default) or `24h`.
    pub range: Option<String>,
    pub limit: Option<String>,
    /// Comma-separated states; defaults to `warn,danger,offline`.
    pub states: Option<String>,
}

impl AlertHistoryQuery {
    pub fn range(&self) -> HistoryRange {
        HistoryRange::parse(self.range.as_deref())
    }

    /// Result size, clamped to 1-200.
    pub fn limit(&self) -> usize {
        parse_clamped(
            self.limit.as_deref(),
            ALERT_HISTORY_DEFAULT_LIMIT,
            ALERT_HISTORY_MAX_LIMIT,
        )
    }

    /// States to include. Unknown names are dropped, so a filter naming
    /// only unknown states matches nothing.
    pub fn states(&self) -> Vec<RoomState> {
        match self.states.as_deref().map(str::trim) {
            None | Some("") => vec![RoomState::Warn, RoomState::Danger, RoomState::Offline],
            Some(list) => {
                let mut states: Vec<RoomState> =
                    list.split(',').filter_map(RoomState::parse).collect();
                states.sort();
                states.dedup();
                states
            }
        }
    }
}

/// Per-channel maxima of a log row or snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelMaxima {
    pub temperature: i64,
    pub humidity: i64,
    pub co2: i64,
    pub ammonia: i64,
    pub static_pressure: i64,
}

/// One entry of the alert history.
#[derive(Debug, Clone, Serialize)]
pub struct AlertHistoryItem {
    pub key12: String,
    pub regist_no: String,
    pub stall_no: i32,
    pub room_no: i32,
    pub state: RoomState,
    pub occurred_at_kst: String,
    #[serde(skip)]
    pub occurred_at: DateTime<Utc>,
    pub max_values: ChannelMaxima,
}

/// Response for `GET /alerts/history`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertHistoryResponse {
    pub server_now_kst: String,
    pub items: Vec<AlertHistoryItem>,
}

/// Integer query value clamped to `1..=max`; missing or unparseable values
/// use `default`.
fn parse_clamped(raw: Option<&str>, default: usize, max: usize) -> usize {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .map(|n| n.clamp(1, max as i64) as usize)
        .unwrap_or(default)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// A room currently in warn, danger or offline state.
#[derive(Debug, Clone, Serialize)]
pub struct RoomAlert {
    pub key12: String,
    pub regist_no: String,
    pub stall_no: i32,
    pub room_no: i32,
    pub state: RoomState,
    pub last_seen_kst: Option<String>,
    pub freshness_sec: Option<i64>,
    pub message: String,
}

/// Response for `GET /alerts`.
#[derive(Debug, Clone, Serialize)]
pub struct AlertsResponse {
    pub server_now_kst: String,
    pub alerts: Vec<RoomAlert>,
}

/// Query parameters for `GET /alerts`.
#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    /// Restrict to one farm.
    pub regist_no: Option<String>,
}
