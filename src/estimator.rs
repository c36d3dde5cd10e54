//! Adaptive offline-threshold estimation.
//!
//! A room is offline when its latest reading is older than its farm's
//! offline threshold. Farms report at different cadences, so the threshold is
//! derived from the 95th-percentile reporting interval observed over a
//! trailing lookback window, then cached per farm for a TTL.
//!
//! The estimator never fails: missing mappings, thin history and store
//! errors all resolve to the configured default threshold, and the outcome
//! is cached like any other so a broken store is asked at most once per TTL.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::model::ThresholdScope;
use crate::source::SampleSource;
use crate::stats::{derive_offline_threshold, percentile_nearest_rank, reporting_intervals};

/// Minimum number of history rows before a farm gets its own threshold.
pub const FARM_MIN_SAMPLES: usize = 50;

/// Percentile of reporting intervals used as the farm's cadence.
const CADENCE_PERCENTILE: f64 = 0.95;

/// Tunables of the estimator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatorConfig {
    /// Threshold used whenever no farm-specific value can be computed.
    pub default_threshold_sec: i64,
    /// How long a computed entry stays valid.
    pub cache_ttl: Duration,
    /// How much history is read per computation.
    pub lookback: Duration,
    /// Upper bound on each store call.
    pub fetch_timeout: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_threshold_sec: 211,
            cache_ttl: Duration::from_secs(300),
            lookback: Duration::from_secs(120 * 60),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// How a cached threshold came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdBasis {
    /// Derived from the farm's P95 reporting interval.
    Computed,
    /// The farm has no mapped devices.
    NoMappings,
    /// Fewer than [`FARM_MIN_SAMPLES`] history rows.
    InsufficientSamples,
    /// History exists but no usable gap between samples.
    NoValidIntervals,
    /// The store failed or timed out.
    SourceFailed,
    /// The global threshold, which is always the default.
    GlobalDefault,
}

/// A cached threshold and the statistics it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCacheEntry {
    pub offline_threshold_sec: i64,
    /// History rows read for the computation.
    pub sample_count: usize,
    /// Valid reporting intervals extracted from those rows.
    pub interval_count: usize,
    pub p95_interval_sec: Option<i64>,
    pub basis: ThresholdBasis,
    pub computed_at: Instant,
}

impl ThresholdCacheEntry {
    fn fallback(default_threshold_sec: i64, sample_count: usize, basis: ThresholdBasis) -> Self {
        Self {
            offline_threshold_sec: default_threshold_sec,
            sample_count,
            interval_count: 0,
            p95_interval_sec: None,
            basis,
            computed_at: Instant::now(),
        }
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.computed_at) < ttl
    }
}

/// Per-farm offline thresholds with a TTL cache.
///
/// Construct one per process and share it behind an `Arc`. Concurrent misses
/// for the same farm may both hit the store; the last write wins.
pub struct ThresholdEstimator {
    source: Arc<dyn SampleSource>,
    config: EstimatorConfig,
    cache: Mutex<HashMap<ThresholdScope, ThresholdCacheEntry>>,
}

impl ThresholdEstimator {
    pub fn new(source: Arc<dyn SampleSource>, config: EstimatorConfig) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Offline threshold of a farm, in seconds.
    pub async fn farm_offline_threshold_sec(&self, regist_no: &str) -> i64 {
        let scope = ThresholdScope::Farm(regist_no.to_string());
        {
            let mut cache = self.lock_cache();
            let now = Instant::now();
            let ttl = self.config.cache_ttl;
            cache.retain(|_, entry| entry.is_fresh(now, ttl));
            if let Some(entry) = cache.get(&scope) {
                return entry.offline_threshold_sec;
            }
        }

        let entry = match self.compute_farm_entry(regist_no).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    regist_no = %regist_no,
                    error = %e,
                    default_sec = self.config.default_threshold_sec,
                    "Failed to compute farm offline threshold, using default"
                );
                ThresholdCacheEntry::fallback(
                    self.config.default_threshold_sec,
                    0,
                    ThresholdBasis::SourceFailed,
                )
            }
        };

        let threshold = entry.offline_threshold_sec;
        self.lock_cache().insert(scope, entry);
        threshold
    }

    /// System-wide offline threshold, in seconds.
    ///
    /// No global percentile is computed; this always resolves to the
    /// configured default, cached with the same TTL as farm entries.
    pub async fn global_offline_threshold_sec(&self) -> i64 {
        let mut cache = self.lock_cache();
        let now = Instant::now();
        if let Some(entry) = cache
            .get(&ThresholdScope::Global)
            .filter(|entry| entry.is_fresh(now, self.config.cache_ttl))
        {
            return entry.offline_threshold_sec;
        }

        let entry = ThresholdCacheEntry::fallback(
            self.config.default_threshold_sec,
            0,
            ThresholdBasis::GlobalDefault,
        );
        let threshold = entry.offline_threshold_sec;
        cache.insert(ThresholdScope::Global, entry);
        threshold
    }

    /// The cached entry of a farm, if present and still within its TTL.
    pub fn farm_entry(&self, regist_no: &str) -> Option<ThresholdCacheEntry> {
        self.fresh_entry(&ThresholdScope::Farm(regist_no.to_string()))
    }

    /// The cached global entry, if present and still within its TTL.
    pub fn global_entry(&self) -> Option<ThresholdCacheEntry> {
        self.fresh_entry(&ThresholdScope::Global)
    }

    fn fresh_entry(&self, scope: &ThresholdScope) -> Option<ThresholdCacheEntry> {
        let now = Instant::now();
        self.lock_cache()
            .get(scope)
            .filter(|entry| entry.is_fresh(now, self.config.cache_ttl))
            .cloned()
    }

    /// Drop a farm's cached entry so the next lookup recomputes it.
    pub fn invalidate(&self, regist_no: &str) {
        self.lock_cache()
            .remove(&ThresholdScope::Farm(regist_no.to_string()));
    }

    async fn compute_farm_entry(&self, regist_no: &str) -> Result<ThresholdCacheEntry, SourceError> {
        let default_sec = self.config.default_threshold_sec;

        let key12s = self.bounded(self.source.farm_key12s(regist_no)).await?;
        if key12s.is_empty() {
            debug!(regist_no = %regist_no, "No mapped devices, using default threshold");
            return Ok(ThresholdCacheEntry::fallback(
                default_sec,
                0,
                ThresholdBasis::NoMappings,
            ));
        }

        let since = Utc::now()
            - chrono::Duration::from_std(self.config.lookback)
                .unwrap_or_else(|_| chrono::Duration::minutes(120));
        let samples = self
            .bounded(self.source.samples_since(&key12s, since))
            .await?;

        if samples.len() < FARM_MIN_SAMPLES {
            debug!(
                regist_no = %regist_no,
                samples = samples.len(),
                "Too few samples, using default threshold"
            );
            return Ok(ThresholdCacheEntry::fallback(
                default_sec,
                samples.len(),
                ThresholdBasis::InsufficientSamples,
            ));
        }

        let mut intervals = reporting_intervals(&samples);
        intervals.sort_unstable();

        let Some(p95) = percentile_nearest_rank(&intervals, CADENCE_PERCENTILE) else {
            debug!(
                regist_no = %regist_no,
                samples = samples.len(),
                "No valid reporting intervals, using default threshold"
            );
            return Ok(ThresholdCacheEntry::fallback(
                default_sec,
                samples.len(),
                ThresholdBasis::NoValidIntervals,
            ));
        };

        let offline_threshold_sec = derive_offline_threshold(p95);
        info!(
            regist_no = %regist_no,
            devices = key12s.len(),
            samples = samples.len(),
            intervals = intervals.len(),
            p95_sec = p95,
            offline_threshold_sec,
            "Farm offline threshold computed"
        );

        Ok(ThresholdCacheEntry {
            offline_threshold_sec,
            sample_count: samples.len(),
            interval_count: intervals.len(),
            p95_interval_sec: Some(p95),
            basis: ThresholdBasis::Computed,
            computed_at: Instant::now(),
        })
    }

    async fn bounded<T>(
        &self,
        fetch: impl Future<Output = Result<T, SourceError>>,
    ) -> Result<T, SourceError> {
        let limit = self.config.fetch_timeout;
        tokio::time::timeout(limit, fetch)
            .await
            .map_err(|_| SourceError::Timeout(limit))?
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<ThresholdScope, ThresholdCacheEntry>> {
        // Entries are plain data; a panic elsewhere cannot leave one half-written.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
