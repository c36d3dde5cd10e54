//! Environment configuration.
//!
//! Every setting has a default. Values that fail to parse, and durations or
//! thresholds that are not positive, are logged and replaced by their
//! default so a typo never keeps the service down.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::estimator::EstimatorConfig;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:barnwatch.db?mode=rwc";

/// Connection settings of a hosted PostgREST/Supabase store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgrestConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// SQLite store used when no PostgREST endpoint is configured.
    pub database_url: String,
    /// JSON document loaded into the SQLite store at startup.
    pub seed_file: Option<PathBuf>,
    pub postgrest: Option<PostgrestConfig>,
    pub estimator: EstimatorConfig,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = EstimatorConfig::default();
        let estimator = EstimatorConfig {
            default_threshold_sec: parse_positive_or(
                "OFFLINE_TH_DEFAULT_SEC",
                get("OFFLINE_TH_DEFAULT_SEC"),
                defaults.default_threshold_sec,
            ),
            cache_ttl: Duration::from_secs(parse_positive_or(
                "OFFLINE_CACHE_TTL_SEC",
                get("OFFLINE_CACHE_TTL_SEC"),
                defaults.cache_ttl.as_secs(),
            )),
            lookback: Duration::from_secs(
                parse_positive_or(
                    "OFFLINE_LOOKBACK_MIN",
                    get("OFFLINE_LOOKBACK_MIN"),
                    defaults.lookback.as_secs() / 60,
                )
                .saturating_mul(60),
            ),
            fetch_timeout: Duration::from_millis(parse_positive_or(
                "SUPABASE_TIMEOUT_MS",
                get("SUPABASE_TIMEOUT_MS"),
                defaults.fetch_timeout.as_millis() as u64,
            )),
        };

        let postgrest = match (get("SUPABASE_URL"), get("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(url), Some(api_key)) => Some(PostgrestConfig { url, api_key }),
            (Some(_), None) => {
                warn!("SUPABASE_URL is set without SUPABASE_SERVICE_ROLE_KEY; using SQLite store");
                None
            }
            _ => None,
        };

        Self {
            port: parse_or("BARNWATCH_PORT", get("BARNWATCH_PORT"), DEFAULT_PORT),
            database_url: get("BARNWATCH_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            seed_file: get("BARNWATCH_SEED_FILE").map(PathBuf::from),
            postgrest,
            estimator,
        }
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    parse_filtered_or(key, raw, default, |_| true)
}

/// Like [`parse_or`], but zero and negative values also fall back.
fn parse_positive_or<T: FromStr + Copy + Default + PartialOrd>(
    key: &str,
    raw: Option<String>,
    default: T,
) -> T {
    parse_filtered_or(key, raw, default, |v| *v > T::default())
}

fn parse_filtered_or<T: FromStr + Copy>(
    key: &str,
    raw: Option<String>,
    default: T,
    accept: impl Fn(&T) -> bool,
) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.parse() {
        Ok(value) if accept(&value) => value,
        _ => {
            warn!(key, value = %raw, "Invalid configuration value, using default");
            default
        }
    }
}
