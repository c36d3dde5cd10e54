//! Barnwatch - room state classification and adaptive offline detection for
//! livestock barn monitoring.
//!
//! # Overview
//!
//! Every barn room reports temperature, humidity, CO2, ammonia and static
//! pressure readings. Barnwatch turns the latest snapshot of a room into one
//! of four states (`normal`, `warn`, `danger`, `offline`), where "offline"
//! means the snapshot is older than an offline threshold learned from the
//! farm's own reporting cadence.
//!
//! # Modules
//!
//! - [`classify`]: The pure room state classifier
//! - [`estimator`]: Per-farm offline thresholds with a TTL cache
//! - [`stats`]: Percentile, interval and clamping helpers
//! - [`source`]: Store capabilities the core reads through
//! - [`storage`]: SQLite store
//! - [`data_sources`]: PostgREST store
//! - [`aggregation`]: Farm summaries, farm detail and alerts
//! - [`api`]: HTTP API handlers

pub mod aggregation;
pub mod api;
pub mod classify;
pub mod config;
pub mod data_sources;
pub mod error;
pub mod estimator;
pub mod kst;
pub mod model;
pub mod source;
pub mod stats;
pub mod storage;
