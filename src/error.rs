//! Errors raised by store collaborators.
//!
//! None of these ever reach a caller of the threshold estimator: it logs them
//! and falls back to the default threshold.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store query failed: {status} - {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed store data: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid timestamp {0} in store data")]
    Timestamp(String),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
}
