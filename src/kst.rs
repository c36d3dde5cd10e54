//! Korea Standard Time rendering.
//!
//! Every timestamp leaving the service is an ISO-8601 string with a fixed
//! `+09:00` offset, e.g. `2026-01-22T10:45:00.000+09:00`.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

const KST_OFFSET_SEC: i32 = 9 * 60 * 60;

/// Render a UTC instant in KST.
pub fn to_kst_iso(at: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(KST_OFFSET_SEC) {
        Some(kst) => at
            .with_timezone(&kst)
            .to_rfc3339_opts(SecondsFormat::Millis, false),
        None => at.to_rfc3339_opts(SecondsFormat::Millis, false),
    }
}

/// Current server time in KST.
pub fn server_now_kst() -> String {
    to_kst_iso(Utc::now())
}
