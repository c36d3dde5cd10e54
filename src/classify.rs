//! Room state classification.
//!
//! [`classify`] is a pure function: it reads a snapshot, the farm's offline
//! threshold and the snapshot's age, and returns one [`RoomState`]. The
//! precedence is fixed:
//!
//! 1. `offline` when `freshness_sec > offline_threshold_sec` (sensor values
//!    are not looked at)
//! 2. `danger` when any channel maximum reaches its danger limit
//! 3. `warn` when any channel maximum reaches its warn limit
//! 4. `normal` otherwise
//!
//! Limits are raw device units. Callers must pass raw readings, never
//! display-converted values.

use crate::model::{RoomState, SensorChannel, SensorSnapshot};

/// Warn and danger limits of one channel, in raw device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub warn: i64,
    pub danger: i64,
}

impl ChannelLimits {
    /// Authoritative limits used for classification.
    pub const fn for_channel(channel: SensorChannel) -> Self {
        match channel {
            // 30.0C / 35.0C (x10)
            SensorChannel::Temperature => ChannelLimits { warn: 300, danger: 350 },
            // 80% / 90% (x10)
            SensorChannel::Humidity => ChannelLimits { warn: 800, danger: 900 },
            // ppm
            SensorChannel::Co2 => ChannelLimits { warn: 2500, danger: 3700 },
            // 20ppm / 30ppm (x10)
            SensorChannel::Ammonia => ChannelLimits { warn: 200, danger: 300 },
            // 60Pa / 80Pa (x10)
            SensorChannel::StaticPressure => ChannelLimits { warn: 600, danger: 800 },
        }
    }
}

/// Largest present reading of a channel, or 0 when none is present.
pub fn channel_max(readings: &[Option<i64>]) -> i64 {
    readings.iter().flatten().copied().max().unwrap_or(0)
}

/// Classify a room.
///
/// Equality with the threshold is still fresh. An empty or absent channel
/// contributes 0 and never breaches a limit.
pub fn classify(
    snapshot: &SensorSnapshot,
    offline_threshold_sec: i64,
    freshness_sec: i64,
) -> RoomState {
    debug_assert!(
        offline_threshold_sec >= 0,
        "offline threshold must be in seconds, got {offline_threshold_sec}"
    );

    if freshness_sec > offline_threshold_sec {
        return RoomState::Offline;
    }

    let maxima = SensorChannel::ALL
        .map(|channel| (ChannelLimits::for_channel(channel), channel_max(snapshot.channel(channel))));

    if maxima.iter().any(|(limits, max)| *max >= limits.danger) {
        return RoomState::Danger;
    }
    if maxima.iter().any(|(limits, max)| *max >= limits.warn) {
        return RoomState::Warn;
    }
    RoomState::Normal
}

/// Channels whose maximum reaches at least the warn limit, most severe first.
///
/// Used for alert messages; the state itself always comes from [`classify`].
pub fn breached_channels(snapshot: &SensorSnapshot) -> Vec<(SensorChannel, RoomState, i64)> {
    let mut breaches: Vec<_> = SensorChannel::ALL
        .into_iter()
        .filter_map(|channel| {
            let limits = ChannelLimits::for_channel(channel);
            let max = channel_max(snapshot.channel(channel));
            if max >= limits.danger {
                Some((channel, RoomState::Danger, max))
            } else if max >= limits.warn {
                Some((channel, RoomState::Warn, max))
            } else {
                None
            }
        })
        .collect();
    breaches.sort_by(|a, b| b.1.cmp(&a.1));
    breaches
}
