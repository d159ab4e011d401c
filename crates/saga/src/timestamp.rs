//! Fixed timestamp encoding for persisted and wire formats.
//!
//! Timestamps are RFC 3339 UTC strings with millisecond precision
//! (`2024-05-01T12:00:00.123Z`). In-memory timestamps come from [`now`] or a
//! [`Clock`], both of which truncate to milliseconds so an encode/decode round
//! trip is exact.

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};
use tokio::time::Instant;

/// Current wall-clock time truncated to the encoding's precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Wall-clock time driven by the tokio clock.
///
/// Anchored on the wall time when created and advanced by
/// [`tokio::time::Instant`], so timestamps move together with tokio timers.
/// A runtime with paused time (`tokio::time::pause`) freezes and advances
/// both at once.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: DateTime<Utc>,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            anchor: Instant::now(),
        }
    }

    /// Current time truncated to the encoding's precision.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.anchor.elapsed()).unwrap_or(TimeDelta::MAX);
        self.origin
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .trunc_subsecs(3)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a timestamp in the fixed encoding.
pub fn format(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse<E: Error>(raw: &str) -> Result<DateTime<Utc>, E> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| E::custom(format!("invalid timestamp {raw:?}: {e}")))
}

pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(value))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw)
}

/// The same encoding for optional timestamps.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&format(value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse(&raw))
            .transpose()
    }
}
