// =============================================================================
// Timeframe arithmetic
// =============================================================================
//
// Every timeframe is a whole number of minutes. Bucketing is integer division
// on epoch minutes, so a bucket id is stable regardless of wall-clock zone or
// DST rules — UTC is the only accepted reference.
//
//   bucket_id(ts, tf)    = floor(epoch_minutes(ts) / minutes(tf))
//   bucket_start(ts, tf) = bucket_id * minutes(tf), expressed as UTC
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Supported bar timeframes, smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Length of one bucket in minutes.
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
        }
    }

    /// Length of one bucket in seconds.
    pub fn seconds(self) -> i64 {
        self.minutes() * 60
    }

    /// All timeframes, smallest first.
    pub fn all() -> [Timeframe; 6] {
        [Self::M1, Self::M5, Self::M15, Self::H1, Self::H4, Self::D1]
    }

    /// Map a minute count back to a known timeframe, if it is one.
    pub fn from_minutes(minutes: i64) -> Option<Self> {
        Self::all().into_iter().find(|tf| tf.minutes() == minutes)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "M1"),
            Self::M5 => write!(f, "M5"),
            Self::M15 => write!(f, "M15"),
            Self::H1 => write!(f, "H1"),
            Self::H4 => write!(f, "H4"),
            Self::D1 => write!(f, "D1"),
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M1" | "1m" => Ok(Self::M1),
            "M5" | "5m" => Ok(Self::M5),
            "M15" | "15m" => Ok(Self::M15),
            "H1" | "1h" => Ok(Self::H1),
            "H4" | "4h" => Ok(Self::H4),
            "D1" | "1d" => Ok(Self::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Whole epoch minutes of a timestamp (floor semantics for pre-epoch inputs).
fn epoch_minutes(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60)
}

/// Bucket id of `ts` at timeframe `tf`.
pub fn bucket_id(ts: DateTime<Utc>, tf: Timeframe) -> i64 {
    epoch_minutes(ts).div_euclid(tf.minutes())
}

/// UTC start of the bucket containing `ts`.
pub fn bucket_start(ts: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
    let start_min = bucket_id(ts, tf) * tf.minutes();
    // Seconds fit comfortably in the chrono-supported range for any i64 minute
    // value this pipeline can produce.
    Utc.timestamp_opt(start_min * 60, 0).unwrap()
}

/// Whether `ts` falls exactly on a bucket boundary of `tf`.
pub fn is_boundary(ts: DateTime<Utc>, tf: Timeframe) -> bool {
    ts.timestamp() % (tf.minutes() * 60) == 0
}
