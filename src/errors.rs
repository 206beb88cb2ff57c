// =============================================================================
// Pipeline error set
// =============================================================================
//
// The set is closed: every failure the core can produce is one of these
// variants. Recoverable kinds (drops, capacity refusals, invalid bars) are
// reported through metrics and diagnostic events and never interrupt the
// stream; `raise` policies surface the variant as a hard `Err` from `feed`
// and halt the offending symbol.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("clock skew: bar ts {bar_ts} precedes last accepted ts {last_ts}")]
    ClockSkew {
        bar_ts: DateTime<Utc>,
        last_ts: DateTime<Utc>,
    },

    #[error("future bar: ts {bar_ts} is beyond now {now} plus allowed skew")]
    FutureBar {
        bar_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("capacity exceeded in {scope}")]
    CapacityExceeded { scope: String },

    #[error("invalid bar: {reason}")]
    InvalidBar { reason: String },

    #[error("ATR underflow: floored ATR reached zero")]
    AtrUnderflow,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl PipelineError {
    /// Stable snake_case label used as a metrics suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClockSkew { .. } => "clock_skew",
            Self::FutureBar { .. } => "future_bar",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InvalidBar { .. } => "invalid_bar",
            Self::AtrUnderflow => "atr_underflow",
            Self::InvalidConfig { .. } => "invalid_config",
        }
    }
}
