// =============================================================================
// Event stream — immutable records exchanged between pipeline stages
// =============================================================================
//
// Components never reach into each other's state; everything downstream of a
// stage sees only these events. Every event carries the driving bar's
// timestamp, and the serialized event log is the unit of replay determinism
// (two runs over the same bars and config must produce byte-identical logs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Band, Side};
use crate::timeframe::Timeframe;

/// Which detector produced a pool candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Fvg,
    Pivot,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fvg => write!(f, "fvg"),
            Self::Pivot => write!(f, "pivot"),
        }
    }
}

/// Raw detector output, not yet admitted to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCandidateEvent {
    pub kind: PoolKind,
    pub side: Side,
    pub band: Band,
    pub timeframe: Timeframe,
    pub created_at: DateTime<Utc>,
    /// Normalized detector confidence in [0, 1].
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCreatedEvent {
    pub pool_id: String,
    pub kind: PoolKind,
    pub side: Side,
    pub band: Band,
    pub timeframe: Timeframe,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolTouchedEvent {
    pub pool_id: String,
    pub timeframe: Timeframe,
    pub touched_at: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolExpiredEvent {
    pub pool_id: String,
    pub timeframe: Timeframe,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlzCreatedEvent {
    pub hlz_id: u64,
    pub side: Side,
    pub band: Band,
    pub member_pool_ids: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub combined_strength: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlzUpdatedEvent {
    pub hlz_id: u64,
    pub band: Band,
    pub member_pool_ids: Vec<String>,
    pub combined_strength: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlzDissolvedEvent {
    pub hlz_id: u64,
    pub ts: DateTime<Utc>,
}

/// What kind of zone was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneKind {
    Pool,
    Hlz,
}

impl std::fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pool => write!(f, "pool"),
            Self::Hlz => write!(f, "hlz"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEnteredEvent {
    pub zone_id: String,
    pub zone_kind: ZoneKind,
    pub side: Side,
    pub band: Band,
    pub entry_ts: DateTime<Utc>,
    pub entry_price: f64,
}

/// A fully filtered trade signal with price hints, pre-sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: u64,
    pub side: Side,
    pub entry_hint_price: f64,
    pub stop_hint_price: f64,
    pub issued_at: DateTime<Utc>,
    pub source_zone_id: String,
}

/// A sized order ready for a broker layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub signal_id: u64,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub risk_amount: f64,
}

/// Why the risk sizer refused a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientEquity,
    SizeBelowMin,
    ZeroStopDistance,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientEquity => write!(f, "insufficient_equity"),
            Self::SizeBelowMin => write!(f, "size_below_min"),
            Self::ZeroStopDistance => write!(f, "zero_stop_distance"),
        }
    }
}

/// Outcome of risk sizing, delivered to the order-intent sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderOutcome {
    Intent(OrderIntent),
    Rejected { signal_id: u64, reason: RejectReason },
}

/// Structured record of a recoverable error (drop, refusal, invalid input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

/// The full ordered event stream emitted by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    HtfBarClosed {
        timeframe: Timeframe,
        ts: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    },
    PoolCreated(PoolCreatedEvent),
    PoolTouched(PoolTouchedEvent),
    PoolExpired(PoolExpiredEvent),
    HlzCreated(HlzCreatedEvent),
    HlzUpdated(HlzUpdatedEvent),
    HlzDissolved(HlzDissolvedEvent),
    ZoneEntered(ZoneEnteredEvent),
    CandidateSpawned {
        candidate_id: String,
        zone_id: String,
        ts: DateTime<Utc>,
    },
    CandidateExpired {
        candidate_id: String,
        ts: DateTime<Utc>,
    },
    SignalIssued(Signal),
    Diagnostic(DiagnosticEvent),
}

// -----------------------------------------------------------------------------
// Sinks
// -----------------------------------------------------------------------------

/// Receiver of the ordered event stream.
pub trait EventSink {
    fn on_event(&mut self, event: &PipelineEvent);
}

/// Receiver of sized order intents and rejections.
pub trait OrderIntentSink {
    fn on_order(&mut self, outcome: &OrderOutcome);
}

/// In-memory sink collecting every event; used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    pub events: Vec<PipelineEvent>,
}

impl EventSink for MemoryEventSink {
    fn on_event(&mut self, event: &PipelineEvent) {
        self.events.push(event.clone());
    }
}

/// In-memory sink collecting order outcomes.
#[derive(Debug, Default)]
pub struct MemoryIntentSink {
    pub outcomes: Vec<OrderOutcome>,
}

impl OrderIntentSink for MemoryIntentSink {
    fn on_order(&mut self, outcome: &OrderOutcome) {
        self.outcomes.push(outcome.clone());
    }
}

/// SHA-256 over the serialized event log, one JSON line per event.
///
/// Two runs over identical bars and config must produce the same digest.
pub fn event_log_digest(events: &[PipelineEvent]) -> String {
    let mut hasher = Sha256::new();
    for event in events {
        // Serialization of these closed types cannot fail.
        let line = serde_json::to_string(event).expect("event serializes");
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
