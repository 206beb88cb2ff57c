// =============================================================================
// Candidate FSM — from zone entry to signal
// =============================================================================
//
// Every zone entry spawns one candidate in WAIT_EMA. On each base bar the
// candidate first checks expiry, then advances:
//
//   WAIT_EMA  -- close beyond the fast EMA in the trade direction --> FILTERS
//   FILTERS   -- every enabled filter passes --> READY (terminal, emits Signal)
//   FILTERS   -- any filter fails --> FILTERS (retry next bar)
//   any       -- now >= created_at + expiry --> EXPIRED (terminal)
//
// A bar that satisfies the WAIT_EMA guard falls through to the filter chain
// on the same bar. Expiry is exact: a candidate whose expiry lands on the
// driving bar never signals on that bar.
//
// Filters are a closed set of variants, each a pure predicate over
// (bar, snapshot, config); the enabled set is configuration, not inheritance.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CandidateConfig;
use crate::events::{Signal, ZoneEnteredEvent};
use crate::indicators::IndicatorSnapshot;
use crate::ring_buffer::RingBuffer;
use crate::types::{Band, Bar, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateState {
    WaitEma,
    Filters,
    Ready,
    Expired,
}

impl std::fmt::Display for CandidateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitEma => write!(f, "WAIT_EMA"),
            Self::Filters => write!(f, "FILTERS"),
            Self::Ready => write!(f, "READY"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// One live FSM instance tied to a zone entry.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub zone_id: String,
    pub side: Side,
    pub band: Band,
    pub state: CandidateState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_bar_ts: Option<DateTime<Utc>>,
}

/// The closed filter set. Each variant is a pure predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    EmaAlignment,
    Volume,
    Regime,
    Session,
    Spacing,
}

/// Evaluation order is fixed so event streams replay identically.
const FILTER_ORDER: [Filter; 5] = [
    Filter::EmaAlignment,
    Filter::Volume,
    Filter::Regime,
    Filter::Session,
    Filter::Spacing,
];

impl Filter {
    fn passes(
        self,
        side: Side,
        bar: &Bar,
        snapshot: &IndicatorSnapshot,
        cfg: &CandidateConfig,
        last_signal_ts: Option<DateTime<Utc>>,
    ) -> bool {
        let f = &cfg.filters;
        match self {
            Self::EmaAlignment => {
                if !f.ema_alignment {
                    return true;
                }
                let tol = f.ema_tolerance_pct / 100.0;
                match side {
                    Side::Bullish => snapshot.ema_fast > snapshot.ema_slow * (1.0 - tol),
                    Side::Bearish => snapshot.ema_fast < snapshot.ema_slow * (1.0 + tol),
                }
            }
            Self::Volume => {
                if f.volume_multiple <= 0.0 {
                    return true;
                }
                bar.volume >= f.volume_multiple * snapshot.volume_sma
            }
            Self::Regime => {
                if !f.regime_enabled {
                    return true;
                }
                let allowed = match side {
                    Side::Bullish => f.regime.clone(),
                    Side::Bearish => f.regime.iter().map(|r| r.mirrored()).collect(),
                };
                allowed.contains(&snapshot.regime)
            }
            Self::Session => {
                if f.sessions.is_empty() {
                    return true;
                }
                if f.sessions.iter().any(|w| w.exclude && w.contains(bar.ts)) {
                    return false;
                }
                let mut allowed = f.sessions.iter().filter(|w| !w.exclude).peekable();
                // Only exclusion windows configured: everything else is open.
                allowed.peek().is_none() || allowed.any(|w| w.contains(bar.ts))
            }
            Self::Spacing => {
                if f.min_entry_spacing_secs <= 0 {
                    return true;
                }
                match last_signal_ts {
                    None => true,
                    Some(last) => bar.ts - last >= Duration::seconds(f.min_entry_spacing_secs),
                }
            }
        }
    }
}

/// Outcome of advancing every live candidate by one bar.
#[derive(Debug, Default)]
pub struct CandidateUpdate {
    pub signals: Vec<Signal>,
    pub expired: Vec<String>,
}

#[derive(Debug)]
pub struct CandidateEngine {
    cfg: CandidateConfig,
    candidates: Vec<Candidate>,
    /// Last READY signal timestamp per side, for the spacing filter.
    last_signal: [Option<DateTime<Utc>>; 2],
    /// (low, high) of recent base bars for the swing-based stop hint.
    swing: RingBuffer<(f64, f64)>,
    next_signal_id: u64,
}

impl CandidateEngine {
    pub fn new(cfg: CandidateConfig) -> Self {
        let swing = RingBuffer::new(cfg.swing_lookback);
        Self {
            cfg,
            candidates: Vec::new(),
            last_signal: [None, None],
            swing,
            next_signal_id: 1,
        }
    }

    pub fn active_count(&self) -> usize {
        self.candidates.len()
    }

    /// Spawn a candidate in WAIT_EMA for a fresh zone entry.
    pub fn spawn(&mut self, entry: &ZoneEnteredEvent) -> String {
        let id = format!("{}@{}", entry.zone_id, entry.entry_ts.to_rfc3339());
        let candidate = Candidate {
            id: id.clone(),
            zone_id: entry.zone_id.clone(),
            side: entry.side,
            band: entry.band,
            state: CandidateState::WaitEma,
            created_at: entry.entry_ts,
            expires_at: entry.entry_ts + Duration::seconds(self.cfg.expiry_secs),
            last_bar_ts: None,
        };
        debug!(candidate_id = %id, side = %entry.side, "candidate spawned");
        self.candidates.push(candidate);
        id
    }

    /// Advance every live candidate with this bar and its snapshot.
    pub fn on_bar(&mut self, bar: &Bar, snapshot: &IndicatorSnapshot) -> CandidateUpdate {
        self.swing.push((bar.low, bar.high));

        let mut update = CandidateUpdate::default();
        let mut retained = Vec::with_capacity(self.candidates.len());

        for mut cand in std::mem::take(&mut self.candidates) {
            cand.last_bar_ts = Some(bar.ts);

            if bar.ts >= cand.expires_at {
                cand.state = CandidateState::Expired;
                debug!(candidate_id = %cand.id, "candidate expired");
                update.expired.push(cand.id);
                continue;
            }

            if cand.state == CandidateState::WaitEma {
                let triggered = match cand.side {
                    Side::Bullish => bar.close > snapshot.ema_fast,
                    Side::Bearish => bar.close < snapshot.ema_fast,
                };
                if triggered {
                    cand.state = CandidateState::Filters;
                }
            }

            if cand.state == CandidateState::Filters {
                let last = self.last_signal[side_slot(cand.side)];
                let all_pass = FILTER_ORDER
                    .iter()
                    .all(|f| f.passes(cand.side, bar, snapshot, &self.cfg, last));
                if all_pass {
                    cand.state = CandidateState::Ready;
                    let signal = self.issue_signal(&cand, bar);
                    self.last_signal[side_slot(cand.side)] = Some(bar.ts);
                    update.signals.push(signal);
                    continue; // READY is terminal
                }
            }

            retained.push(cand);
        }

        self.candidates = retained;
        update
    }

    /// Build the signal with its price hints.
    ///
    /// The stop hint is the zone's far boundary or the swing extreme over the
    /// lookback window, whichever sits further from the entry.
    fn issue_signal(&mut self, cand: &Candidate, bar: &Bar) -> Signal {
        let entry = bar.close;
        let stop = match cand.side {
            Side::Bullish => {
                let swing_low = self
                    .swing
                    .iter()
                    .map(|(low, _)| *low)
                    .fold(f64::INFINITY, f64::min);
                cand.band.bottom.min(swing_low)
            }
            Side::Bearish => {
                let swing_high = self
                    .swing
                    .iter()
                    .map(|(_, high)| *high)
                    .fold(f64::NEG_INFINITY, f64::max);
                cand.band.top.max(swing_high)
            }
        };

        let id = self.next_signal_id;
        self.next_signal_id += 1;
        debug!(signal_id = id, side = %cand.side, entry, stop, "signal issued");
        Signal {
            id,
            side: cand.side,
            entry_hint_price: entry,
            stop_hint_price: stop,
            issued_at: bar.ts,
            source_zone_id: cand.zone_id.clone(),
        }
    }
}

fn side_slot(side: Side) -> usize {
    match side {
        Side::Bullish => 0,
        Side::Bearish => 1,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionWindow;
    use crate::events::ZoneKind;
    use crate::indicators::Regime;
    use crate::timeframe::Timeframe;

    fn entry(ts: &str, side: Side) -> ZoneEnteredEvent {
        ZoneEnteredEvent {
            zone_id: "zone-1".into(),
            zone_kind: ZoneKind::Pool,
            side,
            band: Band::new(49_900.0, 49_960.0),
            entry_ts: ts.parse().unwrap(),
            entry_price: 49_950.0,
        }
    }

    fn bar(ts: &str, close: f64, volume: f64) -> Bar {
        Bar {
            ts: ts.parse().unwrap(),
            open: close,
            high: close + 10.0,
            low: close - 10.0,
            close,
            volume,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
        }
    }

    fn snapshot(ts: &str, ema_fast: f64, ema_slow: f64, volume_sma: f64, regime: Regime) -> IndicatorSnapshot {
        IndicatorSnapshot {
            ts: ts.parse().unwrap(),
            ema_fast,
            ema_slow,
            atr: 25.0,
            volume_sma,
            regime,
            warmed_up: true,
        }
    }

    fn engine() -> CandidateEngine {
        CandidateEngine::new(CandidateConfig::default())
    }

    #[test]
    fn full_chain_ready_on_same_bar() {
        // Bull regime, aligned EMAs, strong volume, inside session, no spacing
        // conflict: WAIT_EMA -> FILTERS -> READY on one bar.
        let mut cfg = CandidateConfig::default();
        cfg.filters.volume_multiple = 1.5;
        cfg.filters.sessions = vec![SessionWindow {
            name: "newyork".into(),
            start_minute: 12 * 60,
            end_minute: 14 * 60 + 5,
            exclude: false,
        }];
        let mut eng = CandidateEngine::new(cfg);

        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        let update = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 2_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );

        assert_eq!(update.signals.len(), 1);
        let s = &update.signals[0];
        assert_eq!(s.side, Side::Bullish);
        assert!((s.entry_hint_price - 50_000.0).abs() < 1e-9);
        assert_eq!(s.source_zone_id, "zone-1");
        // Stop hint: zone bottom (49 900) vs swing low (49 990): zone is further.
        assert!((s.stop_hint_price - 49_900.0).abs() < 1e-9);
        assert_eq!(eng.active_count(), 0);
    }

    #[test]
    fn waits_for_ema_trigger() {
        let mut eng = engine();
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));

        // Close below the fast EMA: stays in WAIT_EMA, no signal.
        let u1 = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 49_950.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(u1.signals.is_empty());
        assert_eq!(eng.active_count(), 1);

        // Next bar closes above: triggers and signals.
        let u2 = eng.on_bar(
            &bar("2024-01-05T12:31:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:31:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert_eq!(u2.signals.len(), 1);
    }

    #[test]
    fn expiry_is_exact_no_signal_on_expiry_bar() {
        let mut cfg = CandidateConfig::default();
        cfg.expiry_secs = 60;
        let mut eng = CandidateEngine::new(cfg);
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));

        // Exactly created_at + expiry: the candidate expires, even though the
        // bar would otherwise pass every gate.
        let update = eng.on_bar(
            &bar("2024-01-05T12:31:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:31:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(update.signals.is_empty());
        assert_eq!(update.expired.len(), 1);
        assert_eq!(eng.active_count(), 0);
    }

    #[test]
    fn failing_filter_retries_until_pass() {
        let mut cfg = CandidateConfig::default();
        cfg.filters.volume_multiple = 2.0;
        let mut eng = CandidateEngine::new(cfg);
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));

        // EMA trigger passes but volume fails: candidate stays in FILTERS.
        let u1 = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(u1.signals.is_empty());
        assert_eq!(eng.active_count(), 1);

        // Volume recovers on a later bar: signal without re-triggering.
        let u2 = eng.on_bar(
            &bar("2024-01-05T12:31:00Z", 49_970.0, 3_000.0),
            &snapshot("2024-01-05T12:31:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert_eq!(u2.signals.len(), 1);
    }

    #[test]
    fn ema_alignment_blocks_misaligned_long() {
        let mut eng = engine();
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        // Fast below slow: alignment filter fails.
        let u = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_940.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(u.signals.is_empty());
        assert_eq!(eng.active_count(), 1);
    }

    #[test]
    fn ema_tolerance_allows_near_alignment() {
        let mut cfg = CandidateConfig::default();
        cfg.filters.ema_tolerance_pct = 0.1; // 0.1% of the slow EMA
        let mut eng = CandidateEngine::new(cfg);
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        let u = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_940.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert_eq!(u.signals.len(), 1);
    }

    #[test]
    fn regime_filter_mirrors_for_shorts() {
        let mut eng = engine();
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bearish));
        // Default allowed {bull, neutral} mirrors to {bear, neutral}: a bear
        // regime short passes.
        let u = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 49_900.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_940.0, 49_980.0, 1_000.0, Regime::Bear),
        );
        assert_eq!(u.signals.len(), 1);

        // A bull regime blocks the short.
        let mut eng2 = engine();
        eng2.spawn(&entry("2024-01-05T12:30:00Z", Side::Bearish));
        let u2 = eng2.on_bar(
            &bar("2024-01-05T12:30:00Z", 49_900.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_940.0, 49_980.0, 1_000.0, Regime::Bull),
        );
        assert!(u2.signals.is_empty());
    }

    #[test]
    fn session_window_blocks_out_of_hours() {
        let mut cfg = CandidateConfig::default();
        cfg.filters.sessions = vec![SessionWindow {
            name: "london".into(),
            start_minute: 8 * 60,
            end_minute: 16 * 60,
            exclude: false,
        }];
        let mut eng = CandidateEngine::new(cfg);
        eng.spawn(&entry("2024-01-05T20:00:00Z", Side::Bullish));
        let u = eng.on_bar(
            &bar("2024-01-05T20:00:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T20:00:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(u.signals.is_empty());
        assert_eq!(eng.active_count(), 1);
    }

    #[test]
    fn exclusion_window_blocks_inside_allowed_session() {
        let mut cfg = CandidateConfig::default();
        cfg.filters.sessions = vec![
            SessionWindow {
                name: "london".into(),
                start_minute: 8 * 60,
                end_minute: 16 * 60,
                exclude: false,
            },
            // Low-volume lunch block inside the session.
            SessionWindow {
                name: "lunch".into(),
                start_minute: 12 * 60,
                end_minute: 13 * 60,
                exclude: true,
            },
        ];
        let mut eng = CandidateEngine::new(cfg);

        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        let blocked = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(blocked.signals.is_empty());

        // Same candidate clears once the lunch block ends.
        let open = eng.on_bar(
            &bar("2024-01-05T13:00:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T13:00:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert_eq!(open.signals.len(), 1);
    }

    #[test]
    fn spacing_enforced_per_side() {
        let mut cfg = CandidateConfig::default();
        cfg.filters.min_entry_spacing_secs = 300;
        let mut eng = CandidateEngine::new(cfg);

        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        let u1 = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert_eq!(u1.signals.len(), 1);

        // A second long 60s later is inside the spacing window: blocked.
        eng.spawn(&entry("2024-01-05T12:31:00Z", Side::Bullish));
        let u2 = eng.on_bar(
            &bar("2024-01-05T12:31:00Z", 50_010.0, 1_000.0),
            &snapshot("2024-01-05T12:31:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert!(u2.signals.is_empty());

        // A short in the same window is unaffected (per-side spacing).
        eng.spawn(&entry("2024-01-05T12:31:00Z", Side::Bearish));
        let u3 = eng.on_bar(
            &bar("2024-01-05T12:32:00Z", 49_900.0, 1_000.0),
            &snapshot("2024-01-05T12:32:00Z", 49_940.0, 49_980.0, 1_000.0, Regime::Bear),
        );
        assert_eq!(u3.signals.len(), 1);
    }

    #[test]
    fn stop_hint_prefers_further_swing_extreme() {
        let mut eng = engine();
        // Drive a deep swing low into the lookback window.
        eng.on_bar(
            &bar("2024-01-05T12:28:00Z", 49_500.0, 1_000.0),
            &snapshot("2024-01-05T12:28:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        let u = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        // Swing low 49 490 is further than the zone bottom 49 900.
        assert!((u.signals[0].stop_hint_price - 49_490.0).abs() < 1e-9);
    }

    #[test]
    fn signal_ids_are_sequential() {
        let mut eng = engine();
        eng.spawn(&entry("2024-01-05T12:30:00Z", Side::Bullish));
        let u1 = eng.on_bar(
            &bar("2024-01-05T12:30:00Z", 50_000.0, 1_000.0),
            &snapshot("2024-01-05T12:30:00Z", 49_990.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        eng.spawn(&entry("2024-01-05T12:40:00Z", Side::Bullish));
        let u2 = eng.on_bar(
            &bar("2024-01-05T12:40:00Z", 50_100.0, 1_000.0),
            &snapshot("2024-01-05T12:40:00Z", 50_090.0, 49_950.0, 1_000.0, Regime::Bull),
        );
        assert_eq!(u1.signals[0].id, 1);
        assert_eq!(u2.signals[0].id, 2);
    }
}
