// =============================================================================
// Risk sizer — signal to sized order intent
// =============================================================================
//
// Sizing rules for one account:
//   R    = risk_per_trade * equity
//   d    = max(|entry - stop_hint|, sl_atr_multiple * ATR)
//   size = min(R / d, max_position_pct * equity / entry)
//
// The effective stop sits `d` away from the (slippage-worsened) entry, the
// take-profit `tp_rr * d` on the favorable side. A signal that cannot be
// sized honestly is rejected with a reason, never silently shrunk.
// =============================================================================

use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::events::{OrderIntent, OrderOutcome, RejectReason, Signal};
use crate::indicators::IndicatorSnapshot;
use crate::types::Side;

#[derive(Debug)]
pub struct RiskSizer {
    cfg: RiskConfig,
    equity: f64,
}

impl RiskSizer {
    pub fn new(cfg: RiskConfig) -> Self {
        let equity = cfg.account_equity;
        Self { cfg, equity }
    }

    pub fn equity(&self) -> f64 {
        self.equity
    }

    /// Replace the working equity (e.g. after a broker fill report).
    pub fn set_equity(&mut self, equity: f64) {
        self.equity = equity;
    }

    /// Convert a signal into an order intent, or reject it.
    pub fn size(&self, signal: &Signal, snapshot: &IndicatorSnapshot) -> OrderOutcome {
        if self.equity <= 0.0 {
            warn!(signal_id = signal.id, equity = self.equity, "sizing rejected: no equity");
            return OrderOutcome::Rejected {
                signal_id: signal.id,
                reason: RejectReason::InsufficientEquity,
            };
        }

        // Entry worsened against the trade direction.
        let slip = self.cfg.entry_slippage_pct;
        let entry = match signal.side {
            Side::Bullish => signal.entry_hint_price * (1.0 + slip),
            Side::Bearish => signal.entry_hint_price * (1.0 - slip),
        };

        // The ATR is floored upstream; a zero here is a logic error.
        debug_assert!(snapshot.atr > 0.0, "ATR reached the sizer un-floored");

        let hint_distance = (entry - signal.stop_hint_price).abs();
        let distance = hint_distance.max(self.cfg.sl_atr_multiple * snapshot.atr);
        if distance <= 0.0 || entry <= 0.0 {
            return OrderOutcome::Rejected {
                signal_id: signal.id,
                reason: RejectReason::ZeroStopDistance,
            };
        }

        let risk_amount = self.cfg.risk_per_trade * self.equity;
        let by_risk = risk_amount / distance;
        let by_notional = self.cfg.max_position_pct * self.equity / entry;
        let size = by_risk.min(by_notional);

        if size < self.cfg.min_position {
            debug!(
                signal_id = signal.id,
                size,
                min = self.cfg.min_position,
                "sizing rejected: below minimum"
            );
            return OrderOutcome::Rejected {
                signal_id: signal.id,
                reason: RejectReason::SizeBelowMin,
            };
        }

        let (stop_price, raw_tp) = match signal.side {
            Side::Bullish => (entry - distance, entry + self.cfg.tp_rr * distance),
            Side::Bearish => (entry + distance, entry - self.cfg.tp_rr * distance),
        };
        // Exit hint worsened as well; order simulation reads it, we never
        // mutate the signal itself.
        let exit_slip = self.cfg.exit_slippage_pct;
        let take_profit_price = match signal.side {
            Side::Bullish => raw_tp * (1.0 - exit_slip),
            Side::Bearish => raw_tp * (1.0 + exit_slip),
        };

        debug!(
            signal_id = signal.id,
            side = %signal.side,
            size,
            entry,
            stop = stop_price,
            tp = take_profit_price,
            "order intent sized"
        );

        OrderOutcome::Intent(OrderIntent {
            signal_id: signal.id,
            side: signal.side,
            size,
            entry_price: entry,
            stop_price,
            take_profit_price,
            risk_amount: size * distance,
        })
    }
}
