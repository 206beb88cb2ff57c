// =============================================================================
// Indicator pack — one streaming update per base bar
// =============================================================================
//
// Bundles the fast/slow EMA pair, the floored ATR, the volume SMA, and the
// EMA-spread regime classifier. `update` advances every member by exactly one
// bar and returns the post-update snapshot; decisions downstream are made
// against that snapshot, never against partially-advanced indicators.
//
// Regime rule (sens = regime_sensitivity):
//   bull    when ema_fast - ema_slow > +sens * close
//   bear    when ema_fast - ema_slow < -sens * close
//   neutral otherwise, and always until the pack is warm

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::IndicatorConfig;
use crate::indicators::atr::Atr;
use crate::indicators::ema::Ema;
use crate::indicators::volume_sma::VolumeSma;
use crate::types::Bar;

/// Coarse market-trend classification derived from the EMA spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Bull,
    Bear,
    Neutral,
}

impl Regime {
    /// Mirror bull and bear; neutral is side-agnostic.
    pub fn mirrored(self) -> Self {
        match self {
            Self::Bull => Self::Bear,
            Self::Bear => Self::Bull,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "bull"),
            Self::Bear => write!(f, "bear"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Indicator values as of one bar, computed before any decision on that bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ts: DateTime<Utc>,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub atr: f64,
    pub volume_sma: f64,
    pub regime: Regime,
    pub warmed_up: bool,
}

/// All incremental indicators for one symbol at the base timeframe.
#[derive(Debug, Clone)]
pub struct IndicatorPack {
    ema_fast: Ema,
    ema_slow: Ema,
    atr: Atr,
    volume_sma: VolumeSma,
    sensitivity: f64,
}

impl IndicatorPack {
    pub fn new(cfg: &IndicatorConfig) -> Self {
        Self {
            ema_fast: Ema::new(cfg.ema_fast_period),
            ema_slow: Ema::new(cfg.ema_slow_period),
            atr: Atr::new(cfg.atr_period, cfg.atr_floor),
            volume_sma: VolumeSma::new(cfg.volume_sma_period),
            sensitivity: cfg.regime_sensitivity,
        }
    }

    /// Advance all indicators by exactly one bar.
    ///
    /// Bar ordering is the driver's responsibility; the pack trusts its input.
    pub fn update(&mut self, bar: &Bar) -> IndicatorSnapshot {
        let ema_fast = self.ema_fast.update(bar.close);
        let ema_slow = self.ema_slow.update(bar.close);
        let atr = self.atr.update(bar.high, bar.low, bar.close);
        let volume_sma = self.volume_sma.update(bar.volume);

        let warmed_up = self.ema_fast.is_warm()
            && self.ema_slow.is_warm()
            && self.atr.is_warm()
            && self.volume_sma.is_warm();

        let regime = if warmed_up {
            classify_regime(ema_fast, ema_slow, bar.close, self.sensitivity)
        } else {
            Regime::Neutral
        };

        IndicatorSnapshot {
            ts: bar.ts,
            ema_fast,
            ema_slow,
            atr,
            volume_sma,
            regime,
            warmed_up,
        }
    }
}

/// EMA-spread regime rule; the spread threshold scales with price.
fn classify_regime(ema_fast: f64, ema_slow: f64, close: f64, sensitivity: f64) -> Regime {
    let spread = ema_fast - ema_slow;
    let threshold = sensitivity * close;
    if spread > threshold {
        Regime::Bull
    } else if spread < -threshold {
        Regime::Bear
    } else {
        Regime::Neutral
    }
}
