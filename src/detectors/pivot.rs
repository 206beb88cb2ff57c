// =============================================================================
// Pivot detector — confirmed swing highs/lows on a higher timeframe
// =============================================================================
//
// A swing high exists at the center of a (2L+1)-bar window when its high is
// strictly greater than every other high in the window; swing lows mirror.
// Confirmation requires the L bars after the center, so emission is delayed
// by L HTF bars relative to the pivot itself.
//
// Prominence is the margin over the closest competing extreme, in ATR units:
//   regular               sigma <= 0.5
//   significant     0.5 < sigma <= 1.0
//   major                 sigma >  1.0
// `min_sigma` drops swings below the prominence threshold.
//
// A swing high marks resting liquidity above the market: the emitted pool is
// bearish. A swing low is the mirror image.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{IndicatorConfig, OutOfOrderPolicy, PivotConfig};
use crate::detectors::DetectorUpdate;
use crate::errors::PipelineError;
use crate::events::{PoolCandidateEvent, PoolKind};
use crate::indicators::Atr;
use crate::ring_buffer::RingBuffer;
use crate::timeframe::Timeframe;
use crate::types::{Band, Bar, Side};

/// Pivot significance class by prominence in ATR units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotClass {
    Regular,
    Significant,
    Major,
}

impl PivotClass {
    fn from_sigma(sigma: f64) -> Self {
        if sigma > 1.0 {
            Self::Major
        } else if sigma > 0.5 {
            Self::Significant
        } else {
            Self::Regular
        }
    }
}

impl std::fmt::Display for PivotClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::Significant => write!(f, "significant"),
            Self::Major => write!(f, "major"),
        }
    }
}

#[derive(Debug)]
pub struct PivotDetector {
    tf: Timeframe,
    cfg: PivotConfig,
    policy: OutOfOrderPolicy,
    atr: Atr,
    window: RingBuffer<Bar>,
    last_ts: Option<DateTime<Utc>>,
}

impl PivotDetector {
    pub fn new(
        tf: Timeframe,
        cfg: PivotConfig,
        indicators: &IndicatorConfig,
        policy: OutOfOrderPolicy,
    ) -> Self {
        let window = RingBuffer::new(2 * cfg.lookback + 1);
        Self {
            tf,
            cfg,
            policy,
            atr: Atr::new(indicators.atr_period, indicators.atr_floor),
            window,
            last_ts: None,
        }
    }

    /// Feed one closed HTF bar; may confirm a swing from L bars ago.
    pub fn update(&mut self, bar: &Bar) -> Result<DetectorUpdate, PipelineError> {
        if let Some(last_ts) = self.last_ts {
            if bar.ts <= last_ts {
                let err = PipelineError::ClockSkew {
                    bar_ts: bar.ts,
                    last_ts,
                };
                return match self.policy {
                    OutOfOrderPolicy::Raise => Err(err),
                    _ => {
                        warn!(tf = %self.tf, bar_ts = %bar.ts, "stale HTF bar dropped by pivot detector");
                        Ok(DetectorUpdate::dropped(err))
                    }
                };
            }
        }

        self.atr.update(bar.high, bar.low, bar.close);
        self.window.push(bar.clone());
        self.last_ts = Some(bar.ts);

        let mut update = DetectorUpdate::default();
        if self.window.is_full() {
            let confirmed_at = bar.ts;
            if let Some(e) = self.check_swing(Side::Bearish, confirmed_at) {
                update.events.push(e);
            }
            if let Some(e) = self.check_swing(Side::Bullish, confirmed_at) {
                update.events.push(e);
            }
        }
        Ok(update)
    }

    /// `Side::Bearish` checks for a swing high, `Side::Bullish` for a swing low.
    fn check_swing(&self, side: Side, confirmed_at: DateTime<Utc>) -> Option<PoolCandidateEvent> {
        let center_idx = self.cfg.lookback;
        let center = self.window.at(center_idx)?;

        let extreme = |b: &Bar| match side {
            Side::Bearish => b.high,
            Side::Bullish => -b.low,
        };

        let pivot_value = extreme(center);
        let mut runner_up = f64::NEG_INFINITY;
        for i in 0..self.window.len() {
            if i == center_idx {
                continue;
            }
            let v = extreme(self.window.at(i)?);
            if v >= pivot_value {
                return None; // not a strict extreme
            }
            runner_up = runner_up.max(v);
        }

        let atr = self.atr.value();
        let sigma = (pivot_value - runner_up) / atr;
        if sigma < self.cfg.min_sigma {
            return None;
        }
        let class = PivotClass::from_sigma(sigma);

        let price = match side {
            Side::Bearish => center.high,
            Side::Bullish => center.low,
        };
        let half_width = (0.1 * atr).max(1e-5 * price);
        let band = Band::new(price - half_width, price + half_width);
        let strength = sigma / (1.0 + sigma);

        debug!(
            tf = %self.tf,
            side = %side,
            class = %class,
            price,
            sigma = format!("{sigma:.3}"),
            "swing pivot confirmed"
        );

        Some(PoolCandidateEvent {
            kind: PoolKind::Pivot,
            side,
            band,
            timeframe: self.tf,
            created_at: confirmed_at,
            strength,
        })
    }
}
