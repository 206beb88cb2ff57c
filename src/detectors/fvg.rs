// =============================================================================
// Fair-Value-Gap detector
// =============================================================================
//
// Three-bar imbalance pattern on a single higher timeframe, window B1 B2 B3:
//
//   bullish:  B3.low  > B1.high  and B2 closed above its open
//             gap band = [B1.high, B3.low]
//   bearish:  B3.high < B1.low   and B2 closed below its open
//             gap band = [B3.high, B1.low]
//
// Qualification is OR-logic over two thresholds, each disabled at zero:
//   gap >= min_gap_atr * ATR        (ATR as of B2)
//   gap / B2.close >= min_gap_pct
// With both thresholds zero every structural gap qualifies.
//
// The displacement-volume filter requires B2.volume >= min_rel_vol * SMA
// (SMA as of B2); min_rel_vol = 0 disables it.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{FvgConfig, IndicatorConfig, OutOfOrderPolicy};
use crate::detectors::DetectorUpdate;
use crate::errors::PipelineError;
use crate::events::{PoolCandidateEvent, PoolKind};
use crate::indicators::{Atr, VolumeSma};
use crate::ring_buffer::RingBuffer;
use crate::timeframe::Timeframe;
use crate::types::{Band, Bar, Side};

#[derive(Debug)]
pub struct FvgDetector {
    tf: Timeframe,
    cfg: FvgConfig,
    policy: OutOfOrderPolicy,
    atr: Atr,
    volume_sma: VolumeSma,
    window: RingBuffer<Bar>,
    last_ts: Option<DateTime<Utc>>,
}

impl FvgDetector {
    pub fn new(
        tf: Timeframe,
        cfg: FvgConfig,
        indicators: &IndicatorConfig,
        policy: OutOfOrderPolicy,
    ) -> Self {
        Self {
            tf,
            cfg,
            policy,
            atr: Atr::new(indicators.atr_period, indicators.atr_floor),
            volume_sma: VolumeSma::new(indicators.volume_sma_period),
            window: RingBuffer::new(3),
            last_ts: None,
        }
    }

    /// Feed one closed HTF bar.
    ///
    /// The pattern is evaluated with indicator state as of B2 (the bar before
    /// the incoming one); only afterwards is the incoming bar absorbed, so a
    /// gap is always measured against pre-gap volatility.
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
                        warn!(tf = %self.tf, bar_ts = %bar.ts, "stale HTF bar dropped by FVG detector");
                        Ok(DetectorUpdate::dropped(err))
                    }
                };
            }
        }

        self.window.push(bar.clone());
        let mut update = DetectorUpdate::default();

        if self.window.len() == 3 {
            if let Some(event) = self.evaluate() {
                update.events.push(event);
            }
        }

        self.atr.update(bar.high, bar.low, bar.close);
        self.volume_sma.update(bar.volume);
        self.last_ts = Some(bar.ts);
        Ok(update)
    }

    fn evaluate(&self) -> Option<PoolCandidateEvent> {
        let b1 = self.window.at(0)?;
        let b2 = self.window.at(1)?;
        let b3 = self.window.at(2)?;

        let (side, band) = if b3.low > b1.high && b2.close > b2.open {
            (Side::Bullish, Band::new(b1.high, b3.low))
        } else if b3.high < b1.low && b2.close < b2.open {
            (Side::Bearish, Band::new(b3.high, b1.low))
        } else {
            return None;
        };

        let gap = band.height();
        let atr = self.atr.value();
        let gap_pct = if b2.close > 0.0 { gap / b2.close } else { 0.0 };

        let atr_rule = self.cfg.min_gap_atr > 0.0 && gap >= self.cfg.min_gap_atr * atr;
        let pct_rule = self.cfg.min_gap_pct > 0.0 && gap_pct >= self.cfg.min_gap_pct;
        let has_qualification = self.cfg.min_gap_atr > 0.0 || self.cfg.min_gap_pct > 0.0;
        if has_qualification && !atr_rule && !pct_rule {
            return None;
        }

        if self.cfg.min_rel_vol > 0.0 {
            let floor = self.cfg.min_rel_vol * self.volume_sma.value();
            if b2.volume < floor {
                return None;
            }
        }

        // Normalized gap size; percentage terms until the HTF ATR is warm.
        let g = if self.atr.is_warm() {
            gap / atr
        } else {
            gap_pct * 100.0
        };
        let strength = g / (1.0 + g);

        debug!(
            tf = %self.tf,
            side = %side,
            bottom = band.bottom,
            top = band.top,
            gap,
            strength = format!("{strength:.3}"),
            "FVG detected"
        );

        Some(PoolCandidateEvent {
            kind: PoolKind::Fvg,
            side,
            band,
            timeframe: self.tf,
            created_at: b3.ts,
            strength,
        })
    }
}
