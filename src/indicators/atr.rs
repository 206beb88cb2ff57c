// =============================================================================
// Average True Range (ATR) — incremental, floored
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// The first bar has no previous close; its TR is simply H - L.
//
// ATR here is the simple moving average of the last `period` TR values,
// clamped from below to a floor constant so downstream ratio math never
// divides by a near-zero range.
// =============================================================================

use std::collections::VecDeque;

/// Streaming ATR over an OHLC stream.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    floor: f64,
    prev_close: Option<f64>,
    window: VecDeque<f64>,
    sum: f64,
}

impl Atr {
    pub fn new(period: usize, floor: f64) -> Self {
        Self {
            period,
            floor,
            prev_close: None,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        }
    }

    /// Absorb one bar and return the post-update, floored ATR.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let tr = match self.prev_close {
            None => high - low,
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        };
        self.prev_close = Some(close);

        self.window.push_back(tr);
        self.sum += tr;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }

        self.value()
    }

    /// Mean of the retained TR values, clamped to the floor.
    pub fn value(&self) -> f64 {
        if self.window.is_empty() {
            return self.floor;
        }
        (self.sum / self.window.len() as f64).max(self.floor)
    }

    /// Whether a full `period` of TR values has been observed.
    pub fn is_warm(&self) -> bool {
        self.window.len() >= self.period
    }
}
