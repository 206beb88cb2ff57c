// =============================================================================
// Exponential Moving Average (EMA) — incremental
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first value seeds the EMA directly; the indicator reports itself
// warm once `period` closes have been absorbed.
// =============================================================================

/// Streaming EMA over a close-price series.
#[derive(Debug, Clone)]
pub struct Ema {
    multiplier: f64,
    period: usize,
    value: Option<f64>,
    count: usize,
}

impl Ema {
    /// Create an EMA with the given look-back `period` (non-zero; enforced at
    /// config validation).
    pub fn new(period: usize) -> Self {
        Self {
            multiplier: 2.0 / (period as f64 + 1.0),
            period,
            value: None,
            count: 0,
        }
    }

    /// Absorb one close and return the post-update EMA.
    pub fn update(&mut self, close: f64) -> f64 {
        let next = match self.value {
            None => close,
            Some(prev) => close * self.multiplier + prev * (1.0 - self.multiplier),
        };
        self.value = Some(next);
        self.count += 1;
        next
    }

    /// Latest EMA value, if any close has been absorbed.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Whether `period` closes have been absorbed.
    pub fn is_warm(&self) -> bool {
        self.count >= self.period
    }
}
