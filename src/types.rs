// =============================================================================
// Shared types used across the Tidemark pipeline
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::timeframe::Timeframe;

/// A single immutable OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl Bar {
    /// Validate the structural bar invariants at ingress.
    ///
    /// `low <= min(open, close) <= max(open, close) <= high`, `volume >= 0`,
    /// and every price field finite.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidBar {
                reason: "non-finite field".into(),
            });
        }
        if self.volume < 0.0 {
            return Err(PipelineError::InvalidBar {
                reason: format!("negative volume {}", self.volume),
            });
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(PipelineError::InvalidBar {
                reason: format!(
                    "range violated: low={} open={} close={} high={}",
                    self.low, self.open, self.close, self.high
                ),
            });
        }
        Ok(())
    }

    /// Whether the bar closed above its open.
    pub fn is_bullish_body(&self) -> bool {
        self.close > self.open
    }
}

/// Direction of a pool, zone, or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bullish,
    Bearish,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Bullish => Self::Bearish,
            Self::Bearish => Self::Bullish,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}

/// A price band with `top >= bottom`, the unit of liquidity bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub bottom: f64,
    pub top: f64,
}

impl Band {
    pub fn new(bottom: f64, top: f64) -> Self {
        debug_assert!(top >= bottom, "band top {top} below bottom {bottom}");
        Self { bottom, top }
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn mid(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    /// Whether `price` lies inside the band widened symmetrically by `tol`.
    pub fn contains(&self, price: f64, tol: f64) -> bool {
        price >= self.bottom - tol && price <= self.top + tol
    }

    /// Whether `[lo, hi]` intersects the band widened symmetrically by `tol`.
    pub fn intersects_range(&self, lo: f64, hi: f64, tol: f64) -> bool {
        hi >= self.bottom - tol && lo <= self.top + tol
    }

    /// Exact intersection with `other`, if non-empty. A shared edge counts
    /// as a degenerate single-price band; bands that merely sit close never
    /// produce a value here.
    pub fn intersect(&self, other: &Band) -> Option<Band> {
        let bottom = self.bottom.max(other.bottom);
        let top = self.top.min(other.top);
        if bottom <= top {
            Some(Band { bottom, top })
        } else {
            None
        }
    }

    /// Whether the bands overlap or the gap between them is at most `tol`.
    /// Eligibility test only; it never yields a band.
    pub fn near(&self, other: &Band, tol: f64) -> bool {
        self.bottom.max(other.bottom) <= self.top.min(other.top) + tol
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            ts: "2024-01-01T00:00:00Z".parse().unwrap(),
            open,
            high,
            low,
            close,
            volume,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(bar(100.0, 101.0, 99.0, 100.5, 10.0).validate().is_ok());
        // Degenerate but legal: all prices equal, zero volume.
        assert!(bar(100.0, 100.0, 100.0, 100.0, 0.0).validate().is_ok());
    }

    #[test]
    fn high_below_body_rejected() {
        let err = bar(100.0, 100.2, 99.0, 100.5, 10.0).validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_bar");
    }

    #[test]
    fn low_above_body_rejected() {
        assert!(bar(100.0, 101.0, 100.2, 100.5, 10.0).validate().is_err());
    }

    #[test]
    fn negative_volume_rejected() {
        assert!(bar(100.0, 101.0, 99.0, 100.5, -1.0).validate().is_err());
    }

    #[test]
    fn nan_rejected() {
        assert!(bar(100.0, f64::NAN, 99.0, 100.5, 10.0).validate().is_err());
    }

    #[test]
    fn band_containment_and_tolerance() {
        let b = Band::new(100.0, 101.0);
        assert!(b.contains(100.5, 0.0));
        assert!(!b.contains(101.1, 0.0));
        assert!(b.contains(101.1, 0.2));
        assert!(b.intersects_range(101.5, 102.0, 0.6));
        assert!(!b.intersects_range(101.5, 102.0, 0.0));
    }

    #[test]
    fn band_intersection_is_exact() {
        let a = Band::new(100.0, 102.0);
        let b = Band::new(101.0, 103.0);
        let i = a.intersect(&b).unwrap();
        assert!((i.bottom - 101.0).abs() < 1e-12);
        assert!((i.top - 102.0).abs() < 1e-12);

        // Touching edges intersect in a degenerate single-price band.
        let d = Band::new(102.0, 105.0);
        let edge = a.intersect(&d).unwrap();
        assert!((edge.bottom - 102.0).abs() < 1e-12);
        assert!((edge.top - 102.0).abs() < 1e-12);

        // Disjoint bands never intersect; the gap is not a band.
        let c = Band::new(103.0, 104.0);
        assert!(a.intersect(&c).is_none());
    }

    #[test]
    fn band_near_is_eligibility_only() {
        let a = Band::new(100.0, 102.0);
        let c = Band::new(103.0, 104.0);
        // Gap of 1.0 between the bands.
        assert!(!a.near(&c, 0.5));
        assert!(a.near(&c, 1.0));
        // Overlapping bands are always near.
        let b = Band::new(101.0, 103.0);
        assert!(a.near(&b, 0.0));
        // Nearness never licenses an intersection value.
        assert!(a.intersect(&c).is_none());
    }
}
