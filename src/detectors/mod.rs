// =============================================================================
// Higher-timeframe detectors
// =============================================================================
//
// Detectors run only on closed HTF bars and never mutate past output. Each
// enabled timeframe owns one instance of each detector, with its own embedded
// ATR / volume-SMA state, so timeframes warm up independently.

pub mod fvg;
pub mod pivot;

pub use fvg::FvgDetector;
pub use pivot::PivotDetector;

use crate::errors::PipelineError;
use crate::events::PoolCandidateEvent;

/// Result of feeding one closed HTF bar to a detector.
#[derive(Debug, Default)]
pub struct DetectorUpdate {
    pub events: Vec<PoolCandidateEvent>,
    /// Set when the bar was silently dropped under the `drop` policy.
    pub dropped: Option<PipelineError>,
}

impl DetectorUpdate {
    pub fn dropped(err: PipelineError) -> Self {
        Self {
            events: Vec::new(),
            dropped: Some(err),
        }
    }
}
