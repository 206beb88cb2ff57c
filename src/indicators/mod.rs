// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Incremental, side-effect-free indicator implementations. Each indicator
// advances by exactly one bar per `update` call so the whole pipeline stays
// deterministic under replay; none of them ever looks ahead.

pub mod atr;
pub mod ema;
pub mod pack;
pub mod volume_sma;

pub use atr::Atr;
pub use ema::Ema;
pub use pack::{IndicatorPack, IndicatorSnapshot, Regime};
pub use volume_sma::VolumeSma;
