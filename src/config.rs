// =============================================================================
// Pipeline configuration — typed tree with serde defaults and atomic save
// =============================================================================
//
// Every tunable of the pipeline lives here. All fields carry serde defaults so
// that loading an older JSON file never breaks when new knobs are added, and
// `PipelineConfig::default()` is a complete, runnable configuration.
//
// Persistence uses the atomic tmp + rename pattern to prevent corruption on
// crash. `validate()` is called once at construction time; the pipeline core
// assumes a validated config afterwards.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::PipelineError;
use crate::indicators::Regime;
use crate::timeframe::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_source_tf_minutes() -> i64 {
    1
}

fn default_target_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::H1, Timeframe::H4]
}

fn default_buffer_size() -> usize {
    512
}

fn default_max_clock_skew_seconds() -> i64 {
    120
}

fn default_ema_fast_period() -> usize {
    9
}

fn default_ema_slow_period() -> usize {
    21
}

fn default_atr_period() -> usize {
    14
}

fn default_volume_sma_period() -> usize {
    20
}

fn default_regime_sensitivity() -> f64 {
    0.0005
}

fn default_atr_floor() -> f64 {
    1e-5
}

fn default_min_gap_atr() -> f64 {
    0.3
}

fn default_pivot_lookback() -> usize {
    5
}

fn default_strength_threshold() -> f64 {
    0.1
}

fn default_grace_period_secs() -> i64 {
    300
}

fn default_max_pools_per_tf() -> usize {
    256
}

fn default_min_members() -> usize {
    2
}

fn default_max_active_hlzs() -> usize {
    64
}

fn default_max_active_zones() -> usize {
    512
}

fn default_candidate_expiry_secs() -> i64 {
    3600
}

fn default_swing_lookback() -> usize {
    20
}

fn default_allowed_regimes() -> Vec<Regime> {
    vec![Regime::Bull, Regime::Neutral]
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_sl_atr_multiple() -> f64 {
    1.5
}

fn default_tp_rr() -> f64 {
    2.0
}

fn default_max_position_pct() -> f64 {
    0.5
}

fn default_account_equity() -> f64 {
    10_000.0
}

// =============================================================================
// Aggregation
// =============================================================================

/// What to do with a base bar that maps into an already-closed bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfOrderPolicy {
    /// Silently ignore the bar (counted and logged).
    Drop,
    /// Fail the symbol with `ClockSkew`.
    Raise,
    /// Reprocess history. Not supported; rejected by `validate()`.
    Recalc,
}

impl Default for OutOfOrderPolicy {
    fn default() -> Self {
        Self::Drop
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Base timeframe of incoming bars, in minutes.
    #[serde(default = "default_source_tf_minutes")]
    pub source_tf_minutes: i64,

    /// Higher timeframes to aggregate into.
    #[serde(default = "default_target_timeframes")]
    pub target_timeframes: Vec<Timeframe>,

    /// Ring-buffer capacity for retained closed bars per target timeframe.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub out_of_order_policy: OutOfOrderPolicy,

    /// Bars further than this beyond the last accepted timestamp fail as
    /// `FutureBar` when strict ordering is on. Zero disables the check.
    #[serde(default = "default_max_clock_skew_seconds")]
    pub max_clock_skew_seconds: i64,

    /// Require non-decreasing timestamps across `feed` calls.
    #[serde(default = "default_true")]
    pub enable_strict_ordering: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            source_tf_minutes: default_source_tf_minutes(),
            target_timeframes: default_target_timeframes(),
            buffer_size: default_buffer_size(),
            out_of_order_policy: OutOfOrderPolicy::default(),
            max_clock_skew_seconds: default_max_clock_skew_seconds(),
            enable_strict_ordering: true,
        }
    }
}

// =============================================================================
// Indicators
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_ema_fast_period")]
    pub ema_fast_period: usize,

    #[serde(default = "default_ema_slow_period")]
    pub ema_slow_period: usize,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    #[serde(default = "default_volume_sma_period")]
    pub volume_sma_period: usize,

    /// EMA-spread threshold for regime classification, as a fraction of close.
    #[serde(default = "default_regime_sensitivity")]
    pub regime_sensitivity: f64,

    /// Minimal ATR value; prevents divide-by-near-zero downstream.
    #[serde(default = "default_atr_floor")]
    pub atr_floor: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_fast_period: default_ema_fast_period(),
            ema_slow_period: default_ema_slow_period(),
            atr_period: default_atr_period(),
            volume_sma_period: default_volume_sma_period(),
            regime_sensitivity: default_regime_sensitivity(),
            atr_floor: default_atr_floor(),
        }
    }
}

// =============================================================================
// Detectors
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FvgConfig {
    /// Gap qualifies when `gap >= min_gap_atr * ATR`.
    #[serde(default = "default_min_gap_atr")]
    pub min_gap_atr: f64,

    /// Gap qualifies when `gap / B2.close >= min_gap_pct` (OR with the ATR rule).
    #[serde(default)]
    pub min_gap_pct: f64,

    /// Displacement-volume filter: `B2.volume >= min_rel_vol * volume_sma`.
    /// Zero disables the filter.
    #[serde(default)]
    pub min_rel_vol: f64,
}

impl Default for FvgConfig {
    fn default() -> Self {
        Self {
            min_gap_atr: default_min_gap_atr(),
            min_gap_pct: 0.0,
            min_rel_vol: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotConfig {
    /// Bars on each side required to confirm a swing point.
    #[serde(default = "default_pivot_lookback")]
    pub lookback: usize,

    /// Minimum pivot prominence in ATR units; zero admits every swing.
    #[serde(default)]
    pub min_sigma: f64,
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            lookback: default_pivot_lookback(),
            min_sigma: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub fvg: FvgConfig,

    #[serde(default)]
    pub pivot: PivotConfig,

    #[serde(default)]
    pub out_of_order_policy: OutOfOrderPolicy,

    /// Subset of the aggregation targets the detectors run on.
    /// Empty means: all aggregation targets.
    #[serde(default)]
    pub enabled_timeframes: Vec<Timeframe>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            fvg: FvgConfig::default(),
            pivot: PivotConfig::default(),
            out_of_order_policy: OutOfOrderPolicy::default(),
            enabled_timeframes: Vec::new(),
        }
    }
}

// =============================================================================
// Pools
// =============================================================================

/// Per-timeframe pool lifecycle knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolTfConfig {
    /// Pool lifetime from creation, in seconds.
    pub ttl_secs: i64,

    /// Price tolerance applied when testing a touch.
    #[serde(default)]
    pub hit_tolerance: f64,

    /// Pools below this detector strength are refused for this timeframe.
    #[serde(default)]
    pub strength_floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Overrides per timeframe; anything absent uses `tf_config` defaults.
    #[serde(default)]
    pub per_tf: BTreeMap<Timeframe, PoolTfConfig>,

    /// Global floor for detector strength, applied before per-tf floors.
    #[serde(default = "default_strength_threshold")]
    pub strength_threshold: f64,

    /// How long an EXPIRED pool is retained before removal.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: i64,

    /// Hard cap on live (non-removed) pools per timeframe.
    #[serde(default = "default_max_pools_per_tf")]
    pub max_pools_per_tf: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            per_tf: BTreeMap::new(),
            strength_threshold: default_strength_threshold(),
            grace_period_secs: default_grace_period_secs(),
            max_pools_per_tf: default_max_pools_per_tf(),
        }
    }
}

impl PoolsConfig {
    /// Effective per-timeframe config: explicit override or the default of
    /// 24 buckets of lifetime and zero tolerances.
    pub fn tf_config(&self, tf: Timeframe) -> PoolTfConfig {
        self.per_tf.get(&tf).copied().unwrap_or(PoolTfConfig {
            ttl_secs: tf.seconds() * 24,
            hit_tolerance: 0.0,
            strength_floor: 0.0,
        })
    }
}

// =============================================================================
// HLZ
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlzConfig {
    /// Minimum pools whose bands must overlap to form a zone.
    #[serde(default = "default_min_members")]
    pub min_members: usize,

    /// Minimum combined (tf-weighted) strength to form a zone.
    #[serde(default)]
    pub min_strength: f64,

    /// Gap tolerance when testing whether two zones are close enough to
    /// merge. Eligibility only; zone bands are always exact intersections.
    #[serde(default)]
    pub merge_tolerance: f64,

    /// Allow bullish and bearish pools in the same zone.
    #[serde(default)]
    pub side_mixing: bool,

    #[serde(default = "default_max_active_hlzs")]
    pub max_active_hlzs: usize,

    /// Recompute band/strength on membership changes.
    #[serde(default = "default_true")]
    pub recompute_on_update: bool,

    /// Keep TOUCHED pools as members until they expire.
    #[serde(default = "default_true")]
    pub retain_touched: bool,

    /// Strength weight per timeframe; absent timeframes weigh 1.0.
    #[serde(default)]
    pub tf_weight: BTreeMap<Timeframe, f64>,
}

impl Default for HlzConfig {
    fn default() -> Self {
        Self {
            min_members: default_min_members(),
            min_strength: 0.0,
            merge_tolerance: 0.0,
            side_mixing: false,
            max_active_hlzs: default_max_active_hlzs(),
            recompute_on_update: true,
            retain_touched: true,
            tf_weight: BTreeMap::new(),
        }
    }
}

impl HlzConfig {
    pub fn weight(&self, tf: Timeframe) -> f64 {
        self.tf_weight.get(&tf).copied().unwrap_or(1.0)
    }
}

// =============================================================================
// Zone watcher
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneWatcherConfig {
    /// Symmetric widening of every zone band.
    #[serde(default)]
    pub price_tolerance: f64,

    /// Require the bar close inside the band, not just a range intersection.
    #[serde(default)]
    pub confirm_closure: bool,

    /// Pools below this strength are not watched (HLZs always are).
    #[serde(default)]
    pub min_strength: f64,

    #[serde(default = "default_max_active_zones")]
    pub max_active_zones: usize,
}

impl Default for ZoneWatcherConfig {
    fn default() -> Self {
        Self {
            price_tolerance: 0.0,
            confirm_closure: false,
            min_strength: 0.0,
            max_active_zones: default_max_active_zones(),
        }
    }
}

// =============================================================================
// Candidate FSM
// =============================================================================

/// A named half-open UTC time-of-day window, in minutes since midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub name: String,
    /// Inclusive start, minutes since 00:00 UTC.
    pub start_minute: u32,
    /// Exclusive end, minutes since 00:00 UTC. May wrap past midnight.
    pub end_minute: u32,
    /// Exclusion window (e.g. a low-volume lunch block): bars inside it are
    /// blocked even when an allowed session also covers them.
    #[serde(default)]
    pub exclude: bool,
}

impl SessionWindow {
    /// Whether `ts` falls inside the window (half-open, UTC).
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let minute = ts.hour() * 60 + ts.minute();
        if self.start_minute <= self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            // Wrapping window, e.g. 22:00 -> 06:00.
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFilterConfig {
    /// Require fast/slow EMA alignment with the trade direction.
    #[serde(default = "default_true")]
    pub ema_alignment: bool,

    /// Near-alignment allowance, as a percentage of the slow EMA.
    #[serde(default)]
    pub ema_tolerance_pct: f64,

    /// Require `bar.volume >= volume_multiple * volume_sma`. Zero disables.
    #[serde(default)]
    pub volume_multiple: f64,

    /// Allowed regimes for longs; mirrored (bull <-> bear) for shorts.
    #[serde(default = "default_allowed_regimes")]
    pub regime: Vec<Regime>,

    /// Toggle for the regime filter.
    #[serde(default = "default_true")]
    pub regime_enabled: bool,

    /// Session windows in which signals are allowed. Empty = always open.
    #[serde(default)]
    pub sessions: Vec<SessionWindow>,

    /// Minimum spacing between READY signals per side, in seconds.
    #[serde(default)]
    pub min_entry_spacing_secs: i64,
}

impl Default for CandidateFilterConfig {
    fn default() -> Self {
        Self {
            ema_alignment: true,
            ema_tolerance_pct: 0.0,
            volume_multiple: 0.0,
            regime: default_allowed_regimes(),
            regime_enabled: true,
            sessions: Vec::new(),
            min_entry_spacing_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateConfig {
    /// Candidate lifetime from zone entry, in seconds.
    #[serde(default = "default_candidate_expiry_secs")]
    pub expiry_secs: i64,

    /// Base bars considered for the swing-based stop hint.
    #[serde(default = "default_swing_lookback")]
    pub swing_lookback: usize,

    #[serde(default)]
    pub filters: CandidateFilterConfig,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_candidate_expiry_secs(),
            swing_lookback: default_swing_lookback(),
            filters: CandidateFilterConfig::default(),
        }
    }
}

// =============================================================================
// Risk
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Account equity used for sizing.
    #[serde(default = "default_account_equity")]
    pub account_equity: f64,

    /// Fraction of equity risked per trade.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// ATR multiple floor for the stop distance.
    #[serde(default = "default_sl_atr_multiple")]
    pub sl_atr_multiple: f64,

    /// Reward : risk ratio for the take-profit.
    #[serde(default = "default_tp_rr")]
    pub tp_rr: f64,

    /// Orders smaller than this are rejected.
    #[serde(default)]
    pub min_position: f64,

    /// Cap on position notional as a fraction of equity.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    /// Entry worsened by this fraction (e.g. 0.0005 = 5 bps).
    #[serde(default)]
    pub entry_slippage_pct: f64,

    /// Exit hint worsened by this fraction.
    #[serde(default)]
    pub exit_slippage_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_equity: default_account_equity(),
            risk_per_trade: default_risk_per_trade(),
            sl_atr_multiple: default_sl_atr_multiple(),
            tp_rr: default_tp_rr(),
            min_position: 0.0,
            max_position_pct: default_max_position_pct(),
            entry_slippage_pct: 0.0,
            exit_slippage_pct: 0.0,
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for one pipeline instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub indicators: IndicatorConfig,

    #[serde(default)]
    pub detectors: DetectorConfig,

    #[serde(default)]
    pub pools: PoolsConfig,

    #[serde(default)]
    pub hlz: HlzConfig,

    #[serde(default)]
    pub zone_watcher: ZoneWatcherConfig,

    #[serde(default)]
    pub candidate: CandidateConfig,

    #[serde(default)]
    pub risk: RiskConfig,
}

impl PipelineConfig {
    /// Timeframes the detectors actually run on.
    pub fn detector_timeframes(&self) -> Vec<Timeframe> {
        if self.detectors.enabled_timeframes.is_empty() {
            self.aggregation.target_timeframes.clone()
        } else {
            self.detectors.enabled_timeframes.clone()
        }
    }

    /// Reject incoherent configurations before the pipeline is built.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |reason: String| Err(PipelineError::InvalidConfig { reason });

        if self.aggregation.out_of_order_policy == OutOfOrderPolicy::Recalc
            || self.detectors.out_of_order_policy == OutOfOrderPolicy::Recalc
        {
            return fail(
                "out_of_order_policy \"recalc\" is not supported; use drop or raise".into(),
            );
        }
        if self.aggregation.source_tf_minutes <= 0 {
            return fail("aggregation.source_tf_minutes must be positive".into());
        }
        if self.aggregation.buffer_size == 0 {
            return fail("aggregation.buffer_size must be non-zero".into());
        }
        for tf in &self.aggregation.target_timeframes {
            if tf.minutes() <= self.aggregation.source_tf_minutes {
                return fail(format!(
                    "target timeframe {tf} is not larger than the {}-minute source",
                    self.aggregation.source_tf_minutes
                ));
            }
            if tf.minutes() % self.aggregation.source_tf_minutes != 0 {
                return fail(format!(
                    "target timeframe {tf} is not a multiple of the source timeframe"
                ));
            }
        }
        for tf in &self.detectors.enabled_timeframes {
            if !self.aggregation.target_timeframes.contains(tf) {
                return fail(format!(
                    "detectors.enabled_timeframes contains {tf} which is not aggregated"
                ));
            }
        }
        if self.indicators.ema_fast_period == 0
            || self.indicators.ema_slow_period == 0
            || self.indicators.atr_period == 0
            || self.indicators.volume_sma_period == 0
        {
            return fail("indicator periods must be non-zero".into());
        }
        if self.indicators.ema_fast_period >= self.indicators.ema_slow_period {
            return fail("indicators.ema_fast_period must be below ema_slow_period".into());
        }
        if self.indicators.atr_floor <= 0.0 {
            return fail("indicators.atr_floor must be positive".into());
        }
        if self.detectors.pivot.lookback == 0 {
            return fail("detectors.pivot.lookback must be non-zero".into());
        }
        for (tf, cfg) in &self.pools.per_tf {
            if cfg.ttl_secs <= 0 {
                return fail(format!("pools.{tf}.ttl must be positive"));
            }
        }
        if self.pools.grace_period_secs < 0 {
            return fail("pools.grace_period must be non-negative".into());
        }
        if self.hlz.min_members < 2 {
            return fail("hlz.min_members must be at least 2".into());
        }
        if self.candidate.expiry_secs <= 0 {
            return fail("candidate.expiry must be positive".into());
        }
        if self.candidate.swing_lookback == 0 {
            return fail("candidate.swing_lookback must be non-zero".into());
        }
        for w in &self.candidate.filters.sessions {
            if w.start_minute >= 1440 || w.end_minute > 1440 {
                return fail(format!("session window {} exceeds the UTC day", w.name));
            }
        }
        if !(self.risk.risk_per_trade > 0.0 && self.risk.risk_per_trade < 1.0) {
            return fail("risk.risk_per_trade must be in (0, 1)".into());
        }
        if self.risk.tp_rr <= 0.0 {
            return fail("risk.tp_rr must be positive".into());
        }
        if self.risk.max_position_pct <= 0.0 {
            return fail("risk.max_position_pct must be positive".into());
        }
        Ok(())
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid pipeline config in {}", path.display()))?;

        info!(
            path = %path.display(),
            targets = ?config.aggregation.target_timeframes,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }
}
