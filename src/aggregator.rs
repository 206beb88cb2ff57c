// =============================================================================
// Time aggregator — rolls base bars into closed higher-timeframe bars
// =============================================================================
//
// One in-progress accumulator per target timeframe. A bucket closes only when
// a base bar arrives that maps into a later bucket; incomplete buckets are
// never emitted, so nothing downstream can look ahead.
//
// OHLCV folding: open = first base open, high = max, low = min,
// close = last base close, volume = sum.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::{AggregationConfig, OutOfOrderPolicy};
use crate::errors::PipelineError;
use crate::ring_buffer::RingBuffer;
use crate::timeframe::{bucket_id, bucket_start, Timeframe};
use crate::types::Bar;

/// In-progress OHLCV fold for one bucket.
#[derive(Debug, Clone)]
struct BucketAcc {
    id: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Result of feeding one base bar.
#[derive(Debug, Default)]
pub struct AggregatorUpdate {
    /// Closed higher-timeframe bars, smallest timeframe first.
    pub closed: Vec<(Timeframe, Bar)>,
    /// Set when the bar was silently dropped under the `drop` policy.
    pub dropped: Option<PipelineError>,
}

/// Multi-target base-bar aggregator with ordering guardrails.
#[derive(Debug)]
pub struct TimeAggregator {
    targets: Vec<Timeframe>,
    buckets: Vec<Option<BucketAcc>>,
    /// Recent closed bars per target, bounded by `buffer_size`.
    history: Vec<RingBuffer<Bar>>,
    policy: OutOfOrderPolicy,
    strict_ordering: bool,
    max_clock_skew: Duration,
    last_ts: Option<DateTime<Utc>>,
}

impl TimeAggregator {
    pub fn new(cfg: &AggregationConfig) -> Self {
        let mut targets = cfg.target_timeframes.clone();
        // Emission order must be stable run-to-run; sort smallest first.
        targets.sort_by_key(|tf| tf.minutes());
        targets.dedup();
        let buckets = vec![None; targets.len()];
        let history = targets
            .iter()
            .map(|_| RingBuffer::new(cfg.buffer_size))
            .collect();
        Self {
            targets,
            buckets,
            history,
            policy: cfg.out_of_order_policy,
            strict_ordering: cfg.enable_strict_ordering,
            max_clock_skew: Duration::seconds(cfg.max_clock_skew_seconds.max(0)),
            last_ts: None,
        }
    }

    pub fn targets(&self) -> &[Timeframe] {
        &self.targets
    }

    /// Retained closed bars for `tf`, oldest first.
    pub fn recent_closed(&self, tf: Timeframe) -> impl Iterator<Item = &Bar> {
        self.targets
            .iter()
            .position(|t| *t == tf)
            .into_iter()
            .flat_map(move |i| self.history[i].iter())
    }

    /// Feed one base bar; returns the closed higher bars it produced.
    ///
    /// Under the `drop` policy an out-of-order bar leaves all state unchanged
    /// and is reported in `dropped`; under `raise` it is a hard error.
    pub fn update(&mut self, bar: &Bar) -> Result<AggregatorUpdate, PipelineError> {
        if let Some(err) = self.ordering_violation(bar) {
            return match self.policy {
                OutOfOrderPolicy::Raise => Err(err),
                // `recalc` is rejected at config load; treat defensively as drop.
                OutOfOrderPolicy::Drop | OutOfOrderPolicy::Recalc => {
                    warn!(bar_ts = %bar.ts, error = %err, "out-of-order base bar dropped");
                    Ok(AggregatorUpdate {
                        closed: Vec::new(),
                        dropped: Some(err),
                    })
                }
            };
        }
        self.last_ts = Some(bar.ts);

        let mut closed = Vec::new();
        for (i, tf) in self.targets.iter().enumerate() {
            let tf = *tf;
            let id = bucket_id(bar.ts, tf);
            match self.buckets[i].take() {
                None => {
                    self.buckets[i] = Some(BucketAcc::start(id, bar));
                }
                Some(mut acc) if acc.id == id => {
                    acc.fold(bar);
                    self.buckets[i] = Some(acc);
                }
                Some(acc) if id > acc.id => {
                    let htf_bar = acc.emit(tf, &bar.symbol);
                    debug!(tf = %tf, ts = %htf_bar.ts, close = htf_bar.close, "HTF bucket closed");
                    self.history[i].push(htf_bar.clone());
                    closed.push((tf, htf_bar));
                    self.buckets[i] = Some(BucketAcc::start(id, bar));
                }
                Some(acc) => {
                    // Stale bucket with strict ordering off; honour the policy.
                    let err = PipelineError::ClockSkew {
                        bar_ts: bar.ts,
                        last_ts: bucket_start_of(acc.id, tf),
                    };
                    self.buckets[i] = Some(acc);
                    match self.policy {
                        OutOfOrderPolicy::Raise => return Err(err),
                        _ => {
                            warn!(tf = %tf, bar_ts = %bar.ts, "stale bucket bar dropped");
                            return Ok(AggregatorUpdate {
                                closed,
                                dropped: Some(err),
                            });
                        }
                    }
                }
            }
        }

        Ok(AggregatorUpdate {
            closed,
            dropped: None,
        })
    }

    /// Look-ahead prevention: in-progress buckets are never flushed.
    pub fn flush(&self) -> Vec<(Timeframe, Bar)> {
        Vec::new()
    }

    fn ordering_violation(&self, bar: &Bar) -> Option<PipelineError> {
        if !self.strict_ordering {
            return None;
        }
        let last_ts = self.last_ts?;
        if bar.ts < last_ts {
            return Some(PipelineError::ClockSkew {
                bar_ts: bar.ts,
                last_ts,
            });
        }
        if self.max_clock_skew > Duration::zero() && bar.ts > last_ts + self.max_clock_skew {
            return Some(PipelineError::FutureBar {
                bar_ts: bar.ts,
                now: last_ts,
            });
        }
        None
    }
}

impl BucketAcc {
    fn start(id: i64, bar: &Bar) -> Self {
        Self {
            id,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    fn fold(&mut self, bar: &Bar) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
    }

    fn emit(&self, tf: Timeframe, symbol: &str) -> Bar {
        Bar {
            ts: bucket_start_of(self.id, tf),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            symbol: symbol.to_string(),
            timeframe: tf,
        }
    }
}

fn bucket_start_of(id: i64, tf: Timeframe) -> DateTime<Utc> {
    // Any timestamp within the bucket maps back to the same start.
    bucket_start(
        DateTime::<Utc>::from_timestamp(id * tf.minutes() * 60, 0)
            .expect("bucket id within chrono range"),
        tf,
    )
}
