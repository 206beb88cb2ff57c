// =============================================================================
// Pipeline driver — one bar in, everything downstream out
// =============================================================================
//
// Single-threaded, cooperative, no suspension points. Each base bar runs the
// full chain to completion before the next is accepted:
//
//   validate -> ordering guardrails -> indicators -> closed HTF bars
//     -> detectors -> pool lifecycle -> HLZ maintenance -> zone entries
//     -> candidate FSM -> risk sizing -> order intents
//
// Every emitted event carries the driving bar's timestamp, and the relative
// order within a bar is fixed, so the serialized event log is bit-identical
// across replays. Recoverable trouble (invalid bars, drops, capacity
// refusals) becomes diagnostics + counters; `raise` policies halt the symbol.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::aggregator::TimeAggregator;
use crate::candidate::CandidateEngine;
use crate::config::PipelineConfig;
use crate::detectors::{DetectorUpdate, FvgDetector, PivotDetector};
use crate::errors::PipelineError;
use crate::events::{
    DiagnosticEvent, EventSink, OrderIntentSink, OrderOutcome, PipelineEvent, PoolCandidateEvent,
    PoolKind,
};
use crate::indicators::IndicatorPack;
use crate::metrics::MetricsRegistry;
use crate::overlap::{HlzEvent, OverlapEngine};
use crate::registry::{PoolRegistry, PoolState};
use crate::risk::RiskSizer;
use crate::timeframe::Timeframe;
use crate::types::Bar;
use crate::zone_watcher::ZoneWatcher;

pub struct Pipeline {
    indicators: IndicatorPack,
    aggregator: TimeAggregator,
    detectors: Vec<(Timeframe, FvgDetector, PivotDetector)>,
    registry: PoolRegistry,
    overlap: OverlapEngine,
    watcher: ZoneWatcher,
    candidates: CandidateEngine,
    sizer: RiskSizer,
    metrics: Arc<MetricsRegistry>,
    halted: Option<PipelineError>,
    /// Whether this bar admitted any pool, so the state gauges refresh.
    pools_created_this_bar: bool,
}

impl Pipeline {
    /// Build a pipeline for one symbol from a validated configuration.
    pub fn new(cfg: &PipelineConfig) -> Result<Self, PipelineError> {
        cfg.validate()?;

        let detectors = cfg
            .detector_timeframes()
            .into_iter()
            .map(|tf| {
                (
                    tf,
                    FvgDetector::new(
                        tf,
                        cfg.detectors.fvg.clone(),
                        &cfg.indicators,
                        cfg.detectors.out_of_order_policy,
                    ),
                    PivotDetector::new(
                        tf,
                        cfg.detectors.pivot.clone(),
                        &cfg.indicators,
                        cfg.detectors.out_of_order_policy,
                    ),
                )
            })
            .collect();

        Ok(Self {
            indicators: IndicatorPack::new(&cfg.indicators),
            aggregator: TimeAggregator::new(&cfg.aggregation),
            detectors,
            registry: PoolRegistry::new(cfg.pools.clone()),
            overlap: OverlapEngine::new(cfg.hlz.clone()),
            watcher: ZoneWatcher::new(cfg.zone_watcher.clone()),
            candidates: CandidateEngine::new(cfg.candidate.clone()),
            sizer: RiskSizer::new(cfg.risk.clone()),
            metrics: Arc::new(MetricsRegistry::new()),
            halted: None,
            pools_created_this_bar: false,
        })
    }

    /// Shared handle for external observers.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Process one base bar end-to-end.
    ///
    /// Returns `Err` only on fatal conditions (`raise` policies); the symbol
    /// is halted afterwards and every further call returns the same error.
    pub fn feed(
        &mut self,
        bar: &Bar,
        events: &mut dyn EventSink,
        orders: &mut dyn OrderIntentSink,
    ) -> Result<(), PipelineError> {
        if let Some(err) = &self.halted {
            return Err(err.clone());
        }
        self.metrics.inc("pipeline.bars_in_total");

        // Ingress validation: a malformed bar is dropped, counted, reported.
        if let Err(err) = bar.validate() {
            self.metrics.inc("pipeline.invalid_bars_total");
            self.diagnostic(events, bar, &err);
            return Ok(());
        }

        // Ordering guardrails live in the aggregator; they run before any
        // state is touched so a dropped bar leaves the pipeline unchanged.
        let t_agg = Instant::now();
        let agg_update = match self.aggregator.update(bar) {
            Ok(u) => u,
            Err(err) => return self.halt(err),
        };
        if let Some(err) = agg_update.dropped {
            self.metrics.inc_labeled("pipeline.bars_dropped_total", "kind", err.kind());
            self.diagnostic(events, bar, &err);
            return Ok(());
        }
        self.gauge_latency("aggregator", t_agg);

        let t_ind = Instant::now();
        let snapshot = self.indicators.update(bar);
        self.gauge_latency("indicators", t_ind);

        // Closed HTF bars drive the detectors; detector candidates become
        // registry pools, pools feed the overlap engine and the watcher.
        let t_det = Instant::now();
        for (tf, htf_bar) in agg_update.closed {
            self.metrics.inc_labeled("aggregator.emitted_total", "tf", tf);
            events.on_event(&PipelineEvent::HtfBarClosed {
                timeframe: tf,
                ts: htf_bar.ts,
                open: htf_bar.open,
                high: htf_bar.high,
                low: htf_bar.low,
                close: htf_bar.close,
                volume: htf_bar.volume,
            });

            let mut candidates: Vec<PoolCandidateEvent> = Vec::new();
            let mut drops: Vec<PipelineError> = Vec::new();
            for (det_tf, fvg, pivot) in &mut self.detectors {
                if *det_tf != tf {
                    continue;
                }
                for update in [fvg.update(&htf_bar)?, pivot.update(&htf_bar)?] {
                    let DetectorUpdate { events: evs, dropped } = update;
                    candidates.extend(evs);
                    drops.extend(dropped);
                }
            }
            for err in drops {
                self.metrics.inc_labeled("detectors.bars_dropped_total", "tf", tf);
                self.diagnostic(events, bar, &err);
            }

            for candidate in candidates {
                self.admit_pool_candidate(&candidate, bar, events);
            }
        }
        self.gauge_latency("detectors", t_det);

        // Pool lifecycle: expiries first, then touches off the bar close.
        let t_pool = Instant::now();
        let expired = self.registry.advance_time(bar.ts);
        let mut pools_changed = !expired.is_empty();
        for expired in expired {
            self.metrics.inc_labeled("registry.expired_total", "tf", expired.timeframe);
            events.on_event(&PipelineEvent::PoolExpired(expired.clone()));
            self.watcher.remove_pool(&expired.pool_id);
            let hlz_events = self.overlap.on_pool_expired(&expired, bar.ts);
            self.apply_hlz_events(hlz_events, bar, events);
        }

        let touched = self.registry.on_price(bar.ts, bar.close);
        pools_changed |= !touched.is_empty();
        for touched in touched {
            self.metrics.inc_labeled("registry.touched_total", "tf", touched.timeframe);
            events.on_event(&PipelineEvent::PoolTouched(touched.clone()));
            let hlz_events = self.overlap.on_pool_touched(&touched, bar.ts);
            // Dropped-on-touch membership also stops the zone being watched.
            self.apply_hlz_events(hlz_events, bar, events);
        }

        if pools_changed || self.pools_created_this_bar {
            let counts = self.registry.counts_by_tf_state();
            for tf in self.aggregator.targets() {
                let active = counts.get(&(*tf, PoolState::Active)).copied().unwrap_or(0);
                let touched = counts.get(&(*tf, PoolState::Touched)).copied().unwrap_or(0);
                self.metrics
                    .set_gauge(&format!("registry.active_pools{{tf={tf}}}"), active as u64);
                self.metrics
                    .set_gauge(&format!("registry.touched_pools{{tf={tf}}}"), touched as u64);
            }
            self.metrics.set_gauge("hlz.active", self.overlap.len() as u64);
            self.pools_created_this_bar = false;
        }
        self.gauge_latency("pool_lifecycle", t_pool);

        // Zone entries spawn candidates; candidates advance on this same bar.
        let t_zone = Instant::now();
        let entries = self.watcher.on_bar(bar);
        for entry in &entries {
            self.metrics.inc_labeled("zone_watcher.entries_total", "kind", entry.zone_kind);
            events.on_event(&PipelineEvent::ZoneEntered(entry.clone()));
            let candidate_id = self.candidates.spawn(entry);
            self.metrics.inc("candidates.spawned_total");
            events.on_event(&PipelineEvent::CandidateSpawned {
                candidate_id,
                zone_id: entry.zone_id.clone(),
                ts: bar.ts,
            });
        }
        self.gauge_latency("zone_watcher", t_zone);

        let t_cand = Instant::now();
        let fsm_update = self.candidates.on_bar(bar, &snapshot);
        for candidate_id in fsm_update.expired {
            self.metrics.inc("candidates.expired_total");
            events.on_event(&PipelineEvent::CandidateExpired {
                candidate_id,
                ts: bar.ts,
            });
        }
        for signal in fsm_update.signals {
            self.metrics.inc("candidates.ready_total");
            self.metrics.inc("signals.emitted_total");
            events.on_event(&PipelineEvent::SignalIssued(signal.clone()));

            let outcome = self.sizer.size(&signal, &snapshot);
            if let OrderOutcome::Rejected { reason, .. } = &outcome {
                self.metrics.inc_labeled("signals.rejected_total", "reason", reason);
            }
            orders.on_order(&outcome);
        }
        self.gauge_latency("candidates", t_cand);

        Ok(())
    }

    /// Look-ahead prevention: stopping the feed never emits partial buckets.
    pub fn flush(&self) -> Vec<(Timeframe, Bar)> {
        self.aggregator.flush()
    }

    /// Retained closed bars for `tf`, oldest first.
    pub fn recent_closed(&self, tf: Timeframe) -> impl Iterator<Item = &Bar> {
        self.aggregator.recent_closed(tf)
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn overlap(&self) -> &OverlapEngine {
        &self.overlap
    }

    fn admit_pool_candidate(
        &mut self,
        candidate: &PoolCandidateEvent,
        bar: &Bar,
        events: &mut dyn EventSink,
    ) {
        match self.registry.create(candidate) {
            Ok(Some(created)) => {
                let kind = match created.kind {
                    PoolKind::Fvg => "fvg",
                    PoolKind::Pivot => "pivot",
                };
                self.metrics.inc_by(
                    &format!(
                        "detectors.pools_created_total{{tf={},kind={kind}}}",
                        created.timeframe
                    ),
                    1,
                );
                events.on_event(&PipelineEvent::PoolCreated(created.clone()));
                self.pools_created_this_bar = true;

                match self.overlap.on_pool_created(&created, bar.ts) {
                    Ok(hlz_events) => self.apply_hlz_events(hlz_events, bar, events),
                    Err(err) => {
                        self.metrics.inc("hlz.capacity_refusals_total");
                        self.diagnostic(events, bar, &err);
                    }
                }

                if let Err(err) = self.watcher.add_pool(&created) {
                    self.metrics.inc("zone_watcher.capacity_refusals_total");
                    self.diagnostic(events, bar, &err);
                }
            }
            Ok(None) => {
                self.metrics.inc("registry.filtered_total");
            }
            Err(err) => {
                self.metrics.inc("registry.capacity_refusals_total");
                self.diagnostic(events, bar, &err);
            }
        }
    }

    fn apply_hlz_events(
        &mut self,
        hlz_events: Vec<HlzEvent>,
        bar: &Bar,
        events: &mut dyn EventSink,
    ) {
        for he in hlz_events {
            match he {
                HlzEvent::Created(c) => {
                    self.metrics.inc("hlz.created_total");
                    if let Err(err) = self.watcher.add_hlz(&c) {
                        self.metrics.inc("zone_watcher.capacity_refusals_total");
                        self.diagnostic(events, bar, &err);
                    }
                    events.on_event(&PipelineEvent::HlzCreated(c));
                }
                HlzEvent::Updated(u) => {
                    self.watcher.update_hlz(&u);
                    events.on_event(&PipelineEvent::HlzUpdated(u));
                }
                HlzEvent::Dissolved(d) => {
                    self.metrics.inc("hlz.dissolved_total");
                    self.watcher.remove_hlz(d.hlz_id);
                    events.on_event(&PipelineEvent::HlzDissolved(d));
                }
            }
        }
    }

    fn diagnostic(&self, events: &mut dyn EventSink, bar: &Bar, err: &PipelineError) {
        warn!(bar_ts = %bar.ts, error = %err, "recoverable pipeline error");
        events.on_event(&PipelineEvent::Diagnostic(DiagnosticEvent {
            ts: bar.ts,
            kind: err.kind().to_string(),
            detail: err.to_string(),
        }));
    }

    fn halt(&mut self, err: PipelineError) -> Result<(), PipelineError> {
        info!(error = %err, "pipeline halted");
        self.halted = Some(err.clone());
        Err(err)
    }

    fn gauge_latency(&self, stage: &str, started: Instant) {
        self.metrics.set_gauge(
            &format!("latency_ns{{stage={stage}}}"),
            started.elapsed().as_nanos() as u64,
        );
    }
}

// =============================================================================
// Scenario tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutOfOrderPolicy, PoolTfConfig};
    use crate::events::{event_log_digest, MemoryEventSink, MemoryIntentSink};
    use chrono::{DateTime, Duration, Utc};

    fn base_ts() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn m1(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            ts,
            open,
            high,
            low,
            close,
            volume,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
        }
    }

    /// 60 one-minute bars realizing exactly the given H1 OHLC.
    fn hour_of_bars(start: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Vec<Bar> {
        let mut bars = Vec::with_capacity(60);
        for i in 0..60 {
            let ts = start + Duration::minutes(i);
            let bar = if i == 0 {
                // Realizes the hour open and low.
                m1(ts, open, open.max(close), low, open, 1000.0)
            } else if i == 59 {
                // Realizes the hour high and close.
                m1(ts, close, high, close.min(low.max(close)), close, 1000.0)
            } else {
                m1(ts, close, close, close, close, 1000.0)
            };
            bars.push(bar);
        }
        bars
    }

    fn feed_all(
        pipeline: &mut Pipeline,
        bars: &[Bar],
        events: &mut MemoryEventSink,
        orders: &mut MemoryIntentSink,
    ) {
        for bar in bars {
            pipeline.feed(bar, events, orders).expect("feed succeeds");
        }
    }

    fn count_htf_closed(events: &MemoryEventSink, tf: Timeframe) -> usize {
        events
            .events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::HtfBarClosed { timeframe, .. } if *timeframe == tf))
            .count()
    }

    #[test]
    fn s1_h1_aggregation_minimum() {
        let mut cfg = PipelineConfig::default();
        cfg.aggregation.target_timeframes = vec![Timeframe::H1];
        cfg.aggregation.max_clock_skew_seconds = 0;
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();

        let start: DateTime<Utc> = "2024-01-01T10:00:00Z".parse().unwrap();
        let bars: Vec<Bar> = (0..121)
            .map(|i| {
                let close = 100.0 + 0.01 * i as f64;
                m1(
                    start + Duration::minutes(i),
                    close,
                    close + 0.01,
                    close,
                    close,
                    1000.0 + i as f64,
                )
            })
            .collect();
        feed_all(&mut pipeline, &bars, &mut events, &mut orders);

        assert_eq!(count_htf_closed(&events, Timeframe::H1), 2);
        let first = events
            .events
            .iter()
            .find_map(|e| match e {
                PipelineEvent::HtfBarClosed {
                    ts, open, high, low, close, volume, ..
                } => Some((*ts, *open, *high, *low, *close, *volume)),
                _ => None,
            })
            .unwrap();
        assert_eq!(first.0, "2024-01-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert!((first.1 - 100.00).abs() < 1e-9);
        assert!((first.2 - 100.60).abs() < 1e-9);
        assert!((first.3 - 100.00).abs() < 1e-9);
        assert!((first.4 - 100.59).abs() < 1e-9);
        assert!((first.5 - 61_770.0).abs() < 1e-9);

        assert_eq!(pipeline.metrics().counter("pipeline.bars_in_total"), 121);
        assert_eq!(
            pipeline.metrics().counter("aggregator.emitted_total{tf=H1}"),
            2
        );
    }

    #[test]
    fn fifty_nine_minutes_emit_nothing() {
        let mut cfg = PipelineConfig::default();
        cfg.aggregation.target_timeframes = vec![Timeframe::H1];
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();

        let start: DateTime<Utc> = "2024-01-01T10:01:00Z".parse().unwrap();
        let bars: Vec<Bar> = (0..59)
            .map(|i| m1(start + Duration::minutes(i), 100.0, 100.1, 100.0, 100.0, 1000.0))
            .collect();
        feed_all(&mut pipeline, &bars, &mut events, &mut orders);
        assert_eq!(count_htf_closed(&events, Timeframe::H1), 0);
        assert!(pipeline.flush().is_empty());
    }

    #[test]
    fn invalid_bar_dropped_and_reported() {
        let cfg = PipelineConfig::default();
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();

        let bad = m1(base_ts(), 100.0, 99.0, 100.0, 100.0, 1000.0); // high < open
        pipeline.feed(&bad, &mut events, &mut orders).unwrap();

        assert_eq!(pipeline.metrics().counter("pipeline.invalid_bars_total"), 1);
        assert!(matches!(events.events[0], PipelineEvent::Diagnostic(_)));
    }

    #[test]
    fn out_of_order_drop_is_recoverable() {
        let mut cfg = PipelineConfig::default();
        cfg.aggregation.max_clock_skew_seconds = 0;
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();

        pipeline
            .feed(&m1(base_ts() + Duration::minutes(5), 100.0, 100.1, 100.0, 100.0, 1000.0), &mut events, &mut orders)
            .unwrap();
        pipeline
            .feed(&m1(base_ts(), 100.0, 100.1, 100.0, 100.0, 1000.0), &mut events, &mut orders)
            .unwrap();

        assert_eq!(
            pipeline
                .metrics()
                .counter("pipeline.bars_dropped_total{kind=clock_skew}"),
            1
        );
        // The stream is still alive.
        pipeline
            .feed(&m1(base_ts() + Duration::minutes(6), 100.0, 100.1, 100.0, 100.0, 1000.0), &mut events, &mut orders)
            .unwrap();
    }

    #[test]
    fn out_of_order_raise_halts_symbol() {
        let mut cfg = PipelineConfig::default();
        cfg.aggregation.out_of_order_policy = OutOfOrderPolicy::Raise;
        cfg.aggregation.max_clock_skew_seconds = 0;
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();

        pipeline
            .feed(&m1(base_ts() + Duration::minutes(5), 100.0, 100.1, 100.0, 100.0, 1000.0), &mut events, &mut orders)
            .unwrap();
        let err = pipeline
            .feed(&m1(base_ts(), 100.0, 100.1, 100.0, 100.0, 1000.0), &mut events, &mut orders)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ClockSkew { .. }));

        // Halted: even a well-ordered bar is refused now.
        let err2 = pipeline
            .feed(&m1(base_ts() + Duration::minutes(9), 100.0, 100.1, 100.0, 100.0, 1000.0), &mut events, &mut orders)
            .unwrap_err();
        assert!(matches!(err2, PipelineError::ClockSkew { .. }));
    }

    /// Full chain: FVG pool on H1, zone entry, candidate, signal, intent.
    fn signal_path_config() -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.aggregation.target_timeframes = vec![Timeframe::H1];
        cfg.aggregation.max_clock_skew_seconds = 0;
        cfg.detectors.fvg.min_gap_atr = 0.1;
        cfg.detectors.fvg.min_rel_vol = 0.0;
        cfg.pools.strength_threshold = 0.0;
        cfg.pools.per_tf.insert(
            Timeframe::H1,
            PoolTfConfig {
                ttl_secs: 24 * 3600,
                hit_tolerance: 0.0,
                strength_floor: 0.0,
            },
        );
        cfg.candidate.expiry_secs = 24 * 3600;
        cfg
    }

    fn signal_path_bars() -> Vec<Bar> {
        let start = base_ts();
        let mut bars = Vec::new();
        // Warmup hour, then the three FVG hours: B1 caps at 110, B2 is the
        // bullish displacement, B3 leaves the [110, 114] gap.
        bars.extend(hour_of_bars(start, 100.0, 101.0, 99.0, 100.0));
        bars.extend(hour_of_bars(start + Duration::hours(1), 100.0, 110.0, 99.5, 109.0));
        bars.extend(hour_of_bars(start + Duration::hours(2), 110.0, 113.0, 109.0, 112.0));
        bars.extend(hour_of_bars(start + Duration::hours(3), 114.5, 116.0, 114.0, 115.0));

        // Hour 4: closing the B3 bucket creates the pool, then price dips
        // into the gap and closes strong above the fast EMA.
        let h4 = start + Duration::hours(4);
        bars.push(m1(h4, 115.2, 115.4, 115.1, 115.2, 1000.0));
        bars.push(m1(h4 + Duration::minutes(1), 115.2, 115.4, 115.1, 115.2, 1000.0));
        bars.push(m1(h4 + Duration::minutes(2), 115.2, 115.6, 113.5, 115.5, 2000.0));
        bars.push(m1(h4 + Duration::minutes(3), 115.5, 115.7, 115.4, 115.6, 1000.0));
        bars
    }

    #[test]
    fn s2_s5_signal_path_end_to_end() {
        let cfg = signal_path_config();
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();
        feed_all(&mut pipeline, &signal_path_bars(), &mut events, &mut orders);

        let pools: Vec<_> = events
            .events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::PoolCreated(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].timeframe, Timeframe::H1);
        assert!((pools[0].band.bottom - 110.0).abs() < 1e-9);
        assert!((pools[0].band.top - 114.0).abs() < 1e-9);
        assert!(pools[0].strength > 0.0);

        let entries = events
            .events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::ZoneEntered(_)))
            .count();
        assert_eq!(entries, 1);

        let signals: Vec<_> = events
            .events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::SignalIssued(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(signals.len(), 1);
        assert!((signals[0].entry_hint_price - 115.5).abs() < 1e-9);
        // Stop hint: the zone bottom is further than any recent swing low.
        assert!((signals[0].stop_hint_price - 110.0).abs() < 1e-9);

        assert_eq!(orders.outcomes.len(), 1);
        match &orders.outcomes[0] {
            OrderOutcome::Intent(i) => {
                assert!(i.size > 0.0);
                assert!(i.stop_price < i.entry_price);
                assert!(i.take_profit_price > i.entry_price);
            }
            OrderOutcome::Rejected { reason, .. } => panic!("unexpected rejection: {reason}"),
        }

        assert_eq!(pipeline.metrics().counter("signals.emitted_total"), 1);
        assert_eq!(pipeline.metrics().counter("candidates.spawned_total"), 1);
    }

    #[test]
    fn event_order_within_bar_is_stable() {
        let cfg = signal_path_config();
        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();
        feed_all(&mut pipeline, &signal_path_bars(), &mut events, &mut orders);

        let positions: Vec<usize> = ["HtfBarClosed", "PoolCreated", "ZoneEntered", "CandidateSpawned", "SignalIssued"]
            .iter()
            .map(|name| {
                events
                    .events
                    .iter()
                    .position(|e| variant_name(e) == *name)
                    .unwrap_or_else(|| panic!("missing {name}"))
            })
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "stage order violated: {positions:?}");
    }

    fn variant_name(e: &PipelineEvent) -> &'static str {
        match e {
            PipelineEvent::HtfBarClosed { .. } => "HtfBarClosed",
            PipelineEvent::PoolCreated(_) => "PoolCreated",
            PipelineEvent::PoolTouched(_) => "PoolTouched",
            PipelineEvent::PoolExpired(_) => "PoolExpired",
            PipelineEvent::HlzCreated(_) => "HlzCreated",
            PipelineEvent::HlzUpdated(_) => "HlzUpdated",
            PipelineEvent::HlzDissolved(_) => "HlzDissolved",
            PipelineEvent::ZoneEntered(_) => "ZoneEntered",
            PipelineEvent::CandidateSpawned { .. } => "CandidateSpawned",
            PipelineEvent::CandidateExpired { .. } => "CandidateExpired",
            PipelineEvent::SignalIssued(_) => "SignalIssued",
            PipelineEvent::Diagnostic(_) => "Diagnostic",
        }
    }

    /// Deterministic pseudo-random walk; replay must be bit-identical (S6).
    fn synthetic_walk(count: usize) -> Vec<Bar> {
        let mut bars = Vec::with_capacity(count);
        let mut state: u64 = 0x243F_6A88_85A3_08D3;
        let mut price = 50_000.0;
        for i in 0..count {
            // xorshift64*: deterministic across platforms.
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let r1 = ((state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40) as f64
                / (1u64 << 24) as f64)
                - 0.5;
            let drift = r1 * 40.0;
            let open = price;
            price += drift;
            let close = price;
            let high = open.max(close) + drift.abs() * 0.3 + 1.0;
            let low = open.min(close) - drift.abs() * 0.3 - 1.0;
            let volume = 500.0 + ((state >> 16) % 1000) as f64;
            bars.push(m1(
                base_ts() + Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume,
            ));
        }
        bars
    }

    #[test]
    fn s6_replay_determinism_digest() {
        let mut cfg = signal_path_config();
        cfg.aggregation.target_timeframes = vec![Timeframe::H1, Timeframe::H4];
        cfg.detectors.pivot.lookback = 3;
        let bars = synthetic_walk(5_000);

        let run = || {
            let mut pipeline = Pipeline::new(&cfg).unwrap();
            let mut events = MemoryEventSink::default();
            let mut orders = MemoryIntentSink::default();
            feed_all(&mut pipeline, &bars, &mut events, &mut orders);
            (event_log_digest(&events.events), events.events.len())
        };

        let (digest_a, len_a) = run();
        let (digest_b, len_b) = run();
        assert_eq!(len_a, len_b);
        assert_eq!(digest_a, digest_b);
        // The walk must actually exercise the pipeline, not skate over it.
        assert!(len_a > 50, "walk produced too few events: {len_a}");
    }

    #[test]
    fn detector_independence_on_closed_bars() {
        // Feeding the aggregator's closed H1 bars directly into a fresh
        // detector yields the same pool candidates the pipeline admitted.
        use crate::aggregator::TimeAggregator;
        use crate::detectors::FvgDetector;

        let cfg = signal_path_config();
        let bars = signal_path_bars();

        let mut agg = TimeAggregator::new(&cfg.aggregation);
        let mut closed_h1 = Vec::new();
        for bar in &bars {
            for (tf, htf) in agg.update(bar).unwrap().closed {
                if tf == Timeframe::H1 {
                    closed_h1.push(htf);
                }
            }
        }

        let mut det = FvgDetector::new(
            Timeframe::H1,
            cfg.detectors.fvg.clone(),
            &cfg.indicators,
            cfg.detectors.out_of_order_policy,
        );
        let mut direct = Vec::new();
        for htf in &closed_h1 {
            direct.extend(det.update(htf).unwrap().events);
        }

        let mut pipeline = Pipeline::new(&cfg).unwrap();
        let mut events = MemoryEventSink::default();
        let mut orders = MemoryIntentSink::default();
        feed_all(&mut pipeline, &bars, &mut events, &mut orders);
        let piped: Vec<_> = events
            .events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::PoolCreated(p) => Some((p.band, p.created_at)),
                _ => None,
            })
            .collect();

        assert_eq!(direct.len(), piped.len());
        for (d, p) in direct.iter().zip(&piped) {
            assert_eq!(d.band, p.0);
            assert_eq!(d.created_at, p.1);
        }
    }
}
