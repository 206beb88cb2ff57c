// =============================================================================
// Zone watcher — price-entry detection over pools and HLZs
// =============================================================================
//
// Keeps one tracked zone per watched pool (strength-gated) and per active HLZ.
// A zone is entered on the first bar whose price range intersects the band
// after a bar that did not; `confirm_closure` additionally requires the close
// inside the band. At most one entry event per zone per bar.
// =============================================================================

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::ZoneWatcherConfig;
use crate::errors::PipelineError;
use crate::events::{
    HlzCreatedEvent, HlzUpdatedEvent, PoolCreatedEvent, ZoneEnteredEvent, ZoneKind,
};
use crate::types::{Band, Bar, Side};

#[derive(Debug, Clone)]
struct Zone {
    kind: ZoneKind,
    side: Side,
    band: Band,
    /// Whether the previous bar's range already intersected the band.
    was_inside: bool,
}

#[derive(Debug)]
pub struct ZoneWatcher {
    cfg: ZoneWatcherConfig,
    zones: BTreeMap<String, Zone>,
}

impl ZoneWatcher {
    pub fn new(cfg: ZoneWatcherConfig) -> Self {
        Self {
            cfg,
            zones: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Track a newly created pool, unless it falls below the strength gate.
    pub fn add_pool(&mut self, event: &PoolCreatedEvent) -> Result<(), PipelineError> {
        if event.strength < self.cfg.min_strength {
            return Ok(());
        }
        self.insert_zone(
            event.pool_id.clone(),
            Zone {
                kind: ZoneKind::Pool,
                side: event.side,
                band: event.band,
                was_inside: false,
            },
        )
    }

    pub fn remove_pool(&mut self, pool_id: &str) {
        self.zones.remove(pool_id);
    }

    /// Track a newly created HLZ. HLZs are not strength-gated; the overlap
    /// engine already applied its own threshold.
    pub fn add_hlz(&mut self, event: &HlzCreatedEvent) -> Result<(), PipelineError> {
        self.insert_zone(
            hlz_zone_id(event.hlz_id),
            Zone {
                kind: ZoneKind::Hlz,
                side: event.side,
                band: event.band,
                was_inside: false,
            },
        )
    }

    /// Follow an HLZ band/membership update.
    pub fn update_hlz(&mut self, event: &HlzUpdatedEvent) {
        if let Some(zone) = self.zones.get_mut(&hlz_zone_id(event.hlz_id)) {
            zone.band = event.band;
        }
    }

    pub fn remove_hlz(&mut self, hlz_id: u64) {
        self.zones.remove(&hlz_zone_id(hlz_id));
    }

    /// Detect fresh entries for this bar, at most one per zone.
    pub fn on_bar(&mut self, bar: &Bar) -> Vec<ZoneEnteredEvent> {
        let tol = self.cfg.price_tolerance;
        let mut entries = Vec::new();

        for (zone_id, zone) in &mut self.zones {
            let inside = zone.band.intersects_range(bar.low, bar.high, tol);
            let fresh = inside && !zone.was_inside;
            zone.was_inside = inside;

            if !fresh {
                continue;
            }
            if self.cfg.confirm_closure && !zone.band.contains(bar.close, tol) {
                continue;
            }
            debug!(zone_id = %zone_id, kind = %zone.kind, price = bar.close, "zone entered");
            entries.push(ZoneEnteredEvent {
                zone_id: zone_id.clone(),
                zone_kind: zone.kind,
                side: zone.side,
                band: zone.band,
                entry_ts: bar.ts,
                entry_price: bar.close,
            });
        }
        entries
    }

    fn insert_zone(&mut self, id: String, zone: Zone) -> Result<(), PipelineError> {
        if self.zones.len() >= self.cfg.max_active_zones {
            return Err(PipelineError::CapacityExceeded {
                scope: "zone_watcher".into(),
            });
        }
        self.zones.insert(id, zone);
        Ok(())
    }
}

pub fn hlz_zone_id(hlz_id: u64) -> String {
    format!("hlz-{hlz_id}")
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PoolKind;
    use crate::timeframe::Timeframe;
    use chrono::{DateTime, Duration, Utc};

    fn pool_event(id: &str, bottom: f64, top: f64, strength: f64) -> PoolCreatedEvent {
        PoolCreatedEvent {
            pool_id: id.to_string(),
            kind: PoolKind::Fvg,
            side: Side::Bullish,
            band: Band::new(bottom, top),
            timeframe: Timeframe::H1,
            strength,
            created_at: "2024-01-01T00:00:00Z".parse().unwrap(),
            expires_at: "2024-01-02T00:00:00Z".parse().unwrap(),
        }
    }

    fn bar(i: i64, low: f64, high: f64, close: f64) -> Bar {
        let base: DateTime<Utc> = "2024-01-01T01:00:00Z".parse().unwrap();
        Bar {
            ts: base + Duration::minutes(i),
            open: close,
            high: high.max(close),
            low: low.min(close),
            close,
            volume: 1000.0,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
        }
    }

    #[test]
    fn entry_on_first_intersection_only() {
        let mut zw = ZoneWatcher::new(ZoneWatcherConfig::default());
        zw.add_pool(&pool_event("p1", 100.0, 101.0, 0.5)).unwrap();

        // Above the band: nothing.
        assert!(zw.on_bar(&bar(0, 102.0, 103.0, 102.5)).is_empty());
        // Dips into the band: one entry.
        let entries = zw.on_bar(&bar(1, 100.5, 103.0, 102.0));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].zone_id, "p1");
        assert_eq!(entries[0].zone_kind, ZoneKind::Pool);
        // Stays inside: no repeat entry.
        assert!(zw.on_bar(&bar(2, 100.2, 101.5, 100.8)).is_empty());
        // Leaves, then re-enters: fires again.
        assert!(zw.on_bar(&bar(3, 103.0, 104.0, 103.5)).is_empty());
        assert_eq!(zw.on_bar(&bar(4, 100.9, 103.5, 102.0)).len(), 1);
    }

    #[test]
    fn confirm_closure_requires_close_in_band() {
        let mut cfg = ZoneWatcherConfig::default();
        cfg.confirm_closure = true;
        let mut zw = ZoneWatcher::new(cfg);
        zw.add_pool(&pool_event("p1", 100.0, 101.0, 0.5)).unwrap();

        // Wick into the band, close outside: suppressed.
        assert!(zw.on_bar(&bar(0, 100.5, 103.0, 102.5)).is_empty());

        // Leave and come back with a close inside: fires.
        zw.on_bar(&bar(1, 103.0, 104.0, 103.5));
        let entries = zw.on_bar(&bar(2, 100.2, 103.0, 100.7));
        assert_eq!(entries.len(), 1);
        assert!((entries[0].entry_price - 100.7).abs() < 1e-9);
    }

    #[test]
    fn price_tolerance_widens_band() {
        let mut cfg = ZoneWatcherConfig::default();
        cfg.price_tolerance = 0.5;
        let mut zw = ZoneWatcher::new(cfg);
        zw.add_pool(&pool_event("p1", 100.0, 101.0, 0.5)).unwrap();

        // Range 101.2..102.0 misses the raw band, hits the widened one.
        let entries = zw.on_bar(&bar(0, 101.2, 102.0, 101.8));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn weak_pools_are_not_watched() {
        let mut cfg = ZoneWatcherConfig::default();
        cfg.min_strength = 0.5;
        let mut zw = ZoneWatcher::new(cfg);
        zw.add_pool(&pool_event("weak", 100.0, 101.0, 0.3)).unwrap();
        assert!(zw.is_empty());
        assert!(zw.on_bar(&bar(0, 100.0, 101.0, 100.5)).is_empty());
    }

    #[test]
    fn removed_zone_stops_firing() {
        let mut zw = ZoneWatcher::new(ZoneWatcherConfig::default());
        zw.add_pool(&pool_event("p1", 100.0, 101.0, 0.5)).unwrap();
        zw.remove_pool("p1");
        assert!(zw.on_bar(&bar(0, 100.0, 101.0, 100.5)).is_empty());
    }

    #[test]
    fn capacity_cap_refuses_new_zone() {
        let mut cfg = ZoneWatcherConfig::default();
        cfg.max_active_zones = 1;
        let mut zw = ZoneWatcher::new(cfg);
        zw.add_pool(&pool_event("p1", 100.0, 101.0, 0.5)).unwrap();
        let err = zw.add_pool(&pool_event("p2", 200.0, 201.0, 0.5)).unwrap_err();
        assert!(matches!(err, PipelineError::CapacityExceeded { .. }));
    }

    #[test]
    fn hlz_zone_follows_band_updates() {
        let mut zw = ZoneWatcher::new(ZoneWatcherConfig::default());
        let created = HlzCreatedEvent {
            hlz_id: 1,
            side: Side::Bullish,
            band: Band::new(100.0, 101.0),
            member_pool_ids: vec!["a".into(), "b".into()],
            timeframes: vec![Timeframe::H1, Timeframe::H4],
            combined_strength: 1.0,
            ts: "2024-01-01T00:00:00Z".parse().unwrap(),
        };
        zw.add_hlz(&created).unwrap();

        // Narrow the band away from the price; no entry.
        zw.update_hlz(&HlzUpdatedEvent {
            hlz_id: 1,
            band: Band::new(90.0, 91.0),
            member_pool_ids: vec!["a".into(), "b".into()],
            combined_strength: 1.0,
            ts: "2024-01-01T00:00:00Z".parse().unwrap(),
        });
        assert!(zw.on_bar(&bar(0, 100.0, 101.0, 100.5)).is_empty());

        let entries = zw.on_bar(&bar(1, 90.5, 100.0, 99.0));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].zone_id, "hlz-1");
        assert_eq!(entries[0].zone_kind, ZoneKind::Hlz);

        zw.remove_hlz(1);
        assert!(zw.is_empty());
    }
}
