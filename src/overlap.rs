// =============================================================================
// Overlap engine — High-Liquidity Zones from intersecting pools
// =============================================================================
//
// The engine never holds a pool; it mirrors pool lifecycles by id from the
// registry's event stream (weak references only). A pool belongs to at most
// one HLZ at a time.
//
// On PoolCreated the engine first tries to extend an existing compatible HLZ
// (lowest id wins), then tries to found a new one from unassigned intersecting
// pools. Band intersection is exact: a zone's stored band never extends
// outside any member's range. `merge_tolerance` widens only the eligibility
// test between two zones; a merge still requires the pooled members to share
// a real intersection. On expiry (and on touch when `retain_touched` is off)
// membership is dropped and the zone dissolves the moment it falls below
// `min_members`.
//
// Combined strength is the timeframe-weighted sum of member strengths.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::HlzConfig;
use crate::errors::PipelineError;
use crate::events::{
    HlzCreatedEvent, HlzDissolvedEvent, HlzUpdatedEvent, PoolCreatedEvent, PoolExpiredEvent,
    PoolTouchedEvent,
};
use crate::timeframe::Timeframe;
use crate::types::{Band, Side};

/// Lifecycle notification emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HlzEvent {
    Created(HlzCreatedEvent),
    Updated(HlzUpdatedEvent),
    Dissolved(HlzDissolvedEvent),
}

/// A High-Liquidity Zone: the intersection band of its member pools.
#[derive(Debug, Clone, PartialEq)]
pub struct Hlz {
    pub id: u64,
    pub side: Side,
    pub band: Band,
    /// Member pool ids, sorted.
    pub members: Vec<String>,
    pub timeframes: BTreeSet<Timeframe>,
    pub combined_strength: f64,
}

/// Weak mirror of one live pool.
#[derive(Debug, Clone)]
struct PoolRef {
    side: Side,
    band: Band,
    timeframe: Timeframe,
    strength: f64,
}

#[derive(Debug)]
pub struct OverlapEngine {
    cfg: HlzConfig,
    pools: BTreeMap<String, PoolRef>,
    hlzs: BTreeMap<u64, Hlz>,
    member_to_hlz: BTreeMap<String, u64>,
    next_id: u64,
}

impl OverlapEngine {
    pub fn new(cfg: HlzConfig) -> Self {
        Self {
            cfg,
            pools: BTreeMap::new(),
            hlzs: BTreeMap::new(),
            member_to_hlz: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn active_hlzs(&self) -> impl Iterator<Item = &Hlz> {
        self.hlzs.values()
    }

    pub fn len(&self) -> usize {
        self.hlzs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hlzs.is_empty()
    }

    /// A new ACTIVE pool: extend a compatible zone or try to found one.
    ///
    /// `CapacityExceeded` refuses only the new zone; existing zones and the
    /// pool itself are unaffected.
    pub fn on_pool_created(
        &mut self,
        event: &PoolCreatedEvent,
        ts: DateTime<Utc>,
    ) -> Result<Vec<HlzEvent>, PipelineError> {
        let pool = PoolRef {
            side: event.side,
            band: event.band,
            timeframe: event.timeframe,
            strength: event.strength,
        };
        self.pools.insert(event.pool_id.clone(), pool);

        let mut out = Vec::new();

        // 1. Extend the lowest-id compatible zone whose member intersection
        //    stays non-empty with the new pool included.
        let mut extended = None;
        for (id, hlz) in &self.hlzs {
            if !self.cfg.side_mixing && hlz.side != event.side {
                continue;
            }
            let mut members = hlz.members.clone();
            members.push(event.pool_id.clone());
            if let Some(band) = self.intersection_of(&members) {
                extended = Some((*id, members, band));
                break;
            }
        }

        if let Some((id, mut members, band)) = extended {
            members.sort();
            self.member_to_hlz.insert(event.pool_id.clone(), id);
            let (strength, timeframes) = self.aggregate(&members);
            let hlz = self.hlzs.get_mut(&id).expect("extended zone exists");
            hlz.members = members;
            hlz.band = band;
            hlz.combined_strength = strength;
            hlz.timeframes = timeframes;
            debug!(hlz_id = id, pool_id = %event.pool_id, "HLZ extended");
            out.push(HlzEvent::Updated(HlzUpdatedEvent {
                hlz_id: id,
                band: hlz.band,
                member_pool_ids: hlz.members.clone(),
                combined_strength: hlz.combined_strength,
                ts,
            }));
            out.extend(self.merge_pass(ts));
            return Ok(out);
        }

        // 2. Found a new zone from unassigned intersecting pools.
        let mut members = vec![event.pool_id.clone()];
        let mut band = event.band;
        for (id, other) in &self.pools {
            if id == &event.pool_id || self.member_to_hlz.contains_key(id) {
                continue;
            }
            if !self.cfg.side_mixing && other.side != event.side {
                continue;
            }
            if let Some(narrowed) = band.intersect(&other.band) {
                band = narrowed;
                members.push(id.clone());
            }
        }

        if members.len() < self.cfg.min_members {
            return Ok(out);
        }
        let (strength, timeframes) = self.aggregate(&members);
        if strength < self.cfg.min_strength {
            return Ok(out);
        }
        if self.hlzs.len() >= self.cfg.max_active_hlzs {
            warn!(cap = self.cfg.max_active_hlzs, "HLZ cap reached; zone refused");
            return Err(PipelineError::CapacityExceeded {
                scope: "hlz".into(),
            });
        }

        members.sort();
        let id = self.next_id;
        self.next_id += 1;
        for m in &members {
            self.member_to_hlz.insert(m.clone(), id);
        }
        let hlz = Hlz {
            id,
            side: event.side,
            band,
            members: members.clone(),
            timeframes: timeframes.clone(),
            combined_strength: strength,
        };
        debug!(
            hlz_id = id,
            members = members.len(),
            bottom = band.bottom,
            top = band.top,
            "HLZ created"
        );
        self.hlzs.insert(id, hlz);
        out.push(HlzEvent::Created(HlzCreatedEvent {
            hlz_id: id,
            side: event.side,
            band,
            member_pool_ids: members,
            timeframes: timeframes.into_iter().collect(),
            combined_strength: strength,
            ts,
        }));
        out.extend(self.merge_pass(ts));
        Ok(out)
    }

    /// Touched pools keep their membership by default; dropping is opt-in.
    pub fn on_pool_touched(&mut self, event: &PoolTouchedEvent, ts: DateTime<Utc>) -> Vec<HlzEvent> {
        if self.cfg.retain_touched {
            return Vec::new();
        }
        self.remove_pool(&event.pool_id, ts)
    }

    pub fn on_pool_expired(&mut self, event: &PoolExpiredEvent, ts: DateTime<Utc>) -> Vec<HlzEvent> {
        self.remove_pool(&event.pool_id, ts)
    }

    /// Drop a pool from the mirror and from any zone it belongs to.
    fn remove_pool(&mut self, pool_id: &str, ts: DateTime<Utc>) -> Vec<HlzEvent> {
        self.pools.remove(pool_id);
        let Some(hlz_id) = self.member_to_hlz.remove(pool_id) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let hlz = self.hlzs.get_mut(&hlz_id).expect("membership points at a zone");
        hlz.members.retain(|m| m != pool_id);

        if hlz.members.len() < self.cfg.min_members {
            let members = std::mem::take(&mut hlz.members);
            self.hlzs.remove(&hlz_id);
            for m in members {
                self.member_to_hlz.remove(&m);
            }
            debug!(hlz_id, "HLZ dissolved");
            out.push(HlzEvent::Dissolved(HlzDissolvedEvent { hlz_id, ts }));
            return out;
        }

        if self.cfg.recompute_on_update {
            let members = hlz.members.clone();
            // Members were admitted through exact intersections, so any
            // subset of them still shares one.
            let band = self
                .intersection_of(&members)
                .expect("surviving members still intersect");
            let (strength, timeframes) = self.aggregate(&members);
            let hlz = self.hlzs.get_mut(&hlz_id).expect("zone exists");
            hlz.band = band;
            hlz.combined_strength = strength;
            hlz.timeframes = timeframes;
            out.push(HlzEvent::Updated(HlzUpdatedEvent {
                hlz_id,
                band,
                member_pool_ids: hlz.members.clone(),
                combined_strength: strength,
                ts,
            }));
        }
        out
    }

    /// Merge adjacent same-side zones whose bands are within tolerance and
    /// whose pooled members still share an exact intersection. The lower id
    /// wins.
    fn merge_pass(&mut self, ts: DateTime<Utc>) -> Vec<HlzEvent> {
        let mut out = Vec::new();
        loop {
            let ids: Vec<u64> = self.hlzs.keys().copied().collect();
            let mut merged = false;
            'outer: for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    let (ha, hb) = (&self.hlzs[&a], &self.hlzs[&b]);
                    if !self.cfg.side_mixing && ha.side != hb.side {
                        continue;
                    }
                    if !ha.band.near(&hb.band, self.cfg.merge_tolerance) {
                        continue;
                    }
                    let mut members = ha.members.clone();
                    members.extend(hb.members.iter().cloned());
                    let Some(band) = self.intersection_of(&members) else {
                        continue;
                    };
                    members.sort();
                    let (strength, timeframes) = self.aggregate(&members);

                    for m in &members {
                        self.member_to_hlz.insert(m.clone(), a);
                    }
                    self.hlzs.remove(&b);
                    let hlz = self.hlzs.get_mut(&a).expect("merge target exists");
                    hlz.members = members;
                    hlz.band = band;
                    hlz.combined_strength = strength;
                    hlz.timeframes = timeframes;
                    debug!(kept = a, dissolved = b, "HLZ merged");
                    out.push(HlzEvent::Dissolved(HlzDissolvedEvent { hlz_id: b, ts }));
                    out.push(HlzEvent::Updated(HlzUpdatedEvent {
                        hlz_id: a,
                        band,
                        member_pool_ids: hlz.members.clone(),
                        combined_strength: strength,
                        ts,
                    }));
                    merged = true;
                    break 'outer;
                }
            }
            if !merged {
                return out;
            }
        }
    }

    /// Exact intersection of the given members' bands.
    fn intersection_of(&self, members: &[String]) -> Option<Band> {
        let mut iter = members.iter();
        let first = self.pools.get(iter.next()?)?;
        let mut band = first.band;
        for id in iter {
            band = band.intersect(&self.pools.get(id)?.band)?;
        }
        Some(band)
    }

    /// Weighted strength and timeframe set over the given members.
    fn aggregate(&self, members: &[String]) -> (f64, BTreeSet<Timeframe>) {
        let mut strength = 0.0;
        let mut timeframes = BTreeSet::new();
        for id in members {
            if let Some(p) = self.pools.get(id) {
                strength += self.cfg.weight(p.timeframe) * p.strength;
                timeframes.insert(p.timeframe);
            }
        }
        (strength, timeframes)
    }
}
