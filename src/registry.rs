// =============================================================================
// Pool registry — liquidity pool lifecycle and expiry
// =============================================================================
//
// The registry owns every pool. State moves monotonically forward:
//
//   ACTIVE -> TOUCHED            (price traded into the band)
//   ACTIVE | TOUCHED -> EXPIRED  (TTL elapsed, driven by the wheel)
//   EXPIRED -> GRACE             (grace retention elapsed; still queryable)
//   GRACE -> removed             (on the following advance)
//
// A pool never shrinks or moves after creation. Expiry timestamps come from
// the pool's own `expires_at`, not from the advance call, so late advances
// produce identical events to punctual ones.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PoolsConfig;
use crate::errors::PipelineError;
use crate::events::{PoolCandidateEvent, PoolCreatedEvent, PoolExpiredEvent, PoolKind, PoolTouchedEvent};
use crate::timeframe::Timeframe;
use crate::types::{Band, Side};
use crate::wheel::TtlWheel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolState {
    Active,
    Touched,
    Expired,
    Grace,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Touched => write!(f, "TOUCHED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Grace => write!(f, "GRACE"),
        }
    }
}

/// A liquidity pool recorded from a detector event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub kind: PoolKind,
    pub timeframe: Timeframe,
    pub side: Side,
    pub band: Band,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: PoolState,
    pub touched_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Interval-index entry: pools sorted by band bottom for touch queries.
#[derive(Debug, Clone)]
struct IndexEntry {
    bottom: f64,
    top: f64,
    id: String,
}

#[derive(Debug)]
pub struct PoolRegistry {
    cfg: PoolsConfig,
    pools: BTreeMap<String, Pool>,
    /// Live (ACTIVE or TOUCHED) pools per timeframe, sorted by (bottom, id).
    live_index: BTreeMap<Timeframe, Vec<IndexEntry>>,
    /// Live + expired-in-grace count per timeframe, for the capacity cap.
    counts: BTreeMap<Timeframe, usize>,
    wheel: TtlWheel,
    /// (removal due seconds, pool id) for expired pools in grace retention.
    grace: Vec<(i64, String)>,
    /// GRACE pools awaiting final removal on the next advance.
    doomed: Vec<String>,
}

impl PoolRegistry {
    pub fn new(cfg: PoolsConfig) -> Self {
        Self {
            cfg,
            pools: BTreeMap::new(),
            live_index: BTreeMap::new(),
            counts: BTreeMap::new(),
            wheel: TtlWheel::new(),
            grace: Vec::new(),
            doomed: Vec::new(),
        }
    }

    /// Admit a detector candidate as an ACTIVE pool.
    ///
    /// Returns `Ok(None)` when the candidate is filtered (below a strength
    /// floor, or a duplicate id); `CapacityExceeded` when the per-timeframe
    /// cap is full.
    pub fn create(
        &mut self,
        candidate: &PoolCandidateEvent,
    ) -> Result<Option<PoolCreatedEvent>, PipelineError> {
        let tf_cfg = self.cfg.tf_config(candidate.timeframe);
        let floor = self.cfg.strength_threshold.max(tf_cfg.strength_floor);
        if candidate.strength < floor {
            debug!(
                tf = %candidate.timeframe,
                strength = candidate.strength,
                floor,
                "pool candidate below strength floor"
            );
            return Ok(None);
        }

        let count = self.counts.get(&candidate.timeframe).copied().unwrap_or(0);
        if count >= self.cfg.max_pools_per_tf {
            return Err(PipelineError::CapacityExceeded {
                scope: format!("registry/{}", candidate.timeframe),
            });
        }

        let id = pool_id(candidate.timeframe, candidate.created_at, &candidate.band);
        if self.pools.contains_key(&id) {
            debug!(id = %id, "duplicate pool id refused");
            return Ok(None);
        }

        let expires_at = candidate.created_at + Duration::seconds(tf_cfg.ttl_secs);
        let pool = Pool {
            id: id.clone(),
            kind: candidate.kind,
            timeframe: candidate.timeframe,
            side: candidate.side,
            band: candidate.band,
            strength: candidate.strength,
            created_at: candidate.created_at,
            expires_at,
            state: PoolState::Active,
            touched_at: None,
            expired_at: None,
        };

        self.wheel.touch(candidate.created_at.timestamp());
        self.wheel.schedule(id.clone(), expires_at.timestamp());

        let index = self.live_index.entry(candidate.timeframe).or_default();
        let entry = IndexEntry {
            bottom: pool.band.bottom,
            top: pool.band.top,
            id: id.clone(),
        };
        let pos = index.partition_point(|e| {
            (e.bottom, e.id.as_str()) < (entry.bottom, entry.id.as_str())
        });
        index.insert(pos, entry);

        *self.counts.entry(candidate.timeframe).or_insert(0) += 1;

        let event = PoolCreatedEvent {
            pool_id: id.clone(),
            kind: pool.kind,
            side: pool.side,
            band: pool.band,
            timeframe: pool.timeframe,
            strength: pool.strength,
            created_at: pool.created_at,
            expires_at: pool.expires_at,
        };
        self.pools.insert(id, pool);
        Ok(Some(event))
    }

    /// Test the price against every live pool band and transition first
    /// touches ACTIVE -> TOUCHED. The driver feeds the bar close only;
    /// highs and lows never trigger touches.
    pub fn on_price(&mut self, ts: DateTime<Utc>, price: f64) -> Vec<PoolTouchedEvent> {
        let mut touched = Vec::new();
        for (tf, index) in &self.live_index {
            let tol = self.cfg.tf_config(*tf).hit_tolerance;
            // Entries are sorted by bottom; everything past this point starts
            // above the price and cannot contain it.
            let end = index.partition_point(|e| e.bottom <= price + tol);
            for entry in &index[..end] {
                if entry.top < price - tol {
                    continue;
                }
                let pool = self
                    .pools
                    .get_mut(&entry.id)
                    .expect("index entry has a pool");
                if pool.state != PoolState::Active {
                    continue;
                }
                pool.state = PoolState::Touched;
                pool.touched_at = Some(ts);
                touched.push(PoolTouchedEvent {
                    pool_id: pool.id.clone(),
                    timeframe: pool.timeframe,
                    touched_at: ts,
                    price,
                });
            }
        }
        touched
    }

    /// Drive the TTL wheel forward and expire due pools.
    ///
    /// Idempotent forward progress: `advance_time(t1); advance_time(t2)` with
    /// `t1 <= t2` emits the same expiries as a single `advance_time(t2)`.
    pub fn advance_time(&mut self, now: DateTime<Utc>) -> Vec<PoolExpiredEvent> {
        let now_secs = now.timestamp();
        let mut events = Vec::new();

        // Pools marked GRACE on a previous advance are removed for good now.
        for id in std::mem::take(&mut self.doomed) {
            if let Some(pool) = self.pools.remove(&id) {
                *self.counts.entry(pool.timeframe).or_insert(0) -= 1;
            }
        }

        for id in self.wheel.advance(now_secs) {
            let Some(pool) = self.pools.get_mut(&id) else {
                continue;
            };
            if pool.state >= PoolState::Expired {
                continue;
            }
            pool.state = PoolState::Expired;
            pool.expired_at = Some(pool.expires_at);
            debug!(id = %id, tf = %pool.timeframe, "pool expired");

            events.push(PoolExpiredEvent {
                pool_id: pool.id.clone(),
                timeframe: pool.timeframe,
                expired_at: pool.expires_at,
            });

            let tf = pool.timeframe;
            let removal_due = pool.expires_at.timestamp() + self.cfg.grace_period_secs;
            self.grace.push((removal_due, id.clone()));
            remove_index_entry(self.live_index.entry(tf).or_default(), &id);
        }

        // Grace retention elapsed: EXPIRED -> GRACE. The pool stays in the
        // map, observable as GRACE, until the next advance removes it.
        if !self.grace.is_empty() {
            let (due, keep): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.grace)
                    .into_iter()
                    .partition(|(removal_due, _)| *removal_due <= now_secs);
            self.grace = keep;
            for (_, id) in due {
                if let Some(pool) = self.pools.get_mut(&id) {
                    pool.state = PoolState::Grace;
                    self.doomed.push(id);
                }
            }
        }

        events
    }

    /// Offline GC: remove exactly the EXPIRED and GRACE pools with
    /// `expired_at < ts`. ACTIVE and TOUCHED pools are never removed.
    pub fn purge_before(&mut self, ts: DateTime<Utc>) -> usize {
        let purged: Vec<String> = self
            .pools
            .values()
            .filter(|p| {
                p.state >= PoolState::Expired && p.expired_at.map_or(false, |e| e < ts)
            })
            .map(|p| p.id.clone())
            .collect();

        for id in &purged {
            if let Some(pool) = self.pools.remove(id) {
                *self.counts.entry(pool.timeframe).or_insert(0) -= 1;
            }
            self.grace.retain(|(_, gid)| gid != id);
            self.doomed.retain(|gid| gid != id);
        }
        if !purged.is_empty() {
            warn!(count = purged.len(), before = %ts, "purged expired pools");
        }
        purged.len()
    }

    /// ACTIVE pools, optionally restricted to one timeframe, in id order.
    pub fn query_active(&self, tf: Option<Timeframe>) -> impl Iterator<Item = &Pool> {
        self.pools.values().filter(move |p| {
            p.state == PoolState::Active && tf.map_or(true, |t| p.timeframe == t)
        })
    }

    pub fn get(&self, id: &str) -> Option<&Pool> {
        self.pools.get(id)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Pool count per state; the states sum to `len()`.
    pub fn counts_by_state(&self) -> BTreeMap<PoolState, usize> {
        let mut counts = BTreeMap::new();
        for p in self.pools.values() {
            *counts.entry(p.state).or_insert(0) += 1;
        }
        counts
    }

    /// Pool count per (timeframe, state), for the metrics gauges.
    pub fn counts_by_tf_state(&self) -> BTreeMap<(Timeframe, PoolState), usize> {
        let mut counts = BTreeMap::new();
        for p in self.pools.values() {
            *counts.entry((p.timeframe, p.state)).or_insert(0) += 1;
        }
        counts
    }
}

fn remove_index_entry(index: &mut Vec<IndexEntry>, id: &str) {
    index.retain(|e| e.id != id);
}

/// Collision-free deterministic pool id:
/// `tf | rfc3339(created_at) | hex(adler32(packed fields))`.
///
/// The packed fields use an explicit big-endian byte order so the checksum is
/// identical across machines.
pub fn pool_id(tf: Timeframe, created_at: DateTime<Utc>, band: &Band) -> String {
    let mut packed = Vec::with_capacity(32);
    packed.extend_from_slice(&tf.minutes().to_be_bytes());
    packed.extend_from_slice(&created_at.timestamp().to_be_bytes());
    packed.extend_from_slice(&band.top.to_bits().to_be_bytes());
    packed.extend_from_slice(&band.bottom.to_bits().to_be_bytes());
    format!(
        "{}|{}|{}",
        tf,
        created_at.to_rfc3339(),
        hex::encode(adler32(&packed).to_be_bytes())
    )
}

/// Adler-32 checksum (RFC 1950) over `data`.
fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + byte as u32) % MOD;
        b = (b + a) % MOD;
    }
    (b << 16) | a
}
