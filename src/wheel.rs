// =============================================================================
// TTL wheel — hierarchical 4-level timing wheel
// =============================================================================
//
// Levels: seconds (60 slots), minutes (60), hours (24), days (7), covering
// TTLs from one second to seven days; longer TTLs clamp into the top level
// and re-cascade on each rollover until they fit.
//
// The wheel holds no clock. `now` is injected through `touch`/`advance`, so
// expiry is a pure function of the call sequence and fully deterministic.
//
// Slot index for an absolute expiry time at a level with granularity g and
// n slots is `(expires_at / g) % n`; sweeping any n consecutive ticks visits
// every slot, so arbitrarily large time jumps drain in O(slots + due items).
// =============================================================================

use std::collections::HashSet;

/// (granularity seconds, slot count) per level, finest first.
const LEVELS: [(i64, usize); 4] = [(1, 60), (60, 60), (3600, 24), (86400, 7)];

/// Maximum horizon directly representable: seven days.
const MAX_SPAN_SECS: i64 = 7 * 86400;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    expires_at: i64,
}

/// Deterministic hierarchical timing wheel over string item ids.
#[derive(Debug)]
pub struct TtlWheel {
    /// Last observed time; `None` until first `touch`/`advance`.
    now: Option<i64>,
    slots: [Vec<Vec<Entry>>; 4],
    /// Ids scheduled (or due) and not yet delivered or cancelled.
    scheduled: HashSet<String>,
    /// Ids cancelled while still resident somewhere in the wheel.
    cancelled: HashSet<String>,
    due: Vec<String>,
}

impl TtlWheel {
    pub fn new() -> Self {
        Self {
            now: None,
            slots: [
                vec![Vec::new(); LEVELS[0].1],
                vec![Vec::new(); LEVELS[1].1],
                vec![Vec::new(); LEVELS[2].1],
                vec![Vec::new(); LEVELS[3].1],
            ],
            scheduled: HashSet::new(),
            cancelled: HashSet::new(),
            due: Vec::new(),
        }
    }

    /// Initialize the wheel's origin without moving time. No-op once set.
    pub fn touch(&mut self, now: i64) {
        if self.now.is_none() {
            self.now = Some(now);
        }
    }

    /// Number of items scheduled and not yet delivered or cancelled.
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Schedule `id` to expire at `expires_at` (seconds). O(1).
    ///
    /// Late scheduling (`expires_at <= now`) is legal and moves the item
    /// directly into the due list, delivered by the next `advance`.
    pub fn schedule(&mut self, id: impl Into<String>, expires_at: i64) {
        let id = id.into();
        self.touch(expires_at);
        self.scheduled.insert(id.clone());
        self.insert(Entry { id, expires_at });
    }

    /// Cancel a scheduled item. O(1). Unknown ids are ignored.
    pub fn cancel(&mut self, id: &str) {
        if self.scheduled.remove(id) {
            self.cancelled.insert(id.to_string());
        }
    }

    /// Move time forward to `now` and return every item that became due, in
    /// deterministic delivery order. Calling with `now` at or before the
    /// current time delivers only previously-due items (idempotent progress).
    pub fn advance(&mut self, now: i64) -> Vec<String> {
        let cur = match self.now {
            None => {
                self.now = Some(now);
                return self.drain_due();
            }
            Some(cur) => cur,
        };
        if now <= cur {
            return self.drain_due();
        }

        // Drain every slot whose tick elapsed, finest level first. A level
        // whose tick did not change shields all coarser levels.
        let mut pending: Vec<Entry> = Vec::new();
        for (lvl, &(gran, count)) in LEVELS.iter().enumerate() {
            let from_tick = cur.div_euclid(gran);
            let to_tick = now.div_euclid(gran);
            if to_tick == from_tick {
                break;
            }
            let steps = (to_tick - from_tick).min(count as i64);
            for tick in (to_tick - steps + 1)..=to_tick {
                let slot = tick.rem_euclid(count as i64) as usize;
                pending.append(&mut self.slots[lvl][slot]);
            }
        }

        self.now = Some(now);
        for entry in pending {
            self.insert(entry);
        }
        self.drain_due()
    }

    /// Place an entry into the finest level that fits its remaining delta,
    /// or straight into the due list.
    fn insert(&mut self, entry: Entry) {
        if self.cancelled.remove(&entry.id) {
            return;
        }
        let now = self.now.expect("origin set before insert");
        let delta = entry.expires_at - now;
        if delta <= 0 {
            self.due.push(entry.id);
            return;
        }

        let capped = entry.expires_at.min(now + MAX_SPAN_SECS - 1);
        let (lvl, gran, count) = if delta < 60 {
            (0, 1i64, 60i64)
        } else if delta < 3600 {
            (1, 60, 60)
        } else if delta < 86400 {
            (2, 3600, 24)
        } else {
            (3, 86400, 7)
        };
        let slot = (capped.div_euclid(gran)).rem_euclid(count) as usize;
        self.slots[lvl][slot].push(entry);
    }

    fn drain_due(&mut self) -> Vec<String> {
        if self.due.is_empty() {
            return Vec::new();
        }
        let due = std::mem::take(&mut self.due);
        due.into_iter()
            .filter(|id| {
                if self.cancelled.remove(id) {
                    return false;
                }
                self.scheduled.remove(id)
            })
            .collect()
    }
}

impl Default for TtlWheel {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn wheel_at(origin: i64) -> TtlWheel {
        let mut w = TtlWheel::new();
        w.touch(origin);
        w
    }

    #[test]
    fn one_second_ttl_expires() {
        let mut w = wheel_at(0);
        w.schedule("p1", 1);
        assert_eq!(w.advance(0), Vec::<String>::new());
        assert_eq!(w.advance(2), vec!["p1".to_string()]);
        assert!(w.is_empty());
    }

    #[test]
    fn exact_expiry_boundary_is_due() {
        let mut w = wheel_at(0);
        w.schedule("p1", 10);
        assert!(w.advance(9).is_empty());
        assert_eq!(w.advance(10), vec!["p1".to_string()]);
    }

    #[test]
    fn late_scheduling_is_immediately_due() {
        let mut w = wheel_at(100);
        w.schedule("stale", 50);
        assert_eq!(w.advance(100), vec!["stale".to_string()]);
    }

    #[test]
    fn cancel_prevents_delivery() {
        let mut w = wheel_at(0);
        w.schedule("p1", 30);
        w.schedule("p2", 30);
        w.cancel("p1");
        assert_eq!(w.len(), 1);
        assert_eq!(w.advance(60), vec!["p2".to_string()]);
    }

    #[test]
    fn cancel_unknown_id_is_noop() {
        let mut w = wheel_at(0);
        w.cancel("ghost");
        assert!(w.is_empty());
    }

    #[test]
    fn minute_level_cascades_into_seconds() {
        let mut w = wheel_at(0);
        w.schedule("p1", 90); // lands in the minutes level
        assert!(w.advance(60).is_empty()); // cascaded, not yet due
        assert!(w.advance(89).is_empty());
        assert_eq!(w.advance(90), vec!["p1".to_string()]);
    }

    #[test]
    fn hour_and_day_levels_cascade() {
        let mut w = wheel_at(0);
        w.schedule("hourly", 2 * 3600 + 30);
        w.schedule("daily", 2 * 86400 + 90);
        assert!(w.advance(2 * 3600).is_empty());
        assert_eq!(w.advance(2 * 3600 + 30), vec!["hourly".to_string()]);
        assert!(w.advance(2 * 86400).is_empty());
        assert_eq!(w.advance(2 * 86400 + 90), vec!["daily".to_string()]);
    }

    #[test]
    fn beyond_seven_days_clamps_and_still_fires() {
        let mut w = wheel_at(0);
        w.schedule("long", 10 * 86400);
        assert!(w.advance(7 * 86400).is_empty());
        assert!(w.advance(10 * 86400 - 1).is_empty());
        assert_eq!(w.advance(10 * 86400), vec!["long".to_string()]);
    }

    #[test]
    fn large_jump_delivers_everything_once() {
        let mut w = wheel_at(0);
        for i in 0..100 {
            w.schedule(format!("p{i}"), 1 + i % 50);
        }
        let due = w.advance(1_000_000);
        assert_eq!(due.len(), 100);
        let unique: HashSet<&String> = due.iter().collect();
        assert_eq!(unique.len(), 100);
        assert!(w.is_empty());
    }

    #[test]
    fn split_advance_equals_single_advance() {
        let build = || {
            let mut w = wheel_at(0);
            for i in 0..20 {
                w.schedule(format!("p{i}"), 10 + i * 7);
            }
            w
        };

        let mut once = build();
        let mut all_once = once.advance(200);
        all_once.sort();

        let mut twice = build();
        let mut all_twice = twice.advance(77);
        all_twice.extend(twice.advance(200));
        all_twice.sort();

        assert_eq!(all_once, all_twice);
    }

    #[test]
    fn advance_backwards_is_a_noop() {
        let mut w = wheel_at(100);
        w.schedule("p1", 150);
        assert!(w.advance(90).is_empty());
        assert_eq!(w.advance(150), vec!["p1".to_string()]);
    }

    #[test]
    fn ten_thousand_items_mass_expiry() {
        let mut w = wheel_at(0);
        for i in 0..10_000 {
            w.schedule(format!("pool-{i}"), 60 + (i % 3600));
        }
        assert_eq!(w.len(), 10_000);
        let due = w.advance(2 * 3600 + 60);
        assert_eq!(due.len(), 10_000);
        assert!(w.is_empty());
    }

    #[test]
    fn delivery_order_is_deterministic() {
        let run = || {
            let mut w = wheel_at(0);
            w.schedule("a", 5);
            w.schedule("b", 5);
            w.schedule("c", 3);
            w.advance(10)
        };
        assert_eq!(run(), run());
    }
}
