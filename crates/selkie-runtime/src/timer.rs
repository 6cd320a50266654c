//! Per-worker hierarchical timer wheel
//!
//! TigerStyle: Constant-time schedule and cancel, bounded cascade work.
//!
//! Millisecond ticks index a near wheel of 256 slots; four cascade levels
//! of 64 slots each cover the full u64 horizon. Cancellation is lazy: the
//! id is marked and the entry discarded when its slot fires, so `remove`
//! never touches the wheel. Entries scheduled for the same tick fire in
//! schedule order because slots are append-only vectors.
//!
//! An auxiliary min-heap of expiry ticks drives the owning worker's sleep;
//! it may contain stale entries for cancelled timers, which only cost a
//! spurious wake.

use selkie_core::constants::{TIMER_LEVEL_COUNT, TIMER_LEVEL_SLOTS, TIMER_NEAR_SLOTS};
use selkie_core::ServiceId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

const NEAR_SHIFT: u32 = TIMER_NEAR_SLOTS.trailing_zeros();
const NEAR_MASK: u64 = TIMER_NEAR_SLOTS as u64 - 1;
const LEVEL_SHIFT: u32 = TIMER_LEVEL_SLOTS.trailing_zeros();
const LEVEL_MASK: u64 = TIMER_LEVEL_SLOTS as u64 - 1;

#[derive(Debug, Clone)]
struct TimerEntry {
    id: u32,
    service: ServiceId,
    expire: u64,
}

/// The wheel; owned by one worker, ticked from its loop
#[derive(Debug)]
pub(crate) struct TimerWheel {
    /// Current tick in milliseconds
    time: u64,
    near: Vec<Vec<TimerEntry>>,
    levels: Vec<Vec<Vec<TimerEntry>>>,
    next_id: u32,
    /// Ids scheduled and not yet fired
    active: HashSet<u32>,
    /// Subset of `active` marked for lazy removal
    cancelled: HashSet<u32>,
    /// Expiry ticks, for computing the next wake deadline
    due: BinaryHeap<Reverse<u64>>,
}

impl TimerWheel {
    pub(crate) fn new(now_ms: u64) -> Self {
        Self {
            time: now_ms,
            near: vec![Vec::new(); TIMER_NEAR_SLOTS],
            levels: vec![vec![Vec::new(); TIMER_LEVEL_SLOTS]; TIMER_LEVEL_COUNT],
            next_id: 0,
            active: HashSet::new(),
            cancelled: HashSet::new(),
            due: BinaryHeap::new(),
        }
    }

    /// Schedule a timeout for `service`; returns the timer handle
    pub(crate) fn schedule(&mut self, service: ServiceId, delay_ms: u64) -> u32 {
        let id = self.alloc_id();
        let expire = self.time + delay_ms.max(1);
        self.active.insert(id);
        self.due.push(Reverse(expire));
        self.insert(TimerEntry {
            id,
            service,
            expire,
        });
        id
    }

    /// Mark a timer cancelled; a no-op for unknown or already-fired ids
    pub(crate) fn remove(&mut self, id: u32) {
        if self.active.contains(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Advance the wheel to `now_ms`, appending expirations in fire order
    pub(crate) fn update(&mut self, now_ms: u64, expired: &mut Vec<(ServiceId, u32)>) {
        while self.time < now_ms {
            self.time += 1;
            self.shift();
            self.execute(expired);
        }
    }

    /// Absolute tick of the nearest scheduled expiry, if any
    pub(crate) fn next_due(&mut self) -> Option<u64> {
        while let Some(&Reverse(tick)) = self.due.peek() {
            if tick > self.time {
                return Some(tick);
            }
            self.due.pop();
        }
        None
    }

    /// Number of scheduled, unfired timers (cancelled ones included)
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    fn alloc_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.active.contains(&self.next_id) {
                return self.next_id;
            }
        }
    }

    fn insert(&mut self, entry: TimerEntry) {
        debug_assert!(entry.expire > self.time || self.near_window(entry.expire));
        let expire = entry.expire;
        if self.near_window(expire) {
            self.near[(expire & NEAR_MASK) as usize].push(entry);
            return;
        }
        for level in 0..TIMER_LEVEL_COUNT {
            let span = NEAR_SHIFT + (level as u32 + 1) * LEVEL_SHIFT;
            let window = (1u64 << span) - 1;
            let slot_shift = NEAR_SHIFT + level as u32 * LEVEL_SHIFT;
            if (expire | window) == (self.time | window) || level == TIMER_LEVEL_COUNT - 1 {
                let slot = ((expire >> slot_shift) & LEVEL_MASK) as usize;
                self.levels[level][slot].push(entry);
                return;
            }
        }
        unreachable!("last level is a catch-all");
    }

    fn near_window(&self, expire: u64) -> bool {
        (expire | NEAR_MASK) == (self.time | NEAR_MASK)
    }

    /// Cascade one upper-level slot down when the near wheel wraps
    fn shift(&mut self) {
        if self.time & NEAR_MASK != 0 {
            return;
        }
        let mut upper = self.time >> NEAR_SHIFT;
        for level in 0..TIMER_LEVEL_COUNT {
            let slot = (upper & LEVEL_MASK) as usize;
            if slot != 0 {
                let entries = std::mem::take(&mut self.levels[level][slot]);
                for entry in entries {
                    self.insert(entry);
                }
                break;
            }
            upper >>= LEVEL_SHIFT;
        }
    }

    fn execute(&mut self, expired: &mut Vec<(ServiceId, u32)>) {
        let slot = (self.time & NEAR_MASK) as usize;
        if self.near[slot].is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.near[slot]);
        for entry in entries {
            if entry.expire > self.time {
                // parked here by an earlier window; not due yet
                self.insert(entry);
                continue;
            }
            self.active.remove(&entry.id);
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            expired.push((entry.service, entry.id));
        }
    }
}
