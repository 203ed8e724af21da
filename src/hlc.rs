//! Hybrid Logical Clock
//!
//! Totally ordered, causally consistent timestamps without synchronized
//! wall clocks. Ordering is lexicographic: `physical` first, then
//! `logical`. Used for snapshot stamps, merge tie-breaks and overlay
//! creation instants.

use std::cmp::Ordering;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Causal timestamp: wall-clock milliseconds plus a tie-break counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hlc {
    /// Milliseconds since the Unix epoch.
    pub physical: i64,
    /// Counter for events within the same millisecond.
    pub logical: u32,
}

impl Hlc {
    pub const fn new(physical: i64, logical: u32) -> Self {
        Self { physical, logical }
    }

    /// Current wall time with a zero counter.
    pub fn now() -> Self {
        Self::new(wall_clock_ms(), 0)
    }

    /// Advance for a local event.
    pub fn tick(&self) -> Self {
        self.tick_at(wall_clock_ms())
    }

    /// Merge a remote timestamp on message arrival.
    pub fn receive(&self, remote: &Hlc) -> Self {
        self.receive_at(remote, wall_clock_ms())
    }

    /// [`tick`](Self::tick) with an explicit wall reading.
    pub fn tick_at(&self, wall_ms: i64) -> Self {
        if wall_ms > self.physical {
            Self::new(wall_ms, 0)
        } else {
            bump(self.physical, self.logical)
        }
    }

    /// [`receive`](Self::receive) with an explicit wall reading.
    ///
    /// The result is `>=` both inputs and strictly greater than both when
    /// their physical components tie at the maximum.
    pub fn receive_at(&self, remote: &Hlc, wall_ms: i64) -> Self {
        let max = wall_ms.max(self.physical).max(remote.physical);
        let own = max == self.physical;
        let theirs = max == remote.physical;

        match (own, theirs) {
            (true, true) => bump(max, self.logical.max(remote.logical)),
            (true, false) => bump(max, self.logical),
            (false, true) => bump(max, remote.logical),
            (false, false) => Self::new(max, 0),
        }
    }

    /// Compare ignoring the logical counter.
    pub fn cmp_physical(&self, other: &Hlc) -> Ordering {
        self.physical.cmp(&other.physical)
    }
}

/// `(physical, logical + 1)`, carrying into the physical component when
/// the counter is exhausted so the successor is always strictly greater.
fn bump(physical: i64, logical: u32) -> Hlc {
    match logical.checked_add(1) {
        Some(next) => Hlc::new(physical, next),
        None => Hlc::new(physical.saturating_add(1), 0),
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Thread-safe monotonic HLC source owned by an adapter.
#[derive(Debug)]
pub struct HlcClock {
    last: Mutex<Hlc>,
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HlcClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Hlc::now()),
        }
    }

    /// Stamp a local event. Every stamp is strictly greater than the last.
    pub fn tick(&self) -> Hlc {
        let mut last = self.last.lock();
        *last = last.tick();
        *last
    }

    /// Fold in a remote stamp; subsequent ticks order after it.
    pub fn observe(&self, remote: &Hlc) -> Hlc {
        let mut last = self.last.lock();
        *last = last.receive(remote);
        *last
    }

    /// Most recent stamp without advancing.
    pub fn last(&self) -> Hlc {
        *self.last.lock()
    }
}
