//! Timer identities and the dispatcher's deadline-ordered timer list.

use std::sync::Weak;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::freelist::FreeList;
use crate::object::Object;
use crate::variant::Variant;

/// Stamped timer identifier (index + serial). Never zero.
pub type TimerId = i32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerType {
    /// Sub-millisecond accuracy; successive deadlines advance from the
    /// previous deadline, never from "now".
    Precise,
    /// Default. Deadlines may coalesce; missed periods are consolidated
    /// into a single fire.
    Coarse,
    /// One-second granularity; the interval is rounded up to whole seconds.
    VeryCoarse,
}

lazy_static! {
    // Process-wide, id 0 reserved as "no timer".
    static ref TIMER_IDS: FreeList = FreeList::starting_at(1);
}

pub fn allocate_timer_id() -> TimerId {
    TIMER_IDS.next().expect("timer id space exhausted")
}

pub fn release_timer_id(id: TimerId) {
    TIMER_IDS.release(id);
}

/// What an object needs to re-register a timer after a thread move.
#[derive(Clone)]
pub struct TimerSpec {
    pub interval: Duration,
    pub kind: TimerType,
    pub info: Variant,
}

struct TimerEntry {
    id: TimerId,
    interval: Duration,
    kind: TimerType,
    object: Weak<Object>,
    info: Variant,
    deadline: Instant,
}

/// A timer that has come due, ready for delivery.
pub struct Expired {
    pub id: TimerId,
    pub object: Weak<Object>,
    pub info: Variant,
}

/// Deadline-ordered list of registered timers.
pub struct TimerList {
    entries: Vec<TimerEntry>,
}

impl TimerList {
    pub fn new() -> TimerList {
        TimerList { entries: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn register(
        &mut self,
        id: TimerId,
        interval: Duration,
        kind: TimerType,
        object: Weak<Object>,
        info: Variant,
        now: Instant,
    ) {
        let interval = effective_interval(interval, kind);

        let entry = TimerEntry {
            id,
            interval,
            kind,
            object,
            info,
            deadline: now + interval,
        };
        self.insert(entry);
    }

    pub fn unregister(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// Remove every timer owned by `object`, returning specs for
    /// re-registration on another dispatcher.
    pub fn unregister_object(&mut self, object: &Weak<Object>) -> Vec<(TimerId, TimerSpec)> {
        let mut removed = Vec::new();

        self.entries.retain(|entry| {
            if entry.object.ptr_eq(object) {
                removed.push((
                    entry.id,
                    TimerSpec {
                        interval: entry.interval,
                        kind: entry.kind,
                        info: entry.info.clone(),
                    },
                ));
                false
            } else {
                true
            }
        });

        removed
    }

    pub fn remaining(&self, id: TimerId, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    /// Time until the earliest deadline, or `None` when no timer is armed.
    pub fn time_to_next(&self, now: Instant) -> Option<Duration> {
        self.entries
            .first()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    #[inline]
    pub fn has_expired(&self, now: Instant) -> bool {
        match self.entries.first() {
            Some(entry) => entry.deadline <= now,
            None => false,
        }
    }

    /// Pop every expired timer, re-arm it past `now` (consolidating missed
    /// periods into the single fire being reported), and return the fires.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut fired = Vec::new();

        while self.has_expired(now) {
            let mut entry = self.entries.remove(0);

            fired.push(Expired {
                id: entry.id,
                object: entry.object.clone(),
                info: entry.info.clone(),
            });

            // Precise timers advance from the old deadline to stay on the
            // t0 + k*I grid; coarse types re-anchor on the current time.
            entry.deadline = match entry.kind {
                TimerType::Precise => {
                    let mut next = entry.deadline + entry.interval;
                    while next <= now {
                        next += entry.interval;
                    }
                    next
                }
                _ => now + entry.interval,
            };

            self.insert(entry);
        }

        fired
    }

    fn insert(&mut self, entry: TimerEntry) {
        let at = self
            .entries
            .iter()
            .position(|existing| existing.deadline > entry.deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
    }
}

#[inline]
fn effective_interval(interval: Duration, kind: TimerType) -> Duration {
    match kind {
        TimerType::VeryCoarse => {
            let secs = interval.as_secs() + if interval.subsec_nanos() > 0 { 1 } else { 0 };
            Duration::from_secs(secs.max(1))
        }
        _ => interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_object() -> Weak<Object> {
        Weak::new()
    }

    #[test]
    fn test_allocate_release_ids() {
        let a = allocate_timer_id();
        let b = allocate_timer_id();

        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);

        release_timer_id(a);
        release_timer_id(b);
    }

    #[test]
    fn test_deadline_ordering() {
        let now = Instant::now();
        let mut list = TimerList::new();

        list.register(1, Duration::from_millis(50), TimerType::Coarse, dead_object(), Variant::empty(), now);
        list.register(2, Duration::from_millis(10), TimerType::Coarse, dead_object(), Variant::empty(), now);

        assert_eq!(list.time_to_next(now), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_expiry_consolidates_missed_periods() {
        let now = Instant::now();
        let mut list = TimerList::new();

        list.register(7, Duration::from_millis(10), TimerType::Precise, dead_object(), Variant::empty(), now);

        // Wake up three-and-a-half periods late: exactly one fire reported.
        let late = now + Duration::from_millis(35);
        let fired = list.take_expired(late);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, 7);

        // Next deadline lands on the grid (40ms), not at late + interval.
        let remaining = list.remaining(7, late).unwrap();
        assert_eq!(remaining, Duration::from_millis(5));
    }

    #[test]
    fn test_very_coarse_rounds_up() {
        let now = Instant::now();
        let mut list = TimerList::new();

        list.register(3, Duration::from_millis(300), TimerType::VeryCoarse, dead_object(), Variant::empty(), now);

        assert_eq!(list.time_to_next(now), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_unregister() {
        let now = Instant::now();
        let mut list = TimerList::new();

        list.register(5, Duration::from_millis(10), TimerType::Coarse, dead_object(), Variant::empty(), now);

        assert!(list.unregister(5));
        assert!(!list.unregister(5));
        assert_eq!(list.time_to_next(now), None);
    }
}
