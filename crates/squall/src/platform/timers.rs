use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::watcher::WatcherId;

/// Monotonic deadline queue for timer watchers.
///
/// Deadlines are `Instant`s only, so wall-clock adjustments never move a
/// timer.
#[derive(Debug, Default)]
pub struct TimerQueue {
    /// Ordered by (deadline, id) for expiry scanning; ties fire in
    /// registration order because serials increase.
    heap: BTreeMap<(Instant, WatcherId), ()>,
    /// Reverse lookup for cancel and reschedule.
    deadlines: HashMap<WatcherId, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` at `deadline`, replacing any previous schedule.
    pub fn insert(&mut self, id: WatcherId, deadline: Instant) {
        if let Some(old) = self.deadlines.insert(id, deadline) {
            self.heap.remove(&(old, id));
        }
        self.heap.insert((deadline, id), ());
    }

    /// Cancel the schedule for `id`. Returns its deadline if it had one.
    pub fn remove(&mut self, id: WatcherId) -> Option<Instant> {
        let deadline = self.deadlines.remove(&id)?;
        self.heap.remove(&(deadline, id));
        Some(deadline)
    }

    /// Current deadline of `id`, if scheduled.
    pub fn deadline(&self, id: WatcherId) -> Option<Instant> {
        self.deadlines.get(&id).copied()
    }

    pub fn contains(&self, id: WatcherId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Time left until the nearest deadline, zero if already due.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove every entry due at `now`, appending `(id, deadline)` in
    /// deadline order.
    pub fn expire(&mut self, now: Instant, out: &mut Vec<(WatcherId, Instant)>) {
        while let Some(&(deadline, id)) = self.heap.keys().next() {
            if deadline > now {
                break;
            }
            self.heap.remove(&(deadline, id));
            self.deadlines.remove(&id);
            out.push((id, deadline));
        }
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
