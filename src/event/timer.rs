//! Timer tree keyed by absolute expiry.
//!
//! Keys are milliseconds on the worker's cached monotonic clock plus an
//! insertion sequence number, so expiries are ordered by deadline with
//! ties broken by insertion order. The tree holds non-owning references
//! to events (slot + kind); cancelling a timer is a plain remove.

use std::collections::BTreeMap;

use crate::event::EventKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    pub deadline: u64,
    seq: u64,
}

/// What fires when a timer expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerTarget {
    /// A connection event; sets `timedout` and invokes the handler.
    Event { conn: usize, kind: EventKind },
    /// The worker's graceful-shutdown deadline.
    WorkerShutdown,
}

#[derive(Debug, Default)]
pub struct TimerTree {
    map: BTreeMap<TimerKey, TimerTarget>,
    seq: u64,
}

impl TimerTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer `after_ms` from `now`; returns the key used to delete
    /// it later.
    pub fn add(&mut self, now: u64, after_ms: u64, target: TimerTarget) -> TimerKey {
        let key = TimerKey {
            deadline: now + after_ms,
            seq: self.seq,
        };
        self.seq += 1;
        self.map.insert(key, target);
        key
    }

    pub fn remove(&mut self, key: TimerKey) -> bool {
        self.map.remove(&key).is_some()
    }

    pub fn min_deadline(&self) -> Option<u64> {
        self.map.keys().next().map(|k| k.deadline)
    }

    /// Milliseconds until the nearest deadline; `None` when the tree is
    /// empty (poll blocks indefinitely).
    pub fn timeout_ms(&self, now: u64) -> Option<u64> {
        self.min_deadline().map(|d| d.saturating_sub(now))
    }

    /// Detach every entry with `deadline <= now`, in expiry order.
    pub fn take_due(&mut self, now: u64) -> Vec<(TimerKey, TimerTarget)> {
        let boundary = TimerKey {
            deadline: now + 1,
            seq: 0,
        };
        let rest = self.map.split_off(&boundary);
        let due = std::mem::replace(&mut self.map, rest);
        due.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(conn: usize) -> TimerTarget {
        TimerTarget::Event {
            conn,
            kind: EventKind::Read,
        }
    }

    #[test]
    fn test_add_then_remove_is_structural_noop() {
        let mut tree = TimerTree::new();
        tree.add(0, 100, ev(1));
        let snapshot: Vec<_> = tree.map.keys().copied().collect();

        let key = tree.add(0, 50, ev(2));
        assert!(tree.remove(key));
        assert!(!tree.remove(key), "second delete is a no-op");

        let after: Vec<_> = tree.map.keys().copied().collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn test_expiry_order_is_deadline_then_insertion() {
        let mut tree = TimerTree::new();
        tree.add(0, 30, ev(3));
        tree.add(0, 10, ev(1));
        tree.add(0, 10, ev(2));

        let due = tree.take_due(100);
        let conns: Vec<_> = due
            .iter()
            .map(|(_, t)| match t {
                TimerTarget::Event { conn, .. } => *conn,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(conns, vec![1, 2, 3]);
    }

    #[test]
    fn test_take_due_leaves_future_timers() {
        let mut tree = TimerTree::new();
        tree.add(0, 10, ev(1));
        tree.add(0, 20, ev(2));
        tree.add(0, 30, ev(3));

        let due = tree.take_due(20);
        assert_eq!(due.len(), 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.min_deadline(), Some(30));
        // Remaining deadlines are all in the future.
        assert!(tree.min_deadline().unwrap() > 20);
    }

    #[test]
    fn test_timeout_ms_saturates() {
        let mut tree = TimerTree::new();
        assert_eq!(tree.timeout_ms(5), None);
        tree.add(0, 10, ev(1));
        assert_eq!(tree.timeout_ms(4), Some(6));
        assert_eq!(tree.timeout_ms(50), Some(0), "overdue timers poll immediately");
    }
}
