//! Time-ordered event queue.
//!
//! Events fire in ascending time order. Events scheduled for the same time
//! fire in the order they were scheduled: each event carries a sequence number
//! assigned at insertion, and the heap orders by `(time, seq)`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::SimTime;

/// A scheduled callback.
///
/// Immutable once constructed; the queue only ever moves it out whole.
#[derive(Debug)]
pub struct Event<C> {
    time: SimTime,
    seq: u64,
    callback: C,
}

impl<C> Event<C> {
    /// When this event fires.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Take the callback out of the event.
    pub fn into_callback(self) -> C {
        self.callback
    }
}

impl<C> PartialEq for Event<C> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<C> Eq for Event<C> {}

impl<C> PartialOrd for Event<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Event<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest time, then earliest insertion)
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Queue of scheduled callbacks ordered by fire time.
///
/// Entries are added by scheduling calls and removed only by the backend's
/// fire loop. Scheduling in the past is allowed; such events are simply due
/// on the next [`pop_due`](EventQueue::pop_due).
#[derive(Debug)]
pub struct EventQueue<C> {
    heap: BinaryHeap<Event<C>>,
    next_seq: u64,
}

impl<C> EventQueue<C> {
    /// Create an empty queue.
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `callback` to fire at `time`.
    pub fn schedule(&mut self, time: SimTime, callback: C) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Event {
            time,
            seq,
            callback,
        });
    }

    /// Fire time of the earliest pending event.
    pub fn next_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|e| e.time)
    }

    /// Remove and return the earliest event if it is due at or before `now`.
    pub fn pop_due(&mut self, now: SimTime) -> Option<Event<C>> {
        if self.heap.peek()?.time <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Remove and return the earliest event regardless of time.
    pub fn pop(&mut self) -> Option<Event<C>> {
        self.heap.pop()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no events are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<C> Default for EventQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule(SimTime::from_millis(100), 1);
        queue.schedule(SimTime::from_millis(50), 2);
        queue.schedule(SimTime::from_millis(150), 3);

        assert_eq!(queue.next_time(), Some(SimTime::from_millis(50)));
        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(Event::into_callback)).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_equal_times_fire_in_insertion_order() {
        let mut queue = EventQueue::new();
        let t = SimTime::from_millis(7);
        for i in 0..50 {
            queue.schedule(t, i);
        }
        // An earlier event inserted last still goes first
        queue.schedule(SimTime::from_millis(1), -1);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_due(t).map(Event::into_callback)).collect();
        let mut expected = vec![-1];
        expected.extend(0..50);
        assert_eq!(order, expected);
    }

    #[test]
    fn test_pop_due_respects_now() {
        let mut queue = EventQueue::new();
        queue.schedule(SimTime::from_millis(10), "late");
        queue.schedule(SimTime::ZERO, "past");

        let now = SimTime::from_millis(5);
        assert_eq!(queue.pop_due(now).map(Event::into_callback), Some("past"));
        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_due(SimTime::from_millis(10)).is_some());
        assert!(queue.is_empty());
    }
}
